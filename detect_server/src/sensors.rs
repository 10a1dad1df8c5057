//! Sensors module.
//!
//! Camera capability checks, capture requests and frame sources backed by V4L2 devices.
use std::{fmt, future::Future, io, path::Path, str::FromStr, sync::Arc, time::Instant};

use image::RgbImage;
use rscam::{Camera, Config};

use crate::error::CaptureError;

pub type CaptureFn = Box<dyn Fn() -> io::Result<Vec<u8>> + Send + Sync>;

/// Decoded camera frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Direction a camera is facing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum FacingMode {
    /// Facing the user (front camera).
    User,
    /// Facing away from the user (back camera).
    Environment,
}

impl fmt::Display for FacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacingMode::User => write!(f, "user"),
            FacingMode::Environment => write!(f, "environment"),
        }
    }
}

impl FromStr for FacingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(FacingMode::User),
            "environment" => Ok(FacingMode::Environment),
            other => Err(format!("unknown facing mode {other:?}")),
        }
    }
}

/// Constraints of a capture request. Audio is never captured.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaConstraints {
    /// Preferred camera direction, honored when such a camera is available.
    pub facing_mode: FacingMode,
    pub resolution: Option<(u32, u32)>,
    pub frame_rate: Option<(u32, u32)>,
}

impl MediaConstraints {
    pub fn video_only(facing_mode: FacingMode) -> Self {
        Self {
            facing_mode,
            resolution: None,
            frame_rate: None,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_only(FacingMode::Environment)
    }
}

/// Live stream of decoded frames.
pub trait FrameSource: Send + 'static {
    /// Wait for the next frame of the stream.
    fn next_frame(&mut self) -> impl Future<Output = Result<Frame, CaptureError>> + Send;
}

/// Media capture facility.
pub trait MediaDevices: Send + Sync + 'static {
    type Stream: FrameSource;

    /// Whether camera capture is available at all.
    fn is_supported(&self) -> bool;

    /// Open a video stream matching the constraints.
    fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> impl Future<Output = Result<Self::Stream, CaptureError>> + Send;
}

/// Camera device node with an optional facing tag.
///
/// Parsed from `PATH` or `PATH:FACING`, e.g. `/dev/video2:environment`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CameraDevice {
    pub path: String,
    pub facing: Option<FacingMode>,
}

impl FromStr for CameraDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty camera device path".into());
        }

        // Device paths may contain colons themselves (e.g. /dev/v4l/by-path/...)
        let tagged = s.rsplit_once(':').and_then(|(path, facing)| {
            let facing = facing.parse::<FacingMode>().ok()?;
            (!path.is_empty()).then_some((path, facing))
        });

        Ok(match tagged {
            Some((path, facing)) => CameraDevice {
                path: path.to_owned(),
                facing: Some(facing),
            },
            None => CameraDevice {
                path: s.to_owned(),
                facing: None,
            },
        })
    }
}

/// Pick the device to open for a facing preference.
///
/// Prefers an existing device tagged with the requested facing mode and falls back to the first
/// existing device.
pub fn select_device<'a>(
    devices: &'a [CameraDevice],
    facing_mode: FacingMode,
    exists: impl Fn(&str) -> bool,
) -> Option<&'a CameraDevice> {
    let mut available = devices.iter().filter(|device| exists(&device.path));
    let first = available.clone().next();

    available
        .find(|device| device.facing == Some(facing_mode))
        .or(first)
}

/// V4L2 cameras reachable through `rscam`.
pub struct V4l2Devices {
    devices: Vec<CameraDevice>,
}

impl V4l2Devices {
    pub fn new(devices: Vec<CameraDevice>) -> Self {
        Self { devices }
    }
}

impl MediaDevices for V4l2Devices {
    type Stream = CameraStream;

    fn is_supported(&self) -> bool {
        self.devices
            .iter()
            .any(|device| Path::new(&device.path).exists())
    }

    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<CameraStream, CaptureError> {
        let device = select_device(&self.devices, constraints.facing_mode, |path| {
            Path::new(path).exists()
        })
        .ok_or(CaptureError::NoDevice)?;

        if device.facing != Some(constraints.facing_mode) {
            log::info!(
                "No {} facing camera available, falling back to {}",
                constraints.facing_mode,
                &device.path
            );
        }

        let path = device.path.clone();
        let constraints = constraints.clone();
        let capture_fn = tokio::task::spawn_blocking(move || {
            get_capture_fn_linux(&path, "MJPG", constraints.resolution, constraints.frame_rate)
        })
        .await??;

        Ok(CameraStream::new(capture_fn))
    }
}

/// Get a capture function to a video device on a Linux machine.
pub fn get_capture_fn_linux(
    device_name: &str,
    format: &str,
    resolution: Option<(u32, u32)>,
    frame_rate: Option<(u32, u32)>,
) -> Result<CaptureFn, CaptureError> {
    let mut cam = Camera::new(device_name)?;
    log_supported_formats(&cam, format);
    let format = format.as_bytes();

    log::info!("Using camera {}", device_name);

    let resolution = resolution
        .map(Ok)
        .unwrap_or_else(|| get_max_resolution(&cam, format))?;

    let frame_rate = frame_rate
        .map(Ok)
        .unwrap_or_else(|| get_max_frame_rate(&cam, format, resolution))?;

    cam.start(&Config {
        interval: frame_rate,
        resolution,
        format,
        ..Default::default()
    })
    .map_err(config_err)?;

    let callback = move || cam.capture().map(|frame| frame[..].to_vec());
    Ok(Box::new(callback))
}

/// Frame source over a started camera. Capture stops when it is dropped.
pub struct CameraStream {
    capture_fn: Arc<CaptureFn>,
}

impl CameraStream {
    pub fn new(capture_fn: CaptureFn) -> Self {
        Self {
            capture_fn: Arc::new(capture_fn),
        }
    }
}

impl FrameSource for CameraStream {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        let capture_fn = Arc::clone(&self.capture_fn);
        tokio::task::spawn_blocking(move || -> Result<Frame, CaptureError> {
            let jpeg = (*capture_fn)()?;
            let image: RgbImage = turbojpeg::decompress_image(&jpeg)
                .map_err(|err| CaptureError::Decode(err.to_string()))?;
            Ok(Frame::new(image))
        })
        .await?
    }
}

fn config_err(err: impl fmt::Display) -> CaptureError {
    CaptureError::Config(err.to_string())
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), CaptureError> {
    let resolution_info = cam.resolutions(format).map_err(config_err)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1)
            .copied(),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| CaptureError::Config("no resolution found".into()))
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), CaptureError> {
    let interval_info = cam.intervals(format, resolution).map_err(config_err)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) in seconds, the shortest one is the fastest
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            .filter(|(_, denominator)| *denominator > 0)
            .min_by(|a, b| (a.0 * b.1).cmp(&(b.0 * a.1)))
            .copied(),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| CaptureError::Config("no frame rate found".into()))
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}

#[cfg(test)]
mod test {

    use super::*;

    fn devices() -> Vec<CameraDevice> {
        vec![
            "/dev/video0:user".parse().unwrap(),
            "/dev/video2:environment".parse().unwrap(),
            "/dev/video4".parse().unwrap(),
        ]
    }

    #[test]
    fn test_parse_camera_device() {
        let device: CameraDevice = "/dev/video2:environment".parse().unwrap();
        assert_eq!(device.path, "/dev/video2");
        assert_eq!(device.facing, Some(FacingMode::Environment));

        let device: CameraDevice = "/dev/video0".parse().unwrap();
        assert_eq!(device.facing, None);

        let by_path = "/dev/v4l/by-path/pci-0000:00:14.0-usb-0:1:1.0-video-index0";
        let device: CameraDevice = by_path.parse().unwrap();
        assert_eq!(device.path, by_path);
        assert_eq!(device.facing, None);

        let device: CameraDevice = format!("{by_path}:user").parse().unwrap();
        assert_eq!(device.path, by_path);
        assert_eq!(device.facing, Some(FacingMode::User));

        assert!("".parse::<CameraDevice>().is_err());
    }

    #[test]
    fn test_select_prefers_facing_mode() {
        let devices = devices();
        let selected = select_device(&devices, FacingMode::Environment, |_| true).unwrap();
        assert_eq!(selected.path, "/dev/video2");

        let selected = select_device(&devices, FacingMode::User, |_| true).unwrap();
        assert_eq!(selected.path, "/dev/video0");
    }

    #[test]
    fn test_select_falls_back_to_available_device() {
        let devices = devices();
        let selected =
            select_device(&devices, FacingMode::Environment, |path| path != "/dev/video2")
                .unwrap();
        assert_eq!(selected.path, "/dev/video0");

        assert!(select_device(&devices, FacingMode::User, |_| false).is_none());
    }

    #[test]
    fn test_default_constraints_are_video_only_environment() {
        let constraints = MediaConstraints::default();
        assert_eq!(constraints.facing_mode, FacingMode::Environment);
        assert_eq!(constraints.resolution, None);
    }

    #[test]
    fn get_cam_info_if_available() {
        let cam_name = "/dev/video0";
        let cam = Camera::new(cam_name);

        match cam {
            Err(err) => println!("Could not initialize camera (maybe non available): {err}"),
            Ok(cam) => {
                let format = b"MJPG";
                match get_max_resolution(&cam, format) {
                    Ok(resolution) => {
                        let frame_rate = get_max_frame_rate(&cam, format, resolution);
                        println!("Selected {resolution:?} at interval {frame_rate:?}");
                    }
                    Err(err) => println!("Camera does not offer MJPG: {err}"),
                }
            }
        }
    }
}
