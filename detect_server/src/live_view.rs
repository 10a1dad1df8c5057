//! Live view surface: the video sink the overlays are composed onto.
//!
//! Presented frames are rendered with the current overlay nodes and fanned out as MJPEG stream
//! items to every subscribed HTTP client.
use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use common::protocol::{GateState, OverlayDescriptor, StatusMsg};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use lazy_static::lazy_static;
use rusttype::{Font, Scale};
use tokio::sync::broadcast;

use crate::{
    overlay::{NodeId, OverlaySurface},
    sensors::Frame,
    utils::as_jpeg_stream_item,
};

const HIGHLIGHT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_HEIGHT: u32 = 18;
const JPEG_QUALITY: i32 = 85;

pub type JpegSender = broadcast::Sender<Bytes>;
pub type JpegReceiver = broadcast::Receiver<Bytes>;

lazy_static! {
    static ref DEFAULT_FONT: Option<Font<'static>> = [
        "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
        "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
        "/usr/share/fonts/dejavu/DejaVuSansMono.ttf",
    ]
    .iter()
    .find_map(|path| load_font(path));
}

/// Load a TrueType font, `None` if it is missing or invalid.
pub fn load_font(path: impl AsRef<Path>) -> Option<Font<'static>> {
    let data = std::fs::read(path.as_ref()).ok()?;
    Font::try_from_vec(data)
}

#[derive(Debug)]
struct ViewState {
    next_id: NodeId,
    nodes: Vec<(NodeId, OverlayDescriptor)>,
    model_loaded: bool,
    gate: GateState,
    last_error: Option<String>,
}

/// Shared handle to the live view. Clones refer to the same view.
#[derive(Clone)]
pub struct LiveView {
    state: Arc<Mutex<ViewState>>,
    frames_tx: JpegSender,
    font: Option<Font<'static>>,
}

impl LiveView {
    /// Create a view rendering labels with the given font, or a system font if `None`.
    pub fn new(font: Option<Font<'static>>) -> Self {
        let font = font.or_else(|| DEFAULT_FONT.clone());
        if font.is_none() {
            log::warn!("No font available, overlay labels are not drawn on the stream");
        }

        let (frames_tx, _) = broadcast::channel(20);
        Self {
            state: Arc::new(Mutex::new(ViewState {
                next_id: 0,
                nodes: Vec::new(),
                model_loaded: false,
                gate: GateState::Armed,
                last_error: None,
            })),
            frames_tx,
            font,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the rendered MJPEG stream items.
    pub fn subscribe(&self) -> JpegReceiver {
        self.frames_tx.subscribe()
    }

    /// Overlay nodes currently shown, in insertion order.
    pub fn overlays(&self) -> Vec<OverlayDescriptor> {
        self.lock()
            .nodes
            .iter()
            .map(|(_, node)| node.clone())
            .collect()
    }

    pub fn set_model_loaded(&self) {
        self.lock().model_loaded = true;
    }

    pub fn set_gate(&self, gate: GateState) {
        self.lock().gate = gate;
    }

    /// Make an error visible to the user.
    pub fn report_error(&self, message: impl Into<String>) {
        self.lock().last_error = Some(message.into());
    }

    pub fn clear_error(&self) {
        self.lock().last_error = None;
    }

    pub fn status(&self) -> StatusMsg {
        let state = self.lock();
        StatusMsg {
            model_loaded: state.model_loaded,
            gate: state.gate,
            last_error: state.last_error.clone(),
        }
    }
}

impl OverlaySurface for LiveView {
    fn append(&mut self, node: OverlayDescriptor) -> NodeId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.nodes.push((id, node));
        id
    }

    fn remove(&mut self, id: NodeId) {
        self.lock().nodes.retain(|(node_id, _)| *node_id != id);
    }

    fn present(&mut self, frame: &Frame) {
        if self.frames_tx.receiver_count() == 0 {
            return;
        }

        let nodes = self.overlays();
        let mut image = frame.image.clone();
        draw_overlays(&mut image, &nodes, self.font.as_ref());

        match turbojpeg::compress_image(&image, JPEG_QUALITY, turbojpeg::Subsamp::Sub2x2) {
            Ok(buf) => {
                self.frames_tx.send(as_jpeg_stream_item(&buf)).ok();
            }
            Err(err) => log::warn!("Failed to compress frame: {err}"),
        }
    }
}

/// Draw overlay nodes onto the image. Labels are skipped without a font.
pub fn draw_overlays(image: &mut RgbImage, nodes: &[OverlayDescriptor], font: Option<&Font<'_>>) {
    for node in nodes {
        match node {
            OverlayDescriptor::Highlight {
                left,
                top,
                width,
                height,
            } => {
                let rect = Rect::at(*left as i32, *top as i32)
                    .of_size((*width as u32).max(1), (*height as u32).max(1));
                draw_hollow_rect_mut(image, rect, HIGHLIGHT_COLOR);
            }
            OverlayDescriptor::Label {
                text,
                margin_left,
                margin_top,
                width,
            } => {
                let Some(font) = font else { continue };

                let (x, y) = (*margin_left as i32, (*margin_top as i32).max(0));
                let background = Rect::at(x, y).of_size((*width as u32).max(1), LABEL_HEIGHT);
                draw_filled_rect_mut(image, background, HIGHLIGHT_COLOR);
                draw_text_mut(
                    image,
                    LABEL_COLOR,
                    x,
                    y,
                    Scale { x: 16.0, y: 16.0 },
                    font,
                    text,
                );
            }
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;

    fn highlight() -> OverlayDescriptor {
        OverlayDescriptor::Highlight {
            left: 2.0,
            top: 3.0,
            width: 5.0,
            height: 4.0,
        }
    }

    #[test]
    fn test_append_and_remove_nodes() {
        let mut view = LiveView::new(None);
        let first = view.append(highlight());
        let second = view.append(highlight());
        assert_ne!(first, second);
        assert_eq!(view.overlays().len(), 2);

        view.remove(first);
        view.remove(first);
        assert_eq!(view.overlays().len(), 1);
    }

    #[test]
    fn test_draw_highlight_outline() {
        let mut image = RgbImage::new(16, 16);
        draw_overlays(&mut image, &[highlight()], None);

        assert_eq!(image[(2, 3)], HIGHLIGHT_COLOR);
        assert_eq!(image[(6, 6)], HIGHLIGHT_COLOR);
        // Inside of the box stays untouched
        assert_eq!(image[(4, 5)], Rgb([0, 0, 0]));
    }

    #[test]
    fn test_status_reports_errors() {
        let view = LiveView::new(None);
        assert!(!view.status().model_loaded);

        view.set_model_loaded();
        view.report_error("camera busy");
        let status = view.status();
        assert!(status.model_loaded);
        assert_eq!(status.last_error.as_deref(), Some("camera busy"));

        view.clear_error();
        assert_eq!(view.status().last_error, None);
    }

    #[tokio::test]
    async fn test_present_broadcasts_jpeg() {
        let mut view = LiveView::new(None);
        let mut rx = view.subscribe();

        view.append(highlight());
        view.present(&Frame::new(RgbImage::new(32, 32)));

        let item = rx.recv().await.unwrap();
        assert!(item.starts_with(b"--frame\r\n"));
    }
}
