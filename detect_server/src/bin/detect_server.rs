//! Live object detection server binary.
//!
use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    capture::{CaptureGate, CaptureTrigger, ModelHandle},
    detection_loop::{ErrorHandler, LoopConfig, RetryPolicy},
    endpoints::{router, AppState},
    error::LoopError,
    live_view::{load_font, LiveView},
    meter::spawn_meter_logger,
    nn::{SsdConfig, SsdMobilenet},
    overlay::DEFAULT_MIN_SCORE,
    sensors::{CameraDevice, FacingMode, MediaConstraints, V4l2Devices},
};
use env_logger::TimestampPrecision;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Address to serve the live view on
    #[clap(long, default_value = "127.0.0.1:3000")]
    server_address: String,

    /// Camera device, optionally tagged with its facing mode (e.g. /dev/video2:environment)
    #[clap(long = "camera", default_value = "/dev/video0")]
    cameras: Vec<CameraDevice>,

    /// Preferred camera facing mode
    #[clap(long, value_enum, default_value_t = FacingMode::Environment)]
    facing_mode: FacingMode,

    /// Predictions scoring at or below this value are not shown
    #[clap(long, default_value_t = DEFAULT_MIN_SCORE)]
    min_score: f32,

    /// Display refresh rate pacing the detection loop
    #[clap(long, default_value_t = 60)]
    refresh_rate: u32,

    /// Consecutive detector failures before the detection loop gives up
    #[clap(long, default_value_t = 5)]
    max_failures: u32,

    /// Path of the ONNX model, downloaded if missing
    #[clap(long)]
    model_path: Option<PathBuf>,

    /// URL the model is downloaded from
    #[clap(long)]
    model_url: Option<String>,

    /// TrueType font used for overlay labels
    #[clap(long)]
    font: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let cancel = CancellationToken::new();

    let font = args.font.as_ref().and_then(|path| {
        let font = load_font(path);
        if font.is_none() {
            log::warn!("Could not load font {}", path.display());
        }
        font
    });
    let view = LiveView::new(font);

    let on_error: ErrorHandler = {
        let view = view.clone();
        Arc::new(move |err: &LoopError| {
            log::error!("{err}");
            view.report_error(err.to_string());
        })
    };

    // Load the detector in the background, triggers are ignored until it is ready
    let model = ModelHandle::new();
    {
        let model = model.clone();
        let view = view.clone();
        let mut ssd_config = SsdConfig::default();
        if let Some(model_path) = args.model_path {
            ssd_config.model_path = model_path;
        }
        if let Some(model_url) = args.model_url {
            ssd_config.model_url = model_url;
        }

        tokio::spawn(async move {
            match SsdMobilenet::load(ssd_config).await {
                Ok(detector) => {
                    model.set(detector);
                    view.set_model_loaded();
                    log::info!("Model ready");
                }
                Err(err) => {
                    log::error!("Failed to load model: {err:#}");
                    view.report_error(format!("failed to load model: {err}"));
                }
            }
        });
    }

    let loop_config = LoopConfig {
        min_score: args.min_score,
        refresh_rate: args.refresh_rate,
        retry: RetryPolicy {
            max_consecutive_failures: args.max_failures,
            ..Default::default()
        },
    };
    let gate = Arc::new(CaptureGate::new(
        V4l2Devices::new(args.cameras),
        model,
        view.clone(),
        MediaConstraints::video_only(args.facing_mode),
        loop_config,
        on_error,
        cancel.clone(),
    ));

    spawn_meter_logger(cancel.clone());

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Shutting down");
            }
            cancel.cancel();
        });
    }

    let trigger: Arc<dyn CaptureTrigger> = gate.clone();
    let state = Arc::new(AppState {
        view,
        trigger,
        cancel: cancel.clone(),
    });

    // Serve HTTP server
    let addr: SocketAddr = args.server_address.parse()?;
    log::info!("Serving live view on http://{addr}");
    let shutdown = cancel.clone();
    axum::Server::bind(&addr)
        .serve(router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    gate.shutdown().await;

    Ok(())
}
