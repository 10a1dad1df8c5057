//! Capture gate between the trigger control and the detection loop.
//!
//! A trigger is honored only once the detector is loaded. It disables the control, requests the
//! camera and, as soon as the first frame arrives, hands detector and stream to a new detection
//! loop.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use common::protocol::GateState;
use futures::future::BoxFuture;
use tokio::{sync::OnceCell, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    detection_loop::{DetectionLoop, ErrorHandler, LoopConfig, LoopExit},
    error::{CaptureError, LoopError},
    live_view::LiveView,
    nn::Detector,
    sensors::{Frame, FrameSource, MediaConstraints, MediaDevices},
};

/// Write-once handle to a detector that is loaded in the background.
pub struct ModelHandle<D> {
    cell: Arc<OnceCell<Arc<D>>>,
}

impl<D> Clone for ModelHandle<D> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<D> Default for ModelHandle<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> ModelHandle<D> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
        }
    }

    /// Store the loaded detector. Returns `false` if a detector was set before.
    pub fn set(&self, detector: D) -> bool {
        self.cell.set(Arc::new(detector)).is_ok()
    }

    pub fn get(&self) -> Option<Arc<D>> {
        self.cell.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }
}

/// Why a trigger did not start the camera.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IgnoreReason {
    Unsupported,
    ModelNotReady,
    AlreadyTriggered,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TriggerOutcome {
    /// Camera acquired, detection starts with the first frame.
    Started,
    Ignored(IgnoreReason),
}

/// Object-safe trigger for the HTTP layer.
pub trait CaptureTrigger: Send + Sync {
    fn trigger(&self) -> BoxFuture<'_, Result<TriggerOutcome, LoopError>>;
}

pub struct CaptureGate<M, D> {
    media: M,
    model: ModelHandle<D>,
    view: LiveView,
    constraints: MediaConstraints,
    loop_config: LoopConfig,
    on_error: ErrorHandler,
    supported: bool,
    armed: Arc<AtomicBool>,
    cancel: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<LoopExit>>>,
}

impl<M, D> CaptureGate<M, D>
where
    M: MediaDevices,
    D: Detector,
{
    /// Create the gate and run the capability check.
    ///
    /// Loops started by the gate are cancelled together with `cancel`.
    pub fn new(
        media: M,
        model: ModelHandle<D>,
        view: LiveView,
        constraints: MediaConstraints,
        loop_config: LoopConfig,
        on_error: ErrorHandler,
        cancel: CancellationToken,
    ) -> Self {
        let supported = media.is_supported();
        if supported {
            view.set_gate(GateState::Armed);
        } else {
            log::warn!("Camera capture is not supported, no camera device found");
            view.set_gate(GateState::Unsupported);
        }

        Self {
            media,
            model,
            view,
            constraints,
            loop_config,
            on_error,
            supported,
            armed: Arc::new(AtomicBool::new(supported)),
            cancel,
            loop_task: Mutex::new(None),
        }
    }

    /// Whether the trigger control currently accepts triggers.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Handle a trigger of the control.
    pub async fn enable_cam(&self) -> Result<TriggerOutcome, LoopError> {
        if !self.supported {
            return Ok(TriggerOutcome::Ignored(IgnoreReason::Unsupported));
        }
        let Some(detector) = self.model.get() else {
            log::debug!("Trigger ignored, model not loaded yet");
            return Ok(TriggerOutcome::Ignored(IgnoreReason::ModelNotReady));
        };
        if self
            .armed
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(TriggerOutcome::Ignored(IgnoreReason::AlreadyTriggered));
        }

        self.view.set_gate(GateState::Starting);
        log::info!("Requesting camera with {:?}", &self.constraints);

        match self.media.get_user_media(&self.constraints).await {
            Ok(stream) => {
                self.view.clear_error();
                self.start_on_data_ready(detector, stream);
                Ok(TriggerOutcome::Started)
            }
            Err(err) => {
                self.view.set_gate(GateState::Armed);
                self.armed.store(true, Ordering::SeqCst);
                let err = LoopError::Capture(err);
                (self.on_error)(&err);
                Err(err)
            }
        }
    }

    /// Spawn the detection loop once the first frame of the stream is available.
    fn start_on_data_ready(&self, detector: Arc<D>, mut stream: M::Stream) {
        let view = self.view.clone();
        let config = self.loop_config.clone();
        let on_error = Arc::clone(&self.on_error);
        let armed = Arc::clone(&self.armed);
        let cancel = self.cancel.child_token();

        // Spawn and store under one lock, stored handles stay in trigger order
        let mut loop_task = self
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let handle = tokio::spawn(async move {
            let first = tokio::select! {
                _ = cancel.cancelled() => Err(None),
                frame = stream.next_frame() => frame.map_err(Some),
            };

            let exit = match first {
                Ok(frame) => {
                    let (width, height) = frame.dimensions();
                    log::info!("Stream ready ({width}x{height}), starting detection");
                    view.set_gate(GateState::Running);

                    let source = Primed {
                        first: Some(frame),
                        inner: stream,
                    };
                    DetectionLoop::new(detector, source, view.clone(), config, on_error)
                        .run(cancel)
                        .await
                }
                Err(None) => LoopExit::Cancelled,
                Err(Some(err)) => {
                    let err = LoopError::Capture(err);
                    on_error(&err);
                    LoopExit::Failed(err)
                }
            };

            if exit.is_cancelled() {
                view.set_gate(GateState::Stopped);
            } else {
                // Let the user start over after a failure
                view.set_gate(GateState::Armed);
                armed.store(true, Ordering::SeqCst);
            }
            exit
        });

        if let Some(previous) = loop_task.replace(handle) {
            if !previous.is_finished() {
                previous.abort();
            }
        }
    }

    /// Stop the running detection loop and wait for it to finish.
    pub async fn shutdown(&self) -> Option<LoopExit> {
        self.cancel.cancel();
        let handle = self
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        handle.await.ok()
    }
}

impl<M, D> CaptureTrigger for CaptureGate<M, D>
where
    M: MediaDevices,
    D: Detector,
{
    fn trigger(&self) -> BoxFuture<'_, Result<TriggerOutcome, LoopError>> {
        Box::pin(self.enable_cam())
    }
}

/// Frame source replaying the frame that signalled readiness before reading on.
struct Primed<S> {
    first: Option<Frame>,
    inner: S,
}

impl<S: FrameSource> FrameSource for Primed<S> {
    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        match self.first.take() {
            Some(frame) => Ok(frame),
            None => self.inner.next_frame().await,
        }
    }
}
