//! Detection loop running the detector on the live stream.
//!
//! Every cycle detects objects on the current frame, replaces the overlays of the previous cycle
//! with the ones of the qualifying predictions, presents the frame and waits for the next display
//! refresh. The loop owns its detector, frame source and surface and stops on cancellation.
use std::{sync::Arc, time::Duration};

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    error::LoopError,
    meter::METER,
    nn::Detector,
    overlay::{class_counts, overlay_descriptors, OverlaySet, OverlaySurface, DEFAULT_MIN_SCORE},
    sensors::FrameSource,
};

/// Callback receiving every error the loop runs into.
pub type ErrorHandler = Arc<dyn Fn(&LoopError) + Send + Sync>;

/// Retry behaviour for failing detector calls.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Consecutive failures after which the loop gives up.
    pub max_consecutive_failures: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retrying after the given number of consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2_u32.saturating_pow(failures.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Clone, Debug)]
pub struct LoopConfig {
    /// Predictions scoring at or below this value are not shown.
    pub min_score: f32,
    /// Rate of the display refresh the loop is paced by.
    pub refresh_rate: u32,
    pub retry: RetryPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            min_score: DEFAULT_MIN_SCORE,
            refresh_rate: 60,
            retry: RetryPolicy::default(),
        }
    }
}

impl LoopConfig {
    fn refresh_period(&self) -> Duration {
        Duration::from_secs(1) / self.refresh_rate.max(1)
    }
}

/// Reason the loop stopped.
#[derive(Debug)]
pub enum LoopExit {
    Cancelled,
    /// The stream ended or the detector kept failing past the retry budget.
    Failed(LoopError),
}

impl LoopExit {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoopExit::Cancelled)
    }
}

pub struct DetectionLoop<D, S, V> {
    detector: Arc<D>,
    source: S,
    surface: V,
    overlays: OverlaySet,
    config: LoopConfig,
    on_error: ErrorHandler,
}

impl<D, S, V> DetectionLoop<D, S, V>
where
    D: Detector,
    S: FrameSource,
    V: OverlaySurface,
{
    pub fn new(
        detector: Arc<D>,
        source: S,
        surface: V,
        config: LoopConfig,
        on_error: ErrorHandler,
    ) -> Self {
        Self {
            detector,
            source,
            surface,
            overlays: OverlaySet::new(),
            config,
            on_error,
        }
    }

    /// Run detection cycles until cancelled or until the stream or the detector fails for good.
    ///
    /// Overlays still shown when the loop stops are removed.
    pub async fn run(mut self, cancel: CancellationToken) -> LoopExit {
        let exit = self.run_cycles(&cancel).await;
        self.overlays.clear(&mut self.surface);
        log::info!("Detection loop stopped: {:?}", &exit);
        exit
    }

    fn fail(&self, err: LoopError) -> LoopExit {
        (self.on_error)(&err);
        LoopExit::Failed(err)
    }

    async fn run_cycles(&mut self, cancel: &CancellationToken) -> LoopExit {
        let mut refresh = interval(self.config.refresh_period());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures = 0;

        loop {
            if cancel.is_cancelled() {
                return LoopExit::Cancelled;
            }

            let frame = tokio::select! {
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                frame = self.source.next_frame() => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => return self.fail(LoopError::Capture(err)),
            };

            let predictions = tokio::select! {
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                predictions = self.detector.detect(&frame) => predictions,
            };
            let predictions = match predictions {
                Ok(predictions) => {
                    failures = 0;
                    predictions
                }
                Err(err) => {
                    failures += 1;
                    if failures >= self.config.retry.max_consecutive_failures {
                        return self.fail(LoopError::Detect(err));
                    }
                    (self.on_error)(&LoopError::Detect(err));
                    // Overlays of the last good frame must not outlive it
                    self.overlays.clear(&mut self.surface);

                    let backoff = self.config.retry.backoff(failures);
                    log::warn!("Detection failed ({failures} in a row), retrying in {backoff:?}");
                    tokio::select! {
                        _ = cancel.cancelled() => return LoopExit::Cancelled,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            self.overlays.clear(&mut self.surface);
            self.overlays.extend(
                &mut self.surface,
                overlay_descriptors(&predictions, self.config.min_score),
            );

            for (class, count) in class_counts(&predictions, self.config.min_score) {
                log::debug!("{class}: {count}");
            }

            self.surface.present(&frame);
            METER.record_cycle(frame.captured_at.elapsed());

            tokio::select! {
                _ = cancel.cancelled() => return LoopExit::Cancelled,
                _ = refresh.tick() => (),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::RetryPolicy;
    use std::time::Duration;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_consecutive_failures: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }
}
