//! Throughput and latency counters of the live view.
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;

pub static METER: Meter = Meter::new();

#[derive(Default)]
pub struct Meter {
    cycles: AtomicU64,
    latency_us: AtomicU64,
    streamed_frames: AtomicU64,
}

/// Counts accumulated between two reads of the meter.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeterReading {
    pub cycles: u64,
    pub streamed_frames: u64,
    /// Mean time from capture to presentation of a frame.
    pub mean_latency: Option<Duration>,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            cycles: AtomicU64::new(0),
            latency_us: AtomicU64::new(0),
            streamed_frames: AtomicU64::new(0),
        }
    }

    /// Count a detection cycle whose frame was presented `latency` after capture.
    pub fn record_cycle(&self, latency: Duration) {
        let latency_us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_us.fetch_add(latency_us, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset all counters.
    pub fn take_reading(&self) -> MeterReading {
        let cycles = self.cycles.swap(0, Ordering::Relaxed);
        let latency_us = self.latency_us.swap(0, Ordering::Relaxed);
        MeterReading {
            cycles,
            streamed_frames: self.streamed_frames.swap(0, Ordering::Relaxed),
            mean_latency: (cycles > 0).then(|| Duration::from_micros(latency_us / cycles)),
        }
    }
}

impl MeterReading {
    fn log(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f32();
        if let Some(latency) = self.mean_latency {
            log::info!(
                "Detection cycles per second: {:.2}, mean latency {:?}",
                self.cycles as f32 / secs,
                latency
            );
        }
        if self.streamed_frames > 0 {
            log::info!(
                "Streamed frames per second: {:.2}",
                self.streamed_frames as f32 / secs
            );
        }
    }
}

pub fn spawn_meter_logger(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut log_interval = interval(Duration::from_secs(2));
        log_interval.tick().await;
        let mut last_read = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = log_interval.tick() => (),
            }

            METER.take_reading().log(last_read.elapsed());
            last_read = Instant::now();
        }
    })
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{Meter, MeterReading};

    #[test]
    fn test_reading_resets_counters() {
        let meter = Meter::new();
        meter.record_cycle(Duration::from_millis(10));
        meter.record_cycle(Duration::from_millis(30));
        meter.tick_streamed();

        let reading = meter.take_reading();
        assert_eq!(reading.cycles, 2);
        assert_eq!(reading.streamed_frames, 1);
        assert_eq!(reading.mean_latency, Some(Duration::from_millis(20)));

        assert_eq!(meter.take_reading(), MeterReading::default());
    }
}
