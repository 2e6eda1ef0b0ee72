//! Throughput counters, logged periodically.
//!
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use tokio::{task::JoinHandle, time::interval};

pub static METER: Meter = Meter::new();

const LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct Meter {
    streamed_frames: AtomicU64,
    processed_uploads: AtomicU64,
}

/// Counts collected over one period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub streamed_frames: u64,
    pub processed_uploads: u64,
    pub period: Duration,
}

impl Meter {
    pub const fn new() -> Meter {
        Meter {
            streamed_frames: AtomicU64::new(0),
            processed_uploads: AtomicU64::new(0),
        }
    }

    pub fn tick_streamed(&self) {
        self.streamed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_upload(&self) {
        self.processed_uploads.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the counts of the period that lasted `period` and start a new one.
    pub fn take(&self, period: Duration) -> Throughput {
        Throughput {
            streamed_frames: self.streamed_frames.swap(0, Ordering::Relaxed),
            processed_uploads: self.processed_uploads.swap(0, Ordering::Relaxed),
            period,
        }
    }
}

impl Throughput {
    pub fn is_idle(&self) -> bool {
        self.streamed_frames == 0 && self.processed_uploads == 0
    }

    pub fn frames_per_second(&self) -> f32 {
        match self.period.as_secs_f32() {
            secs if secs > 0.0 => self.streamed_frames as f32 / secs,
            _ => 0.0,
        }
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "streaming {:.2} fps, {} uploads in {:.1}s",
            self.frames_per_second(),
            self.processed_uploads,
            self.period.as_secs_f32()
        )
    }
}

/// Log the throughput of [`METER`] while anything is happening.
pub fn spawn_meter_logger() -> JoinHandle<()> {
    tokio::spawn(async {
        let mut ticker = interval(LOG_INTERVAL);
        ticker.tick().await;
        let mut period_start = Instant::now();

        loop {
            ticker.tick().await;
            let throughput = METER.take(period_start.elapsed());
            period_start = Instant::now();

            if !throughput.is_idle() {
                log::info!("Throughput: {throughput}");
            }
        }
    })
}
