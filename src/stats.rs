//! Pipeline statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by every stage of the pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    frame_timeouts: AtomicU64,
    frames_encoded: AtomicU64,
    consumers_served: AtomicU64,
    backpressure_waits: AtomicU64,
    timelapse_stills: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A raw frame was handed to the encoder.
    pub fn record_captured(&self) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
    }

    /// A raw frame was dropped because the encoder was busy.
    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.frame_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_encoded(&self) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_served(&self, consumers: usize) {
        self.consumers_served
            .fetch_add(consumers as u64, Ordering::Relaxed);
    }

    /// The encoder found nobody waiting and had to block.
    pub fn record_backpressure(&self) {
        self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_still(&self) {
        self.timelapse_stills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frame_timeouts: self.frame_timeouts.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            consumers_served: self.consumers_served.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
            timelapse_stills: self.timelapse_stills.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frame_timeouts: u64,
    pub frames_encoded: u64,
    pub consumers_served: u64,
    pub backpressure_waits: u64,
    pub timelapse_stills: u64,
}

impl StatsSnapshot {
    /// Fraction of captured-or-dropped frames that never reached the encoder.
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_captured + self.frames_dropped;
        if total == 0 {
            return 0.0;
        }

        self.frames_dropped as f64 / total as f64
    }

    /// Average consumers per encoded frame.
    pub fn mean_fan_out(&self) -> f64 {
        if self.frames_encoded == 0 {
            return 0.0;
        }

        self.consumers_served as f64 / self.frames_encoded as f64
    }
}
