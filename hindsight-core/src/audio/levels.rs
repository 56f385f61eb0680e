//! Atomic level meters shared between the capture callback and readers.
//!
//! The callback publishes per-channel peak and a downsampled RMS figure by
//! storing f32 bit patterns into `AtomicU32` cells; the coordinator and UI
//! pollers read them without ever touching the real-time path. Errors the
//! callback cannot report (live-queue overruns) are counters here too.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Linear level below which a signal is reported as the −100 dB floor.
const DB_FLOOR_LINEAR: f32 = 1e-5;

/// Silence floor in dB.
pub const DB_FLOOR: f32 = -100.0;

/// Convert a linear level in [0, 1] to dBFS, clipped at the −100 dB floor.
pub fn linear_to_db(level: f32) -> f32 {
    if level > DB_FLOOR_LINEAR {
        20.0 * level.log10()
    } else {
        DB_FLOOR
    }
}

/// Shared meter block. One per engine, allocated at init.
pub struct LevelMeter {
    /// Per-channel peak absolute value of the last batch (f32 bits).
    peaks: Box<[AtomicU32]>,
    /// RMS over the last published window (f32 bits), all channels pooled.
    rms: AtomicU32,
    /// Total frames delivered by the audio server.
    frames_captured: AtomicU64,
    /// Samples dropped because the live queue was full.
    dropped_samples: AtomicU64,
}

impl LevelMeter {
    pub fn new(channels: usize) -> Self {
        Self {
            peaks: (0..channels).map(|_| AtomicU32::new(0)).collect(),
            rms: AtomicU32::new(0),
            frames_captured: AtomicU64::new(0),
            dropped_samples: AtomicU64::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.peaks.len()
    }

    /// Publish per-channel peaks. Called from the callback; wait-free.
    pub fn store_peaks(&self, peaks: &[f32]) {
        for (cell, &p) in self.peaks.iter().zip(peaks) {
            cell.store(p.to_bits(), Ordering::Relaxed);
        }
    }

    /// Publish a pooled RMS figure. Called from the callback every Kth block.
    pub fn store_rms(&self, rms: f32) {
        self.rms.store(rms.to_bits(), Ordering::Relaxed);
    }

    pub fn add_frames(&self, frames: u64) {
        self.frames_captured.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, samples: u64) {
        self.dropped_samples.fetch_add(samples, Ordering::Relaxed);
    }

    /// Per-channel linear peaks of the most recent batch.
    pub fn peaks(&self) -> Vec<f32> {
        self.peaks
            .iter()
            .map(|c| f32::from_bits(c.load(Ordering::Relaxed)))
            .collect()
    }

    /// Per-channel peaks in dBFS.
    pub fn peaks_db(&self) -> Vec<f32> {
        self.peaks().into_iter().map(linear_to_db).collect()
    }

    /// Pooled RMS (linear) of the last published window.
    pub fn rms(&self) -> f32 {
        f32::from_bits(self.rms.load(Ordering::Relaxed))
    }

    pub fn rms_db(&self) -> f32 {
        linear_to_db(self.rms())
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }
}
