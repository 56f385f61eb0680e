//! The pre-roll ring buffer.
//!
//! A fixed window over the most recent `capacity_frames` of interleaved
//! audio. The capture callback writes into it on every invocation for the
//! engine's whole lifetime; the controller reads it exactly once per
//! recording start, unwrapping the circular store into oldest-first order.
//!
//! ## Concurrency
//!
//! Samples are stored as f32 bit patterns in `AtomicU32` cells with
//! `Relaxed` ordering, so the writer never waits and the snapshot never
//! blocks the writer. A snapshot taken while the callback is mid-block may
//! tear the one or two blocks straddling the cursor; pre-roll audio is
//! approximate by nature and the artifact is below perceptual thresholds.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Circular interleaved sample store with a monotonic write cursor.
pub struct HistoryBuffer {
    /// f32 bit patterns, `capacity_frames * channels` cells.
    store: Box<[AtomicU32Cell]>,
    /// Write cursor in frames, always `< capacity_frames`.
    write_pos: AtomicUsize,
    /// Latched true after the first wrap. Never reset.
    filled: AtomicBool,
    capacity_frames: usize,
    channels: usize,
}

type AtomicU32Cell = std::sync::atomic::AtomicU32;

impl HistoryBuffer {
    /// Allocate a buffer holding `capacity_frames` frames of `channels`
    /// interleaved samples. All allocation happens here, once.
    pub fn new(capacity_frames: usize, channels: usize) -> Self {
        let cells = capacity_frames * channels;
        let store = (0..cells).map(|_| AtomicU32Cell::new(0)).collect();
        Self {
            store,
            write_pos: AtomicUsize::new(0),
            filled: AtomicBool::new(false),
            capacity_frames,
            channels,
        }
    }

    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// True once the buffer has wrapped at least once.
    pub fn filled(&self) -> bool {
        self.filled.load(Ordering::Acquire)
    }

    /// Frames currently valid: the full capacity after the first wrap,
    /// otherwise the cursor position.
    pub fn valid_frames(&self) -> usize {
        if self.filled() {
            self.capacity_frames
        } else {
            self.write_pos.load(Ordering::Acquire)
        }
    }

    /// Fill fraction in [0, 1] for meter display.
    pub fn fill_fraction(&self) -> f32 {
        if self.capacity_frames == 0 {
            return 0.0;
        }
        self.valid_frames() as f32 / self.capacity_frames as f32
    }

    /// Write one interleaved batch, wrapping at capacity.
    ///
    /// Wait-free and allocation-free — this is the only method the
    /// real-time callback touches. `interleaved.len()` must be a multiple
    /// of the channel count and at most `capacity_frames * channels`;
    /// both are guaranteed by engine-init validation.
    pub fn write(&self, interleaved: &[f32]) {
        let frames = interleaved.len() / self.channels;
        if frames == 0 {
            return;
        }

        let pos = self.write_pos.load(Ordering::Relaxed);
        let first_frames = frames.min(self.capacity_frames - pos);
        let first_cells = first_frames * self.channels;
        let base = pos * self.channels;

        for (i, &sample) in interleaved[..first_cells].iter().enumerate() {
            self.store[base + i].store(sample.to_bits(), Ordering::Relaxed);
        }

        let mut new_pos = pos + first_frames;
        if first_frames < frames {
            // Wrap: remainder lands at the start of the store.
            for (i, &sample) in interleaved[first_cells..].iter().enumerate() {
                self.store[i].store(sample.to_bits(), Ordering::Relaxed);
            }
            new_pos = frames - first_frames;
            self.filled.store(true, Ordering::Release);
        } else if new_pos >= self.capacity_frames {
            new_pos = 0;
            self.filled.store(true, Ordering::Release);
        }

        self.write_pos.store(new_pos, Ordering::Release);
    }

    /// Copy the logical contents — oldest frame first — into `target`,
    /// returning the number of valid frames.
    ///
    /// `target` is cleared and refilled; its capacity is reused so the
    /// caller can hold one pre-sized buffer across recordings. Called at
    /// most once per recording start, from the controller thread, while
    /// the callback keeps writing.
    pub fn snapshot_into(&self, target: &mut Vec<f32>) -> usize {
        target.clear();

        let pos = self.write_pos.load(Ordering::Acquire);
        if self.filled() {
            // Unwrap at the cursor: [pos..capacity) is the oldest audio,
            // [0..pos) the newest.
            self.copy_cells(target, pos * self.channels, self.capacity_frames * self.channels);
            self.copy_cells(target, 0, pos * self.channels);
            self.capacity_frames
        } else {
            self.copy_cells(target, 0, pos * self.channels);
            pos
        }
    }

    fn copy_cells(&self, target: &mut Vec<f32>, start: usize, end: usize) {
        for cell in &self.store[start..end] {
            target.push(f32::from_bits(cell.load(Ordering::Relaxed)));
        }
    }
}
