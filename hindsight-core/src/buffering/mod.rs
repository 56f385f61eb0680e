//! Lock-free buffering between the real-time callback and everything else.
//!
//! Two structures, two jobs:
//!
//! - [`history::HistoryBuffer`] — the pre-roll window. Always written,
//!   overwrites the oldest audio, snapshotted once per recording start.
//! - the live queue — a `ringbuf::HeapRb<f32>` SPSC pair. The callback
//!   holds the producer for the engine's lifetime and pushes only while a
//!   recording is active; the file writer drains the consumer.
//!
//! `push_slice` / `pop_slice` are wait-free and allocation-free, which is
//! what makes the producer side safe to call from the audio callback.

pub mod history;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Producer half of the live queue — held by the capture callback.
pub type LiveProducer = ringbuf::HeapProd<f32>;

/// Consumer half of the live queue — drained by the file writer.
pub type LiveConsumer = ringbuf::HeapCons<f32>;

/// Default live-queue depth in seconds of audio. Sized to absorb scheduler
/// jitter on the writer thread; at 48 kHz stereo this is ~1.5 MiB.
pub const LIVE_QUEUE_SECONDS: usize = 4;

/// Create a matched producer/consumer pair for the live queue.
///
/// `capacity_samples` should be `sample_rate * channels * seconds`; values
/// below one callback block would drop audio immediately and are rejected
/// by `EngineConfig::validate`, not here.
pub fn create_live_queue(capacity_samples: usize) -> (LiveProducer, LiveConsumer) {
    HeapRb::<f32>::new(capacity_samples).split()
}
