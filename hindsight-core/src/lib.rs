//! # hindsight-core
//!
//! Retroactive audio recorder engine.
//!
//! ## Architecture
//!
//! ```text
//! audio server → capture callback ─► HistoryBuffer (13 s pre-roll)
//!                      │          ─► level/RMS atomics ─► SignalDetector
//!                      └─(recording)─► live SPSC queue ─► FileWriter → .wav
//!                                                              │
//! operator toggle ─► Coordinator FSM ◄─ writer report          │
//!                          │                                   ▼
//!                          └─► session manifest        TranscriptionDispatcher
//!                                                         → external HTTP
//! ```
//!
//! The capture callback is zero-alloc and lock-free. All heap work,
//! state transitions, and I/O happen on the coordinator thread, the
//! per-recording writer thread, and the bounded transcription workers —
//! every one of which observes the process-wide shutdown signal.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod controller;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod session;
pub mod signal;
pub mod transcribe;
pub mod writer;

// Convenience re-exports for embedding programs.
pub use engine::{EngineConfig, HindsightEngine, SessionConfig, TranscriptionConfig};
pub use error::{HindsightError, Result};
pub use ipc::events::{
    CaptureBlockedReason, LevelEvent, RecordingState, SessionEvent, StateChangeEvent,
};
pub use session::{RecordingMeta, RecordingStatus};
pub use transcribe::TranscriptionBackend;
