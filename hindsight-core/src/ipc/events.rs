//! Event types published over the engine's observer channels.
//!
//! Three broadcast channels, three event families:
//!
//! | Event | Channel | Cadence |
//! |-------|---------|---------|
//! | `LevelEvent` | `subscribe_levels()` | ~20 Hz while capturing |
//! | `StateChangeEvent` | `subscribe_state()` | on every FSM transition |
//! | `SessionEvent` | `subscribe_events()` | recording / transcript lifecycle |
//!
//! All types serialize with camelCase fields so embedding UIs can forward
//! them over IPC verbatim.

use serde::{Deserialize, Serialize};

use crate::session::RecordingMeta;

/// Recording controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    /// Not recording, auto-record disabled.
    Idle,
    /// Auto-record enabled, monitoring for signal onset.
    Armed,
    /// Operator-initiated recording.
    RecordingManual,
    /// Onset-triggered recording.
    RecordingAuto,
    /// Stop requested; writer draining.
    Stopping,
}

impl RecordingState {
    pub fn is_recording(self) -> bool {
        matches!(self, Self::RecordingManual | Self::RecordingAuto)
    }
}

/// Why a manual trigger was refused by the activity gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureBlockedReason {
    /// No input is connected to the engine.
    PortsMissing,
    /// A stop is still draining; try again once it completes.
    StopInProgress,
}

/// Published at ~20 Hz for peak meters and the buffer-fill display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Per-channel peak of the last block, dBFS (floor −100).
    pub peaks_db: Vec<f32>,
    /// Pooled RMS over the detector window, dBFS.
    pub rms_db: f32,
    /// Pre-roll fill fraction in [0, 1]; 1.0 once the window has wrapped.
    pub buffer_fill: f32,
}

/// Published on every controller state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangeEvent {
    pub state: RecordingState,
    /// Human-readable transition cause ("toggle", "signal_onset", ...).
    pub reason: String,
}

/// Recording and transcription lifecycle notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum SessionEvent {
    /// A recording finished, survived the energy floor, and joined the
    /// session.
    RecordingComplete { recording: RecordingMeta },
    /// A recording finished below the energy floor and was deleted.
    RecordingDiscarded { ordinal: u32, average_rms_db: f32 },
    /// The writer hit an I/O failure; the recording is marked failed.
    RecordingFailed { ordinal: u32, error: String },
    /// A transcript arrived for the given recording.
    Transcript {
        ordinal: u32,
        text: String,
        language: Option<String>,
    },
    /// All transcription attempts were exhausted or preempted.
    TranscriptError { ordinal: u32, error: String },
    /// A manual trigger was refused.
    CaptureBlocked { reason: CaptureBlockedReason },
    /// Live-queue overrun: frames were dropped since the last report.
    CaptureUnderrun { dropped_samples: u64 },
}
