use thiserror::Error;

/// All errors produced by hindsight-core.
#[derive(Debug, Error)]
pub enum HindsightError {
    #[error("audio server unavailable: {0}")]
    AudioServerUnavailable(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no input device found")]
    NoInputDevice,

    #[error("saved input selection no longer matches the live graph: {missing:?}")]
    PortValidation { missing: Vec<String> },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("recording writer I/O failure: {0}")]
    WriterIo(String),

    #[error("transcription failed after {attempts} attempt(s): {message}")]
    Transcription { attempts: u32, message: String },

    #[error("transcription backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("operation not permitted while recording")]
    RecordingInProgress,

    #[error("toggle delivery is not supported on this platform")]
    ToggleUnsupported,

    #[error("no running instance found (pid file missing or stale)")]
    NoRunningInstance,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, HindsightError>;
