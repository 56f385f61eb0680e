//! `HindsightEngine` — top-level lifecycle controller and control surface.
//!
//! ## Lifecycle
//!
//! ```text
//! HindsightEngine::new()   → session created, old temp sessions swept
//!     └─► start()          → device open, coordinator running
//!         ├─► toggle() / set_auto_record() / save_session() / ...
//!         └─► shutdown()   → writer drained, dispatcher drained, quiet
//! ```
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send`, so the capture stream is opened *inside*
//! the `spawn_blocking` closure that runs the coordinator, and dropped on
//! that same thread when the coordinator returns. A sync mpsc channel
//! propagates the open result back to `start()`. Transcription workers
//! run as tokio tasks; `start()` and `shutdown()` must therefore be
//! called within a tokio runtime.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::audio::{
    device::{InputGraph, InputPort},
    AudioCapture, CaptureShared,
};
use crate::buffering::LIVE_QUEUE_SECONDS;
use crate::controller::{self, ControlEvent, ControllerConfig, ControllerContext};
use crate::error::{HindsightError, Result};
use crate::ipc::events::{LevelEvent, SessionEvent, StateChangeEvent};
use crate::ipc::trigger;
use crate::session::SessionStore;
use crate::transcribe::dispatcher::{Dispatcher, DispatcherConfig, TranscriptionOutcome};
use crate::transcribe::{TranscriptionBackend, TranscriptionClient};

/// Broadcast channel capacity per observer stream.
const BROADCAST_CAP: usize = 256;

/// Control channel depth. The coordinator drains every 50 ms, so this is
/// weeks of headroom for operator-rate events.
const CONTROL_QUEUE_CAP: usize = 256;

/// Session-related knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root directory for temp sessions.
    pub temp_root: PathBuf,
    /// Temp sessions older than this many days are removed at startup.
    pub auto_cleanup_days: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            temp_root: std::env::temp_dir().join("hindsight"),
            auto_cleanup_days: 7,
        }
    }
}

/// Transcription knobs.
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub enabled: bool,
    pub backend: TranscriptionBackend,
    pub dispatcher: DispatcherConfig,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: TranscriptionBackend::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// Configuration for [`HindsightEngine`]. Defaults match the shipped
/// behavior; `validate()` runs at engine construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pre-roll window length in seconds. Default: 13.
    pub buffer_seconds: u32,
    /// Live-queue depth in seconds of audio. Default: 4.
    pub live_queue_seconds: usize,
    /// Preferred input device names; empty means system default.
    pub preferred_inputs: Vec<String>,
    /// Auto-record onset threshold. Default: −35 dB.
    pub onset_threshold_db: f32,
    /// Auto-record offset (silence) threshold. Must sit strictly below
    /// the onset threshold. Default: −40 dB.
    pub offset_threshold_db: f32,
    /// Sustained signal required before onset fires. Default: 0.5 s.
    pub onset_sustain: Duration,
    /// Continuous silence that ends an auto recording. Default: 10 s.
    pub silence_timeout: Duration,
    /// Activity-gate floor for the manual-trigger look-back. Default: −70 dB.
    pub activity_floor_db: f32,
    /// Activity-gate look-back window. Default: 0.5 s.
    pub activity_lookback: Duration,
    /// Recordings quieter than this on average are discarded. Default: −50 dB.
    pub discard_floor_db: f32,
    /// Keep partial files when the writer fails. Default: true.
    pub retain_failed: bool,
    /// Start with auto-record armed. Default: false.
    pub auto_record: bool,
    /// Forward SIGUSR1 as toggle events (POSIX only). Default: true.
    pub enable_toggle_signal: bool,
    /// Hard ceiling from shutdown request to forced exit. Default: 60 s.
    pub shutdown_deadline: Duration,
    pub session: SessionConfig,
    pub transcription: TranscriptionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 13,
            live_queue_seconds: LIVE_QUEUE_SECONDS,
            preferred_inputs: Vec::new(),
            onset_threshold_db: -35.0,
            offset_threshold_db: -40.0,
            onset_sustain: Duration::from_millis(500),
            silence_timeout: Duration::from_secs(10),
            activity_floor_db: -70.0,
            activity_lookback: Duration::from_millis(500),
            discard_floor_db: -50.0,
            retain_failed: true,
            auto_record: false,
            enable_toggle_signal: true,
            shutdown_deadline: Duration::from_secs(60),
            session: SessionConfig::default(),
            transcription: TranscriptionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_seconds == 0 || self.buffer_seconds > 600 {
            return Err(HindsightError::Config(format!(
                "buffer_seconds must be in 1..=600, got {}",
                self.buffer_seconds
            )));
        }
        if self.live_queue_seconds == 0 {
            return Err(HindsightError::Config(
                "live_queue_seconds must be at least 1".into(),
            ));
        }
        if self.onset_threshold_db <= self.offset_threshold_db {
            return Err(HindsightError::Config(format!(
                "onset threshold ({} dB) must be above the offset threshold ({} dB)",
                self.onset_threshold_db, self.offset_threshold_db
            )));
        }
        if !(-100.0..=0.0).contains(&self.onset_threshold_db)
            || !(-100.0..=0.0).contains(&self.offset_threshold_db)
            || !(-100.0..=0.0).contains(&self.discard_floor_db)
        {
            return Err(HindsightError::Config(
                "thresholds must lie within -100..=0 dB".into(),
            ));
        }
        if self.shutdown_deadline.is_zero() {
            return Err(HindsightError::Config(
                "shutdown_deadline must be non-zero".into(),
            ));
        }
        if self.transcription.enabled {
            self.transcription.backend.validate()?;
            if self.transcription.dispatcher.max_attempts == 0 {
                return Err(HindsightError::Config(
                    "transcription max_attempts must be at least 1".into(),
                ));
            }
        }
        Ok(())
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            onset_threshold_db: self.onset_threshold_db,
            offset_threshold_db: self.offset_threshold_db,
            onset_sustain: self.onset_sustain,
            silence_timeout: self.silence_timeout,
            activity_floor_db: self.activity_floor_db,
            activity_lookback: self.activity_lookback,
            discard_floor_db: self.discard_floor_db,
            retain_failed: self.retain_failed,
            auto_record: self.auto_record,
            transcription_enabled: self.transcription.enabled,
        }
    }
}

struct RunningState {
    shared: CaptureShared,
    events_tx: SyncSender<ControlEvent>,
    coordinator: tokio::task::JoinHandle<()>,
    dispatcher: Option<Arc<Dispatcher>>,
    toggle_task: Option<tokio::task::JoinHandle<()>>,
    /// Removed on drop, so a crash-free exit always cleans up.
    _pid_file: Option<trigger::PidFile>,
    sample_rate: u32,
    channels: u16,
}

/// The top-level engine handle. `Send + Sync`; wrap in `Arc` to share
/// with observer-forwarding tasks.
pub struct HindsightEngine {
    config: EngineConfig,
    sessions: Arc<Mutex<SessionStore>>,
    client: Option<TranscriptionClient>,
    recording_active: Arc<AtomicBool>,
    running: Mutex<Option<RunningState>>,
    preferred_inputs: Mutex<Vec<String>>,
    level_tx: broadcast::Sender<LevelEvent>,
    state_tx: broadcast::Sender<StateChangeEvent>,
    session_tx: broadcast::Sender<SessionEvent>,
}

impl HindsightEngine {
    /// Validate configuration, sweep stale temp sessions, and open a
    /// fresh session. Does not touch the audio device — call `start()`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let mut store = SessionStore::new(config.session.temp_root.clone())?;
        match store.cleanup_older_than(config.session.auto_cleanup_days) {
            Ok(0) => {}
            Ok(n) => info!(sessions = n, "cleaned up old temp sessions"),
            Err(e) => warn!("temp session cleanup failed: {e}"),
        }
        store.create_session()?;

        let client = if config.transcription.enabled {
            Some(TranscriptionClient::new(config.transcription.backend.clone())?)
        } else {
            None
        };

        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (state_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (session_tx, _) = broadcast::channel(BROADCAST_CAP);

        Ok(Self {
            preferred_inputs: Mutex::new(config.preferred_inputs.clone()),
            config,
            sessions: Arc::new(Mutex::new(store)),
            client,
            recording_active: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
            level_tx,
            state_tx,
            session_tx,
        })
    }

    /// Open the audio device and start the coordinator.
    ///
    /// Blocks until the device open is confirmed (or failed). Must be
    /// called within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        if self.running.lock().is_some() {
            return Err(HindsightError::AlreadyRunning);
        }

        let (events_tx, events_rx) = sync_channel::<ControlEvent>(CONTROL_QUEUE_CAP);

        let dispatcher = match &self.client {
            Some(client) => {
                let outcome_tx = events_tx.clone();
                Some(Arc::new(Dispatcher::new(
                    client.clone(),
                    self.config.transcription.dispatcher.clone(),
                    move |outcome: TranscriptionOutcome| {
                        if outcome_tx
                            .try_send(ControlEvent::Transcription(outcome))
                            .is_err()
                        {
                            warn!("control channel unavailable; transcription outcome dropped");
                        }
                    },
                )))
            }
            None => None,
        };

        let controller_config = self.config.controller_config();
        let buffer_seconds = self.config.buffer_seconds;
        let live_queue_seconds = self.config.live_queue_seconds;
        let preferred = self.preferred_inputs.lock().first().cloned();
        let recording_active = Arc::clone(&self.recording_active);
        let sessions = Arc::clone(&self.sessions);
        let level_tx = self.level_tx.clone();
        let state_tx = self.state_tx.clone();
        let session_tx = self.session_tx.clone();
        let dispatcher_for_ctx = dispatcher.clone();
        let ctx_events_tx = events_tx.clone();

        // Open confirmation: carries the capture handles on success.
        let (open_tx, open_rx) = sync_channel::<Result<(CaptureShared, u32, u16)>>(1);

        let coordinator = tokio::task::spawn_blocking(move || {
            // The stream must be created and dropped on this thread.
            let (capture, live_consumer) = match AudioCapture::open_with_preference(
                buffer_seconds,
                live_queue_seconds,
                Arc::clone(&recording_active),
                preferred.as_deref(),
            ) {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    return;
                }
            };

            let shared = capture.shared();
            let _ = open_tx.send(Ok((shared.clone(), capture.sample_rate, capture.channels)));

            controller::run(ControllerContext {
                config: controller_config,
                history: Arc::clone(&shared.history),
                meter: Arc::clone(&shared.meter),
                live_consumer: Arc::new(Mutex::new(live_consumer)),
                recording_active: Arc::clone(&shared.recording_active),
                input_connected: Arc::clone(&shared.input_connected),
                events: events_rx,
                events_tx: ctx_events_tx,
                sessions,
                dispatcher: dispatcher_for_ctx,
                level_tx,
                state_tx,
                session_tx,
                sample_rate: capture.sample_rate,
                channels: capture.channels,
            });

            capture.stop();
            drop(capture);
        });

        let (shared, sample_rate, channels) = match open_rx.recv() {
            Ok(Ok(open)) => open,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(HindsightError::AudioServerUnavailable(
                    "capture thread died before confirming device open".into(),
                ))
            }
        };

        let (toggle_task, pid_file) = if self.config.enable_toggle_signal {
            let task = match trigger::spawn_toggle_listener(events_tx.clone()) {
                Ok(handle) => Some(handle),
                Err(HindsightError::ToggleUnsupported) => None,
                Err(e) => {
                    warn!("toggle signal listener unavailable: {e}");
                    None
                }
            };
            // The pid file only matters if the listener is up.
            let pid_file = if task.is_some() {
                match trigger::PidFile::create() {
                    Ok(f) => Some(f),
                    Err(e) => {
                        warn!("failed to write pid file: {e}");
                        None
                    }
                }
            } else {
                None
            };
            (task, pid_file)
        } else {
            (None, None)
        };

        *self.running.lock() = Some(RunningState {
            shared,
            events_tx,
            coordinator,
            dispatcher,
            toggle_task,
            _pid_file: pid_file,
            sample_rate,
            channels,
        });

        info!(sample_rate, channels, "engine started");
        Ok(())
    }

    // ── control surface ──────────────────────────────────────────────────

    /// Advance the recording controller one step: start when idle, stop
    /// when recording.
    pub fn toggle(&self) -> Result<()> {
        self.send(ControlEvent::Toggle)
    }

    pub fn set_auto_record(&self, enabled: bool) -> Result<()> {
        self.send(ControlEvent::SetAuto(enabled))
    }

    /// Change the input selection. Validates the requested names against
    /// a fresh scan of the input graph, then reopens capture when
    /// running. Refused while a recording is active.
    pub async fn select_inputs(&self, inputs: &[String]) -> Result<()> {
        InputGraph::scan().validate(inputs)?;
        if self.recording_active.load(Ordering::Acquire) {
            return Err(HindsightError::RecordingInProgress);
        }
        *self.preferred_inputs.lock() = inputs.to_vec();

        if self.running.lock().is_some() {
            info!("input selection changed; reopening capture");
            self.stop().await?;
            self.start()?;
        }
        Ok(())
    }

    /// Readiness of the transcription backend; `false` when transcription
    /// is disabled.
    pub async fn health(&self) -> bool {
        match &self.client {
            Some(client) => client.health().await,
            None => false,
        }
    }

    /// Copy the current session to permanent storage. Refused while
    /// recording.
    pub fn save_session(&self, destination: &Path) -> Result<PathBuf> {
        if self.recording_active.load(Ordering::Acquire) {
            return Err(HindsightError::RecordingInProgress);
        }
        self.sessions.lock().save_session(destination)
    }

    /// Discard the current session's temp files. Refused while recording.
    pub fn discard_session(&self) -> Result<()> {
        if self.recording_active.load(Ordering::Acquire) {
            return Err(HindsightError::RecordingInProgress);
        }
        self.sessions.lock().discard_session()
    }

    /// Begin cooperative shutdown without waiting for completion.
    pub fn request_shutdown(&self) {
        let running = self.running.lock();
        if let Some(state) = running.as_ref() {
            if let Some(dispatcher) = &state.dispatcher {
                dispatcher.begin_shutdown();
            }
            let _ = state.events_tx.try_send(ControlEvent::Shutdown);
        }
    }

    /// Full cooperative shutdown: the coordinator drains the writer
    /// first, then transcription workers get whatever remains of the
    /// deadline. Returns the number of abandoned transcription jobs.
    pub async fn shutdown(&self) -> Result<usize> {
        let Some(state) = self.running.lock().take() else {
            return Err(HindsightError::NotRunning);
        };

        if let Some(dispatcher) = &state.dispatcher {
            dispatcher.begin_shutdown();
        }
        let _ = state.events_tx.try_send(ControlEvent::Shutdown);

        let deadline = self.config.shutdown_deadline;
        let started = tokio::time::Instant::now();

        // Writer completion is prioritized: the coordinator does not
        // return until its writer is drained (or its internal grace
        // period lapses).
        if tokio::time::timeout(deadline, state.coordinator).await.is_err() {
            warn!("coordinator did not stop within the shutdown deadline; unwritten audio lost");
        }

        let mut abandoned = 0;
        if let Some(dispatcher) = &state.dispatcher {
            let remaining = deadline.saturating_sub(started.elapsed());
            abandoned = dispatcher.shutdown(remaining).await;
        }
        if let Some(task) = state.toggle_task {
            task.abort();
        }

        info!(abandoned, "engine shut down");
        Ok(abandoned)
    }

    /// Stop capture and the coordinator without tearing down the session
    /// (used by input reselection).
    async fn stop(&self) -> Result<()> {
        let Some(state) = self.running.lock().take() else {
            return Err(HindsightError::NotRunning);
        };
        let _ = state.events_tx.try_send(ControlEvent::Shutdown);
        let _ = tokio::time::timeout(Duration::from_secs(15), state.coordinator).await;
        if let Some(task) = state.toggle_task {
            task.abort();
        }
        // The dispatcher survives a capture restart; in-flight jobs keep
        // their outcome channel until the old sender drops.
        Ok(())
    }

    // ── observers ────────────────────────────────────────────────────────

    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelEvent> {
        self.level_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    // ── introspection ────────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.recording_active.load(Ordering::Acquire)
    }

    /// Pre-roll fill fraction in [0, 1]; 0 while stopped.
    pub fn buffer_fill(&self) -> f32 {
        self.running
            .lock()
            .as_ref()
            .map(|s| s.shared.history.fill_fraction())
            .unwrap_or(0.0)
    }

    /// Device rate and channel count once running.
    pub fn audio_format(&self) -> Option<(u32, u16)> {
        self.running
            .lock()
            .as_ref()
            .map(|s| (s.sample_rate, s.channels))
    }

    /// Current snapshot of selectable input ports.
    pub fn input_ports(&self) -> Vec<InputPort> {
        InputGraph::scan().ports().to_vec()
    }

    fn send(&self, event: ControlEvent) -> Result<()> {
        let running = self.running.lock();
        let state = running.as_ref().ok_or(HindsightError::NotRunning)?;
        state
            .events_tx
            .try_send(event)
            .map_err(|_| HindsightError::Other(anyhow::anyhow!("control channel full")))
    }
}
