//! Recording state machine and coordinator loop.
//!
//! All state transitions happen on one thread: the coordinator consumes
//! `ControlEvent`s from a bounded channel (operator toggles, the writer's
//! completion report, transcription outcomes, shutdown) and runs a ~50 ms
//! tick between events to sample the level meter, drive the signal
//! detector, and publish levels. The capture callback never mutates state
//! — it publishes atomics the tick reads.
//!
//! ```text
//! IDLE ──enable_auto──► ARMED ──onset──► RECORDING_AUTO ──silence──┐
//!  │                      │                   │                    │
//!  └──toggle──► RECORDING_MANUAL ──toggle──► STOPPING ◄────────────┘
//!                                               │ writer done
//!                                               ▼
//!                                        IDLE or ARMED
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::audio::levels::LevelMeter;
use crate::buffering::{history::HistoryBuffer, Consumer, LiveConsumer};
use crate::error::Result;
use crate::ipc::events::{
    CaptureBlockedReason, LevelEvent, RecordingState, SessionEvent, StateChangeEvent,
};
use crate::session::{RecordingMeta, RecordingStatus, SessionStore};
use crate::signal::{SignalDetector, SignalEdge};
use crate::transcribe::dispatcher::{Dispatcher, TranscriptionJob, TranscriptionOutcome};
use crate::writer::{self, WriterJob, WriterReport};

/// Coordinator tick period; also the level-publish cadence (~20 Hz).
const TICK: Duration = Duration::from_millis(50);

/// How long the shutdown path waits for the writer before abandoning it.
const SHUTDOWN_WRITER_GRACE: Duration = Duration::from_secs(10);

/// Events consumed by the coordinator.
pub enum ControlEvent {
    /// Operator toggle: start or stop depending on state.
    Toggle,
    /// Enable or disable auto-record.
    SetAuto(bool),
    /// The writer closed its file (or failed).
    WriterFinished(Result<WriterReport>),
    /// A transcription job reached a terminal state.
    Transcription(TranscriptionOutcome),
    /// Begin cooperative shutdown.
    Shutdown,
}

/// Controller tuning, extracted from `EngineConfig` by the engine.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub onset_threshold_db: f32,
    pub offset_threshold_db: f32,
    pub onset_sustain: Duration,
    pub silence_timeout: Duration,
    pub activity_floor_db: f32,
    pub activity_lookback: Duration,
    /// Recordings whose average RMS falls below this are discarded.
    pub discard_floor_db: f32,
    /// Keep the partial file when the writer fails mid-recording.
    pub retain_failed: bool,
    /// Start with auto-record armed.
    pub auto_record: bool,
    pub transcription_enabled: bool,
}

/// Everything the coordinator needs, passed as one struct so the
/// spawn-site stays tidy.
pub struct ControllerContext {
    pub config: ControllerConfig,
    pub history: Arc<HistoryBuffer>,
    pub meter: Arc<LevelMeter>,
    pub live_consumer: Arc<Mutex<LiveConsumer>>,
    /// Gate the callback checks before pushing onto the live queue.
    pub recording_active: Arc<AtomicBool>,
    /// True while the capture stream has an input connected.
    pub input_connected: Arc<AtomicBool>,
    pub events: Receiver<ControlEvent>,
    /// Clone handed to writer threads for their completion report.
    pub events_tx: SyncSender<ControlEvent>,
    pub sessions: Arc<Mutex<SessionStore>>,
    pub dispatcher: Option<Arc<Dispatcher>>,
    pub level_tx: broadcast::Sender<LevelEvent>,
    pub state_tx: broadcast::Sender<StateChangeEvent>,
    pub session_tx: broadcast::Sender<SessionEvent>,
    pub sample_rate: u32,
    pub channels: u16,
}

struct ActiveRecording {
    ordinal: u32,
    path: PathBuf,
    started_at: chrono::DateTime<Utc>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

struct Coordinator {
    ctx: ControllerContext,
    detector: SignalDetector,
    state: RecordingState,
    auto_enabled: bool,
    active: Option<ActiveRecording>,
    /// Next ordinal to assign. Monotonic; never reused even for discards.
    next_ordinal: u32,
    snapshot_buf: Vec<f32>,
    level_seq: u64,
    last_dropped: u64,
}

/// Run the coordinator until shutdown. Blocking; the engine calls this
/// inside `spawn_blocking`.
pub fn run(ctx: ControllerContext) {
    let detector = SignalDetector::new(
        ctx.config.onset_threshold_db,
        ctx.config.offset_threshold_db,
        ctx.config.onset_sustain,
        ctx.config.silence_timeout,
        ctx.config.activity_floor_db,
    );
    let capacity = ctx.history.capacity_frames() * ctx.history.channels();
    let auto = ctx.config.auto_record;

    let mut coordinator = Coordinator {
        detector,
        state: if auto {
            RecordingState::Armed
        } else {
            RecordingState::Idle
        },
        auto_enabled: auto,
        active: None,
        next_ordinal: 1,
        snapshot_buf: Vec::with_capacity(capacity),
        level_seq: 0,
        last_dropped: 0,
        ctx,
    };

    info!(state = ?coordinator.state, "recording controller started");
    coordinator.publish_state("startup");

    loop {
        match coordinator.ctx.events.recv_timeout(TICK) {
            Ok(ControlEvent::Shutdown) => break,
            Ok(event) => coordinator.handle_event(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        coordinator.tick(Instant::now());
    }

    coordinator.shutdown();
    info!("recording controller stopped");
}

impl Coordinator {
    fn handle_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Toggle => self.on_toggle(),
            ControlEvent::SetAuto(enabled) => self.on_set_auto(enabled),
            ControlEvent::WriterFinished(result) => self.on_writer_finished(result),
            ControlEvent::Transcription(outcome) => self.on_transcription(outcome),
            ControlEvent::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    // ── tick work ────────────────────────────────────────────────────────

    fn tick(&mut self, now: Instant) {
        let rms_db = self.ctx.meter.rms_db();
        let edge = self.detector.update(rms_db, now);

        match (edge, self.state) {
            (Some(SignalEdge::Onset), RecordingState::Armed) => {
                debug!(rms_db, "signal onset while armed");
                self.start_recording(true, "signal_onset");
            }
            (Some(SignalEdge::Offset), RecordingState::RecordingAuto) => {
                info!("silence timeout elapsed; auto-stopping");
                self.begin_stop("silence_elapsed");
            }
            _ => {}
        }

        self.publish_levels();
        self.report_underruns();
    }

    fn publish_levels(&mut self) {
        let event = LevelEvent {
            seq: self.level_seq,
            peaks_db: self.ctx.meter.peaks_db(),
            rms_db: self.ctx.meter.rms_db(),
            buffer_fill: self.ctx.history.fill_fraction(),
        };
        self.level_seq = self.level_seq.wrapping_add(1);
        let _ = self.ctx.level_tx.send(event);
    }

    fn report_underruns(&mut self) {
        let dropped = self.ctx.meter.dropped_samples();
        if dropped > self.last_dropped {
            let delta = dropped - self.last_dropped;
            self.last_dropped = dropped;
            warn!(dropped_samples = delta, "live queue overrun; frames dropped");
            let _ = self.ctx.session_tx.send(SessionEvent::CaptureUnderrun {
                dropped_samples: delta,
            });
        }
    }

    // ── operator events ──────────────────────────────────────────────────

    fn on_toggle(&mut self) {
        match self.state {
            RecordingState::Idle | RecordingState::Armed => {
                if !self.gate_passes() {
                    return;
                }
                self.start_recording(false, "toggle");
            }
            RecordingState::RecordingManual | RecordingState::RecordingAuto => {
                self.begin_stop("toggle");
            }
            RecordingState::Stopping => {
                debug!("toggle ignored while stopping");
                let _ = self.ctx.session_tx.send(SessionEvent::CaptureBlocked {
                    reason: CaptureBlockedReason::StopInProgress,
                });
            }
        }
    }

    fn on_set_auto(&mut self, enabled: bool) {
        self.auto_enabled = enabled;
        match (enabled, self.state) {
            (true, RecordingState::Idle) => {
                self.detector.reset();
                self.set_state(RecordingState::Armed, "enable_auto");
            }
            (false, RecordingState::Armed) => {
                self.set_state(RecordingState::Idle, "disable_auto");
            }
            (false, RecordingState::RecordingAuto) => {
                // Disabling auto mid-take ends the take.
                self.begin_stop("disable_auto");
            }
            _ => {}
        }
    }

    /// The activity gate for manual triggers: refuse only when no input is
    /// connected. With inputs present the gate falls open — a connected
    /// but silent input is still recordable.
    fn gate_passes(&mut self) -> bool {
        if !self.ctx.input_connected.load(Ordering::Acquire) {
            info!("manual trigger refused: no input connected");
            let _ = self.ctx.session_tx.send(SessionEvent::CaptureBlocked {
                reason: CaptureBlockedReason::PortsMissing,
            });
            return false;
        }
        if !self
            .detector
            .active_within(self.ctx.config.activity_lookback, Instant::now())
        {
            debug!("input connected but silent over the look-back window");
        }
        true
    }

    // ── recording lifecycle ──────────────────────────────────────────────

    fn start_recording(&mut self, auto: bool, reason: &str) {
        let ordinal = self.next_ordinal;
        let path = {
            let sessions = self.ctx.sessions.lock();
            let Some(session) = sessions.current() else {
                error!("no active session; cannot start recording");
                return;
            };
            session.recording_path(ordinal)
        };

        let preroll_frames = self.ctx.history.snapshot_into(&mut self.snapshot_buf);
        let snapshot = self.snapshot_buf.clone();

        // Stale audio from a previous recording may still sit in the live
        // queue; flush it before the callback starts feeding again.
        {
            let mut consumer = self.ctx.live_consumer.lock();
            let mut scratch = [0f32; 4096];
            while consumer.pop_slice(&mut scratch) > 0 {}
        }

        let stop = Arc::new(AtomicBool::new(false));
        let events_tx = self.ctx.events_tx.clone();
        let job = WriterJob {
            path: path.clone(),
            snapshot,
            consumer: Arc::clone(&self.ctx.live_consumer),
            stop: Arc::clone(&stop),
            channels: self.ctx.channels,
            sample_rate: self.ctx.sample_rate,
        };
        let join = match writer::spawn(job, move |result| {
            let _ = events_tx.send(ControlEvent::WriterFinished(result));
        }) {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to spawn writer thread: {e}");
                let _ = self.ctx.session_tx.send(SessionEvent::RecordingFailed {
                    ordinal,
                    error: e.to_string(),
                });
                return;
            }
        };

        self.ctx.recording_active.store(true, Ordering::Release);
        self.next_ordinal += 1;

        let preroll = Duration::from_secs_f64(
            f64::from(preroll_frames as u32) / f64::from(self.ctx.sample_rate.max(1)),
        );
        let started_at = Utc::now()
            - chrono::Duration::from_std(preroll).unwrap_or_else(|_| chrono::Duration::zero());

        info!(
            ordinal,
            path = %path.display(),
            preroll_frames,
            auto,
            "recording started"
        );

        self.active = Some(ActiveRecording {
            ordinal,
            path,
            started_at,
            stop,
            join: Some(join),
        });
        self.detector.reset();
        self.set_state(
            if auto {
                RecordingState::RecordingAuto
            } else {
                RecordingState::RecordingManual
            },
            reason,
        );
    }

    fn begin_stop(&mut self, reason: &str) {
        let Some(active) = &self.active else {
            warn!("stop requested with no active recording");
            return;
        };
        let stop = Arc::clone(&active.stop);
        // Order matters: stop feeding the queue first, then tell the
        // writer, so "stop observed + queue empty" really means done.
        self.ctx.recording_active.store(false, Ordering::Release);
        stop.store(true, Ordering::Release);
        self.set_state(RecordingState::Stopping, reason);
    }

    fn on_writer_finished(&mut self, result: Result<WriterReport>) {
        let Some(mut active) = self.active.take() else {
            warn!("writer report with no active recording");
            return;
        };
        if let Some(join) = active.join.take() {
            let _ = join.join();
        }

        match result {
            Ok(report) => self.dispose_recording(&active, report),
            Err(e) => {
                error!(ordinal = active.ordinal, "writer failed: {e}");
                if !self.ctx.config.retain_failed {
                    if let Err(rm) = std::fs::remove_file(&active.path) {
                        warn!(path = %active.path.display(), "failed to remove partial file: {rm}");
                    }
                } else if let Some(meta) = self.build_meta(&active, None) {
                    self.register(meta);
                }
                let _ = self.ctx.session_tx.send(SessionEvent::RecordingFailed {
                    ordinal: active.ordinal,
                    error: e.to_string(),
                });
            }
        }

        let next = if self.auto_enabled {
            RecordingState::Armed
        } else {
            RecordingState::Idle
        };
        self.detector.reset();
        self.set_state(next, "writer_finished");
    }

    /// Apply the post-stop disposition: discard below the energy floor,
    /// otherwise register with the session and queue transcription.
    fn dispose_recording(&mut self, active: &ActiveRecording, report: WriterReport) {
        if report.average_rms_db < self.ctx.config.discard_floor_db {
            info!(
                ordinal = active.ordinal,
                average_rms_db = report.average_rms_db,
                floor_db = self.ctx.config.discard_floor_db,
                "recording below energy floor; discarding"
            );
            if let Err(e) = std::fs::remove_file(&active.path) {
                warn!(path = %active.path.display(), "failed to remove discarded recording: {e}");
            }
            let _ = self.ctx.session_tx.send(SessionEvent::RecordingDiscarded {
                ordinal: active.ordinal,
                average_rms_db: report.average_rms_db,
            });
            return;
        }

        let Some(meta) = self.build_meta(active, Some(report)) else {
            return;
        };
        self.register(meta.clone());
        let _ = self
            .ctx
            .session_tx
            .send(SessionEvent::RecordingComplete { recording: meta });

        if self.ctx.config.transcription_enabled {
            if let Some(dispatcher) = &self.ctx.dispatcher {
                let transcript_path = {
                    let sessions = self.ctx.sessions.lock();
                    sessions
                        .current()
                        .map(|s| s.transcript_path(active.ordinal))
                };
                if let Some(transcript_path) = transcript_path {
                    dispatcher.enqueue(TranscriptionJob {
                        ordinal: active.ordinal,
                        audio_path: active.path.clone(),
                        transcript_path,
                    });
                }
            }
        }
    }

    fn build_meta(
        &self,
        active: &ActiveRecording,
        report: Option<WriterReport>,
    ) -> Option<RecordingMeta> {
        let filename = active
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())?;
        Some(RecordingMeta {
            ordinal: active.ordinal,
            filename,
            timestamp: active.started_at,
            duration_seconds: report.map(|r| r.duration_seconds).unwrap_or(0.0),
            channels: self.ctx.channels,
            sample_rate: self.ctx.sample_rate,
            peak: report.map(|r| r.peak).unwrap_or(0.0),
            average_rms_db: report
                .map(|r| r.average_rms_db)
                .unwrap_or(crate::audio::levels::DB_FLOOR),
            status: if report.is_some() {
                RecordingStatus::Completed
            } else {
                RecordingStatus::Failed
            },
        })
    }

    fn register(&self, meta: RecordingMeta) {
        let mut sessions = self.ctx.sessions.lock();
        if let Some(session) = sessions.current_mut() {
            if let Err(e) = session.register_recording(meta) {
                error!("failed to persist session manifest: {e}");
            }
        }
    }

    // ── transcription outcomes ───────────────────────────────────────────

    fn on_transcription(&mut self, outcome: TranscriptionOutcome) {
        match outcome {
            TranscriptionOutcome::Done {
                ordinal,
                text,
                language,
            } => {
                {
                    let mut sessions = self.ctx.sessions.lock();
                    if let Some(session) = sessions.current_mut() {
                        if let Err(e) = session.add_transcript(&text) {
                            warn!(ordinal, "failed to store transcript in session: {e}");
                        }
                    }
                }
                let _ = self.ctx.session_tx.send(SessionEvent::Transcript {
                    ordinal,
                    text,
                    language,
                });
            }
            TranscriptionOutcome::Failed {
                ordinal,
                attempts,
                error,
            } => {
                warn!(ordinal, attempts, "transcription failed: {error}");
                let _ = self
                    .ctx
                    .session_tx
                    .send(SessionEvent::TranscriptError { ordinal, error });
            }
        }
    }

    // ── shutdown ─────────────────────────────────────────────────────────

    /// Finish the in-flight recording (writer completion is prioritized
    /// over everything else), persist the manifest, and go quiet.
    fn shutdown(&mut self) {
        if self.active.is_some() {
            info!("shutdown with active recording; draining writer");
            self.begin_stop("shutdown");

            let deadline = Instant::now() + SHUTDOWN_WRITER_GRACE;
            while self.active.is_some() && Instant::now() < deadline {
                match self.ctx.events.recv_timeout(TICK) {
                    Ok(ControlEvent::WriterFinished(result)) => self.on_writer_finished(result),
                    Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            if self.active.is_some() {
                warn!("writer did not finish before shutdown deadline; audio may be lost");
            }
        }

        {
            let sessions = self.ctx.sessions.lock();
            if let Some(session) = sessions.current() {
                if let Err(e) = session.persist() {
                    warn!("failed to persist session at shutdown: {e}");
                }
            }
        }
        self.set_state(RecordingState::Idle, "shutdown");
    }

    // ── helpers ──────────────────────────────────────────────────────────

    fn set_state(&mut self, state: RecordingState, reason: &str) {
        if self.state != state {
            info!(from = ?self.state, to = ?state, reason, "state transition");
        }
        self.state = state;
        self.publish_state(reason);
    }

    fn publish_state(&self, reason: &str) {
        let _ = self.ctx.state_tx.send(StateChangeEvent {
            state: self.state,
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_live_queue, LiveProducer, Producer};
    use std::sync::mpsc::sync_channel;
    use tempfile::TempDir;

    struct Harness {
        tx: SyncSender<ControlEvent>,
        meter: Arc<LevelMeter>,
        history: Arc<HistoryBuffer>,
        recording_active: Arc<AtomicBool>,
        input_connected: Arc<AtomicBool>,
        producer: LiveProducer,
        sessions: Arc<Mutex<SessionStore>>,
        state_rx: broadcast::Receiver<StateChangeEvent>,
        session_rx: broadcast::Receiver<SessionEvent>,
        join: Option<std::thread::JoinHandle<()>>,
        _tmp: TempDir,
    }

    fn harness(config: ControllerConfig) -> Harness {
        let tmp = TempDir::new().expect("tmp");
        let mut store = SessionStore::new(tmp.path().join("sessions")).expect("store");
        store.create_session().expect("session");
        let sessions = Arc::new(Mutex::new(store));

        let history = Arc::new(HistoryBuffer::new(1_000, 1));
        let meter = Arc::new(LevelMeter::new(1));
        let (producer, consumer) = create_live_queue(16_384);
        let recording_active = Arc::new(AtomicBool::new(false));
        let input_connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = sync_channel(64);
        let (level_tx, _) = broadcast::channel(64);
        let (state_tx, state_rx) = broadcast::channel(64);
        let (session_tx, session_rx) = broadcast::channel(64);

        let ctx = ControllerContext {
            config,
            history: Arc::clone(&history),
            meter: Arc::clone(&meter),
            live_consumer: Arc::new(Mutex::new(consumer)),
            recording_active: Arc::clone(&recording_active),
            input_connected: Arc::clone(&input_connected),
            events: rx,
            events_tx: tx.clone(),
            sessions: Arc::clone(&sessions),
            dispatcher: None,
            level_tx,
            state_tx,
            session_tx,
            sample_rate: 1_000,
            channels: 1,
        };
        let join = std::thread::spawn(move || run(ctx));

        Harness {
            tx,
            meter,
            history,
            recording_active,
            input_connected,
            producer,
            sessions,
            state_rx,
            session_rx,
            join: Some(join),
            _tmp: tmp,
        }
    }

    fn test_config() -> ControllerConfig {
        ControllerConfig {
            onset_threshold_db: -35.0,
            offset_threshold_db: -40.0,
            onset_sustain: Duration::ZERO,
            silence_timeout: Duration::from_millis(150),
            activity_floor_db: -70.0,
            activity_lookback: Duration::from_millis(500),
            discard_floor_db: -50.0,
            retain_failed: true,
            auto_record: false,
            transcription_enabled: false,
        }
    }

    fn wait_for_state(rx: &mut broadcast::Receiver<StateChangeEvent>, want: RecordingState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match rx.try_recv() {
                Ok(event) if event.state == want => return,
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty) => {
                    assert!(Instant::now() < deadline, "timed out waiting for {want:?}");
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(broadcast::error::TryRecvError::Closed) => panic!("state channel closed"),
            }
        }
    }

    fn wait_for_session_event(
        rx: &mut broadcast::Receiver<SessionEvent>,
        mut matches: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match rx.try_recv() {
                Ok(event) if matches(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Empty) => {
                    assert!(Instant::now() < deadline, "timed out waiting for session event");
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(broadcast::error::TryRecvError::Closed) => panic!("session channel closed"),
            }
        }
    }

    impl Harness {
        fn shutdown(mut self) {
            let _ = self.tx.send(ControlEvent::Shutdown);
            if let Some(join) = self.join.take() {
                join.join().expect("coordinator thread");
            }
        }
    }

    #[test]
    fn manual_toggle_records_preroll_and_live_audio() {
        let mut h = harness(test_config());

        // 200 frames of loud pre-roll in the history window.
        h.history.write(&vec![0.5f32; 200]);
        h.meter.store_rms(0.5);

        h.tx.send(ControlEvent::Toggle).expect("toggle");
        wait_for_state(&mut h.state_rx, RecordingState::RecordingManual);
        assert!(h.recording_active.load(Ordering::Acquire));

        // 100 live frames while recording.
        h.producer.push_slice(&vec![0.5f32; 100]);
        std::thread::sleep(Duration::from_millis(100));

        h.tx.send(ControlEvent::Toggle).expect("toggle stop");
        wait_for_state(&mut h.state_rx, RecordingState::Stopping);
        wait_for_state(&mut h.state_rx, RecordingState::Idle);
        assert!(!h.recording_active.load(Ordering::Acquire));

        let event = wait_for_session_event(&mut h.session_rx, |e| {
            matches!(e, SessionEvent::RecordingComplete { .. })
        });
        let SessionEvent::RecordingComplete { recording } = event else {
            unreachable!()
        };
        assert_eq!(recording.ordinal, 1);
        assert_eq!(recording.filename, "001.wav");
        // 200 pre-roll + 100 live frames at 1 kHz.
        assert_eq!(recording.duration_seconds, 0.3);

        let sessions = h.sessions.lock();
        let session = sessions.current().expect("session");
        assert_eq!(session.recordings.len(), 1);
        assert!(session.recording_path(1).is_file());
        drop(sessions);

        h.shutdown();
    }

    #[test]
    fn toggle_refused_without_input_connection() {
        let mut h = harness(test_config());
        h.input_connected.store(false, Ordering::Release);

        h.tx.send(ControlEvent::Toggle).expect("toggle");
        let event = wait_for_session_event(&mut h.session_rx, |e| {
            matches!(e, SessionEvent::CaptureBlocked { .. })
        });
        assert!(matches!(
            event,
            SessionEvent::CaptureBlocked {
                reason: CaptureBlockedReason::PortsMissing
            }
        ));
        assert!(!h.recording_active.load(Ordering::Acquire));

        h.shutdown();
    }

    #[test]
    fn quiet_recording_is_discarded_and_ordinal_not_reused() {
        let mut h = harness(test_config());

        // ~-60 dB content: below the -50 dB floor.
        h.history.write(&vec![0.001f32; 200]);
        h.tx.send(ControlEvent::Toggle).expect("toggle");
        wait_for_state(&mut h.state_rx, RecordingState::RecordingManual);
        h.tx.send(ControlEvent::Toggle).expect("toggle stop");
        wait_for_state(&mut h.state_rx, RecordingState::Idle);

        let event = wait_for_session_event(&mut h.session_rx, |e| {
            matches!(e, SessionEvent::RecordingDiscarded { .. })
        });
        assert!(matches!(
            event,
            SessionEvent::RecordingDiscarded { ordinal: 1, .. }
        ));

        {
            let sessions = h.sessions.lock();
            let session = sessions.current().expect("session");
            assert!(session.recordings.is_empty());
            assert!(!session.recording_path(1).exists());
        }

        // A second, loud recording consumes ordinal 2.
        h.history.write(&vec![0.5f32; 500]);
        h.tx.send(ControlEvent::Toggle).expect("toggle");
        wait_for_state(&mut h.state_rx, RecordingState::RecordingManual);
        h.tx.send(ControlEvent::Toggle).expect("toggle stop");
        wait_for_state(&mut h.state_rx, RecordingState::Idle);

        let event = wait_for_session_event(&mut h.session_rx, |e| {
            matches!(e, SessionEvent::RecordingComplete { .. })
        });
        let SessionEvent::RecordingComplete { recording } = event else {
            unreachable!()
        };
        assert_eq!(recording.ordinal, 2);
        assert_eq!(recording.filename, "002.wav");

        h.shutdown();
    }

    #[test]
    fn auto_record_arms_starts_on_onset_and_stops_on_silence() {
        let mut config = test_config();
        config.auto_record = true;
        let mut h = harness(config);

        wait_for_state(&mut h.state_rx, RecordingState::Armed);

        // Loud signal → onset (zero sustain) → auto recording.
        h.history.write(&vec![0.5f32; 100]);
        h.meter.store_rms(0.5);
        wait_for_state(&mut h.state_rx, RecordingState::RecordingAuto);

        // Silence → offset after the 150 ms timeout → back to ARMED.
        h.meter.store_rms(0.0);
        wait_for_state(&mut h.state_rx, RecordingState::Stopping);
        wait_for_state(&mut h.state_rx, RecordingState::Armed);

        h.shutdown();
    }

    #[test]
    fn set_auto_drives_idle_armed_transitions() {
        let mut h = harness(test_config());

        h.tx.send(ControlEvent::SetAuto(true)).expect("arm");
        wait_for_state(&mut h.state_rx, RecordingState::Armed);

        h.tx.send(ControlEvent::SetAuto(false)).expect("disarm");
        wait_for_state(&mut h.state_rx, RecordingState::Idle);

        h.shutdown();
    }

    #[test]
    fn shutdown_mid_recording_finishes_the_writer_first() {
        let mut h = harness(test_config());

        h.history.write(&vec![0.5f32; 300]);
        h.tx.send(ControlEvent::Toggle).expect("toggle");
        wait_for_state(&mut h.state_rx, RecordingState::RecordingManual);

        let sessions = Arc::clone(&h.sessions);
        h.shutdown();

        // The writer was drained before exit: the file exists and the
        // manifest records it.
        let sessions = sessions.lock();
        let session = sessions.current().expect("session");
        assert_eq!(session.recordings.len(), 1);
        assert!(session.recording_path(1).is_file());
    }
}
