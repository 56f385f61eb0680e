//! Bounded transcription worker pool with retry, backoff, and
//! shutdown-aware cancellation.
//!
//! One tokio task per job, gated by a semaphore so at most
//! `max_concurrent` requests are in flight. Each job retries transient
//! failures with exponential backoff (1 s, 2 s, 4 s, …), checking the
//! process-wide shutdown flag before every attempt and at every sleep.
//! During shutdown the per-attempt timeout collapses to a few seconds so
//! workers fail fast, and in-flight retries are abandoned after the
//! current attempt.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::transcribe::{TranscribeError, TranscriptionClient};

/// A recording handed to the dispatcher on STOP.
#[derive(Debug, Clone)]
pub struct TranscriptionJob {
    pub ordinal: u32,
    pub audio_path: PathBuf,
    /// Where the transcript lands on success (same basename as the audio).
    pub transcript_path: PathBuf,
}

/// Terminal result of a job, delivered to the coordinator.
#[derive(Debug, Clone)]
pub enum TranscriptionOutcome {
    Done {
        ordinal: u32,
        text: String,
        language: Option<String>,
    },
    Failed {
        ordinal: u32,
        attempts: u32,
        error: String,
    },
}

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    pub max_attempts: u32,
    /// Steady-state per-attempt timeout.
    pub request_timeout: Duration,
    /// Per-attempt timeout once shutdown has begun.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_attempts: 3,
            request_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

type OutcomeCallback = Arc<dyn Fn(TranscriptionOutcome) + Send + Sync>;

pub struct Dispatcher {
    client: TranscriptionClient,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    on_outcome: OutcomeCallback,
    runtime: tokio::runtime::Handle,
    tasks: Mutex<Vec<(u32, JoinHandle<()>)>>,
}

impl Dispatcher {
    /// Must be called from within a tokio runtime — workers spawn onto the
    /// ambient runtime handle.
    pub fn new(
        client: TranscriptionClient,
        config: DispatcherConfig,
        on_outcome: impl Fn(TranscriptionOutcome) + Send + Sync + 'static,
    ) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            on_outcome: Arc::new(on_outcome),
            runtime: tokio::runtime::Handle::current(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Readiness of the backend, for the startup probe.
    pub async fn health(&self) -> bool {
        self.client.health().await
    }

    /// Number of jobs not yet finished (queued or in flight).
    pub fn active_jobs(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, handle)| !handle.is_finished());
        tasks.len()
    }

    /// Submit a job. Returns immediately; the outcome callback fires from
    /// a worker task when the job reaches a terminal state.
    pub fn enqueue(&self, job: TranscriptionJob) {
        if self.shutdown.load(Ordering::Acquire) {
            warn!(ordinal = job.ordinal, "dispatcher shut down; job refused");
            (self.on_outcome)(TranscriptionOutcome::Failed {
                ordinal: job.ordinal,
                attempts: 0,
                error: "dispatcher is shutting down".into(),
            });
            return;
        }

        let ordinal = job.ordinal;
        let worker = Worker {
            client: self.client.clone(),
            config: self.config.clone(),
            permits: Arc::clone(&self.permits),
            shutdown: Arc::clone(&self.shutdown),
            shutdown_notify: Arc::clone(&self.shutdown_notify),
            on_outcome: Arc::clone(&self.on_outcome),
        };
        let handle = self.runtime.spawn(worker.run(job));

        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, h)| !h.is_finished());
        tasks.push((ordinal, handle));
    }

    /// Begin shutdown: new jobs are refused, sleeping retries wake and
    /// abandon, in-flight requests switch to the short timeout.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
    }

    /// Wait up to `deadline` for workers to finish, then abandon the rest.
    /// Returns the number of abandoned jobs.
    pub async fn shutdown(&self, deadline: Duration) -> usize {
        self.begin_shutdown();

        let drained: Vec<(u32, JoinHandle<()>)> = std::mem::take(&mut *self.tasks.lock());
        let mut abandoned = 0;
        let started = tokio::time::Instant::now();
        for (ordinal, mut handle) in drained {
            let remaining = deadline.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    handle.abort();
                    abandoned += 1;
                    warn!(
                        ordinal,
                        "transcription worker exceeded shutdown deadline; abandoned (transcript lost)"
                    );
                }
            }
        }
        abandoned
    }
}

struct Worker {
    client: TranscriptionClient,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    on_outcome: OutcomeCallback,
}

impl Worker {
    async fn run(self, job: TranscriptionJob) {
        // Closing the semaphore never happens, so acquisition only fails
        // if the dispatcher is dropped mid-run; treat it as preemption.
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                (self.on_outcome)(TranscriptionOutcome::Failed {
                    ordinal: job.ordinal,
                    attempts: 0,
                    error: "dispatcher dropped".into(),
                });
                return;
            }
        };

        let mut attempt = 0u32;
        let mut last_error: Option<TranscribeError> = None;

        while attempt < self.config.max_attempts {
            if self.shutdown.load(Ordering::Acquire) && attempt > 0 {
                // Shutdown preempted the remaining retries.
                break;
            }
            attempt += 1;

            let timeout = if self.shutdown.load(Ordering::Acquire) {
                self.config.shutdown_timeout
            } else {
                self.config.request_timeout
            };

            match self.client.transcribe(&job.audio_path, timeout).await {
                Ok(transcript) => {
                    if let Err(e) =
                        tokio::fs::write(&job.transcript_path, &transcript.text).await
                    {
                        warn!(
                            ordinal = job.ordinal,
                            path = %job.transcript_path.display(),
                            "failed to write transcript file: {e}"
                        );
                    }
                    info!(ordinal = job.ordinal, attempt, "transcription complete");
                    (self.on_outcome)(TranscriptionOutcome::Done {
                        ordinal: job.ordinal,
                        text: transcript.text,
                        language: transcript.language,
                    });
                    return;
                }
                Err(e) => {
                    let give_up = !e.is_retryable()
                        || attempt >= self.config.max_attempts
                        || self.shutdown.load(Ordering::Acquire);
                    if give_up {
                        last_error = Some(e);
                        break;
                    }

                    let backoff = Duration::from_secs(1u64 << (attempt - 1));
                    warn!(
                        ordinal = job.ordinal,
                        attempt,
                        backoff_s = backoff.as_secs(),
                        error = %e,
                        "transcription attempt failed; retrying"
                    );
                    last_error = Some(e);

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown_notify.notified() => {
                            // Wake early; the loop head sees the flag.
                        }
                    }
                }
            }
        }

        let error = match last_error {
            Some(e) => e.to_string(),
            None => "shutdown preempted transcription".into(),
        };
        warn!(ordinal = job.ordinal, attempts = attempt, error = %error, "transcription failed");
        (self.on_outcome)(TranscriptionOutcome::Failed {
            ordinal: job.ordinal,
            attempts: attempt,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcribe::TranscriptionBackend;

    fn client() -> TranscriptionClient {
        TranscriptionClient::new(TranscriptionBackend::Local {
            // Unroutable per RFC 5737; requests fail fast with a network error.
            url: "http://192.0.2.1:9".into(),
            inference_path: "/inference".into(),
        })
        .expect("client")
    }

    #[tokio::test]
    async fn refused_jobs_report_failure_after_shutdown() {
        let (tx, rx) = std::sync::mpsc::channel();
        let dispatcher = Dispatcher::new(client(), DispatcherConfig::default(), move |outcome| {
            let _ = tx.send(outcome);
        });

        dispatcher.begin_shutdown();
        dispatcher.enqueue(TranscriptionJob {
            ordinal: 1,
            audio_path: "/nonexistent.wav".into(),
            transcript_path: "/nonexistent.md".into(),
        });

        match rx.recv_timeout(Duration::from_secs(1)).expect("outcome") {
            TranscriptionOutcome::Failed {
                ordinal, attempts, ..
            } => {
                assert_eq!(ordinal, 1);
                assert_eq!(attempts, 0);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreadable_file_fails_without_retry() {
        let (tx, rx) = std::sync::mpsc::channel();
        let config = DispatcherConfig {
            request_timeout: Duration::from_secs(1),
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(client(), config, move |outcome| {
            let _ = tx.send(outcome);
        });

        dispatcher.enqueue(TranscriptionJob {
            ordinal: 7,
            audio_path: "/this/file/does/not/exist.wav".into(),
            transcript_path: "/tmp/out.md".into(),
        });

        let outcome = tokio::task::spawn_blocking(move || {
            rx.recv_timeout(Duration::from_secs(5)).expect("outcome")
        })
        .await
        .expect("join");

        match outcome {
            TranscriptionOutcome::Failed { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(dispatcher.shutdown(Duration::from_secs(1)).await, 0);
    }
}
