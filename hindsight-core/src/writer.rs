//! Off-thread WAV writer.
//!
//! One writer thread per recording. It writes the pre-roll snapshot
//! first, then drains the live queue in capture order until the stop flag
//! is set and the queue is empty, finalizes the file, and reports
//! duration / peak / average RMS back to the controller. The writer only
//! ever reads its snapshot copy and the consumer half of the live queue —
//! it can never stall the capture callback.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hound::{WavSpec, WavWriter};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::audio::levels::linear_to_db;
use crate::buffering::{Consumer, LiveConsumer};
use crate::error::{HindsightError, Result};

/// Sleep while the live queue is empty. Long enough to avoid burning a
/// core, short enough that the stop flag is observed promptly.
const EMPTY_SLEEP: Duration = Duration::from_millis(5);

/// Scratch block size in samples for draining the live queue.
const DRAIN_BLOCK: usize = 8192;

/// Everything a writer needs, handed over at spawn.
pub struct WriterJob {
    pub path: PathBuf,
    /// Unwrapped pre-roll, interleaved, oldest first.
    pub snapshot: Vec<f32>,
    pub consumer: Arc<Mutex<LiveConsumer>>,
    /// Set by the controller once capture stops feeding the queue.
    pub stop: Arc<AtomicBool>,
    pub channels: u16,
    pub sample_rate: u32,
}

/// Stats published when the file is closed.
#[derive(Debug, Clone, Copy)]
pub struct WriterReport {
    pub frames: u64,
    pub duration_seconds: f64,
    pub peak: f32,
    pub average_rms_db: f32,
}

/// Spawn the writer thread. `on_done` fires exactly once with the final
/// result; the thread never panics on I/O failure.
pub fn spawn(
    job: WriterJob,
    on_done: impl FnOnce(Result<WriterReport>) + Send + 'static,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("hindsight-writer".into())
        .spawn(move || {
            let path = job.path.clone();
            let result = run(job);
            if let Err(e) = &result {
                debug!(path = %path.display(), "writer finished with error: {e}");
            }
            on_done(result);
        })
}

fn run(job: WriterJob) -> Result<WriterReport> {
    let spec = WavSpec {
        channels: job.channels,
        sample_rate: job.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut wav = WavWriter::create(&job.path, spec)
        .map_err(|e| HindsightError::WriterIo(e.to_string()))?;

    let mut stats = Stats::default();

    write_block(&mut wav, &job.snapshot, &mut stats)?;
    debug!(
        path = %job.path.display(),
        preroll_samples = job.snapshot.len(),
        "pre-roll written, draining live queue"
    );

    let mut scratch = vec![0f32; DRAIN_BLOCK];
    loop {
        let n = job.consumer.lock().pop_slice(&mut scratch);
        if n == 0 {
            if job.stop.load(Ordering::Acquire) {
                // Stop observed with an empty queue: capture stopped
                // feeding before the flag was set, so we are done.
                break;
            }
            thread::sleep(EMPTY_SLEEP);
            continue;
        }
        write_block(&mut wav, &scratch[..n], &mut stats)?;
    }

    wav.finalize()
        .map_err(|e| HindsightError::WriterIo(e.to_string()))?;
    // finalize() flushes the header; make the data durable before the
    // controller acknowledges the stop.
    File::open(&job.path)?.sync_all()?;

    let frames = stats.samples / u64::from(job.channels.max(1));
    let report = WriterReport {
        frames,
        duration_seconds: frames as f64 / f64::from(job.sample_rate.max(1)),
        peak: stats.peak,
        average_rms_db: stats.average_rms_db(),
    };
    info!(
        path = %job.path.display(),
        frames = report.frames,
        duration_s = format_args!("{:.2}", report.duration_seconds),
        avg_rms_db = format_args!("{:.1}", report.average_rms_db),
        "recording file closed"
    );
    Ok(report)
}

#[derive(Default)]
struct Stats {
    samples: u64,
    peak: f32,
    sum_squares: f64,
}

impl Stats {
    fn average_rms_db(&self) -> f32 {
        if self.samples == 0 {
            return crate::audio::levels::DB_FLOOR;
        }
        let rms = (self.sum_squares / self.samples as f64).sqrt() as f32;
        linear_to_db(rms)
    }
}

fn write_block(
    wav: &mut WavWriter<BufWriter<File>>,
    samples: &[f32],
    stats: &mut Stats,
) -> Result<()> {
    for &sample in samples {
        wav.write_sample(sample)
            .map_err(|e| HindsightError::WriterIo(e.to_string()))?;
        let abs = sample.abs();
        if abs > stats.peak {
            stats.peak = abs;
        }
        stats.sum_squares += f64::from(sample) * f64::from(sample);
    }
    stats.samples += samples.len() as u64;
    Ok(())
}
