//! Audio capture via the cpal backend.
//!
//! # Design constraints
//!
//! The input callback runs on an OS audio thread at real-time priority.
//! It **must not**:
//! - allocate heap memory
//! - take a lock or block
//! - perform I/O or logging
//! - do anything super-linear in the block size
//!
//! Per invocation the callback does exactly four things: write the block
//! into the pre-roll [`HistoryBuffer`], update the peak atomics (plus a
//! downsampled RMS figure every Kth block), push the block onto the live
//! SPSC queue when a recording is active (short pushes bump the drop
//! counter — degradation, not failure), and return. All scratch storage
//! is pre-allocated before the stream starts.
//!
//! # Threading note
//!
//! Platform audio APIs pin `cpal::Stream` to its creation thread
//! (`!Send`), so the coordinator's blocking thread both opens and drops
//! the capture handle; nothing else ever holds it.

pub mod device;
pub mod levels;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffering::{history::HistoryBuffer, LiveConsumer, LiveProducer, Producer};
use crate::error::Result;
use levels::LevelMeter;

#[cfg(feature = "audio-cpal")]
use crate::buffering::create_live_queue;

#[cfg(feature = "audio-cpal")]
use crate::error::HindsightError;
#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

/// Compute and publish RMS every Kth callback to keep the hot path cheap.
const RMS_EVERY_K_BLOCKS: u32 = 10;

/// Scratch sizes pre-allocated before the stream starts. Blocks larger
/// than the conversion scratch are processed in chunks, never allocated
/// for.
#[cfg(feature = "audio-cpal")]
const CONVERT_SCRATCH_SAMPLES: usize = 16_384;

/// State shared between the callback, the coordinator, and the engine.
#[derive(Clone)]
pub struct CaptureShared {
    pub history: Arc<HistoryBuffer>,
    pub meter: Arc<LevelMeter>,
    /// Callback pushes onto the live queue only while this is set.
    pub recording_active: Arc<AtomicBool>,
    /// True while the stream is open on a connected input.
    pub input_connected: Arc<AtomicBool>,
}

/// Handle to an active input stream.
///
/// **Not `Send`** — create and drop on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    shared: CaptureShared,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Everything the callback owns. Boxed into the stream closure once; no
/// further allocation after `new`.
struct CallbackState {
    history: Arc<HistoryBuffer>,
    meter: Arc<LevelMeter>,
    recording_active: Arc<AtomicBool>,
    producer: LiveProducer,
    channels: usize,
    /// Per-channel peak scratch, length `channels`.
    peak_scratch: Vec<f32>,
    /// RMS accumulation across blocks.
    sum_squares: f64,
    accumulated_samples: u64,
    blocks_since_rms: u32,
}

impl CallbackState {
    fn new(
        history: Arc<HistoryBuffer>,
        meter: Arc<LevelMeter>,
        recording_active: Arc<AtomicBool>,
        producer: LiveProducer,
        channels: usize,
    ) -> Self {
        Self {
            history,
            meter,
            recording_active,
            producer,
            channels,
            peak_scratch: vec![0.0; channels],
            sum_squares: 0.0,
            accumulated_samples: 0,
            blocks_since_rms: 0,
        }
    }

    /// The whole per-invocation contract, on already-f32 interleaved data.
    #[inline]
    fn process(&mut self, interleaved: &[f32]) {
        self.history.write(interleaved);

        for peak in self.peak_scratch.iter_mut() {
            *peak = 0.0;
        }
        for frame in interleaved.chunks_exact(self.channels) {
            for (c, &sample) in frame.iter().enumerate() {
                let abs = sample.abs();
                if abs > self.peak_scratch[c] {
                    self.peak_scratch[c] = abs;
                }
            }
        }
        self.meter.store_peaks(&self.peak_scratch);

        for &sample in interleaved {
            self.sum_squares += f64::from(sample) * f64::from(sample);
        }
        self.accumulated_samples += interleaved.len() as u64;
        self.blocks_since_rms += 1;
        if self.blocks_since_rms >= RMS_EVERY_K_BLOCKS {
            if self.accumulated_samples > 0 {
                let rms = (self.sum_squares / self.accumulated_samples as f64).sqrt() as f32;
                self.meter.store_rms(rms);
            }
            self.sum_squares = 0.0;
            self.accumulated_samples = 0;
            self.blocks_since_rms = 0;
        }

        if self.recording_active.load(Ordering::Relaxed) {
            let written = self.producer.push_slice(interleaved);
            if written < interleaved.len() {
                self.meter.add_dropped((interleaved.len() - written) as u64);
            }
        }

        self.meter
            .add_frames((interleaved.len() / self.channels) as u64);
    }
}

impl AudioCapture {
    pub fn shared(&self) -> CaptureShared {
        self.shared.clone()
    }

    /// Signal the callback to go quiet; the stream closes on drop.
    pub fn stop(&self) {
        self.shared.input_connected.store(false, Ordering::Release);
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Start capturing from the operator's saved port selection, falling
    /// back through the server's default source (see
    /// `resolve_capture_source` for the exact order).
    ///
    /// The pre-roll window, meters, and live queue are all sized here,
    /// from the resolved port's native rate and channel count — nothing
    /// on the callback path allocates after this returns. The consumer
    /// half of the live queue comes back alongside the handle for the
    /// file writer. Caller owns the thread-affinity contract: open and
    /// drop happen on the coordinator's blocking thread.
    pub fn open_with_preference(
        buffer_seconds: u32,
        live_queue_seconds: usize,
        recording_active: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<(Self, LiveConsumer)> {
        let host = cpal::default_host();
        let device = resolve_capture_source(&host, preferred_device_name)?;
        let port = device.name().unwrap_or_else(|_| "<unnamed>".into());

        let supported = device
            .default_input_config()
            .map_err(|e| HindsightError::AudioServerUnavailable(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(
            port = %port,
            sample_rate,
            channels,
            window_s = buffer_seconds,
            "capturing into pre-roll window"
        );

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let history = Arc::new(HistoryBuffer::new(
            (sample_rate as usize) * buffer_seconds as usize,
            channels as usize,
        ));
        let meter = Arc::new(LevelMeter::new(channels as usize));
        let (live_producer, live_consumer) = create_live_queue(
            sample_rate as usize * channels as usize * live_queue_seconds.max(1),
        );
        let input_connected = Arc::new(AtomicBool::new(false));
        let shared = CaptureShared {
            history: Arc::clone(&history),
            meter: Arc::clone(&meter),
            recording_active: Arc::clone(&recording_active),
            input_connected: Arc::clone(&input_connected),
        };

        let mut state = CallbackState::new(
            history,
            meter,
            recording_active,
            live_producer,
            channels as usize,
        );
        let connected = Arc::clone(&input_connected);
        let err_fn = |err| error!("audio stream error: {err}");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _info| {
                    if !connected.load(Ordering::Relaxed) {
                        return;
                    }
                    state.process(data);
                },
                err_fn,
                None,
            ),

            SampleFormat::I16 => {
                let mut convert = vec![0f32; CONVERT_SCRATCH_SAMPLES];
                let ch = channels as usize;
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !connected.load(Ordering::Relaxed) {
                            return;
                        }
                        // Chunked conversion keeps full frames together and
                        // never grows the scratch.
                        let frames_per_chunk = convert.len() / ch;
                        for chunk in data.chunks(frames_per_chunk * ch) {
                            for (dst, &src) in convert.iter_mut().zip(chunk) {
                                *dst = f32::from(src) / 32_768.0;
                            }
                            state.process(&convert[..chunk.len()]);
                        }
                    },
                    err_fn,
                    None,
                )
            }

            SampleFormat::U16 => {
                let mut convert = vec![0f32; CONVERT_SCRATCH_SAMPLES];
                let ch = channels as usize;
                device.build_input_stream(
                    &config,
                    move |data: &[u16], _info| {
                        if !connected.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames_per_chunk = convert.len() / ch;
                        for chunk in data.chunks(frames_per_chunk * ch) {
                            for (dst, &src) in convert.iter_mut().zip(chunk) {
                                *dst = (f32::from(src) - 32_768.0) / 32_768.0;
                            }
                            state.process(&convert[..chunk.len()]);
                        }
                    },
                    err_fn,
                    None,
                )
            }

            fmt => {
                return Err(HindsightError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| HindsightError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| HindsightError::AudioStream(e.to_string()))?;
        input_connected.store(true, Ordering::Release);

        Ok((
            Self {
                _stream: stream,
                shared,
                sample_rate,
                channels,
            },
            live_consumer,
        ))
    }
}

/// Pick the capture source for this engine run.
///
/// A saved port selection wins when it still resolves; otherwise capture
/// falls back to wherever the server routes input by default, and as a
/// last resort to any port at all (headless servers sometimes expose
/// sources without nominating a default).
#[cfg(feature = "audio-cpal")]
fn resolve_capture_source(
    host: &cpal::Host,
    preferred: Option<&str>,
) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if let Some(want) = preferred {
        let found = host.input_devices().ok().and_then(|mut ports| {
            ports.find(|p| p.name().is_ok_and(|n| n == want))
        });
        match found {
            Some(device) => return Ok(device),
            None => warn!(
                port = want,
                "saved input port not in the live graph; falling back to the default source"
            ),
        }
    }

    if let Some(device) = host.default_input_device() {
        return Ok(device);
    }

    host.input_devices()
        .map_err(|e| HindsightError::AudioServerUnavailable(e.to_string()))?
        .next()
        .ok_or(HindsightError::NoInputDevice)
}

/// Stub when the `audio-cpal` feature is disabled: the engine cannot open
/// a device, but the rest of the pipeline stays fully testable.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _buffer_seconds: u32,
        _live_queue_seconds: usize,
        _recording_active: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<(Self, LiveConsumer)> {
        Err(crate::error::HindsightError::AudioStream(
            "compiled without the audio-cpal feature".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::create_live_queue;

    fn state(channels: usize, queue: usize) -> (CallbackState, crate::buffering::LiveConsumer) {
        let history = Arc::new(HistoryBuffer::new(1_000, channels));
        let meter = Arc::new(LevelMeter::new(channels));
        let (producer, consumer) = create_live_queue(queue);
        let cb = CallbackState::new(
            history,
            meter,
            Arc::new(AtomicBool::new(false)),
            producer,
            channels,
        );
        (cb, consumer)
    }

    #[test]
    fn process_updates_history_and_peaks() {
        let (mut cb, _consumer) = state(2, 64);
        // Stereo frames: left ramps, right fixed at -0.8.
        let block: Vec<f32> = (0..8)
            .flat_map(|i| [i as f32 / 10.0, -0.8])
            .collect();
        cb.process(&block);

        assert_eq!(cb.meter.peaks(), vec![0.7, 0.8]);
        assert_eq!(cb.meter.frames_captured(), 8);

        let mut out = Vec::new();
        assert_eq!(cb.history.snapshot_into(&mut out), 8);
        assert_eq!(out, block);
    }

    #[test]
    fn rms_publishes_every_kth_block() {
        let (mut cb, _consumer) = state(1, 64);
        let block = vec![0.5f32; 100];
        for _ in 0..RMS_EVERY_K_BLOCKS - 1 {
            cb.process(&block);
        }
        assert_eq!(cb.meter.rms(), 0.0);
        cb.process(&block);
        assert!((cb.meter.rms() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn live_queue_only_fed_while_recording() {
        use crate::buffering::Consumer;

        let (mut cb, mut consumer) = state(1, 1024);
        cb.process(&[0.1, 0.2, 0.3]);
        let mut scratch = [0f32; 16];
        assert_eq!(consumer.pop_slice(&mut scratch), 0);

        cb.recording_active.store(true, Ordering::Release);
        cb.process(&[0.4, 0.5]);
        assert_eq!(consumer.pop_slice(&mut scratch), 2);
        assert_eq!(&scratch[..2], &[0.4, 0.5]);
    }

    #[test]
    fn full_live_queue_counts_drops_instead_of_blocking() {
        let (mut cb, _consumer) = state(1, 4);
        cb.recording_active.store(true, Ordering::Release);
        cb.process(&[0.1; 10]);
        assert_eq!(cb.meter.dropped_samples(), 6);
    }
}
