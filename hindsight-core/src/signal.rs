//! Voice-activity edge detection over the downsampled RMS stream.
//!
//! The detector never sees raw audio. The coordinator feeds it the RMS
//! figure published by the capture callback, and it answers with edge
//! events: `Onset` after the level has stayed above the onset threshold
//! for the sustain window (transients shorter than the sustain are
//! ignored), `Offset` after the level has stayed below the offset
//! threshold for the silence timeout. The two thresholds are independent
//! to permit hysteresis.

use std::time::{Duration, Instant};

/// Edge events delivered to the recording controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEdge {
    /// Sustained signal above the onset threshold.
    Onset,
    /// Continuous silence past the timeout.
    Offset,
}

#[derive(Debug, Clone)]
pub struct SignalDetector {
    onset_threshold_db: f32,
    offset_threshold_db: f32,
    onset_sustain: Duration,
    silence_timeout: Duration,
    /// Floor for the activity gate's look-back, well below both thresholds.
    activity_floor_db: f32,
    /// Start of the current above-onset-threshold stretch.
    above_since: Option<Instant>,
    /// Start of the current below-offset-threshold stretch.
    below_since: Option<Instant>,
    /// Latched once Onset fires; re-armed when the level leaves the
    /// onset band, so each sustained stretch fires exactly once.
    onset_fired: bool,
    /// Same latch for Offset and the silence band.
    offset_fired: bool,
    /// Most recent above-floor observation, for the activity gate.
    last_active_at: Option<Instant>,
}

impl SignalDetector {
    pub fn new(
        onset_threshold_db: f32,
        offset_threshold_db: f32,
        onset_sustain: Duration,
        silence_timeout: Duration,
        activity_floor_db: f32,
    ) -> Self {
        Self {
            onset_threshold_db,
            offset_threshold_db,
            onset_sustain,
            silence_timeout,
            activity_floor_db,
            above_since: None,
            below_since: None,
            onset_fired: false,
            offset_fired: false,
            last_active_at: None,
        }
    }

    pub fn silence_timeout(&self) -> Duration {
        self.silence_timeout
    }

    /// Reconfigure thresholds without losing timer state.
    pub fn reconfigure(
        &mut self,
        onset_threshold_db: f32,
        offset_threshold_db: f32,
        silence_timeout: Duration,
    ) {
        self.onset_threshold_db = onset_threshold_db;
        self.offset_threshold_db = offset_threshold_db;
        self.silence_timeout = silence_timeout;
    }

    /// Feed one RMS observation. Returns at most one edge.
    ///
    /// `silence_timeout == 0` ends on the first sub-threshold update and
    /// `onset_sustain == 0` fires on the first above-threshold update.
    pub fn update(&mut self, rms_db: f32, now: Instant) -> Option<SignalEdge> {
        if rms_db > self.activity_floor_db {
            self.last_active_at = Some(now);
        }

        if rms_db > self.onset_threshold_db {
            let since = *self.above_since.get_or_insert(now);
            if !self.onset_fired && now.duration_since(since) >= self.onset_sustain {
                self.onset_fired = true;
                return Some(SignalEdge::Onset);
            }
        } else {
            self.above_since = None;
            self.onset_fired = false;
        }

        if rms_db > self.offset_threshold_db {
            self.below_since = None;
            self.offset_fired = false;
        } else {
            let since = *self.below_since.get_or_insert(now);
            if !self.offset_fired && now.duration_since(since) >= self.silence_timeout {
                self.offset_fired = true;
                return Some(SignalEdge::Offset);
            }
        }

        None
    }

    /// Seconds of continuous silence so far, for the operator countdown.
    pub fn silence_duration(&self, now: Instant) -> Duration {
        self.below_since
            .map(|since| now.duration_since(since))
            .unwrap_or(Duration::ZERO)
    }

    /// True if the level rose above the activity floor within the trailing
    /// `window`. Used by the controller's activity gate.
    pub fn active_within(&self, window: Duration, now: Instant) -> bool {
        self.last_active_at
            .map(|at| now.duration_since(at) <= window)
            .unwrap_or(false)
    }

    /// Clear all timers. Called on state transitions so a new recording
    /// starts with a fresh silence clock.
    pub fn reset(&mut self) {
        self.above_since = None;
        self.below_since = None;
        self.onset_fired = false;
        self.offset_fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(sustain_ms: u64, timeout_ms: u64) -> SignalDetector {
        SignalDetector::new(
            -35.0,
            -40.0,
            Duration::from_millis(sustain_ms),
            Duration::from_millis(timeout_ms),
            -70.0,
        )
    }

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn short_transient_does_not_fire_onset() {
        let mut d = detector(500, 10_000);
        let t0 = Instant::now();

        // 200 ms click at -20 dB, then back to silence.
        assert_eq!(d.update(-20.0, at(t0, 0)), None);
        assert_eq!(d.update(-20.0, at(t0, 100)), None);
        assert_eq!(d.update(-20.0, at(t0, 200)), None);
        assert_eq!(d.update(-90.0, at(t0, 250)), None);
        // Loud again much later — sustain clock restarted.
        assert_eq!(d.update(-20.0, at(t0, 1000)), None);
    }

    #[test]
    fn sustained_speech_fires_onset_after_sustain() {
        let mut d = detector(500, 10_000);
        let t0 = Instant::now();

        assert_eq!(d.update(-25.0, at(t0, 0)), None);
        assert_eq!(d.update(-25.0, at(t0, 250)), None);
        assert_eq!(d.update(-25.0, at(t0, 500)), Some(SignalEdge::Onset));
        // No repeated onset while speech continues.
        assert_eq!(d.update(-25.0, at(t0, 750)), None);
    }

    #[test]
    fn zero_sustain_fires_on_first_update() {
        let mut d = detector(0, 10_000);
        let t0 = Instant::now();
        assert_eq!(d.update(-20.0, t0), Some(SignalEdge::Onset));
    }

    #[test]
    fn stream_starting_above_threshold_fires_after_sustain_from_start() {
        let mut d = detector(500, 10_000);
        let t0 = Instant::now();
        assert_eq!(d.update(-10.0, at(t0, 0)), None);
        assert_eq!(d.update(-10.0, at(t0, 499)), None);
        assert_eq!(d.update(-10.0, at(t0, 501)), Some(SignalEdge::Onset));
    }

    #[test]
    fn offset_fires_after_silence_timeout() {
        let mut d = detector(0, 2_000);
        let t0 = Instant::now();

        assert_eq!(d.update(-20.0, at(t0, 0)), Some(SignalEdge::Onset));
        assert_eq!(d.update(-90.0, at(t0, 100)), None);
        assert_eq!(d.update(-90.0, at(t0, 1_000)), None);
        assert_eq!(d.update(-90.0, at(t0, 2_100)), Some(SignalEdge::Offset));
    }

    #[test]
    fn speech_resets_the_silence_clock() {
        let mut d = detector(0, 2_000);
        let t0 = Instant::now();

        assert_eq!(d.update(-20.0, at(t0, 0)), Some(SignalEdge::Onset));
        assert_eq!(d.update(-90.0, at(t0, 100)), None);
        // Speech returns 1.5 s in: a fresh stretch (new onset with zero
        // sustain) and the silence clock restarts.
        assert_eq!(d.update(-20.0, at(t0, 1_500)), Some(SignalEdge::Onset));
        assert_eq!(d.update(-90.0, at(t0, 1_600)), None);
        assert_eq!(d.update(-90.0, at(t0, 3_500)), None);
        assert_eq!(d.update(-90.0, at(t0, 3_601)), Some(SignalEdge::Offset));
    }

    #[test]
    fn zero_timeout_ends_on_first_silent_update() {
        let mut d = detector(0, 0);
        let t0 = Instant::now();

        assert_eq!(d.update(-20.0, at(t0, 0)), Some(SignalEdge::Onset));
        assert_eq!(d.update(-90.0, at(t0, 50)), Some(SignalEdge::Offset));
    }

    #[test]
    fn hysteresis_band_keeps_silence_clock_stopped() {
        // Between offset (-40) and onset (-35): no onset, but not silence.
        let mut d = detector(0, 1_000);
        let t0 = Instant::now();

        assert_eq!(d.update(-20.0, at(t0, 0)), Some(SignalEdge::Onset));
        assert_eq!(d.update(-37.0, at(t0, 500)), None);
        assert_eq!(d.update(-37.0, at(t0, 2_000)), None);
        assert_eq!(d.silence_duration(at(t0, 2_000)), Duration::ZERO);
    }

    #[test]
    fn silence_countdown_is_observable() {
        let mut d = detector(0, 10_000);
        let t0 = Instant::now();
        d.update(-20.0, at(t0, 0));
        d.update(-90.0, at(t0, 1_000));
        assert_eq!(
            d.silence_duration(at(t0, 4_000)),
            Duration::from_millis(3_000)
        );
    }

    #[test]
    fn activity_lookback_window() {
        let mut d = detector(500, 10_000);
        let t0 = Instant::now();
        let window = Duration::from_millis(500);
        assert!(!d.active_within(window, t0));
        // -60 dB is below both thresholds but above the -70 dB floor.
        d.update(-60.0, at(t0, 0));
        assert!(d.active_within(window, at(t0, 400)));
        assert!(!d.active_within(window, at(t0, 900)));
        // A level under the floor does not refresh the window.
        d.update(-85.0, at(t0, 1_000));
        assert!(!d.active_within(window, at(t0, 1_100)));
    }

    #[test]
    fn reset_clears_timers_but_not_activity() {
        let mut d = detector(0, 1_000);
        let t0 = Instant::now();
        d.update(-20.0, at(t0, 0));
        d.update(-90.0, at(t0, 100));
        d.reset();
        assert_eq!(d.silence_duration(at(t0, 5_000)), Duration::ZERO);
        // A fresh onset is possible again after reset.
        assert_eq!(d.update(-20.0, at(t0, 5_000)), Some(SignalEdge::Onset));
    }
}
