// src/transport.rs

//! The shared transport clock and the phase arithmetic built on it.
//!
//! The audio thread owns the frame counter and publishes it after every
//! block. Everything in the control domain reads time from here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Frame counter published by the audio engine.
#[derive(Clone, Debug)]
pub struct TransportClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl TransportClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Absolute frame index of the next block the engine will process.
    pub fn now_frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn now_seconds(&self) -> f64 {
        self.frames_to_seconds(self.now_frames())
    }

    pub(crate) fn publish(&self, frames: u64) {
        self.frames.store(frames, Ordering::Release);
    }

    pub fn seconds_to_frames(&self, seconds: f64) -> u64 {
        seconds_to_frames(seconds, self.sample_rate)
    }

    pub fn frames_to_seconds(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }
}

pub fn seconds_to_frames(seconds: f64, sample_rate: u32) -> u64 {
    (seconds * sample_rate as f64).round().max(0.0) as u64
}

pub fn ms_to_samples(ms: f32, sample_rate: u32) -> i64 {
    (ms as f64 / 1000.0 * sample_rate as f64).round() as i64
}

/// Rolling phase of a loop that started at `loop_start` and repeats every
/// `loop_duration` seconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseClock {
    pub loop_start: f64,
    pub loop_duration: f64,
}

impl PhaseClock {
    pub fn new(loop_start: f64, loop_duration: f64) -> Self {
        Self {
            loop_start,
            loop_duration,
        }
    }

    /// Position inside the current cycle, always in `[0, loop_duration)`.
    pub fn elapsed(&self, now: f64) -> f64 {
        if self.loop_duration <= 0.0 {
            return 0.0;
        }
        (now - self.loop_start).rem_euclid(self.loop_duration)
    }

    pub fn time_to_next_boundary(&self, now: f64) -> f64 {
        self.loop_duration - self.elapsed(now)
    }
}

/// Frame-domain counterpart of [`PhaseClock`], used for sample-accurate
/// scheduling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePhase {
    pub anchor: u64,
    pub length: u64,
}

impl FramePhase {
    pub fn new(anchor: u64, length: u64) -> Self {
        Self { anchor, length }
    }

    pub fn elapsed(&self, now: u64) -> u64 {
        if self.length == 0 {
            return 0;
        }
        (now as i128 - self.anchor as i128).rem_euclid(self.length as i128) as u64
    }

    /// The same cycle on the seconds timeline.
    pub fn seconds(&self, sample_rate: u32) -> PhaseClock {
        let sr = sample_rate.max(1) as f64;
        PhaseClock::new(self.anchor as f64 / sr, self.length as f64 / sr)
    }

    /// First loop boundary strictly after `now`. A `now` that sits exactly on
    /// a boundary yields the following one.
    pub fn next_boundary(&self, now: u64) -> u64 {
        now + (self.length - self.elapsed(now))
    }
}

/// Tempo assumed for tempo-synced effects before a master loop exists.
pub const DEFAULT_BPM: u32 = 120;

/// Tempo implied by a master loop that spans one bar of four beats.
pub fn bpm_for_loop(loop_duration: f64) -> u32 {
    if loop_duration <= 0.0 {
        return 0;
    }
    (60.0 / loop_duration * 4.0).round() as u32
}

/// Number of frames one 4/4 bar lasts at `bpm`.
pub fn bar_frames(bpm: u32, sample_rate: u32) -> usize {
    if bpm == 0 {
        return 0;
    }
    (sample_rate as f64 * 60.0 * 4.0 / bpm as f64).round() as usize
}

/// Pre-roll used when arming an overdub: one sixteenth note at the master
/// tempo, never less than 150 ms.
pub fn default_prerecord_ms(bpm: u32) -> f32 {
    const MIN_PRERECORD_MS: f32 = 150.0;
    if bpm == 0 {
        return MIN_PRERECORD_MS;
    }
    let sixteenth_ms = (60_000.0 / bpm as f32 / 4.0).round();
    sixteenth_ms.max(MIN_PRERECORD_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_time_to_next_boundary() {
        let t0 = 10.0;
        let phase = PhaseClock::new(t0, 2.0);
        assert_close(phase.time_to_next_boundary(t0 + 0.75), 1.25);
        assert_close(phase.time_to_next_boundary(t0 + 2.75), 1.25);
    }

    #[test]
    fn test_elapsed_before_start_is_non_negative() {
        let phase = PhaseClock::new(5.0, 2.0);
        assert_close(phase.elapsed(4.5), 1.5);
        assert_close(phase.time_to_next_boundary(4.5), 0.5);
    }

    #[test]
    fn test_boundary_exactly_now_yields_next_cycle() {
        let phase = FramePhase::new(1_000, 500);
        assert_eq!(phase.next_boundary(1_000), 1_500);
        assert_eq!(phase.next_boundary(1_499), 1_500);
        assert_eq!(phase.next_boundary(1_500), 2_000);
        assert_eq!(phase.next_boundary(10), 500);
    }

    #[test]
    fn test_frame_phase_in_seconds() {
        let phase = FramePhase::new(480_000, 96_000).seconds(48_000);
        assert_eq!(phase, PhaseClock::new(10.0, 2.0));
        assert_close(phase.time_to_next_boundary(12.75), 1.25);
    }

    #[test]
    fn test_bpm_derivation() {
        assert_eq!(bpm_for_loop(2.0), 120);
        assert_eq!(bpm_for_loop(1.6), 150);
        assert_eq!(bar_frames(120, 48_000), 96_000);
    }

    #[test]
    fn test_prerecord_floor() {
        assert_eq!(default_prerecord_ms(120), 150.0);
        assert_eq!(default_prerecord_ms(60), 250.0);
        assert_eq!(default_prerecord_ms(0), 150.0);
    }

    #[test]
    fn test_clock_publish() {
        let clock = TransportClock::new(48_000);
        clock.publish(96_000);
        assert_eq!(clock.now_frames(), 96_000);
        assert_close(clock.now_seconds(), 2.0);
        assert_eq!(clock.seconds_to_frames(0.05), 2_400);
        assert_eq!(ms_to_samples(-20.0, 48_000), -960);
    }
}
