// src/fx_components/delay.rs

//! A fractional feedback delay using a circular buffer and linear
//! interpolation, mixed in series with the dry signal.
use crate::fx_components::{AtomicParam, DspComponent};

/// Longest delay time the line allocates for.
pub const MAX_DELAY_SEC: f32 = 2.0;

/// Shared, automatable parameters for the Delay component.
#[derive(Debug, Clone)]
pub struct Params {
    pub time_sec: AtomicParam,
    /// Feedback amount (0.0 to 0.95).
    pub feedback: AtomicParam,
    /// Wet level (0.0 to 1.0).
    pub mix: AtomicParam,
    /// High-frequency damping of the feedback path (0.0 to 1.0).
    pub damping: AtomicParam,
    /// Delay length in quarter notes of the master tempo (0.5 is an eighth,
    /// 0.75 a dotted eighth). Zero leaves `time_sec` free.
    pub beats: AtomicParam,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            time_sec: AtomicParam::new(0.25),
            feedback: AtomicParam::new(0.25),
            mix: AtomicParam::new(0.25),
            damping: AtomicParam::new(0.0),
            beats: AtomicParam::new(0.0),
        }
    }
}

impl Params {
    pub fn get_param(&self, name: &str) -> Option<AtomicParam> {
        match name {
            "time_sec" => Some(self.time_sec.clone()),
            "feedback" => Some(self.feedback.clone()),
            "mix" => Some(self.mix.clone()),
            "damping" => Some(self.damping.clone()),
            "beats" => Some(self.beats.clone()),
            _ => None,
        }
    }

    /// Sets `time_sec` from `beats` at `bpm`. Free-running delays are left
    /// alone.
    pub fn sync_to_tempo(&self, bpm: u32) {
        let beats = self.beats.get();
        if beats <= 0.0 || bpm == 0 {
            return;
        }
        let quarter_sec = 60.0 / bpm as f32;
        self.time_sec
            .set((quarter_sec * beats).clamp(0.001, MAX_DELAY_SEC));
    }
}

/// The audio-thread state for the Delay component.
#[derive(Debug)]
pub struct DelayLine {
    params: Params,
    buffer: Vec<f32>,
    write_pos: usize,
    max_delay_samples: usize,
    sample_rate: f32,
    /// One-pole low-pass state on the feedback path.
    feedback_z1: f32,
    smoothed_time_sec: f32,
}

impl DelayLine {
    pub fn new(max_delay_sec: f32, sample_rate: f32, params: Params) -> Self {
        let max_delay_samples = ((max_delay_sec * sample_rate).ceil() as usize).max(2);
        let initial_time = params.time_sec.get();

        Self {
            params,
            buffer: vec![0.0; max_delay_samples],
            write_pos: 0,
            max_delay_samples,
            sample_rate,
            feedback_z1: 0.0,
            smoothed_time_sec: initial_time,
        }
    }

    #[inline]
    fn write(&mut self, sample: f32) {
        self.buffer[self.write_pos] = sample;
        self.write_pos = (self.write_pos + 1) % self.max_delay_samples;
    }

    #[inline]
    fn read(&self, delay_samples: f32) -> f32 {
        let read_pos_float = (self.write_pos as f32 - delay_samples + self.max_delay_samples as f32)
            % self.max_delay_samples as f32;
        let index1 = read_pos_float.floor() as usize % self.max_delay_samples;
        let index2 = (index1 + 1) % self.max_delay_samples;
        let fraction = read_pos_float.fract();
        let sample1 = self.buffer[index1];
        let sample2 = self.buffer[index2];
        sample1 + fraction * (sample2 - sample1)
    }
}

impl DspComponent for DelayLine {
    #[inline]
    fn process_audio(&mut self, input: f32) -> f32 {
        const SMOOTHING_COEFF: f32 = 0.9995;

        let max_time = (self.max_delay_samples - 1) as f32 / self.sample_rate;
        let target_time = self.params.time_sec.get().clamp(1.0 / self.sample_rate, max_time);
        let feedback = self.params.feedback.get().clamp(0.0, 0.95);
        let mix = self.params.mix.get().clamp(0.0, 1.0);
        let damping = self.params.damping.get().clamp(0.0, 1.0);

        self.smoothed_time_sec =
            SMOOTHING_COEFF * self.smoothed_time_sec + (1.0 - SMOOTHING_COEFF) * target_time;

        let delayed = self.read(self.smoothed_time_sec * self.sample_rate);
        self.feedback_z1 = delayed + (self.feedback_z1 - delayed) * damping;
        self.write((input + self.feedback_z1 * feedback).clamp(-1.0, 1.0));

        input * (1.0 - mix) + delayed * mix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tempo_sync_sets_time() {
        let params = Params::default();
        params.sync_to_tempo(90);
        assert_eq!(params.time_sec.get(), 0.25);

        params.beats.set(0.75);
        params.sync_to_tempo(120);
        assert!((params.time_sec.get() - 0.375).abs() < 1e-6);

        // Whole notes at a slow tempo are capped by the line length.
        params.beats.set(4.0);
        params.sync_to_tempo(60);
        assert_eq!(params.time_sec.get(), MAX_DELAY_SEC);
    }

    #[test]
    fn test_impulse_echoes_after_delay_time() {
        let sr = 1_000.0;
        let params = Params::default();
        params.feedback.set(0.0);
        params.mix.set(0.5);
        let mut delay = DelayLine::new(MAX_DELAY_SEC, sr, params);

        let mut out = Vec::new();
        for i in 0..400 {
            out.push(delay.process_audio(if i == 0 { 1.0 } else { 0.0 }));
        }
        assert_eq!(out[0], 0.5);
        // 0.25 s at 1 kHz.
        assert!((out[250] - 0.5).abs() < 1e-3, "echo {}", out[250]);
        assert!(out[100].abs() < 1e-6);
    }
}
