// src/fx_components/compressor.rs

//! Feed-forward soft-knee compressor with a peak envelope follower.

use crate::fx_components::{AtomicParam, DspComponent};

#[derive(Debug, Clone)]
pub struct Params {
    pub threshold_db: AtomicParam,
    pub knee_db: AtomicParam,
    pub ratio: AtomicParam,
    pub attack_sec: AtomicParam,
    pub release_sec: AtomicParam,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            threshold_db: AtomicParam::new(-18.0),
            knee_db: AtomicParam::new(6.0),
            ratio: AtomicParam::new(3.0),
            attack_sec: AtomicParam::new(0.003),
            release_sec: AtomicParam::new(0.25),
        }
    }
}

impl Params {
    pub fn get_param(&self, name: &str) -> Option<AtomicParam> {
        match name {
            "threshold" => Some(self.threshold_db.clone()),
            "knee" => Some(self.knee_db.clone()),
            "ratio" => Some(self.ratio.clone()),
            "attack" => Some(self.attack_sec.clone()),
            "release" => Some(self.release_sec.clone()),
            _ => None,
        }
    }
}

/// Static gain curve: output level in dB for an input level in dB.
pub fn gain_computer(input_db: f32, threshold_db: f32, knee_db: f32, ratio: f32) -> f32 {
    let over = input_db - threshold_db;
    if knee_db > 0.0 && (2.0 * over).abs() <= knee_db {
        let x = over + knee_db / 2.0;
        input_db + (1.0 / ratio - 1.0) * x * x / (2.0 * knee_db)
    } else if 2.0 * over > knee_db {
        threshold_db + over / ratio
    } else {
        input_db
    }
}

#[derive(Debug)]
pub struct Compressor {
    params: Params,
    sample_rate: f32,
    envelope: f32,
}

impl Compressor {
    pub fn new(sample_rate: f32, params: Params) -> Self {
        Self {
            params,
            sample_rate,
            envelope: 0.0,
        }
    }

    fn coeff(&self, seconds: f32) -> f32 {
        (-(1.0 / (seconds.max(1e-4) * self.sample_rate))).exp()
    }
}

impl DspComponent for Compressor {
    #[inline]
    fn process_audio(&mut self, input: f32) -> f32 {
        let input_abs = input.abs();
        let attack = self.coeff(self.params.attack_sec.get());
        let release = self.coeff(self.params.release_sec.get());

        self.envelope = if input_abs > self.envelope {
            attack * (self.envelope - input_abs) + input_abs
        } else {
            release * (self.envelope - input_abs) + input_abs
        };
        self.envelope = self.envelope.max(1e-6);

        let ratio = self.params.ratio.get().max(1.0);
        let level_db = 20.0 * self.envelope.log10();
        let out_db = gain_computer(
            level_db,
            self.params.threshold_db.get(),
            self.params.knee_db.get().max(0.0),
            ratio,
        );
        let gain = 10f32.powf((out_db - level_db) / 20.0);
        input * gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_curve_regions() {
        // Well below threshold: untouched.
        assert_eq!(gain_computer(-40.0, -18.0, 6.0, 3.0), -40.0);
        // Well above: 12 dB over at 3:1 leaves 4 dB over.
        assert!((gain_computer(-6.0, -18.0, 6.0, 3.0) - -14.0).abs() < 1e-4);
        // Inside the knee the reduction is partial.
        let knee = gain_computer(-18.0, -18.0, 6.0, 3.0);
        assert!(knee < -18.0 && knee > -18.0 - 2.0);
    }

    #[test]
    fn test_loud_signal_is_reduced() {
        let mut comp = Compressor::new(48_000.0, Params::default());
        let mut last = 0.0;
        for _ in 0..4_800 {
            last = comp.process_audio(0.9);
        }
        assert!(last < 0.5, "compressed level {}", last);

        let mut quiet = Compressor::new(48_000.0, Params::default());
        let mut out = 0.0;
        for _ in 0..4_800 {
            out = quiet.process_audio(0.01);
        }
        assert!((out - 0.01).abs() < 1e-4);
    }
}
