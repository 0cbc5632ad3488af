// src/fx_components/filter.rs

//! A State Variable Filter implementation.
//! Provides low-pass and high-pass outputs.

use crate::fx_components::{AtomicParam, DspComponent};
use std::f32::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    LowPass,
    HighPass,
}

/// Shared, automatable parameters for the Filter component.
#[derive(Debug, Clone)]
pub struct Params {
    pub mode: FilterMode,
    /// Cutoff frequency in Hz.
    pub cutoff_hz: AtomicParam,
    /// Quality factor. 0.707 is maximally flat.
    pub q: AtomicParam,
}

impl Params {
    pub fn new(mode: FilterMode, cutoff_hz: f32, q: f32) -> Self {
        Self {
            mode,
            cutoff_hz: AtomicParam::new(cutoff_hz),
            q: AtomicParam::new(q),
        }
    }

    pub fn get_param(&self, name: &str) -> Option<AtomicParam> {
        match name {
            "cutoff" => Some(self.cutoff_hz.clone()),
            "q" => Some(self.q.clone()),
            _ => None,
        }
    }
}

/// The audio-thread state for the Filter component.
#[derive(Debug)]
pub struct Filter {
    params: Params,
    sample_rate: f32,
    z1: f32,
    z2: f32,
}

impl Filter {
    pub fn new(sample_rate: f32, params: Params) -> Self {
        Self {
            params,
            sample_rate,
            z1: 0.0,
            z2: 0.0,
        }
    }
}

impl DspComponent for Filter {
    #[inline]
    fn process_audio(&mut self, input: f32) -> f32 {
        let cutoff_hz = self
            .params
            .cutoff_hz
            .get()
            .clamp(20.0, self.sample_rate / 2.0 - 20.0);
        let q = self.params.q.get().clamp(0.1, 20.0);

        let g = (PI * cutoff_hz / self.sample_rate).tan();
        let k = 1.0 / q;
        let a1 = 1.0 / (1.0 + g * (g + k));
        let a2 = g * a1;
        let a3 = g * a2;

        let v3 = input - self.z2;
        let v1 = a1 * self.z1 + a2 * v3;
        let v2 = self.z2 + a2 * self.z1 + a3 * v3;

        self.z1 = (2.0 * v1 - self.z1).clamp(-1e6, 1e6); // Clamp to prevent denormals
        self.z2 = (2.0 * v2 - self.z2).clamp(-1e6, 1e6);

        match self.params.mode {
            FilterMode::LowPass => v2,
            FilterMode::HighPass => input - k * v1 - v2,
        }
    }
}
