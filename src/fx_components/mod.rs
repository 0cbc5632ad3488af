// src/fx_components/mod.rs

pub mod compressor;
pub mod delay;
pub mod filter;

pub use compressor::{Compressor, Params as CompressorParams};
pub use delay::{DelayLine, Params as DelayParams};
pub use filter::{Filter, FilterMode, Params as FilterParams};

use crate::fx::EffectKind;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// A float parameter shared between the control thread and the audio thread.
/// Stored as raw `f32` bits so negative values and large frequencies fit.
#[derive(Debug, Clone)]
pub struct AtomicParam(Arc<AtomicU32>);

impl AtomicParam {
    pub fn new(value: f32) -> Self {
        Self(Arc::new(AtomicU32::new(value.to_bits())))
    }

    #[inline]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct PanParams {
    /// -1.0 (left) to 1.0 (right).
    pub pan: AtomicParam,
}

impl Default for PanParams {
    fn default() -> Self {
        Self {
            pan: AtomicParam::new(0.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PitchParams {
    pub semitones: AtomicParam,
}

impl Default for PitchParams {
    fn default() -> Self {
        Self {
            semitones: AtomicParam::new(0.0),
        }
    }
}

/// The shared parameters of one effect in a chain. Held by the chain on the
/// control thread and cloned into the `FxRack` on the audio thread.
#[derive(Debug, Clone)]
pub enum ComponentParams {
    LowPass(FilterParams),
    HighPass(FilterParams),
    Delay(DelayParams),
    Compressor(CompressorParams),
    Pan(PanParams),
    Pitch(PitchParams),
}

impl ComponentParams {
    /// Creates a new set of default parameters for a given effect.
    pub fn new(kind: EffectKind) -> Self {
        match kind {
            EffectKind::LowPass => {
                ComponentParams::LowPass(FilterParams::new(FilterMode::LowPass, 12_000.0, 0.7))
            }
            EffectKind::HighPass => {
                ComponentParams::HighPass(FilterParams::new(FilterMode::HighPass, 120.0, 0.7))
            }
            EffectKind::Delay => ComponentParams::Delay(DelayParams::default()),
            EffectKind::Compressor => ComponentParams::Compressor(CompressorParams::default()),
            EffectKind::Pan => ComponentParams::Pan(PanParams::default()),
            EffectKind::Pitch => ComponentParams::Pitch(PitchParams::default()),
        }
    }

    pub fn kind(&self) -> EffectKind {
        match self {
            ComponentParams::LowPass(_) => EffectKind::LowPass,
            ComponentParams::HighPass(_) => EffectKind::HighPass,
            ComponentParams::Delay(_) => EffectKind::Delay,
            ComponentParams::Compressor(_) => EffectKind::Compressor,
            ComponentParams::Pan(_) => EffectKind::Pan,
            ComponentParams::Pitch(_) => EffectKind::Pitch,
        }
    }

    /// Looks up a live parameter by name.
    pub fn get_param(&self, name: &str) -> Option<AtomicParam> {
        match self {
            ComponentParams::LowPass(p) | ComponentParams::HighPass(p) => p.get_param(name),
            ComponentParams::Delay(p) => p.get_param(name),
            ComponentParams::Compressor(p) => p.get_param(name),
            ComponentParams::Pan(p) => match name {
                "pan" => Some(p.pan.clone()),
                _ => None,
            },
            ComponentParams::Pitch(p) => match name {
                "semitones" => Some(p.semitones.clone()),
                _ => None,
            },
        }
    }
}

/// A real-time audio processor in an effect chain.
pub trait DspComponent: Send {
    fn process_audio(&mut self, input: f32) -> f32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_param_holds_negative_and_large_values() {
        let param = AtomicParam::new(-18.0);
        assert_eq!(param.get(), -18.0);
        let shared = param.clone();
        shared.set(12_000.0);
        assert_eq!(param.get(), 12_000.0);
    }

    #[test]
    fn test_defaults_follow_catalog() {
        let params = ComponentParams::new(EffectKind::HighPass);
        assert_eq!(params.kind(), EffectKind::HighPass);
        assert_eq!(params.get_param("cutoff").map(|p| p.get()), Some(120.0));
        assert_eq!(params.get_param("q").map(|p| p.get()), Some(0.7));
        assert!(params.get_param("feedback").is_none());

        let delay = ComponentParams::new(EffectKind::Delay);
        assert_eq!(delay.get_param("time_sec").map(|p| p.get()), Some(0.25));
    }
}
