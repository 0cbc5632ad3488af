// src/audio_engine/fx_rack.rs

use crate::fx::EffectChain;
use crate::fx_components::{
    self, AtomicParam, ComponentParams, Compressor, DelayLine, DspComponent, Filter,
};

/// Number of parallel processing lanes (left and right).
const LANES: usize = 2;

/// The audio-thread rendition of an effect chain. Bypassed links are left
/// out; pan and pitch are read by the player instead of processed per sample.
pub struct FxRack {
    lanes: [Vec<Box<dyn DspComponent>>; LANES],
    pan: Option<AtomicParam>,
    pitch: Vec<AtomicParam>,
}

impl FxRack {
    pub fn empty() -> Self {
        Self {
            lanes: [Vec::new(), Vec::new()],
            pan: None,
            pitch: Vec::new(),
        }
    }

    /// Creates a new FxRack from a chain "recipe".
    pub fn new(chain: &EffectChain, sample_rate: f32) -> Self {
        let mut rack = Self::empty();
        for link in chain.links().iter().filter(|l| !l.bypassed) {
            match &link.params {
                ComponentParams::Pan(p) => rack.pan = Some(p.pan.clone()),
                ComponentParams::Pitch(p) => rack.pitch.push(p.semitones.clone()),
                params => {
                    for lane in rack.lanes.iter_mut() {
                        if let Some(component) = build_component(params, sample_rate) {
                            lane.push(component);
                        }
                    }
                }
            }
        }
        rack
    }

    pub fn is_empty(&self) -> bool {
        self.lanes[0].is_empty() && self.pan.is_none() && self.pitch.is_empty()
    }

    #[inline]
    pub fn process_sample(&mut self, lane: usize, input: f32) -> f32 {
        self.lanes[lane % LANES]
            .iter_mut()
            .fold(input, |sample, component| component.process_audio(sample))
    }

    /// Processes a mono buffer in place through the first lane.
    pub fn process_buffer(&mut self, buffer: &mut [f32]) {
        if self.lanes[0].is_empty() {
            return;
        }
        for sample in buffer.iter_mut() {
            *sample = self.process_sample(0, *sample);
        }
    }

    /// Pan position in [-1, 1]. The last pan in the chain wins.
    pub fn pan(&self) -> f32 {
        self.pan.as_ref().map_or(0.0, |p| p.get().clamp(-1.0, 1.0))
    }

    /// Playback rate implied by the summed pitch shifts.
    pub fn playback_rate(&self) -> f64 {
        let semitones: f32 = self.pitch.iter().map(|p| p.get()).sum();
        2f64.powf(semitones.clamp(-24.0, 24.0) as f64 / 12.0)
    }
}

fn build_component(params: &ComponentParams, sample_rate: f32) -> Option<Box<dyn DspComponent>> {
    let component: Box<dyn DspComponent> = match params {
        ComponentParams::LowPass(p) | ComponentParams::HighPass(p) => {
            Box::new(Filter::new(sample_rate, p.clone()))
        }
        ComponentParams::Delay(p) => Box::new(DelayLine::new(
            fx_components::delay::MAX_DELAY_SEC,
            sample_rate,
            p.clone(),
        )),
        ComponentParams::Compressor(p) => Box::new(Compressor::new(sample_rate, p.clone())),
        ComponentParams::Pan(_) | ComponentParams::Pitch(_) => return None,
    };
    Some(component)
}
