// src/fx.rs

//! Effect chain "recipes" held on the control thread. Every structural edit
//! produces a fresh `FxRack` for the audio thread; parameter tweaks go
//! through the shared atomics without a rebuild.

use crate::audio_engine::fx_rack::FxRack;
use crate::error::LooperError;
use crate::fx_components::ComponentParams;
use std::fmt;
use std::str::FromStr;

/// Uniquely identifies a location in the audio pipeline where an FX Rack can be inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InsertionPoint {
    /// After-FX on a loop track's playback.
    Track(usize),
    /// Before-FX on the live input, ahead of capture and monitoring.
    Input,
}

impl fmt::Display for InsertionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertionPoint::Track(i) => write!(f, "Track {}", i + 1),
            InsertionPoint::Input => write!(f, "Audio Input"),
        }
    }
}

/// The effects a user can add to a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    Pitch,
    LowPass,
    HighPass,
    Pan,
    Delay,
    Compressor,
}

impl EffectKind {
    pub fn label(&self) -> &'static str {
        match self {
            EffectKind::Pitch => "Pitch",
            EffectKind::LowPass => "Low-pass Filter",
            EffectKind::HighPass => "High-pass Filter",
            EffectKind::Pan => "Pan",
            EffectKind::Delay => "Delay",
            EffectKind::Compressor => "Compressor",
        }
    }
}

impl FromStr for EffectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pitch" => Ok(EffectKind::Pitch),
            "lowpass" | "lp" => Ok(EffectKind::LowPass),
            "highpass" | "hp" => Ok(EffectKind::HighPass),
            "pan" => Ok(EffectKind::Pan),
            "delay" => Ok(EffectKind::Delay),
            "compressor" | "comp" => Ok(EffectKind::Compressor),
            _ => Err(format!("unknown effect: {}", s)),
        }
    }
}

/// A single link or "pedal" in the effects chain.
#[derive(Debug, Clone)]
pub struct EffectLink {
    pub id: u32,
    pub bypassed: bool,
    pub params: ComponentParams,
}

impl EffectLink {
    pub fn kind(&self) -> EffectKind {
        self.params.kind()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EffectChain {
    links: Vec<EffectLink>,
    next_id: u32,
}

impl EffectChain {
    pub fn links(&self) -> &[EffectLink] {
        &self.links
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Appends an effect with catalog defaults and returns its id.
    pub fn add(&mut self, kind: EffectKind) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.links.push(EffectLink {
            id,
            bypassed: false,
            params: ComponentParams::new(kind),
        });
        id
    }

    fn position(&self, id: u32) -> Result<usize, LooperError> {
        self.links
            .iter()
            .position(|l| l.id == id)
            .ok_or(LooperError::UnknownEffect { id })
    }

    pub fn get(&self, id: u32) -> Option<&EffectLink> {
        self.links.iter().find(|l| l.id == id)
    }

    pub fn remove(&mut self, id: u32) -> Result<EffectLink, LooperError> {
        let pos = self.position(id)?;
        Ok(self.links.remove(pos))
    }

    /// Moves an effect one slot earlier. The first effect stays put.
    pub fn move_up(&mut self, id: u32) -> Result<(), LooperError> {
        let pos = self.position(id)?;
        if pos > 0 {
            self.links.swap(pos, pos - 1);
        }
        Ok(())
    }

    pub fn move_down(&mut self, id: u32) -> Result<(), LooperError> {
        let pos = self.position(id)?;
        if pos + 1 < self.links.len() {
            self.links.swap(pos, pos + 1);
        }
        Ok(())
    }

    /// Flips the bypass flag and returns the new value.
    pub fn toggle_bypass(&mut self, id: u32) -> Result<bool, LooperError> {
        let pos = self.position(id)?;
        let link = &mut self.links[pos];
        link.bypassed = !link.bypassed;
        Ok(link.bypassed)
    }

    /// Sets a live parameter without touching the chain's structure.
    pub fn set_param(&self, id: u32, name: &str, value: f32) -> Result<(), LooperError> {
        let link = self.get(id).ok_or(LooperError::UnknownEffect { id })?;
        match link.params.get_param(name) {
            Some(param) => {
                param.set(value);
                Ok(())
            }
            None => Err(LooperError::UnknownParam {
                id,
                name: name.to_string(),
            }),
        }
    }

    /// Re-times tempo-synced delays in this chain.
    pub fn sync_to_tempo(&self, bpm: u32) {
        for link in &self.links {
            if let ComponentParams::Delay(params) = &link.params {
                params.sync_to_tempo(bpm);
            }
        }
    }

    /// Builds the audio-thread rack for the current chain.
    pub fn build(&self, sample_rate: f32) -> FxRack {
        FxRack::new(self, sample_rate)
    }

    /// One-line description, e.g. `1.Low-pass Filter → 2.Pitch (bypassed)`.
    pub fn summary(&self) -> String {
        if self.links.is_empty() {
            return "no effects".to_string();
        }
        self.links
            .iter()
            .enumerate()
            .map(|(i, link)| {
                let mut s = format!("{}.{} #{}", i + 1, link.kind().label(), link.id);
                if link.bypassed {
                    s.push_str(" (bypassed)");
                }
                s
            })
            .collect::<Vec<_>>()
            .join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(chain: &EffectChain) -> Vec<EffectKind> {
        chain.links().iter().map(|l| l.kind()).collect()
    }

    #[test]
    fn test_reorder_and_remove() {
        let mut chain = EffectChain::default();
        let lp = chain.add(EffectKind::LowPass);
        let delay = chain.add(EffectKind::Delay);
        let pitch = chain.add(EffectKind::Pitch);

        chain.move_up(pitch).unwrap();
        assert_eq!(kinds(&chain), vec![EffectKind::LowPass, EffectKind::Pitch, EffectKind::Delay]);

        // Moving past either end is a no-op.
        chain.move_up(lp).unwrap();
        chain.move_down(delay).unwrap();
        assert_eq!(kinds(&chain), vec![EffectKind::LowPass, EffectKind::Pitch, EffectKind::Delay]);

        chain.remove(pitch).unwrap();
        assert_eq!(kinds(&chain), vec![EffectKind::LowPass, EffectKind::Delay]);
        assert!(matches!(
            chain.remove(pitch),
            Err(LooperError::UnknownEffect { .. })
        ));
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut chain = EffectChain::default();
        let a = chain.add(EffectKind::Pan);
        chain.remove(a).unwrap();
        let b = chain.add(EffectKind::Pan);
        assert_ne!(a, b);
    }

    #[test]
    fn test_bypass_and_summary() {
        let mut chain = EffectChain::default();
        assert_eq!(chain.summary(), "no effects");
        let lp = chain.add(EffectKind::LowPass);
        chain.add(EffectKind::Pitch);
        assert!(chain.toggle_bypass(lp).unwrap());
        assert_eq!(
            chain.summary(),
            "1.Low-pass Filter #0 (bypassed) → 2.Pitch #1"
        );
        assert!(!chain.toggle_bypass(lp).unwrap());
    }

    #[test]
    fn test_set_param_reaches_shared_atomic() {
        let mut chain = EffectChain::default();
        let delay = chain.add(EffectKind::Delay);
        chain.set_param(delay, "feedback", 0.5).unwrap();
        let link = chain.get(delay).unwrap();
        assert_eq!(link.params.get_param("feedback").unwrap().get(), 0.5);
        assert!(chain.set_param(delay, "cutoff", 1.0).is_err());
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("LP".parse::<EffectKind>(), Ok(EffectKind::LowPass));
        assert!("reverb".parse::<EffectKind>().is_err());
        assert_eq!(InsertionPoint::Track(0).to_string(), "Track 1");
    }
}
