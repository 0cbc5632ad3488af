// src/mixer.rs
use crate::looper::NUM_TRACKS;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MixerTrackState {
    pub volume: f32,
    pub is_muted: bool,
    pub is_soloed: bool,
}

impl Default for MixerTrackState {
    fn default() -> Self {
        Self {
            volume: 0.9,
            is_muted: false,
            is_soloed: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackMixerState {
    pub tracks: [MixerTrackState; NUM_TRACKS],
}

impl Default for TrackMixerState {
    fn default() -> Self {
        Self {
            tracks: [MixerTrackState::default(); NUM_TRACKS],
        }
    }
}

impl TrackMixerState {
    pub fn any_soloed(&self) -> bool {
        self.tracks.iter().any(|t| t.is_soloed)
    }

    /// Gain applied to a track after mute and solo are taken into account.
    pub fn effective_gain(&self, track: usize, any_soloed: bool) -> f32 {
        match self.tracks.get(track) {
            Some(t) if t.is_muted => 0.0,
            Some(t) if any_soloed && !t.is_soloed => 0.0,
            Some(t) => t.volume,
            None => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solo_silences_other_tracks() {
        let mut mixer = TrackMixerState::default();
        mixer.tracks[2].is_soloed = true;
        let solo = mixer.any_soloed();
        assert_eq!(mixer.effective_gain(2, solo), 0.9);
        assert_eq!(mixer.effective_gain(0, solo), 0.0);
    }

    #[test]
    fn test_mute_wins_over_solo() {
        let mut mixer = TrackMixerState::default();
        mixer.tracks[1].is_soloed = true;
        mixer.tracks[1].is_muted = true;
        assert_eq!(mixer.effective_gain(1, true), 0.0);
        assert_eq!(mixer.effective_gain(9, false), 0.0);
    }
}
