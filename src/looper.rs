// src/looper.rs
use crate::fx::EffectChain;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

pub const NUM_TRACKS: usize = 4;
pub const MASTER_TRACK: usize = 0;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    Ready,
    Waiting,
    Recording,
    Prerecord,
    Overdub,
    Playing,
    Stopped,
}

impl From<u8> for TrackState {
    fn from(val: u8) -> Self {
        match val {
            0 => TrackState::Ready,
            1 => TrackState::Waiting,
            2 => TrackState::Recording,
            3 => TrackState::Prerecord,
            4 => TrackState::Overdub,
            5 => TrackState::Playing,
            6 => TrackState::Stopped,
            _ => TrackState::Ready, // Default fallback
        }
    }
}

impl TrackState {
    pub fn label(&self) -> &'static str {
        match self {
            TrackState::Ready => "ready",
            TrackState::Waiting => "waiting",
            TrackState::Recording => "recording",
            TrackState::Prerecord => "prerecord",
            TrackState::Overdub => "overdub",
            TrackState::Playing => "playing",
            TrackState::Stopped => "stopped",
        }
    }
}

/// State that is shared between the control thread and the audio thread.
#[derive(Clone, Debug)]
pub struct SharedTrackState {
    state: Arc<AtomicU8>,
    playhead: Arc<AtomicUsize>,
}

impl SharedTrackState {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(TrackState::Ready as u8)),
            playhead: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn get(&self) -> TrackState {
        self.state.load(Ordering::Relaxed).into()
    }

    pub fn set(&self, state: TrackState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Playback position inside the loop, in frames. Written by the audio thread.
    pub fn get_playhead(&self) -> usize {
        self.playhead.load(Ordering::Relaxed)
    }

    pub fn set_playhead(&self, frame: usize) {
        self.playhead.store(frame, Ordering::Relaxed);
    }
}

impl Default for SharedTrackState {
    fn default() -> Self {
        Self::new()
    }
}

/// Planar multi-channel audio owned by a track. Replaced wholesale, never
/// edited once it is shared with the audio thread.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopBuffer {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl LoopBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    pub fn silent(num_channels: usize, frames: usize, sample_rate: u32) -> Self {
        Self {
            channels: vec![vec![0.0; frames]; num_channels.max(1)],
            sample_rate,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, |c| c.len())
    }

    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Copies `length` frames starting at `offset` out of `source`. Frames
    /// outside the source (before its start or past its end) are silent.
    pub fn from_window(
        source: &[Vec<f32>],
        offset: i64,
        length: usize,
        sample_rate: u32,
    ) -> Self {
        let channels = source
            .iter()
            .map(|ch| {
                let mut out = vec![0.0; length];
                for (j, sample) in out.iter_mut().enumerate() {
                    let src = offset + j as i64;
                    if src >= 0 {
                        if let Some(v) = ch.get(src as usize) {
                            *sample = *v;
                        }
                    }
                }
                out
            })
            .collect::<Vec<_>>();
        if channels.is_empty() {
            return Self::silent(1, length, sample_rate);
        }
        Self {
            channels,
            sample_rate,
        }
    }
}

/// One applied overdub: the captured segment and where it landed.
#[derive(Clone, Debug)]
pub struct OverdubLayer {
    pub segment: Vec<Vec<f32>>,
    pub start_sample: i64,
    pub gain: f32,
}

/// Control-side model of one looper channel.
pub struct Track {
    pub index: usize,
    pub state: TrackState,
    pub loop_buffer: Option<Arc<LoopBuffer>>,
    /// Absolute frame where playback phase is zero.
    pub loop_anchor: u64,
    pub divider: f64,
    pub overdub_history: Vec<OverdubLayer>,
    pub nudge_ms: f32,
    pub prerecord_ms: Option<f32>,
    pub overdub_gain: f32,
    pub volume: f32,
    pub is_muted: bool,
    pub is_soloed: bool,
    pub fx_chain: EffectChain,
    pub shared_state: SharedTrackState,
}

impl Track {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: TrackState::Ready,
            loop_buffer: None,
            loop_anchor: 0,
            divider: 1.0,
            overdub_history: Vec::new(),
            nudge_ms: -20.0,
            prerecord_ms: None,
            overdub_gain: 1.0,
            volume: 0.9,
            is_muted: false,
            is_soloed: false,
            fx_chain: EffectChain::default(),
            shared_state: SharedTrackState::new(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.index == MASTER_TRACK
    }

    pub fn set_state(&mut self, state: TrackState) {
        self.state = state;
        self.shared_state.set(state);
    }

    pub fn loop_frames(&self) -> usize {
        self.loop_buffer.as_ref().map_or(0, |b| b.frames())
    }

    pub fn loop_duration(&self) -> f64 {
        self.loop_buffer.as_ref().map_or(0.0, |b| b.duration())
    }

    /// Drops all audio and returns the track to `Ready`.
    pub fn clear(&mut self) {
        self.loop_buffer = None;
        self.loop_anchor = 0;
        self.overdub_history.clear();
        self.shared_state.set_playhead(0);
        self.set_state(TrackState::Ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_atomic() {
        let shared = SharedTrackState::new();
        for state in [
            TrackState::Waiting,
            TrackState::Prerecord,
            TrackState::Stopped,
        ] {
            shared.set(state);
            assert_eq!(shared.get(), state);
        }
    }

    #[test]
    fn test_window_pads_with_silence() {
        let source = vec![vec![0.1, 0.2, 0.3, 0.4]];
        let buffer = LoopBuffer::from_window(&source, 2, 4, 8_000);
        assert_eq!(buffer.channels[0], vec![0.3, 0.4, 0.0, 0.0]);

        let past_end = LoopBuffer::from_window(&source, 10, 2, 8_000);
        assert_eq!(past_end.channels[0], vec![0.0, 0.0]);

        let late = LoopBuffer::from_window(&source, -2, 4, 8_000);
        assert_eq!(late.channels[0], vec![0.0, 0.0, 0.1, 0.2]);
    }

    #[test]
    fn test_clear_resets_track() {
        let mut track = Track::new(1);
        track.loop_buffer = Some(Arc::new(LoopBuffer::silent(1, 16, 8_000)));
        track.set_state(TrackState::Playing);
        track.clear();
        assert_eq!(track.state, TrackState::Ready);
        assert_eq!(track.shared_state.get(), TrackState::Ready);
        assert!(track.loop_buffer.is_none());
        assert_eq!(track.loop_frames(), 0);
    }
}
