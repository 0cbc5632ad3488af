// src/audio_engine/loop_player.rs

use crate::audio_engine::fx_rack::FxRack;
use crate::looper::{LoopBuffer, SharedTrackState};
use std::sync::Arc;

/// Plays one track's loop phase-locked to an absolute frame anchor.
pub struct LoopPlayer {
    buffer: Option<Arc<LoopBuffer>>,
    anchor: u64,
    playing: bool,
    fx: Box<FxRack>,
    shared_state: SharedTrackState,
}

impl LoopPlayer {
    pub fn new(shared_state: SharedTrackState) -> Self {
        Self {
            buffer: None,
            anchor: 0,
            playing: false,
            fx: Box::new(FxRack::empty()),
            shared_state,
        }
    }

    /// Swaps in a new loop. Phase zero sits at `anchor`.
    pub fn start(&mut self, buffer: Arc<LoopBuffer>, anchor: u64) {
        self.buffer = Some(buffer);
        self.anchor = anchor;
        self.playing = true;
    }

    pub fn stop(&mut self) {
        self.playing = false;
    }

    pub fn set_fx(&mut self, rack: Box<FxRack>) {
        self.fx = rack;
    }

    /// Loop position for `frame` at the given playback rate.
    #[inline]
    fn position(&self, frame: u64, len: usize, rate: f64) -> f64 {
        let offset = frame as i128 - self.anchor as i128;
        if rate == 1.0 {
            offset.rem_euclid(len as i128) as f64
        } else {
            (offset as f64 * rate).rem_euclid(len as f64)
        }
    }

    /// Adds this track's output for the block into interleaved stereo `out`.
    pub fn render(&mut self, block_start: u64, gain: f32, out: &mut [f32]) {
        if !self.playing {
            return;
        }
        let Some(buffer) = self.buffer.as_ref() else {
            return;
        };
        let len = buffer.frames();
        if len == 0 {
            return;
        }

        let rate = self.fx.playback_rate();
        let pan = self.fx.pan();
        let left_gain = gain * (1.0 - pan).min(1.0);
        let right_gain = gain * (1.0 + pan).min(1.0);
        let stereo = buffer.num_channels() > 1;
        let mut last_index = 0;

        for (i, frame_out) in out.chunks_exact_mut(2).enumerate() {
            let pos = self.position(block_start + i as u64, len, rate);
            let index = pos as usize % len;
            let next = (index + 1) % len;
            let fraction = (pos - index as f64) as f32;
            let read = |ch: &[f32]| ch[index] + fraction * (ch[next] - ch[index]);

            let left_in = read(&buffer.channels[0]);
            let (left, right) = if stereo {
                let right_in = read(&buffer.channels[1]);
                (
                    self.fx.process_sample(0, left_in),
                    self.fx.process_sample(1, right_in),
                )
            } else {
                let mono = self.fx.process_sample(0, left_in);
                (mono, mono)
            };
            frame_out[0] += left * left_gain;
            frame_out[1] += right * right_gain;
            last_index = index;
        }
        self.shared_state.set_playhead(last_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_with(samples: Vec<f32>, anchor: u64) -> LoopPlayer {
        let mut player = LoopPlayer::new(SharedTrackState::new());
        player.start(Arc::new(LoopBuffer::new(vec![samples], 1_000)), anchor);
        player
    }

    #[test]
    fn test_output_is_phase_locked_to_anchor() {
        let mut player = player_with(vec![0.1, 0.2, 0.3, 0.4], 102);
        let mut out = vec![0.0; 8];
        // Frame 100 sits two frames before the anchor: position 2.
        player.render(100, 1.0, &mut out);
        let left: Vec<f32> = out.chunks(2).map(|f| f[0]).collect();
        assert_eq!(left, vec![0.3, 0.4, 0.1, 0.2]);
        assert_eq!(out[1], out[0]);
    }

    #[test]
    fn test_stopped_player_is_silent() {
        let mut player = player_with(vec![0.5; 4], 0);
        player.stop();
        let mut out = vec![0.0; 8];
        player.render(0, 1.0, &mut out);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_gain_scales_output() {
        let mut player = player_with(vec![0.5; 4], 0);
        let mut out = vec![0.0; 4];
        player.render(0, 0.5, &mut out);
        assert_eq!(out, vec![0.25; 4]);
    }
}
