// src/merge.rs

//! Overdub placement: additive wrap-around merge into a loop and undo of the
//! most recent layer.

use crate::looper::{LoopBuffer, OverdubLayer};

/// Where the captured segment's first sample lands in the loop.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Placement {
    /// Measure the overdub start against a running phase reference: the
    /// master loop for the master track, the track's own cycle otherwise.
    Phase {
        overdub_start: f64,
        phase_start: f64,
        phase_duration: f64,
    },
    /// Align the end of the segment with the end of the loop.
    TailAligned,
}

/// Loop index written by segment sample `i`.
#[inline]
pub fn wrap_index(start_sample: i64, i: usize, loop_len: usize) -> usize {
    (start_sample + i as i64).rem_euclid(loop_len as i64) as usize
}

pub fn start_sample(
    placement: Placement,
    segment_len: usize,
    loop_len: usize,
    sample_rate: u32,
    nudge_samples: i64,
    prerecord_samples: i64,
) -> i64 {
    let base = match placement {
        Placement::Phase {
            overdub_start,
            phase_start,
            phase_duration,
        } => {
            let phase = if phase_duration > 0.0 {
                (overdub_start - phase_start).rem_euclid(phase_duration)
            } else {
                0.0
            };
            (phase * sample_rate as f64).round() as i64
        }
        Placement::TailAligned => segment_len as i64 - loop_len as i64,
    };
    base + nudge_samples - prerecord_samples
}

/// Adds `segment * gain` onto a copy of `loop_buffer` starting at
/// `start_sample`, wrapping around the loop, then hard-clips to [-1, 1].
pub fn merge_overdub(
    loop_buffer: &LoopBuffer,
    segment: &[Vec<f32>],
    start_sample: i64,
    gain: f32,
) -> LoopBuffer {
    apply_layer(loop_buffer, segment, start_sample, gain)
}

/// Subtracts a previously merged layer. Samples that were clipped when the
/// layer went in are not restored exactly.
pub fn undo_overdub(loop_buffer: &LoopBuffer, layer: &OverdubLayer) -> LoopBuffer {
    apply_layer(loop_buffer, &layer.segment, layer.start_sample, -layer.gain)
}

fn apply_layer(
    loop_buffer: &LoopBuffer,
    segment: &[Vec<f32>],
    start_sample: i64,
    gain: f32,
) -> LoopBuffer {
    let mut merged = loop_buffer.clone();
    let loop_len = merged.frames();
    if loop_len == 0 || segment.is_empty() {
        return merged;
    }

    for (ch, out) in merged.channels.iter_mut().enumerate() {
        // Mono captures feed every loop channel.
        let source = segment.get(ch).unwrap_or(&segment[0]);
        for (i, sample) in source.iter().enumerate() {
            let idx = wrap_index(start_sample, i, loop_len);
            out[idx] += sample * gain;
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize, scale: f32) -> Vec<f32> {
        (0..len).map(|i| (i as f32 / len as f32) * scale).collect()
    }

    #[test]
    fn test_wrap_invariant() {
        let m = 64;
        let original = LoopBuffer::new(vec![ramp(m, 0.5)], 8_000);
        let segment = vec![vec![0.25; 40]];
        for start in [-50i64, 0, m as i64 - 1, m as i64 + 10] {
            let merged = merge_overdub(&original, &segment, start, 1.0);
            let mut expected = original.channels[0].clone();
            for i in 0..segment[0].len() {
                let idx = wrap_index(start, i, m);
                assert!(idx < m);
                expected[idx] = (expected[idx] + segment[0][i]).clamp(-1.0, 1.0);
            }
            assert_eq!(merged.channels[0], expected, "start {}", start);
            assert_eq!(merged.frames(), m);
        }
    }

    #[test]
    fn test_segment_longer_than_loop_wraps_onto_itself() {
        let original = LoopBuffer::silent(1, 4, 8_000);
        let segment = vec![vec![0.125; 10]];
        let merged = merge_overdub(&original, &segment, 0, 1.0);
        // Indices 0 and 1 receive three writes, 2 and 3 receive two.
        assert_eq!(merged.channels[0], vec![0.375, 0.375, 0.25, 0.25]);
    }

    #[test]
    fn test_mono_segment_feeds_all_channels() {
        let original = LoopBuffer::silent(2, 8, 8_000);
        let segment = vec![vec![0.5; 2]];
        let merged = merge_overdub(&original, &segment, 3, 0.5);
        for ch in &merged.channels {
            assert_eq!(ch[3], 0.25);
            assert_eq!(ch[4], 0.25);
            assert_eq!(ch[5], 0.0);
        }
    }

    #[test]
    fn test_undo_restores_unclipped_samples() {
        let original = LoopBuffer::new(vec![vec![0.25, -0.5, 0.0, 0.125, 0.5, -0.25]], 8_000);
        let segment = vec![vec![0.5, 0.25, -0.125, 0.0625]];
        let start = -2;
        let merged = merge_overdub(&original, &segment, start, 1.0);
        assert_ne!(merged, original);
        let layer = OverdubLayer {
            segment,
            start_sample: start,
            gain: 1.0,
        };
        let restored = undo_overdub(&merged, &layer);
        assert_eq!(restored, original);
    }

    #[test]
    fn test_undo_after_clipping_leaves_residual() {
        let original = LoopBuffer::new(vec![vec![0.75, 0.0]], 8_000);
        let segment = vec![vec![0.5]];
        let merged = merge_overdub(&original, &segment, 0, 1.0);
        assert_eq!(merged.channels[0][0], 1.0);
        let layer = OverdubLayer {
            segment,
            start_sample: 0,
            gain: 1.0,
        };
        let restored = undo_overdub(&merged, &layer);
        // 1.0 - 0.5 = 0.5, not the original 0.75.
        assert_eq!(restored.channels[0][0], 0.5);
        assert_eq!(restored.channels[0][1], 0.0);
    }

    #[test]
    fn test_start_sample_relative_to_phase() {
        let placement = Placement::Phase {
            overdub_start: 12.5,
            phase_start: 10.0,
            phase_duration: 2.0,
        };
        // Phase 0.5 s at 8 kHz, minus 160 nudge, minus 1200 pre-roll.
        assert_eq!(start_sample(placement, 0, 16_000, 8_000, -160, 1_200), 4_000 - 160 - 1_200);
    }

    #[test]
    fn test_start_sample_tail_aligned() {
        let s = start_sample(Placement::TailAligned, 17_000, 16_000, 8_000, 0, 200);
        assert_eq!(s, 800);
    }
}
