// src/audio_engine/capture_track.rs

//! Fixed-capacity circular capture buffer for one track.
//!
//! All storage is allocated up front; the only allocation on the audio
//! thread is the linearized copy produced by [`CaptureTrack::dump`].

use crate::audio_engine::command::CaptureDump;

/// What happened to a track while processing one block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockEvents {
    pub started: Option<u64>,
    pub stopped: Option<(u64, usize)>,
}

#[derive(Debug, Clone, Copy)]
struct OverdubPass {
    loop_frames: usize,
    position: usize,
}

/// Region of the undo layer touched by the last overdub pass, in loop
/// positions.
#[derive(Debug, Clone, Copy)]
struct UndoSpan {
    loop_frames: usize,
    start: usize,
    touched: usize,
}

pub struct CaptureTrack {
    ring: Vec<Vec<f32>>,
    undo_layer: Vec<Vec<f32>>,
    capacity: usize,
    write_cursor: usize,
    total_written: usize,
    recording: bool,
    pending_start: Option<u64>,
    pending_stop: Option<u64>,
    started_at: Option<u64>,
    stopped_at: Option<u64>,
    /// Absolute frame just after the newest retained sample.
    end_frame: u64,
    overdub: Option<OverdubPass>,
    undo: Option<UndoSpan>,
}

impl std::fmt::Debug for CaptureTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureTrack")
            .field("channels", &self.ring.len())
            .field("capacity", &self.capacity)
            .field("write_cursor", &self.write_cursor)
            .field("total_written", &self.total_written)
            .field("recording", &self.recording)
            .finish()
    }
}

impl CaptureTrack {
    pub fn new(capacity_frames: usize, num_channels: usize) -> Self {
        let num_channels = num_channels.max(1);
        Self {
            ring: vec![vec![0.0; capacity_frames]; num_channels],
            undo_layer: vec![vec![0.0; capacity_frames]; num_channels],
            capacity: capacity_frames,
            write_cursor: 0,
            total_written: 0,
            recording: false,
            pending_start: None,
            pending_stop: None,
            started_at: None,
            stopped_at: None,
            end_frame: 0,
            overdub: None,
            undo: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_channels(&self) -> usize {
        self.ring.len()
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_overdubbing(&self) -> bool {
        self.overdub.is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.recording || self.overdub.is_some()
    }

    pub fn has_undo(&self) -> bool {
        self.undo.map_or(false, |u| u.touched > 0)
    }

    /// Drops buffered audio, schedule and markers. Storage stays allocated.
    pub fn reset(&mut self) {
        self.write_cursor = 0;
        self.total_written = 0;
        self.recording = false;
        self.pending_start = None;
        self.pending_stop = None;
        self.started_at = None;
        self.stopped_at = None;
        self.end_frame = 0;
        self.overdub = None;
        self.undo = None;
    }

    pub fn arm_at(&mut self, frame: u64) {
        self.pending_start = Some(frame);
    }

    pub fn stop_at(&mut self, frame: u64) {
        self.pending_stop = Some(frame);
    }

    /// Starts writing from `frame`, the start of the next processed block.
    pub fn start_now(&mut self, frame: u64) {
        self.pending_start = None;
        self.begin(frame);
    }

    /// Stops writing before `frame` and cancels a pending arm. Returns the
    /// total retained frames if the track was recording.
    pub fn stop_now(&mut self, frame: u64) -> Option<usize> {
        self.pending_start = None;
        self.pending_stop = None;
        if !self.recording {
            return None;
        }
        self.finish(frame);
        Some(self.total_written)
    }

    fn begin(&mut self, frame: u64) {
        if self.total_written == 0 {
            self.end_frame = frame;
        }
        self.recording = true;
        self.started_at = Some(frame);
        self.stopped_at = None;
        // New material shifts loop positions; the old layer no longer lines up.
        self.undo = None;
    }

    fn finish(&mut self, frame: u64) {
        self.recording = false;
        self.stopped_at = Some(frame);
    }

    /// Runs the schedule for the block `[block_start, block_start + frames)`
    /// and writes or adds the interleaved input.
    pub fn process_block(
        &mut self,
        block_start: u64,
        input: &[f32],
        input_channels: usize,
        frames: usize,
    ) -> BlockEvents {
        let mut events = BlockEvents::default();
        let block_end = block_start + frames as u64;

        if !self.recording && self.overdub.is_none() {
            if let Some(at) = self.pending_start {
                // Arming in or before this block starts at its first frame.
                if at < block_end {
                    self.pending_start = None;
                    self.begin(block_start);
                    events.started = Some(block_start);
                }
            }
        }

        if self.recording {
            if let Some(at) = self.pending_stop {
                if at < block_start {
                    self.pending_stop = None;
                    self.finish(block_start);
                    events.stopped = Some((block_start, self.total_written));
                    return events;
                }
            }

            self.write(input, input_channels, frames);
            self.end_frame = block_end;

            if let Some(at) = self.pending_stop {
                if at < block_end {
                    self.pending_stop = None;
                    self.finish(block_end);
                    events.stopped = Some((block_end, self.total_written));
                }
            }
        } else if self.overdub.is_some() {
            self.add(input, input_channels, frames);
        }

        events
    }

    fn write(&mut self, input: &[f32], input_channels: usize, frames: usize) {
        if self.capacity == 0 {
            return;
        }
        for frame in 0..frames {
            for (ch, ring) in self.ring.iter_mut().enumerate() {
                ring[self.write_cursor] = input_sample(input, input_channels, frame, ch);
            }
            self.write_cursor = (self.write_cursor + 1) % self.capacity;
            if self.total_written < self.capacity {
                self.total_written += 1;
            }
        }
    }

    /// Index of the oldest retained frame inside the ring.
    fn oldest(&self) -> usize {
        if self.total_written >= self.capacity {
            self.write_cursor
        } else {
            0
        }
    }

    /// Switches to additive mode. The retained material is treated as a loop
    /// whose phase zero is its oldest sample. Returns false without material.
    pub fn start_overdub(&mut self, frame: u64) -> bool {
        if self.recording || self.total_written == 0 {
            return false;
        }
        let loop_frames = self.total_written;
        let first_frame = self.end_frame - loop_frames as u64;
        let position = ((frame as i128 - first_frame as i128).rem_euclid(loop_frames as i128)) as usize;

        if let Some(span) = self.undo.take() {
            for layer in self.undo_layer.iter_mut() {
                for i in 0..span.touched {
                    layer[(span.start + i) % span.loop_frames] = 0.0;
                }
            }
        }
        self.undo = Some(UndoSpan {
            loop_frames,
            start: position,
            touched: 0,
        });
        self.overdub = Some(OverdubPass {
            loop_frames,
            position,
        });
        true
    }

    pub fn stop_overdub(&mut self) -> Option<usize> {
        self.overdub.take()?;
        self.undo.map(|u| u.touched)
    }

    fn add(&mut self, input: &[f32], input_channels: usize, frames: usize) {
        let (Some(pass), Some(span)) = (self.overdub.as_mut(), self.undo.as_mut()) else {
            return;
        };
        let oldest = if self.total_written >= self.capacity {
            self.write_cursor
        } else {
            0
        };
        for frame in 0..frames {
            let physical = (oldest + pass.position) % self.capacity;
            for (ch, (ring, layer)) in self
                .ring
                .iter_mut()
                .zip(self.undo_layer.iter_mut())
                .enumerate()
            {
                let sample = input_sample(input, input_channels, frame, ch);
                ring[physical] += sample;
                layer[pass.position] += sample;
            }
            pass.position = (pass.position + 1) % pass.loop_frames;
            if span.touched < span.loop_frames {
                span.touched += 1;
            }
        }
    }

    /// Subtracts the last additive layer. Only one level is kept.
    pub fn undo_overdub(&mut self) -> bool {
        if self.overdub.is_some() || !self.has_undo() {
            return false;
        }
        let Some(span) = self.undo.take() else {
            return false;
        };
        let oldest = self.oldest();
        for (ring, layer) in self.ring.iter_mut().zip(self.undo_layer.iter_mut()) {
            for i in 0..span.touched {
                let position = (span.start + i) % span.loop_frames;
                let physical = (oldest + position) % self.capacity;
                ring[physical] -= layer[position];
                layer[position] = 0.0;
            }
        }
        true
    }

    /// Linearizes the ring oldest to newest and resets the track. An empty
    /// capture yields `None`.
    pub fn dump(&mut self, sample_rate: u32) -> Option<CaptureDump> {
        let frames = self.total_written;
        if frames == 0 {
            self.reset();
            return None;
        }
        let oldest = self.oldest();
        let channels = self
            .ring
            .iter()
            .map(|ring| {
                let mut out = Vec::with_capacity(frames);
                if frames >= self.capacity {
                    out.extend_from_slice(&ring[oldest..]);
                    out.extend_from_slice(&ring[..oldest]);
                } else {
                    out.extend_from_slice(&ring[..frames]);
                }
                out
            })
            .collect();
        let dump = CaptureDump {
            channels,
            frames,
            sample_rate,
            first_block_frame: self.end_frame - frames as u64,
            started_at_frame: self.started_at,
            stopped_at_frame: self.stopped_at,
        };
        self.reset();
        Some(dump)
    }
}

/// Sample for track channel `ch`; channels missing from the input reuse
/// input channel 0.
#[inline]
fn input_sample(input: &[f32], input_channels: usize, frame: usize, ch: usize) -> f32 {
    if input_channels == 0 {
        return 0.0;
    }
    let source = if ch < input_channels { ch } else { 0 };
    input
        .get(frame * input_channels + source)
        .copied()
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 1_000;

    /// Feeds `total` frames of a counting signal in blocks of `block`.
    fn feed_counting(track: &mut CaptureTrack, start_frame: u64, total: usize, block: usize) {
        let mut frame = start_frame;
        let mut written = 0;
        while written < total {
            let n = block.min(total - written);
            let input: Vec<f32> = (0..n).map(|i| (written + i) as f32).collect();
            track.process_block(frame, &input, 1, n);
            frame += n as u64;
            written += n;
        }
    }

    #[test]
    fn test_stop_cancels_pending_arm() {
        let mut track = CaptureTrack::new(2_000, 1);
        track.arm_at(500);
        assert_eq!(track.stop_now(0), None);
        feed_counting(&mut track, 0, 16 * 128, 128);
        assert!(!track.is_recording());
        assert!(track.dump(SR).is_none());
    }

    #[test]
    fn test_dump_before_wrap_is_prefix() {
        let mut track = CaptureTrack::new(100, 1);
        track.start_now(0);
        feed_counting(&mut track, 0, 60, 16);
        let dump = track.dump(SR).expect("material");
        assert_eq!(dump.frames, 60);
        let expected: Vec<f32> = (0..60).map(|i| i as f32).collect();
        assert_eq!(dump.channels[0], expected);
        assert_eq!(dump.first_block_frame, 0);
    }

    #[test]
    fn test_dump_after_wrap_keeps_newest_capacity_frames() {
        // 250 does not divide by 100; 300 does.
        for total in [250usize, 300] {
            let mut track = CaptureTrack::new(100, 1);
            track.start_now(0);
            feed_counting(&mut track, 0, total, 32);
            let dump = track.dump(SR).expect("material");
            assert_eq!(dump.frames, 100);
            let expected: Vec<f32> = ((total - 100)..total).map(|i| i as f32).collect();
            assert_eq!(dump.channels[0], expected, "total {}", total);
            assert_eq!(dump.first_block_frame, (total - 100) as u64);
        }
    }

    #[test]
    fn test_arm_in_past_starts_at_block_start() {
        let mut track = CaptureTrack::new(1_000, 1);
        track.arm_at(10);
        let events = track.process_block(128, &[0.5; 128], 1, 128);
        assert_eq!(events.started, Some(128));
        assert!(track.is_recording());
        assert_eq!(track.total_written, 128);
    }

    #[test]
    fn test_arm_in_future_waits_for_block() {
        let mut track = CaptureTrack::new(1_000, 1);
        track.arm_at(300);
        assert_eq!(track.process_block(0, &[0.0; 128], 1, 128).started, None);
        assert_eq!(track.process_block(128, &[0.0; 128], 1, 128).started, None);
        // The block [256, 384) contains 300 and is captured from its start.
        assert_eq!(track.process_block(256, &[0.0; 128], 1, 128).started, Some(256));
    }

    #[test]
    fn test_stop_inside_block_captures_block_fully() {
        let mut track = CaptureTrack::new(1_000, 1);
        track.start_now(0);
        track.stop_at(140);
        assert_eq!(track.process_block(0, &[0.1; 128], 1, 128).stopped, None);
        let events = track.process_block(128, &[0.2; 128], 1, 128);
        assert_eq!(events.stopped, Some((256, 256)));
        assert!(!track.is_recording());
        let dump = track.dump(SR).expect("material");
        assert_eq!(dump.frames, 256);
        assert_eq!(dump.stopped_at_frame, Some(256));
    }

    #[test]
    fn test_stop_in_past_stops_before_block() {
        let mut track = CaptureTrack::new(1_000, 1);
        track.start_now(0);
        track.process_block(0, &[0.1; 128], 1, 128);
        track.stop_at(100);
        let events = track.process_block(128, &[0.2; 128], 1, 128);
        assert_eq!(events.stopped, Some((128, 128)));
        assert_eq!(track.total_written, 128);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut track = CaptureTrack::new(100, 1);
        track.start_now(0);
        feed_counting(&mut track, 0, 50, 10);
        track.reset();
        track.reset();
        assert!(!track.is_recording());
        assert_eq!(track.total_written, 0);
        assert!(track.dump(SR).is_none());
    }

    #[test]
    fn test_mono_input_feeds_every_channel() {
        let mut track = CaptureTrack::new(16, 2);
        track.start_now(0);
        track.process_block(0, &[0.25, 0.5], 1, 2);
        let dump = track.dump(SR).expect("material");
        assert_eq!(dump.channels[0], vec![0.25, 0.5]);
        assert_eq!(dump.channels[1], vec![0.25, 0.5]);
    }

    #[test]
    fn test_overdub_adds_and_undo_subtracts() {
        let mut track = CaptureTrack::new(64, 1);
        track.start_now(0);
        track.process_block(0, &[0.25; 8], 1, 8);
        track.stop_now(8);

        // Frame 10 is position 2 of the 8-frame loop anchored at frame 0.
        assert!(track.start_overdub(10));
        track.process_block(10, &[0.5; 4], 1, 4);
        assert_eq!(track.stop_overdub(), Some(4));

        assert!(track.undo_overdub());
        assert!(!track.undo_overdub());
        let dump = track.dump(SR).expect("material");
        assert_eq!(dump.channels[0], vec![0.25; 8]);
    }

    #[test]
    fn test_overdub_lands_at_loop_phase() {
        let mut track = CaptureTrack::new(64, 1);
        track.start_now(0);
        track.process_block(0, &[0.0; 8], 1, 8);
        track.stop_now(8);
        assert!(track.start_overdub(14));
        track.process_block(14, &[0.5; 3], 1, 3);
        track.stop_overdub();
        let dump = track.dump(SR).expect("material");
        assert_eq!(
            dump.channels[0],
            vec![0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.5]
        );
    }

    #[test]
    fn test_overdub_needs_material() {
        let mut track = CaptureTrack::new(64, 1);
        assert!(!track.start_overdub(0));
        assert!(!track.undo_overdub());
    }
}
