// src/audio_engine.rs

pub mod capture;
pub mod capture_track;
pub mod command;
pub mod fx_rack;
pub mod loop_player;

use crate::channel::EngineEndpoint;
use crate::fx::InsertionPoint;
use crate::looper::{SharedTrackState, NUM_TRACKS};
use crate::mixer::TrackMixerState;
use crate::transport::TransportClock;
use capture::CaptureEngine;
use command::{AudioCommand, CaptureConfig};
use fx_rack::FxRack;
use loop_player::LoopPlayer;
use ringbuf::HeapConsumer;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// Scheduling granularity of the engine, in frames.
pub const BLOCK_FRAMES: usize = 128;
/// The engine always renders interleaved stereo.
pub const OUTPUT_CHANNELS: usize = 2;

struct OneShot {
    buffer: Arc<Vec<f32>>,
    at_frame: u64,
}

impl OneShot {
    fn finished(&self, frame: u64) -> bool {
        frame >= self.at_frame + self.buffer.len() as u64
    }
}

/// Everything that runs on the audio thread.
pub struct AudioEngine {
    command_consumer: HeapConsumer<AudioCommand>,
    pub input_consumer: HeapConsumer<f32>,
    pub input_latency_compensation_ms: Arc<AtomicU32>,
    input_channels: usize,
    sample_rate: u32,
    frame: u64,
    clock: TransportClock,
    capture: CaptureEngine,
    players: Vec<LoopPlayer>,
    track_states: Vec<SharedTrackState>,
    mixer: TrackMixerState,
    input_fx_rack: Box<FxRack>,
    monitoring: bool,
    monitor_gain: f32,
    one_shot: Option<OneShot>,
    mono_input: Vec<f32>,
}

impl AudioEngine {
    pub fn new(
        endpoint: EngineEndpoint,
        input_consumer: HeapConsumer<f32>,
        input_channels: usize,
        sample_rate: u32,
        capture_config: CaptureConfig,
        input_latency_compensation_ms: Arc<AtomicU32>,
    ) -> Self {
        let track_states: Vec<SharedTrackState> =
            (0..NUM_TRACKS).map(|_| SharedTrackState::new()).collect();
        Self {
            command_consumer: endpoint.command_consumer,
            input_consumer,
            input_latency_compensation_ms,
            input_channels: input_channels.max(1),
            sample_rate,
            frame: 0,
            clock: TransportClock::new(sample_rate),
            capture: CaptureEngine::new(
                capture_config,
                sample_rate,
                endpoint.reply_producer,
                endpoint.dropped_replies,
            ),
            players: track_states.iter().cloned().map(LoopPlayer::new).collect(),
            track_states,
            mixer: TrackMixerState::default(),
            input_fx_rack: Box::new(FxRack::empty()),
            monitoring: false,
            monitor_gain: 1.0,
            one_shot: None,
            mono_input: vec![0.0; BLOCK_FRAMES],
        }
    }

    /// The transport clock this engine publishes to.
    pub fn clock(&self) -> TransportClock {
        self.clock.clone()
    }

    pub fn track_states(&self) -> Vec<SharedTrackState> {
        self.track_states.clone()
    }

    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn handle_commands(&mut self) {
        self.capture.set_current_frame(self.frame);
        while let Some(command) = self.command_consumer.pop() {
            match command {
                AudioCommand::Capture(cmd) => self.capture.handle_command(cmd),
                AudioCommand::StartLoop {
                    track,
                    buffer,
                    anchor_frame,
                } => {
                    if let Some(player) = self.players.get_mut(track) {
                        player.start(buffer, anchor_frame);
                    }
                }
                AudioCommand::StopLoop(track) => {
                    if let Some(player) = self.players.get_mut(track) {
                        player.stop();
                    }
                }
                AudioCommand::LoadFxRack(point, rack) => match point {
                    InsertionPoint::Track(i) => {
                        if let Some(player) = self.players.get_mut(i) {
                            player.set_fx(rack);
                        }
                    }
                    InsertionPoint::Input => self.input_fx_rack = rack,
                },
                AudioCommand::SetTrackVolume { track, volume } => {
                    if let Some(t) = self.mixer.tracks.get_mut(track) {
                        t.volume = volume.clamp(0.0, 2.0);
                    }
                }
                AudioCommand::ToggleTrackMute(track) => {
                    if let Some(t) = self.mixer.tracks.get_mut(track) {
                        t.is_muted = !t.is_muted;
                    }
                }
                AudioCommand::ToggleTrackSolo(track) => {
                    if let Some(t) = self.mixer.tracks.get_mut(track) {
                        t.is_soloed = !t.is_soloed;
                    }
                }
                AudioCommand::SetInputMonitoring(on) => self.monitoring = on,
                AudioCommand::SetMonitorGain(gain) => self.monitor_gain = gain.clamp(0.0, 2.0),
                AudioCommand::PlayOneShot { buffer, at_frame } => {
                    self.one_shot = Some(OneShot { buffer, at_frame });
                }
            }
        }
    }

    /// Handles pending commands, then renders `output` (interleaved stereo)
    /// from `input` (interleaved, `input_channels` wide) in engine blocks.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        self.handle_commands();
        let total_frames = output.len() / OUTPUT_CHANNELS;
        let mut offset = 0;
        while offset < total_frames {
            let frames = BLOCK_FRAMES.min(total_frames - offset);
            let in_start = (offset * self.input_channels).min(input.len());
            let in_end = ((offset + frames) * self.input_channels).min(input.len());
            let out_start = offset * OUTPUT_CHANNELS;
            let out_end = (offset + frames) * OUTPUT_CHANNELS;
            self.process_block(&input[in_start..in_end], &mut output[out_start..out_end], frames);
            offset += frames;
        }
    }

    fn process_block(&mut self, input: &[f32], output: &mut [f32], frames: usize) {
        let block_start = self.frame;
        let channels = self.input_channels;

        // --- Input: downmix, then the input FX chain ---
        for (i, sample) in self.mono_input[..frames].iter_mut().enumerate() {
            let frame = input.get(i * channels..(i + 1) * channels).unwrap_or(&[]);
            *sample = if frame.is_empty() {
                0.0
            } else {
                frame.iter().sum::<f32>() / channels as f32
            };
        }
        let processed_input = !self.input_fx_rack.is_empty();
        if processed_input {
            self.input_fx_rack.process_buffer(&mut self.mono_input[..frames]);
            self.capture
                .process_block(block_start, &self.mono_input[..frames], 1, frames);
        } else {
            self.capture.process_block(block_start, input, channels, frames);
        }

        // --- Playback ---
        output.fill(0.0);
        let any_soloed = self.mixer.any_soloed();
        for (i, player) in self.players.iter_mut().enumerate() {
            let gain = self.mixer.effective_gain(i, any_soloed);
            player.render(block_start, gain, output);
        }

        if self.monitoring {
            for (frame_out, m) in output
                .chunks_exact_mut(OUTPUT_CHANNELS)
                .zip(self.mono_input[..frames].iter())
            {
                let sample = m * self.monitor_gain;
                frame_out[0] += sample;
                frame_out[1] += sample;
            }
        }

        if let Some(shot) = &self.one_shot {
            for (i, frame_out) in output.chunks_exact_mut(OUTPUT_CHANNELS).enumerate() {
                let frame = block_start + i as u64;
                if frame >= shot.at_frame {
                    if let Some(s) = shot.buffer.get((frame - shot.at_frame) as usize) {
                        frame_out[0] += s;
                        frame_out[1] += s;
                    }
                }
            }
            if shot.finished(block_start + frames as u64) {
                self.one_shot = None;
            }
        }

        for sample in output.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.frame = block_start + frames as u64;
        self.capture.set_current_frame(self.frame);
        self.clock.publish(self.frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::command::{CaptureCommand, CaptureReply};
    use crate::channel::{engine_channel, EngineHandle};
    use crate::looper::LoopBuffer;
    use ringbuf::HeapRb;
    use std::sync::atomic::AtomicU32;

    fn engine() -> (AudioEngine, EngineHandle) {
        let (handle, endpoint) = engine_channel(64);
        let (_input_producer, input_consumer) = HeapRb::<f32>::new(16).split();
        let config = CaptureConfig {
            num_tracks: NUM_TRACKS,
            num_channels: 1,
            max_seconds_per_track: 1.0,
        };
        let engine = AudioEngine::new(
            endpoint,
            input_consumer,
            1,
            1_000,
            config,
            Arc::new(AtomicU32::new(500)),
        );
        (engine, handle)
    }

    #[test]
    fn test_process_splits_into_blocks_and_publishes_clock() {
        let (mut engine, _handle) = engine();
        let clock = engine.clock();
        let input = vec![0.0; 300];
        let mut output = vec![0.0; 600];
        engine.process(&input, &mut output);
        assert_eq!(clock.now_frames(), 300);
    }

    #[test]
    fn test_one_shot_plays_at_frame() {
        let (mut engine, mut handle) = engine();
        handle
            .send(AudioCommand::PlayOneShot {
                buffer: Arc::new(vec![0.5, 0.25]),
                at_frame: 130,
            })
            .unwrap();
        let input = vec![0.0; 256];
        let mut output = vec![0.0; 512];
        engine.process(&input, &mut output);
        assert_eq!(output[129 * 2], 0.0);
        assert_eq!(output[130 * 2], 0.5);
        assert_eq!(output[131 * 2 + 1], 0.25);
        assert_eq!(output[132 * 2], 0.0);
    }

    #[test]
    fn test_loops_mix_and_clip() {
        let (mut engine, mut handle) = engine();
        let buffer = Arc::new(LoopBuffer::new(vec![vec![0.75; 4]], 1_000));
        for track in 0..2 {
            handle
                .send(AudioCommand::StartLoop {
                    track,
                    buffer: buffer.clone(),
                    anchor_frame: 0,
                })
                .unwrap();
            handle
                .send(AudioCommand::SetTrackVolume { track, volume: 1.0 })
                .unwrap();
        }
        let input = vec![0.0; 4];
        let mut output = vec![0.0; 8];
        engine.process(&input, &mut output);
        assert!(output.iter().all(|s| *s == 1.0));

        handle.send(AudioCommand::ToggleTrackMute(1)).unwrap();
        engine.process(&input, &mut output);
        assert!(output.iter().all(|s| *s == 0.75));
    }

    #[test]
    fn test_monitoring_passes_input_through() {
        let (mut engine, mut handle) = engine();
        handle.send(AudioCommand::SetInputMonitoring(true)).unwrap();
        handle.send(AudioCommand::SetMonitorGain(0.5)).unwrap();
        let input = vec![0.5; 4];
        let mut output = vec![0.0; 8];
        engine.process(&input, &mut output);
        assert!(output.iter().all(|s| *s == 0.25));
    }

    #[test]
    fn test_capture_commands_reach_capture_engine() {
        let (mut engine, mut handle) = engine();
        handle
            .capture(CaptureCommand::Start { track: 3 })
            .unwrap();
        let input = vec![0.5; 128];
        let mut output = vec![0.0; 256];
        engine.process(&input, &mut output);
        handle.capture(CaptureCommand::Dump { track: 3 }).unwrap();
        engine.process(&input, &mut output);

        assert!(matches!(handle.try_recv(), Some(CaptureReply::Started { track: 3, at_frame: 0 })));
        match handle.try_recv() {
            Some(CaptureReply::Dump { track: 3, data: Some(dump) }) => {
                assert_eq!(dump.frames, 128);
                assert_eq!(dump.first_block_frame, 0);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
