// src/audio_engine/capture.rs

use crate::audio_engine::capture_track::CaptureTrack;
use crate::audio_engine::command::{
    CaptureCommand, CaptureConfig, CaptureReply, RejectReason, UndoFailure,
};
use ringbuf::HeapProducer;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Per-track capture state living on the audio thread.
pub struct CaptureEngine {
    tracks: Vec<CaptureTrack>,
    sample_rate: u32,
    /// First frame of the next block to be processed.
    current_frame: u64,
    reply_producer: HeapProducer<CaptureReply>,
    dropped_replies: Arc<AtomicUsize>,
}

impl CaptureEngine {
    pub fn new(
        config: CaptureConfig,
        sample_rate: u32,
        reply_producer: HeapProducer<CaptureReply>,
        dropped_replies: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            tracks: config.build_tracks(sample_rate),
            sample_rate,
            current_frame: 0,
            reply_producer,
            dropped_replies,
        }
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn reply(&mut self, reply: CaptureReply) {
        if self.reply_producer.push(reply).is_err() {
            self.dropped_replies.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn when_to_frame(&self, when: f64) -> u64 {
        (when * self.sample_rate as f64).round().max(0.0) as u64
    }

    pub fn handle_command(&mut self, command: CaptureCommand) {
        if let CaptureCommand::Configure { config, tracks } = command {
            let retired = std::mem::replace(&mut self.tracks, tracks);
            self.reply(CaptureReply::Configured {
                num_tracks: self.tracks.len(),
                num_channels: config.num_channels,
                max_seconds_per_track: config.max_seconds_per_track,
                retired,
            });
            return;
        }

        let index = match &command {
            CaptureCommand::Reset { track }
            | CaptureCommand::ArmAtFrame { track, .. }
            | CaptureCommand::StopAtFrame { track, .. }
            | CaptureCommand::Start { track }
            | CaptureCommand::Stop { track }
            | CaptureCommand::ScheduleStart { track, .. }
            | CaptureCommand::ScheduleStop { track, .. }
            | CaptureCommand::StartOverdub { track }
            | CaptureCommand::StopOverdub { track }
            | CaptureCommand::UndoOverdub { track }
            | CaptureCommand::Dump { track }
            | CaptureCommand::Clear { track } => *track,
            CaptureCommand::Configure { .. } => return,
        };
        if index >= self.tracks.len() {
            self.reply(CaptureReply::Rejected {
                track: index,
                reason: RejectReason::UnknownTrack,
            });
            return;
        }

        let now = self.current_frame;
        let sample_rate = self.sample_rate;
        match command {
            CaptureCommand::Reset { track } => self.tracks[track].reset(),
            CaptureCommand::ArmAtFrame { track, frame } => {
                self.tracks[track].arm_at(frame);
                self.reply(CaptureReply::ScheduledStart {
                    track,
                    at_frame: frame,
                });
            }
            CaptureCommand::StopAtFrame { track, frame } => {
                self.tracks[track].stop_at(frame);
                self.reply(CaptureReply::ScheduledStop {
                    track,
                    at_frame: frame,
                });
            }
            CaptureCommand::ScheduleStart { track, when } => {
                let frame = self.when_to_frame(when);
                self.tracks[track].arm_at(frame);
                self.reply(CaptureReply::ScheduledStart {
                    track,
                    at_frame: frame,
                });
            }
            CaptureCommand::ScheduleStop { track, when } => {
                let frame = self.when_to_frame(when);
                self.tracks[track].stop_at(frame);
                self.reply(CaptureReply::ScheduledStop {
                    track,
                    at_frame: frame,
                });
            }
            CaptureCommand::Start { track } => {
                if self.tracks[track].is_overdubbing() {
                    self.reply(CaptureReply::Rejected {
                        track,
                        reason: RejectReason::Busy,
                    });
                } else {
                    self.tracks[track].start_now(now);
                    self.reply(CaptureReply::Started {
                        track,
                        at_frame: now,
                    });
                }
            }
            CaptureCommand::Stop { track } => {
                match self.tracks[track].stop_now(now) {
                    Some(total_frames) => self.reply(CaptureReply::Stopped {
                        track,
                        at_frame: now,
                        total_frames,
                    }),
                    None => self.reply(CaptureReply::Rejected {
                        track,
                        reason: RejectReason::NotRecording,
                    }),
                }
            }
            CaptureCommand::StartOverdub { track } => {
                if self.tracks[track].is_busy() {
                    self.reply(CaptureReply::Rejected {
                        track,
                        reason: RejectReason::Busy,
                    });
                } else if self.tracks[track].start_overdub(now) {
                    self.reply(CaptureReply::OverdubStarted {
                        track,
                        at_frame: now,
                    });
                } else {
                    self.reply(CaptureReply::Rejected {
                        track,
                        reason: RejectReason::NoMaterial,
                    });
                }
            }
            CaptureCommand::StopOverdub { track } => match self.tracks[track].stop_overdub() {
                Some(frames) => self.reply(CaptureReply::OverdubStopped { track, frames }),
                None => self.reply(CaptureReply::Rejected {
                    track,
                    reason: RejectReason::NotOverdubbing,
                }),
            },
            CaptureCommand::UndoOverdub { track } => {
                if self.tracks[track].is_overdubbing() {
                    self.reply(CaptureReply::UndoFailed {
                        track,
                        reason: UndoFailure::Busy,
                    });
                } else if self.tracks[track].undo_overdub() {
                    self.reply(CaptureReply::UndoDone { track });
                } else {
                    self.reply(CaptureReply::UndoFailed {
                        track,
                        reason: UndoFailure::NoOverdubs,
                    });
                }
            }
            CaptureCommand::Dump { track } => {
                let data = self.tracks[track].dump(sample_rate);
                self.reply(CaptureReply::Dump { track, data });
            }
            CaptureCommand::Clear { track } => {
                self.tracks[track].reset();
                self.reply(CaptureReply::Cleared { track });
            }
            CaptureCommand::Configure { .. } => {}
        }
    }

    /// Processes one block of interleaved input starting at `block_start`.
    pub fn process_block(
        &mut self,
        block_start: u64,
        input: &[f32],
        input_channels: usize,
        frames: usize,
    ) {
        self.current_frame = block_start;
        for index in 0..self.tracks.len() {
            let events = self.tracks[index].process_block(block_start, input, input_channels, frames);
            if let Some(at_frame) = events.started {
                self.reply(CaptureReply::Started {
                    track: index,
                    at_frame,
                });
            }
            if let Some((at_frame, total_frames)) = events.stopped {
                self.reply(CaptureReply::Stopped {
                    track: index,
                    at_frame,
                    total_frames,
                });
            }
        }
        self.current_frame = block_start + frames as u64;
    }

    /// Keeps immediate commands aligned with the transport between blocks.
    pub fn set_current_frame(&mut self, frame: u64) {
        self.current_frame = frame;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::{HeapConsumer, HeapRb};

    fn engine(seconds: f32) -> (CaptureEngine, HeapConsumer<CaptureReply>) {
        let (producer, consumer) = HeapRb::<CaptureReply>::new(64).split();
        let config = CaptureConfig {
            num_tracks: 2,
            num_channels: 1,
            max_seconds_per_track: seconds,
        };
        let engine = CaptureEngine::new(config, 1_000, producer, Arc::new(AtomicUsize::new(0)));
        (engine, consumer)
    }

    fn drain(consumer: &mut HeapConsumer<CaptureReply>) -> Vec<CaptureReply> {
        let mut replies = Vec::new();
        while let Some(reply) = consumer.pop() {
            replies.push(reply);
        }
        replies
    }

    #[test]
    fn test_scheduled_cycle_reports_and_dumps() {
        let (mut engine, mut replies) = engine(1.0);
        engine.handle_command(CaptureCommand::ArmAtFrame { track: 1, frame: 130 });
        engine.handle_command(CaptureCommand::StopAtFrame { track: 1, frame: 300 });
        let input = vec![0.5; 128];
        for block in 0..4u64 {
            engine.process_block(block * 128, &input, 1, 128);
        }
        engine.handle_command(CaptureCommand::Dump { track: 1 });

        let replies = drain(&mut replies);
        assert!(matches!(replies[0], CaptureReply::ScheduledStart { track: 1, at_frame: 130 }));
        assert!(matches!(replies[1], CaptureReply::ScheduledStop { track: 1, at_frame: 300 }));
        assert!(matches!(replies[2], CaptureReply::Started { track: 1, at_frame: 128 }));
        assert!(matches!(
            replies[3],
            CaptureReply::Stopped { track: 1, at_frame: 384, total_frames: 256 }
        ));
        match &replies[4] {
            CaptureReply::Dump { track: 1, data: Some(dump) } => {
                assert_eq!(dump.frames, 256);
                assert_eq!(dump.first_block_frame, 128);
                assert_eq!(dump.started_at_frame, Some(128));
                assert_eq!(dump.stopped_at_frame, Some(384));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_stop_before_armed_start_cancels_the_arm() {
        let (mut engine, mut replies) = engine(4.0);
        engine.handle_command(CaptureCommand::ArmAtFrame { track: 0, frame: 500 });
        engine.handle_command(CaptureCommand::Stop { track: 0 });
        let input = vec![0.5; 128];
        for block in 0..16u64 {
            engine.process_block(block * 128, &input, 1, 128);
        }

        let replies = drain(&mut replies);
        assert_eq!(replies.len(), 2);
        assert!(matches!(replies[0], CaptureReply::ScheduledStart { track: 0, at_frame: 500 }));
        assert!(matches!(
            replies[1],
            CaptureReply::Rejected { track: 0, reason: RejectReason::NotRecording }
        ));
        assert!(!engine.tracks[0].is_recording());
    }

    #[test]
    fn test_when_converts_with_sample_rate() {
        let (mut engine, mut replies) = engine(1.0);
        engine.handle_command(CaptureCommand::ScheduleStart { track: 0, when: 0.2504 });
        let replies = drain(&mut replies);
        assert!(matches!(replies[0], CaptureReply::ScheduledStart { track: 0, at_frame: 250 }));
    }

    #[test]
    fn test_empty_dump_is_explicit() {
        let (mut engine, mut replies) = engine(1.0);
        engine.handle_command(CaptureCommand::Dump { track: 0 });
        let replies = drain(&mut replies);
        assert!(matches!(replies[0], CaptureReply::Dump { track: 0, data: None }));
    }

    #[test]
    fn test_unknown_track_is_rejected() {
        let (mut engine, mut replies) = engine(1.0);
        engine.handle_command(CaptureCommand::Start { track: 7 });
        let replies = drain(&mut replies);
        assert!(matches!(
            replies[0],
            CaptureReply::Rejected { track: 7, reason: RejectReason::UnknownTrack }
        ));
    }

    #[test]
    fn test_undo_without_overdub_fails() {
        let (mut engine, mut replies) = engine(1.0);
        engine.handle_command(CaptureCommand::UndoOverdub { track: 0 });
        let replies = drain(&mut replies);
        assert!(matches!(
            replies[0],
            CaptureReply::UndoFailed { track: 0, reason: UndoFailure::NoOverdubs }
        ));
    }

    #[test]
    fn test_configure_returns_old_tracks() {
        let (mut engine, mut replies) = engine(1.0);
        let config = CaptureConfig {
            num_tracks: 3,
            num_channels: 2,
            max_seconds_per_track: 0.5,
        };
        engine.handle_command(CaptureCommand::configure(config, 1_000));
        assert_eq!(engine.num_tracks(), 3);
        match drain(&mut replies).remove(0) {
            CaptureReply::Configured {
                num_tracks,
                num_channels,
                retired,
                ..
            } => {
                assert_eq!(num_tracks, 3);
                assert_eq!(num_channels, 2);
                assert_eq!(retired.len(), 2);
                assert_eq!(retired[0].capacity(), 1_000);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_immediate_start_and_overdub_protocol() {
        let (mut engine, mut replies) = engine(1.0);
        engine.handle_command(CaptureCommand::Start { track: 0 });
        engine.process_block(0, &[0.25; 16], 1, 16);
        engine.handle_command(CaptureCommand::Stop { track: 0 });
        engine.handle_command(CaptureCommand::StartOverdub { track: 0 });
        engine.process_block(16, &[0.25; 16], 1, 16);
        engine.handle_command(CaptureCommand::StopOverdub { track: 0 });
        engine.handle_command(CaptureCommand::UndoOverdub { track: 0 });
        engine.handle_command(CaptureCommand::Dump { track: 0 });

        let replies = drain(&mut replies);
        assert!(matches!(replies[0], CaptureReply::Started { track: 0, at_frame: 0 }));
        assert!(matches!(
            replies[1],
            CaptureReply::Stopped { track: 0, at_frame: 16, total_frames: 16 }
        ));
        assert!(matches!(replies[2], CaptureReply::OverdubStarted { track: 0, at_frame: 16 }));
        assert!(matches!(replies[3], CaptureReply::OverdubStopped { track: 0, frames: 16 }));
        assert!(matches!(replies[4], CaptureReply::UndoDone { track: 0 }));
        match &replies[5] {
            CaptureReply::Dump { data: Some(dump), .. } => {
                assert_eq!(dump.channels[0], vec![0.25; 16]);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
