// src/audio_engine/command.rs

use crate::audio_engine::capture_track::CaptureTrack;
use crate::audio_engine::fx_rack::FxRack;
use crate::fx::InsertionPoint;
use crate::looper::LoopBuffer;
use std::sync::Arc;

/// Everything the control thread can ask of the audio thread.
pub enum AudioCommand {
    Capture(CaptureCommand),
    StartLoop {
        track: usize,
        buffer: Arc<LoopBuffer>,
        anchor_frame: u64,
    },
    StopLoop(usize),
    LoadFxRack(InsertionPoint, Box<FxRack>),
    SetTrackVolume {
        track: usize,
        volume: f32,
    },
    ToggleTrackMute(usize),
    ToggleTrackSolo(usize),
    SetInputMonitoring(bool),
    SetMonitorGain(f32),
    PlayOneShot {
        buffer: Arc<Vec<f32>>,
        at_frame: u64,
    },
}

impl std::fmt::Debug for AudioCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioCommand::Capture(cmd) => write!(f, "Capture({:?})", cmd),
            AudioCommand::StartLoop {
                track,
                anchor_frame,
                buffer,
            } => write!(
                f,
                "StartLoop {{ track: {}, anchor_frame: {}, frames: {} }}",
                track,
                anchor_frame,
                buffer.frames()
            ),
            AudioCommand::StopLoop(track) => write!(f, "StopLoop({})", track),
            AudioCommand::LoadFxRack(point, _) => write!(f, "LoadFxRack({})", point),
            AudioCommand::SetTrackVolume { track, volume } => {
                write!(f, "SetTrackVolume({}, {})", track, volume)
            }
            AudioCommand::ToggleTrackMute(track) => write!(f, "ToggleTrackMute({})", track),
            AudioCommand::ToggleTrackSolo(track) => write!(f, "ToggleTrackSolo({})", track),
            AudioCommand::SetInputMonitoring(on) => write!(f, "SetInputMonitoring({})", on),
            AudioCommand::SetMonitorGain(gain) => write!(f, "SetMonitorGain({})", gain),
            AudioCommand::PlayOneShot { at_frame, buffer } => write!(
                f,
                "PlayOneShot {{ at_frame: {}, len: {} }}",
                at_frame,
                buffer.len()
            ),
        }
    }
}

/// Longest ring any capture track may allocate.
pub const MAX_SECONDS_PER_TRACK: f32 = 120.0;

/// Capacity layout for the capture engine. Built on the control thread.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureConfig {
    pub num_tracks: usize,
    pub num_channels: usize,
    pub max_seconds_per_track: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            num_tracks: crate::looper::NUM_TRACKS,
            num_channels: 1,
            max_seconds_per_track: 60.0,
        }
    }
}

impl CaptureConfig {
    pub fn capacity_frames(&self, sample_rate: u32) -> usize {
        let seconds = if self.max_seconds_per_track.is_nan() {
            0.0
        } else {
            self.max_seconds_per_track.clamp(0.0, MAX_SECONDS_PER_TRACK)
        };
        (sample_rate as f64 * seconds as f64).floor() as usize
    }

    /// Allocates the ring buffers this layout needs.
    pub fn build_tracks(&self, sample_rate: u32) -> Vec<CaptureTrack> {
        let capacity = self.capacity_frames(sample_rate);
        (0..self.num_tracks)
            .map(|_| CaptureTrack::new(capacity, self.num_channels))
            .collect()
    }
}

#[derive(Debug)]
pub enum CaptureCommand {
    Reset { track: usize },
    ArmAtFrame { track: usize, frame: u64 },
    StopAtFrame { track: usize, frame: u64 },
    Start { track: usize },
    Stop { track: usize },
    ScheduleStart { track: usize, when: f64 },
    ScheduleStop { track: usize, when: f64 },
    StartOverdub { track: usize },
    StopOverdub { track: usize },
    UndoOverdub { track: usize },
    Dump { track: usize },
    Clear { track: usize },
    Configure {
        config: CaptureConfig,
        tracks: Vec<CaptureTrack>,
    },
}

impl CaptureCommand {
    /// Builds a `Configure` command with freshly allocated tracks.
    pub fn configure(config: CaptureConfig, sample_rate: u32) -> Self {
        CaptureCommand::Configure {
            tracks: config.build_tracks(sample_rate),
            config,
        }
    }
}

/// Linearized capture handed back to the control thread.
#[derive(Debug, Clone)]
pub struct CaptureDump {
    pub channels: Vec<Vec<f32>>,
    pub frames: usize,
    pub sample_rate: u32,
    /// Absolute frame of the oldest retained sample.
    pub first_block_frame: u64,
    pub started_at_frame: Option<u64>,
    pub stopped_at_frame: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownTrack,
    Busy,
    NoMaterial,
    NotOverdubbing,
    NotRecording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoFailure {
    NoOverdubs,
    Busy,
}

pub enum CaptureReply {
    Started { track: usize, at_frame: u64 },
    Stopped {
        track: usize,
        at_frame: u64,
        total_frames: usize,
    },
    ScheduledStart { track: usize, at_frame: u64 },
    ScheduledStop { track: usize, at_frame: u64 },
    OverdubStarted { track: usize, at_frame: u64 },
    OverdubStopped { track: usize, frames: usize },
    UndoDone { track: usize },
    UndoFailed { track: usize, reason: UndoFailure },
    Dump {
        track: usize,
        data: Option<CaptureDump>,
    },
    Configured {
        num_tracks: usize,
        num_channels: usize,
        max_seconds_per_track: f32,
        retired: Vec<CaptureTrack>,
    },
    Cleared { track: usize },
    Rejected { track: usize, reason: RejectReason },
}

impl CaptureReply {
    pub fn track(&self) -> Option<usize> {
        match self {
            CaptureReply::Started { track, .. }
            | CaptureReply::Stopped { track, .. }
            | CaptureReply::ScheduledStart { track, .. }
            | CaptureReply::ScheduledStop { track, .. }
            | CaptureReply::OverdubStarted { track, .. }
            | CaptureReply::OverdubStopped { track, .. }
            | CaptureReply::UndoDone { track }
            | CaptureReply::UndoFailed { track, .. }
            | CaptureReply::Dump { track, .. }
            | CaptureReply::Cleared { track }
            | CaptureReply::Rejected { track, .. } => Some(*track),
            CaptureReply::Configured { .. } => None,
        }
    }
}

impl std::fmt::Debug for CaptureReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureReply::Dump { track, data } => write!(
                f,
                "Dump {{ track: {}, frames: {} }}",
                track,
                data.as_ref().map_or(0, |d| d.frames)
            ),
            CaptureReply::Configured {
                num_tracks,
                num_channels,
                max_seconds_per_track,
                ..
            } => write!(
                f,
                "Configured {{ num_tracks: {}, num_channels: {}, max_seconds_per_track: {} }}",
                num_tracks, num_channels, max_seconds_per_track
            ),
            CaptureReply::Started { track, at_frame } => {
                write!(f, "Started {{ track: {}, at_frame: {} }}", track, at_frame)
            }
            CaptureReply::Stopped {
                track,
                at_frame,
                total_frames,
            } => write!(
                f,
                "Stopped {{ track: {}, at_frame: {}, total_frames: {} }}",
                track, at_frame, total_frames
            ),
            CaptureReply::ScheduledStart { track, at_frame } => {
                write!(f, "ScheduledStart {{ track: {}, at_frame: {} }}", track, at_frame)
            }
            CaptureReply::ScheduledStop { track, at_frame } => {
                write!(f, "ScheduledStop {{ track: {}, at_frame: {} }}", track, at_frame)
            }
            CaptureReply::OverdubStarted { track, at_frame } => {
                write!(f, "OverdubStarted {{ track: {}, at_frame: {} }}", track, at_frame)
            }
            CaptureReply::OverdubStopped { track, frames } => {
                write!(f, "OverdubStopped {{ track: {}, frames: {} }}", track, frames)
            }
            CaptureReply::UndoDone { track } => write!(f, "UndoDone {{ track: {} }}", track),
            CaptureReply::UndoFailed { track, reason } => {
                write!(f, "UndoFailed {{ track: {}, reason: {:?} }}", track, reason)
            }
            CaptureReply::Cleared { track } => write!(f, "Cleared {{ track: {} }}", track),
            CaptureReply::Rejected { track, reason } => {
                write!(f, "Rejected {{ track: {}, reason: {:?} }}", track, reason)
            }
        }
    }
}
