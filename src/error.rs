// src/error.rs

use crate::looper::TrackState;

/// Errors raised by the control side of the looper.
#[derive(Debug, thiserror::Error)]
pub enum LooperError {
    #[error("track {0} does not exist")]
    UnknownTrack(usize),
    #[error("track {0} needs a master loop before it can record")]
    MasterNotSet(usize),
    #[error("cannot {action} track {track} while it is {state:?}")]
    InvalidTransition {
        track: usize,
        state: TrackState,
        action: &'static str,
    },
    #[error("track {0} already has a capture cycle in flight")]
    CaptureBusy(usize),
    #[error("track {track} needs {requested} frames but the capture buffer holds {capacity}")]
    CaptureTooLong {
        track: usize,
        requested: usize,
        capacity: usize,
    },
    #[error("nothing to undo on track {0}")]
    NothingToUndo(usize),
    #[error("effect {id} not found in chain")]
    UnknownEffect { id: u32 },
    #[error("effect {id} has no parameter named {name}")]
    UnknownParam { id: u32, name: String },
    #[error("divider must be a positive finite number, got {0}")]
    InvalidDivider(f64),
    #[error("capture length must be a positive finite number of seconds, got {0}")]
    InvalidCaptureLength(f32),
    #[error("the master track always uses a divider of 1")]
    MasterDivider,
    #[error("engine command queue is full")]
    CommandQueueFull,
    #[error("latency calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("audio is not running")]
    AudioNotRunning,
}

/// Reasons a latency calibration produces no usable estimate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("every capture track is busy")]
    NoIdleTrack,
    #[error("a calibration is already running")]
    AlreadyRunning,
    #[error("the capture came back empty")]
    EmptyCapture,
    #[error("capture is shorter than the click")]
    CaptureTooShort,
    #[error("correlation {correlation:.3} is below the confidence threshold {threshold:.3}")]
    LowConfidence { correlation: f32, threshold: f32 },
    #[error("the calibration cycle was cancelled")]
    Cancelled,
}
