// src/session.rs

//! Control-domain side of the looper. The session owns the track state
//! machines, the master tempo, overdub history and latency calibration, and
//! talks to the audio thread only through the engine queues. Nothing here
//! blocks: callers drive it by calling [`Session::poll`] regularly.

use crate::audio_engine::command::{
    AudioCommand, CaptureCommand, CaptureConfig, CaptureDump, CaptureReply,
    MAX_SECONDS_PER_TRACK,
};
use crate::audio_engine::BLOCK_FRAMES;
use crate::channel::EngineHandle;
use crate::error::{CalibrationError, LooperError};
use crate::fx::{EffectChain, EffectKind, InsertionPoint};
use crate::latency::{self, LatencyEstimator, LatencyMeasurement};
use crate::looper::{
    LoopBuffer, OverdubLayer, SharedTrackState, Track, TrackState, MASTER_TRACK, NUM_TRACKS,
};
use crate::merge::{self, Placement};
use crate::settings::AppSettings;
use crate::transport::{self, FramePhase, TransportClock};
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Oldest layers beyond this depth can no longer be undone.
pub const MAX_UNDO_LAYERS: usize = 8;

/// Tempo and phase reference fixed by the master track.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MasterTempo {
    /// Absolute frame of phase zero.
    pub anchor: u64,
    pub frames: usize,
    pub duration: f64,
    pub bpm: u32,
}

impl MasterTempo {
    pub fn phase(&self) -> FramePhase {
        FramePhase::new(self.anchor, self.frames as u64)
    }
}

/// What changed during a [`Session::poll`].
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged { track: usize, state: TrackState },
    MasterSet(MasterTempo),
    MasterCleared,
    LoopInstalled { track: usize, frames: usize },
    OverdubMerged { track: usize, start_sample: i64 },
    OverdubUndone { track: usize },
    CaptureEmpty { track: usize },
    Calibrated(LatencyMeasurement),
    CalibrationFailed(CalibrationError),
}

#[derive(Debug, Clone)]
enum CycleKind {
    /// `target_frames` is fixed for dependent tracks and open for the master.
    Record { target_frames: Option<usize> },
    Overdub { boundary: u64, prerecord_frames: usize },
    Calibration { click: Arc<Vec<f32>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CyclePhase {
    Armed,
    Capturing,
    /// Stopped by the engine, dump not requested yet.
    Stopped,
    /// Dump requested, waiting for the data.
    Draining,
    /// `clear` sent, waiting for `cleared`.
    Cancelling,
}

/// One reset → arm → stop → dump round trip on a capture track.
#[derive(Debug, Clone)]
struct CaptureCycle {
    kind: CycleKind,
    requested_start: u64,
    requested_stop: u64,
    phase: CyclePhase,
}

impl CaptureCycle {
    fn is_calibration(&self) -> bool {
        matches!(self.kind, CycleKind::Calibration { .. })
    }

    fn is_running(&self) -> bool {
        matches!(self.phase, CyclePhase::Armed | CyclePhase::Capturing)
    }
}

pub struct Session {
    tracks: Vec<Track>,
    cycles: Vec<Option<CaptureCycle>>,
    engine: EngineHandle,
    clock: TransportClock,
    sample_rate: u32,
    capture_config: CaptureConfig,
    master: Option<MasterTempo>,
    master_max_seconds: f32,
    bpm_rounding: bool,
    tail_aligned_overdubs: bool,
    latency: LatencyEstimator,
    last_measurement: Option<LatencyMeasurement>,
    calibration_track: Option<usize>,
    input_chain: EffectChain,
    monitoring: bool,
    events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(
        mut engine: EngineHandle,
        clock: TransportClock,
        track_states: Vec<SharedTrackState>,
        settings: &AppSettings,
    ) -> Result<Self, LooperError> {
        let mut tracks: Vec<Track> = (0..NUM_TRACKS).map(Track::new).collect();
        for (track, shared) in tracks.iter_mut().zip(track_states) {
            track.shared_state = shared;
            track.shared_state.set(TrackState::Ready);
        }
        for track in tracks.iter_mut() {
            track.nudge_ms = settings.manual_nudge_ms;
            track.prerecord_ms = settings.prerecord_ms;
            track.overdub_gain = settings.overdub_gain;
            track.volume = settings.track_volume;
            if !track.is_master() {
                match settings.dividers.get(track.index - 1) {
                    Some(d) if d.is_finite() && *d > 0.0 => track.divider = *d,
                    Some(d) => warn!(
                        "Ignoring invalid divider {} for track {}; using 1",
                        d,
                        track.index + 1
                    ),
                    None => {}
                }
            }
            engine.send(AudioCommand::SetTrackVolume {
                track: track.index,
                volume: track.volume,
            })?;
        }
        engine.send(AudioCommand::SetMonitorGain(settings.monitor_gain))?;

        Ok(Self {
            tracks,
            cycles: (0..NUM_TRACKS).map(|_| None).collect(),
            engine,
            sample_rate: clock.sample_rate(),
            clock,
            capture_config: settings.capture_config(),
            master: None,
            master_max_seconds: settings.master_max_seconds,
            bpm_rounding: settings.bpm_rounding,
            tail_aligned_overdubs: settings.tail_aligned_overdubs,
            latency: LatencyEstimator::new(settings.latency_confidence_threshold),
            last_measurement: None,
            calibration_track: None,
            input_chain: EffectChain::default(),
            monitoring: false,
            events: Vec::new(),
        })
    }

    // --- Accessors ---

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, track: usize) -> Option<&Track> {
        self.tracks.get(track)
    }

    pub fn master(&self) -> Option<MasterTempo> {
        self.master
    }

    /// Dependent tracks stay disabled until the master loop exists.
    pub fn is_enabled(&self, track: usize) -> bool {
        track == MASTER_TRACK || self.master.is_some()
    }

    pub fn clock(&self) -> &TransportClock {
        &self.clock
    }

    pub fn capture_config(&self) -> CaptureConfig {
        self.capture_config
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibration_track.is_some()
    }

    pub fn latency(&self) -> &LatencyEstimator {
        &self.latency
    }

    pub fn last_measurement(&self) -> Option<&LatencyMeasurement> {
        self.last_measurement.as_ref()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    // --- Polling ---

    /// Drains engine replies, advances time-driven transitions and returns
    /// everything that changed since the last call.
    pub fn poll(&mut self) -> Vec<SessionEvent> {
        let dropped = self.engine.take_dropped_replies();
        if dropped > 0 {
            warn!("{} capture replies were dropped on a full queue", dropped);
        }
        while let Some(reply) = self.engine.try_recv() {
            self.handle_reply(reply);
        }
        self.request_pending_dumps();
        self.advance_prerecord();
        std::mem::take(&mut self.events)
    }

    fn handle_reply(&mut self, reply: CaptureReply) {
        match reply {
            CaptureReply::Started { track, at_frame } => self.on_started(track, at_frame),
            CaptureReply::Stopped {
                track,
                at_frame,
                total_frames,
            } => self.on_stopped(track, at_frame, total_frames),
            CaptureReply::Dump { track, data } => self.on_dump(track, data),
            CaptureReply::Cleared { track } => {
                if let Some(slot) = self.cycles.get_mut(track) {
                    if matches!(slot, Some(c) if c.phase == CyclePhase::Cancelling) {
                        *slot = None;
                        debug!("Capture track {} cleared", track + 1);
                    }
                }
            }
            CaptureReply::Configured {
                num_tracks,
                num_channels,
                max_seconds_per_track,
                retired,
            } => {
                info!(
                    "Capture reconfigured: {} tracks, {} channel(s), {:.0} s each",
                    num_tracks, num_channels, max_seconds_per_track
                );
                self.capture_config = CaptureConfig {
                    num_tracks,
                    num_channels,
                    max_seconds_per_track,
                };
                // The old rings are freed here, off the audio thread.
                drop(retired);
            }
            CaptureReply::Rejected { track, reason } => {
                warn!("Capture engine rejected a command for track {}: {:?}", track + 1, reason)
            }
            CaptureReply::UndoFailed { track, reason } => {
                warn!("In-engine undo failed on track {}: {:?}", track + 1, reason)
            }
            other => debug!("Capture reply {:?}", other),
        }
    }

    fn on_started(&mut self, track: usize, at_frame: u64) {
        let Some(cycle) = self.cycles.get_mut(track).and_then(Option::as_mut) else {
            return;
        };
        if cycle.phase != CyclePhase::Armed {
            return;
        }
        cycle.phase = CyclePhase::Capturing;
        // The master loop begins where capture actually began.
        if matches!(cycle.kind, CycleKind::Record { target_frames: None }) {
            cycle.requested_start = at_frame;
        }
        if self.tracks[track].state == TrackState::Waiting {
            self.set_state(track, TrackState::Recording);
        }
    }

    fn on_stopped(&mut self, track: usize, at_frame: u64, total_frames: usize) {
        let Some(cycle) = self.cycles.get_mut(track).and_then(Option::as_mut) else {
            return;
        };
        if !cycle.is_running() {
            return;
        }
        cycle.phase = CyclePhase::Stopped;
        debug!(
            "Capture track {} stopped at frame {} with {} frames",
            track + 1,
            at_frame,
            total_frames
        );
    }

    fn request_pending_dumps(&mut self) {
        for track in 0..self.cycles.len() {
            if !matches!(&self.cycles[track], Some(c) if c.phase == CyclePhase::Stopped) {
                continue;
            }
            match self.engine.capture(CaptureCommand::Dump { track }) {
                Ok(()) => {
                    if let Some(cycle) = self.cycles[track].as_mut() {
                        cycle.phase = CyclePhase::Draining;
                    }
                }
                Err(e) => warn!("Could not request dump for track {}: {}", track + 1, e),
            }
        }
    }

    fn advance_prerecord(&mut self) {
        let now = self.clock.now_frames();
        for track in 0..self.tracks.len() {
            if self.tracks[track].state != TrackState::Prerecord {
                continue;
            }
            let boundary = match &self.cycles[track] {
                Some(CaptureCycle {
                    kind: CycleKind::Overdub { boundary, .. },
                    ..
                }) => *boundary,
                _ => continue,
            };
            if now >= boundary {
                self.set_state(track, TrackState::Overdub);
            }
        }
    }

    fn on_dump(&mut self, track: usize, data: Option<CaptureDump>) {
        let draining = matches!(
            self.cycles.get(track),
            Some(Some(c)) if c.phase == CyclePhase::Draining
        );
        if !draining {
            debug!("Ignoring stale dump for track {}", track + 1);
            return;
        }
        let Some(cycle) = self.cycles[track].take() else {
            return;
        };
        let CaptureCycle {
            kind,
            requested_start,
            requested_stop,
            ..
        } = cycle;

        let result = match kind {
            CycleKind::Record { target_frames } => {
                self.finish_recording(track, target_frames, requested_start, requested_stop, data)
            }
            CycleKind::Overdub {
                boundary,
                prerecord_frames,
            } => self.merge_capture(
                track,
                boundary,
                prerecord_frames,
                requested_start,
                requested_stop,
                data,
            ),
            CycleKind::Calibration { click } => {
                self.finish_calibration(track, &click, requested_start, requested_stop, data);
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("Track {}: {}", track + 1, e);
        }
    }

    // --- Recording ---

    /// The main control: record, close a recording, arm or finish an
    /// overdub, or resume, depending on where the track is.
    pub fn press(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        match self.tracks[track].state {
            TrackState::Ready => self.start_recording(track),
            TrackState::Recording => self.stop_recording(track),
            TrackState::Playing => self.arm_overdub(track),
            TrackState::Prerecord | TrackState::Overdub => self.finish_overdub(track),
            TrackState::Stopped => self.resume(track),
            state @ TrackState::Waiting => Err(LooperError::InvalidTransition {
                track,
                state,
                action: "press",
            }),
        }
    }

    /// The stop control: aborts a recording, stops playback, or resumes a
    /// stopped loop.
    pub fn press_stop(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        match self.tracks[track].state {
            TrackState::Recording | TrackState::Waiting => self.abort_recording(track),
            TrackState::Playing | TrackState::Prerecord | TrackState::Overdub => {
                self.stop_playback(track)
            }
            TrackState::Stopped => self.resume(track),
            TrackState::Ready => Ok(()),
        }
    }

    pub fn start_recording(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        if track != MASTER_TRACK && self.master.is_none() {
            return Err(LooperError::MasterNotSet(track));
        }
        self.ensure_state(track, &[TrackState::Ready], "record")?;
        self.ensure_idle(track)?;

        let now = self.clock.now_frames();
        let capacity = self.capture_capacity();
        match self.master {
            Some(master) if track != MASTER_TRACK => {
                let target = ((master.frames as f64 * self.tracks[track].divider).round()
                    as usize)
                    .max(1);
                if target + 2 * BLOCK_FRAMES > capacity {
                    return Err(LooperError::CaptureTooLong {
                        track,
                        requested: target,
                        capacity,
                    });
                }
                let boundary = master.phase().next_boundary(now);
                self.begin_cycle(
                    track,
                    CycleKind::Record {
                        target_frames: Some(target),
                    },
                    boundary,
                    boundary + target as u64,
                )?;
                info!(
                    "Track {} waiting for the master boundary at frame {} ({} frames)",
                    track + 1,
                    boundary,
                    target
                );
                self.set_state(track, TrackState::Waiting);
            }
            _ => {
                let ceiling = (transport::seconds_to_frames(
                    self.master_max_seconds.max(0.0) as f64,
                    self.sample_rate,
                ) as usize)
                    .min(self.loop_ceiling())
                    .max(1);
                self.begin_cycle(
                    track,
                    CycleKind::Record {
                        target_frames: None,
                    },
                    now,
                    now + ceiling as u64,
                )?;
                info!("Track {} recording the master loop", track + 1);
                self.set_state(track, TrackState::Recording);
            }
        }
        Ok(())
    }

    /// Closes a recording. The master loop ends here; a dependent stopped
    /// early keeps its target length and is padded with silence.
    pub fn stop_recording(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        self.ensure_state(track, &[TrackState::Recording], "stop recording")?;
        let now = self.clock.now_frames();
        let frame = match self.cycles[track].as_mut() {
            Some(cycle)
                if cycle.is_running() && matches!(cycle.kind, CycleKind::Record { .. }) =>
            {
                if matches!(cycle.kind, CycleKind::Record { target_frames: None }) {
                    cycle.requested_stop = now.max(cycle.requested_start);
                    cycle.requested_stop
                } else {
                    now
                }
            }
            _ => return Err(LooperError::CaptureBusy(track)),
        };
        self.engine
            .capture(CaptureCommand::StopAtFrame { track, frame })?;
        Ok(())
    }

    /// Discards a recording in progress and returns the track to `Ready`.
    pub fn abort_recording(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        self.ensure_state(
            track,
            &[TrackState::Recording, TrackState::Waiting],
            "abort",
        )?;
        self.cancel_cycle(track)?;
        info!("Track {} recording aborted", track + 1);
        self.reset_track(track);
        Ok(())
    }

    fn finish_recording(
        &mut self,
        track: usize,
        target_frames: Option<usize>,
        start: u64,
        stop: u64,
        data: Option<CaptureDump>,
    ) -> Result<(), LooperError> {
        let length = target_frames.unwrap_or_else(|| stop.saturating_sub(start) as usize);
        let dump = match data {
            Some(dump) if length > 0 => dump,
            _ => {
                warn!("Track {} captured nothing; back to ready", track + 1);
                self.events.push(SessionEvent::CaptureEmpty { track });
                self.reset_track(track);
                return Ok(());
            }
        };
        let mut buffer = trim_capture(&dump, start, length, track);

        if target_frames.is_some() {
            return self.install_loop(track, buffer, start);
        }

        let bpm = transport::bpm_for_loop(buffer.duration());
        if self.bpm_rounding && bpm > 0 {
            let snapped = transport::bar_frames(bpm, self.sample_rate);
            if snapped > self.loop_ceiling() {
                warn!(
                    "Not snapping master loop to {} frames; the capture buffer only fits {}",
                    snapped,
                    self.loop_ceiling()
                );
            } else if snapped > 0 && snapped != buffer.frames() {
                info!(
                    "Snapping master loop from {} to {} frames ({} BPM)",
                    buffer.frames(),
                    snapped,
                    bpm
                );
                buffer = LoopBuffer::from_window(&buffer.channels, 0, snapped, self.sample_rate);
            }
        }
        let tempo = MasterTempo {
            anchor: start + buffer.frames() as u64,
            frames: buffer.frames(),
            duration: buffer.duration(),
            bpm,
        };
        info!(
            "Master loop set: {:.3} s, {} BPM",
            tempo.duration, tempo.bpm
        );
        self.master = Some(tempo);
        self.events.push(SessionEvent::MasterSet(tempo));
        self.sync_delays();
        self.install_loop(track, buffer, tempo.anchor)
    }

    fn install_loop(
        &mut self,
        track: usize,
        buffer: LoopBuffer,
        anchor: u64,
    ) -> Result<(), LooperError> {
        let frames = buffer.frames();
        let buffer = Arc::new(buffer);
        {
            let t = &mut self.tracks[track];
            t.loop_buffer = Some(buffer.clone());
            t.loop_anchor = anchor;
            t.overdub_history.clear();
        }
        self.engine.send(AudioCommand::StartLoop {
            track,
            buffer,
            anchor_frame: anchor,
        })?;
        self.events.push(SessionEvent::LoopInstalled { track, frames });
        self.set_state(track, TrackState::Playing);
        Ok(())
    }

    // --- Overdub ---

    /// Schedules one loop cycle of capture starting a pre-roll ahead of the
    /// track's next boundary.
    pub fn arm_overdub(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        self.ensure_state(track, &[TrackState::Playing], "overdub")?;
        self.ensure_idle(track)?;

        let t = &self.tracks[track];
        let loop_frames = t.loop_frames();
        if loop_frames == 0 {
            return Err(LooperError::InvalidTransition {
                track,
                state: t.state,
                action: "overdub",
            });
        }
        let capacity = self.capture_capacity();
        if loop_frames + 2 * BLOCK_FRAMES > capacity {
            return Err(LooperError::CaptureTooLong {
                track,
                requested: loop_frames,
                capacity,
            });
        }

        let bpm = self.master.map_or(0, |m| m.bpm);
        let prerecord_ms = t
            .prerecord_ms
            .unwrap_or_else(|| transport::default_prerecord_ms(bpm));
        let pre = (transport::ms_to_samples(prerecord_ms, self.sample_rate).max(0) as u64)
            .min(loop_frames as u64 / 2);
        let now = self.clock.now_frames();
        let boundary = FramePhase::new(t.loop_anchor, loop_frames as u64).next_boundary(now);
        let start = boundary.saturating_sub(pre).max(now);
        let prerecord_frames = (boundary - start) as usize;

        self.begin_cycle(
            track,
            CycleKind::Overdub {
                boundary,
                prerecord_frames,
            },
            start,
            start + loop_frames as u64,
        )?;
        info!(
            "Track {} overdub armed for frame {} with {} frames of pre-roll",
            track + 1,
            boundary,
            prerecord_frames
        );
        self.set_state(track, TrackState::Prerecord);
        Ok(())
    }

    /// Ends an overdub early; whatever was captured so far is merged.
    pub fn finish_overdub(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        self.ensure_state(
            track,
            &[TrackState::Prerecord, TrackState::Overdub],
            "finish overdub",
        )?;
        let now = self.clock.now_frames();
        let frame = match self.cycles[track].as_mut() {
            Some(cycle)
                if cycle.is_running() && matches!(cycle.kind, CycleKind::Overdub { .. }) =>
            {
                cycle.requested_stop = now.clamp(cycle.requested_start, cycle.requested_stop);
                cycle.requested_stop
            }
            _ => return Err(LooperError::CaptureBusy(track)),
        };
        self.engine
            .capture(CaptureCommand::StopAtFrame { track, frame })?;
        Ok(())
    }

    fn merge_capture(
        &mut self,
        track: usize,
        boundary: u64,
        prerecord_frames: usize,
        start: u64,
        stop: u64,
        data: Option<CaptureDump>,
    ) -> Result<(), LooperError> {
        let length = stop.saturating_sub(start) as usize;
        let Some(loop_buffer) = self.tracks[track].loop_buffer.clone() else {
            debug!("Track {} was cleared before its overdub landed", track + 1);
            return Ok(());
        };
        let dump = match data {
            Some(dump) if length > 0 => dump,
            _ => {
                warn!("Track {} overdub captured nothing", track + 1);
                self.end_overdub_state(track);
                return Ok(());
            }
        };
        let segment = trim_capture(&dump, start, length, track).channels;

        let t = &self.tracks[track];
        let placement = if self.tail_aligned_overdubs {
            warn!("Track {}: placing overdub by tail alignment", track + 1);
            Placement::TailAligned
        } else {
            Placement::Phase {
                overdub_start: self.clock.frames_to_seconds(boundary),
                phase_start: self.clock.frames_to_seconds(t.loop_anchor),
                phase_duration: loop_buffer.duration(),
            }
        };
        let nudge = transport::ms_to_samples(t.nudge_ms, self.sample_rate);
        let start_sample = merge::start_sample(
            placement,
            length,
            loop_buffer.frames(),
            self.sample_rate,
            nudge,
            prerecord_frames as i64,
        );
        let gain = t.overdub_gain;
        let merged = merge::merge_overdub(&loop_buffer, &segment, start_sample, gain);

        let history = &mut self.tracks[track].overdub_history;
        history.push(OverdubLayer {
            segment,
            start_sample,
            gain,
        });
        if history.len() > MAX_UNDO_LAYERS {
            history.remove(0);
        }
        self.swap_buffer(track, merged)?;
        debug!(
            "Track {} overdub merged at sample {} (nudge {}, pre-roll {})",
            track + 1,
            start_sample,
            nudge,
            prerecord_frames
        );
        self.events
            .push(SessionEvent::OverdubMerged { track, start_sample });
        self.end_overdub_state(track);
        Ok(())
    }

    fn end_overdub_state(&mut self, track: usize) {
        if matches!(
            self.tracks[track].state,
            TrackState::Prerecord | TrackState::Overdub
        ) {
            self.set_state(track, TrackState::Playing);
        }
    }

    /// Removes the most recent overdub layer.
    pub fn undo(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        self.ensure_state(track, &[TrackState::Playing, TrackState::Stopped], "undo")?;
        if matches!(&self.cycles[track], Some(c) if !c.is_calibration()) {
            return Err(LooperError::CaptureBusy(track));
        }
        let Some(buffer) = self.tracks[track].loop_buffer.clone() else {
            return Err(LooperError::NothingToUndo(track));
        };
        let Some(layer) = self.tracks[track].overdub_history.pop() else {
            return Err(LooperError::NothingToUndo(track));
        };
        let restored = merge::undo_overdub(&buffer, &layer);
        self.swap_buffer(track, restored)?;
        info!("Track {} overdub undone", track + 1);
        self.events.push(SessionEvent::OverdubUndone { track });
        Ok(())
    }

    /// Replaces the loop content in place. Playback keeps its phase.
    fn swap_buffer(&mut self, track: usize, buffer: LoopBuffer) -> Result<(), LooperError> {
        let buffer = Arc::new(buffer);
        let t = &mut self.tracks[track];
        t.loop_buffer = Some(buffer.clone());
        if matches!(
            t.state,
            TrackState::Playing | TrackState::Prerecord | TrackState::Overdub
        ) {
            let anchor_frame = t.loop_anchor;
            self.engine.send(AudioCommand::StartLoop {
                track,
                buffer,
                anchor_frame,
            })?;
        }
        Ok(())
    }

    // --- Playback ---

    /// Stops a loop; an overdub in flight is cancelled.
    pub fn stop_playback(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        self.ensure_state(
            track,
            &[TrackState::Playing, TrackState::Prerecord, TrackState::Overdub],
            "stop",
        )?;
        self.cancel_cycle(track)?;
        self.engine.send(AudioCommand::StopLoop(track))?;
        self.set_state(track, TrackState::Stopped);
        Ok(())
    }

    /// Restarts a stopped loop. The master restarts from phase zero now and
    /// drags playing dependents along; a dependent rejoins the master phase.
    pub fn resume(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        self.ensure_state(track, &[TrackState::Stopped], "resume")?;
        let Some(buffer) = self.tracks[track].loop_buffer.clone() else {
            return Err(LooperError::InvalidTransition {
                track,
                state: TrackState::Stopped,
                action: "resume",
            });
        };
        let now = self.clock.now_frames();

        if track == MASTER_TRACK {
            if let Some(master) = self.master.as_mut() {
                master.anchor = now;
            }
            self.start_player(track, buffer, now)?;
            for dep in (0..self.tracks.len()).filter(|i| *i != MASTER_TRACK) {
                if self.tracks[dep].state != TrackState::Playing {
                    continue;
                }
                if let Some(dep_buffer) = self.tracks[dep].loop_buffer.clone() {
                    self.start_player(dep, dep_buffer, now)?;
                }
            }
        } else {
            let anchor = self.master.map_or(now, |m| m.anchor);
            self.start_player(track, buffer, anchor)?;
        }
        self.set_state(track, TrackState::Playing);
        Ok(())
    }

    fn start_player(
        &mut self,
        track: usize,
        buffer: Arc<LoopBuffer>,
        anchor: u64,
    ) -> Result<(), LooperError> {
        self.tracks[track].loop_anchor = anchor;
        self.engine.send(AudioCommand::StartLoop {
            track,
            buffer,
            anchor_frame: anchor,
        })
    }

    /// Drops a track's audio. Clearing the master also clears every
    /// dependent and disables them until a new master is recorded.
    pub fn clear(&mut self, track: usize) -> Result<(), LooperError> {
        self.check_track(track)?;
        self.clear_one(track)?;
        if track == MASTER_TRACK {
            if self.master.take().is_some() {
                info!("Master loop cleared; dependent tracks disabled");
                self.events.push(SessionEvent::MasterCleared);
                self.sync_delays();
            }
            for dep in (0..self.tracks.len()).filter(|i| *i != MASTER_TRACK) {
                self.clear_one(dep)?;
            }
        }
        Ok(())
    }

    fn clear_one(&mut self, track: usize) -> Result<(), LooperError> {
        self.cancel_cycle(track)?;
        self.engine.send(AudioCommand::StopLoop(track))?;
        self.reset_track(track);
        Ok(())
    }

    // --- Track parameters ---

    pub fn set_divider(&mut self, track: usize, divider: f64) -> Result<(), LooperError> {
        self.check_track(track)?;
        if track == MASTER_TRACK {
            return if divider == 1.0 {
                Ok(())
            } else {
                Err(LooperError::MasterDivider)
            };
        }
        if !divider.is_finite() || divider <= 0.0 {
            return Err(LooperError::InvalidDivider(divider));
        }
        self.tracks[track].divider = divider;
        info!("Track {} divider set to {}", track + 1, divider);
        Ok(())
    }

    /// Sets the placement nudge of every track.
    pub fn set_nudge_ms(&mut self, nudge_ms: f32) {
        let nudge_ms = nudge_ms.clamp(-latency::MAX_NUDGE_MS, latency::MAX_NUDGE_MS);
        for track in self.tracks.iter_mut() {
            track.nudge_ms = nudge_ms;
        }
        info!("Nudge set to {} ms", nudge_ms);
    }

    pub fn set_prerecord_ms(
        &mut self,
        track: usize,
        prerecord_ms: Option<f32>,
    ) -> Result<(), LooperError> {
        self.check_track(track)?;
        self.tracks[track].prerecord_ms = prerecord_ms.map(|ms| ms.max(0.0));
        Ok(())
    }

    pub fn set_overdub_gain(&mut self, track: usize, gain: f32) -> Result<(), LooperError> {
        self.check_track(track)?;
        self.tracks[track].overdub_gain = gain.max(0.0);
        Ok(())
    }

    pub fn set_volume(&mut self, track: usize, volume: f32) -> Result<(), LooperError> {
        self.check_track(track)?;
        let volume = volume.clamp(0.0, 2.0);
        self.tracks[track].volume = volume;
        self.engine
            .send(AudioCommand::SetTrackVolume { track, volume })
    }

    pub fn toggle_mute(&mut self, track: usize) -> Result<bool, LooperError> {
        self.check_track(track)?;
        self.engine.send(AudioCommand::ToggleTrackMute(track))?;
        let t = &mut self.tracks[track];
        t.is_muted = !t.is_muted;
        Ok(t.is_muted)
    }

    pub fn toggle_solo(&mut self, track: usize) -> Result<bool, LooperError> {
        self.check_track(track)?;
        self.engine.send(AudioCommand::ToggleTrackSolo(track))?;
        let t = &mut self.tracks[track];
        t.is_soloed = !t.is_soloed;
        Ok(t.is_soloed)
    }

    pub fn set_input_monitoring(&mut self, on: bool) -> Result<(), LooperError> {
        self.engine.send(AudioCommand::SetInputMonitoring(on))?;
        self.monitoring = on;
        Ok(())
    }

    pub fn set_monitor_gain(&mut self, gain: f32) -> Result<(), LooperError> {
        self.engine.send(AudioCommand::SetMonitorGain(gain))
    }

    /// Swaps in freshly sized capture rings. Only allowed while every
    /// capture track is idle.
    pub fn configure_capture(&mut self, mut config: CaptureConfig) -> Result<(), LooperError> {
        let seconds = config.max_seconds_per_track;
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(LooperError::InvalidCaptureLength(seconds));
        }
        if let Some(track) = self.cycles.iter().position(Option::is_some) {
            return Err(LooperError::CaptureBusy(track));
        }
        if seconds > MAX_SECONDS_PER_TRACK {
            warn!(
                "Capture length {} s exceeds the {} s ceiling; clamping",
                seconds, MAX_SECONDS_PER_TRACK
            );
            config.max_seconds_per_track = MAX_SECONDS_PER_TRACK;
        }
        config.num_tracks = NUM_TRACKS;
        self.engine
            .capture(CaptureCommand::configure(config, self.sample_rate))
    }

    // --- Effects ---

    pub fn fx_chain(&self, point: InsertionPoint) -> Result<&EffectChain, LooperError> {
        match point {
            InsertionPoint::Track(i) => self
                .tracks
                .get(i)
                .map(|t| &t.fx_chain)
                .ok_or(LooperError::UnknownTrack(i)),
            InsertionPoint::Input => Ok(&self.input_chain),
        }
    }

    fn fx_chain_mut(&mut self, point: InsertionPoint) -> Result<&mut EffectChain, LooperError> {
        match point {
            InsertionPoint::Track(i) => self
                .tracks
                .get_mut(i)
                .map(|t| &mut t.fx_chain)
                .ok_or(LooperError::UnknownTrack(i)),
            InsertionPoint::Input => Ok(&mut self.input_chain),
        }
    }

    /// Rebuilds the rack for `point` and hands it to the audio thread.
    fn reload_fx(&mut self, point: InsertionPoint) -> Result<(), LooperError> {
        let rack = self.fx_chain(point)?.build(self.sample_rate as f32);
        self.engine
            .send(AudioCommand::LoadFxRack(point, Box::new(rack)))?;
        debug!("{} chain: {}", point, self.fx_chain(point)?.summary());
        Ok(())
    }

    pub fn add_effect(&mut self, point: InsertionPoint, kind: EffectKind) -> Result<u32, LooperError> {
        let id = self.fx_chain_mut(point)?.add(kind);
        self.reload_fx(point)?;
        if kind == EffectKind::Delay {
            self.sync_delays();
        }
        Ok(id)
    }

    pub fn remove_effect(&mut self, point: InsertionPoint, id: u32) -> Result<(), LooperError> {
        self.fx_chain_mut(point)?.remove(id)?;
        self.reload_fx(point)
    }

    pub fn move_effect_up(&mut self, point: InsertionPoint, id: u32) -> Result<(), LooperError> {
        self.fx_chain_mut(point)?.move_up(id)?;
        self.reload_fx(point)
    }

    pub fn move_effect_down(&mut self, point: InsertionPoint, id: u32) -> Result<(), LooperError> {
        self.fx_chain_mut(point)?.move_down(id)?;
        self.reload_fx(point)
    }

    pub fn toggle_effect_bypass(
        &mut self,
        point: InsertionPoint,
        id: u32,
    ) -> Result<bool, LooperError> {
        let bypassed = self.fx_chain_mut(point)?.toggle_bypass(id)?;
        self.reload_fx(point)?;
        Ok(bypassed)
    }

    /// Live parameter change; the running rack reads it without a rebuild.
    pub fn set_effect_param(
        &self,
        point: InsertionPoint,
        id: u32,
        name: &str,
        value: f32,
    ) -> Result<(), LooperError> {
        self.fx_chain(point)?.set_param(id, name, value)?;
        if name == "beats" {
            self.sync_delays();
        }
        Ok(())
    }

    /// Re-times every tempo-synced delay to the master tempo, or to
    /// `DEFAULT_BPM` while no master is set.
    fn sync_delays(&self) {
        let bpm = self.master.map_or(transport::DEFAULT_BPM, |m| m.bpm);
        std::iter::once(&self.input_chain)
            .chain(self.tracks.iter().map(|t| &t.fx_chain))
            .for_each(|chain| chain.sync_to_tempo(bpm));
    }

    // --- Latency calibration ---

    /// Plays a click shortly in the future and captures the input window
    /// around it on an idle capture track. The outcome arrives as a
    /// `Calibrated` or `CalibrationFailed` event.
    pub fn begin_calibration(&mut self) -> Result<(), LooperError> {
        if self.calibration_track.is_some() {
            return Err(CalibrationError::AlreadyRunning.into());
        }
        let idle = |i: &usize| self.cycles[*i].is_none();
        let slot = (0..self.tracks.len())
            .rev()
            .find(|i| idle(i) && self.tracks[*i].state == TrackState::Ready)
            .or_else(|| (0..self.tracks.len()).rev().find(|i| idle(i)))
            .ok_or(CalibrationError::NoIdleTrack)?;

        let click = Arc::new(latency::make_click(self.sample_rate, latency::CLICK_MS));
        let play_at = self.clock.now_frames()
            + transport::seconds_to_frames(latency::CLICK_LEAD_SECONDS, self.sample_rate);
        let window = transport::seconds_to_frames(latency::RECORD_SECONDS, self.sample_rate);
        self.begin_cycle(
            slot,
            CycleKind::Calibration {
                click: click.clone(),
            },
            play_at,
            play_at + window,
        )?;
        self.engine.send(AudioCommand::PlayOneShot {
            buffer: click,
            at_frame: play_at,
        })?;
        self.calibration_track = Some(slot);
        info!("Calibrating latency on capture track {}", slot + 1);
        Ok(())
    }

    pub fn cancel_calibration(&mut self) -> Result<(), LooperError> {
        let Some(slot) = self.calibration_track.take() else {
            return Ok(());
        };
        if let Some(cycle) = self.cycles[slot].as_mut() {
            if cycle.phase != CyclePhase::Cancelling {
                self.engine.capture(CaptureCommand::Clear { track: slot })?;
                cycle.phase = CyclePhase::Cancelling;
            }
        }
        self.events
            .push(SessionEvent::CalibrationFailed(CalibrationError::Cancelled));
        Ok(())
    }

    fn finish_calibration(
        &mut self,
        track: usize,
        click: &[f32],
        start: u64,
        stop: u64,
        data: Option<CaptureDump>,
    ) {
        self.calibration_track = None;
        let outcome = match data {
            None => Err(CalibrationError::EmptyCapture),
            Some(dump) => {
                let length = stop.saturating_sub(start) as usize;
                let window = trim_capture(&dump, start, length, track);
                let captured = window.channels.first().map(Vec::as_slice).unwrap_or(&[]);
                let max_search = latency::MAX_SEARCH_SECONDS.min(latency::RECORD_SECONDS);
                self.latency
                    .analyze(click, captured, self.sample_rate, max_search)
            }
        };
        match outcome {
            Ok(measurement) => {
                let nudge = latency::nudge_for_latency(measurement.median_latency_ms);
                for t in self.tracks.iter_mut() {
                    t.nudge_ms = nudge;
                }
                info!(
                    "Latency {:.1} ms (median {:.1} ms, correlation {:.2}); nudge set to {} ms",
                    measurement.latency_ms,
                    measurement.median_latency_ms,
                    measurement.correlation,
                    nudge
                );
                self.last_measurement = Some(measurement.clone());
                self.events.push(SessionEvent::Calibrated(measurement));
            }
            Err(e) => {
                warn!("Latency calibration failed: {}", e);
                self.events.push(SessionEvent::CalibrationFailed(e));
            }
        }
    }

    // --- Helpers ---

    fn check_track(&self, track: usize) -> Result<(), LooperError> {
        if track < self.tracks.len() {
            Ok(())
        } else {
            Err(LooperError::UnknownTrack(track))
        }
    }

    fn ensure_state(
        &self,
        track: usize,
        allowed: &[TrackState],
        action: &'static str,
    ) -> Result<(), LooperError> {
        let state = self.tracks[track].state;
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(LooperError::InvalidTransition {
                track,
                state,
                action,
            })
        }
    }

    fn ensure_idle(&self, track: usize) -> Result<(), LooperError> {
        match self.cycles[track] {
            Some(_) => Err(LooperError::CaptureBusy(track)),
            None => Ok(()),
        }
    }

    fn capture_capacity(&self) -> usize {
        self.capture_config.capacity_frames(self.sample_rate)
    }

    /// Longest loop a capture cycle can fill, keeping two blocks of slack
    /// for block-granular start and stop.
    fn loop_ceiling(&self) -> usize {
        self.capture_capacity().saturating_sub(2 * BLOCK_FRAMES)
    }

    fn begin_cycle(
        &mut self,
        track: usize,
        kind: CycleKind,
        start: u64,
        stop: u64,
    ) -> Result<(), LooperError> {
        self.engine.capture(CaptureCommand::Reset { track })?;
        self.engine
            .capture(CaptureCommand::ArmAtFrame { track, frame: start })?;
        self.engine
            .capture(CaptureCommand::StopAtFrame { track, frame: stop })?;
        self.cycles[track] = Some(CaptureCycle {
            kind,
            requested_start: start,
            requested_stop: stop,
            phase: CyclePhase::Armed,
        });
        Ok(())
    }

    /// Asks the engine to drop the track's capture. The slot stays busy until
    /// `cleared` comes back. Calibration cycles are left alone.
    fn cancel_cycle(&mut self, track: usize) -> Result<(), LooperError> {
        if let Some(cycle) = self.cycles[track].as_mut() {
            if !cycle.is_calibration() && cycle.phase != CyclePhase::Cancelling {
                self.engine.capture(CaptureCommand::Clear { track })?;
                cycle.phase = CyclePhase::Cancelling;
            }
        }
        Ok(())
    }

    fn set_state(&mut self, track: usize, state: TrackState) {
        if self.tracks[track].state != state {
            debug!("Track {} is {}", track + 1, state.label());
            self.tracks[track].set_state(state);
            self.events.push(SessionEvent::StateChanged { track, state });
        }
    }

    fn reset_track(&mut self, track: usize) {
        let was = self.tracks[track].state;
        self.tracks[track].clear();
        if was != TrackState::Ready {
            self.events.push(SessionEvent::StateChanged {
                track,
                state: TrackState::Ready,
            });
        }
    }
}

/// Cuts the requested window out of a dump using its first block frame.
fn trim_capture(dump: &CaptureDump, start: u64, length: usize, track: usize) -> LoopBuffer {
    let offset = start as i64 - dump.first_block_frame as i64;
    if offset < 0 {
        warn!(
            "Track {} capture began {} frames late; padding with silence",
            track + 1,
            -offset
        );
    } else if offset as usize + length > dump.frames {
        debug!(
            "Track {} capture is {} frames short; padding with silence",
            track + 1,
            offset as usize + length - dump.frames
        );
    }
    LoopBuffer::from_window(&dump.channels, offset, length, dump.sample_rate)
}
