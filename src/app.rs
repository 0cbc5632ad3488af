// src/app.rs

use crate::audio_device;
use crate::audio_engine::AudioEngine;
use crate::audio_io;
use crate::channel::{engine_channel, COMMAND_QUEUE_CAPACITY};
use crate::error::{CalibrationError, LooperError};
use crate::latency::LatencyMeasurement;
use crate::looper::MASTER_TRACK;
use crate::session::{Session, SessionEvent};
use crate::settings::{self, AppSettings};
use anyhow::Result;
use cpal::traits::DeviceTrait;
use cpal::Stream;
use log::{error, info, warn};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Owns the audio streams and the session running on top of them.
pub struct LooperApp {
    pub settings: AppSettings,
    session: Option<Session>,
    _input_stream: Option<Stream>,
    _output_stream: Option<Stream>,
    pub xrun_count: Arc<AtomicUsize>,
    reported_xruns: usize,
    pub input_latency_compensation_ms: Arc<AtomicU32>,
    pub active_sample_rate: u32,
    pub active_buffer_size: u32,
    pub active_input_device_name: Option<String>,
    pub active_output_device_name: Option<String>,
    pending_events: Vec<SessionEvent>,
}

impl LooperApp {
    pub fn new(settings: AppSettings) -> Self {
        let input_latency_compensation_ms = Arc::new(AtomicU32::new(
            (settings.input_latency_compensation_ms * 100.0).round() as u32,
        ));
        Self {
            settings,
            session: None,
            _input_stream: None,
            _output_stream: None,
            xrun_count: Arc::new(AtomicUsize::new(0)),
            reported_xruns: 0,
            input_latency_compensation_ms,
            active_sample_rate: 0,
            active_buffer_size: 0,
            active_input_device_name: None,
            active_output_device_name: None,
            pending_events: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Result<&Session, LooperError> {
        self.session.as_ref().ok_or(LooperError::AudioNotRunning)
    }

    pub fn session_mut(&mut self) -> Result<&mut Session, LooperError> {
        self.session.as_mut().ok_or(LooperError::AudioNotRunning)
    }

    pub fn stop_audio(&mut self) {
        self._input_stream.take();
        self._output_stream.take();
        if self.session.take().is_some() {
            info!("Audio engine stopped.");
        }
    }

    /// Opens the configured devices, builds a fresh engine and session and
    /// starts both streams. Nothing is kept unless every step succeeds.
    pub fn start_audio(&mut self) -> Result<()> {
        let host_id = audio_device::resolve_host_id(self.settings.host_name.as_deref());
        let setup = audio_io::open_devices(
            host_id,
            self.settings.input_device.as_ref(),
            self.settings.output_device.as_ref(),
            self.settings.sample_rate,
            self.settings.buffer_size,
        )?;
        let sample_rate = setup.sample_rate();
        let input_channels = setup.input_channels();

        let (handle, endpoint) = engine_channel(COMMAND_QUEUE_CAPACITY);
        let audio_rb = HeapRb::<f32>::new(sample_rate as usize * input_channels * 4);
        let (audio_producer, audio_consumer) = audio_rb.split();

        let engine = AudioEngine::new(
            endpoint,
            audio_consumer,
            input_channels,
            sample_rate,
            self.settings.capture_config(),
            self.input_latency_compensation_ms.clone(),
        );
        let session = Session::new(
            handle,
            engine.clock(),
            engine.track_states(),
            &self.settings,
        )?;

        let (input_stream, output_stream) = audio_io::init_and_run_streams(
            &setup,
            audio_producer,
            engine,
            self.xrun_count.clone(),
        )?;

        self._input_stream = Some(input_stream);
        self._output_stream = Some(output_stream);
        self.session = Some(session);
        self.active_sample_rate = sample_rate;
        self.active_buffer_size = setup.buffer_size();
        self.active_input_device_name = setup.input_device.name().ok();
        self.active_output_device_name = setup.output_device.name().ok();
        Ok(())
    }

    /// Restarts audio with changed device settings, reverting to the previous
    /// ones if the new configuration fails to start.
    pub fn apply_audio_settings(&mut self, update: impl FnOnce(&mut AppSettings)) -> Result<()> {
        let old_settings = self.settings.clone();
        update(&mut self.settings);
        self.stop_audio();

        match self.start_audio() {
            Ok(()) => {
                info!("Audio settings applied successfully.");
                self.save_settings();
                Ok(())
            }
            Err(e) => {
                warn!("Failed to apply settings: {}; reverting", e);
                self.settings = old_settings;
                if let Err(revert_err) = self.start_audio() {
                    error!(
                        "Could not restore previous settings: {}. Audio engine is stopped.",
                        revert_err
                    );
                }
                Err(e)
            }
        }
    }

    pub fn set_input_latency_compensation_ms(&self, ms: f32) {
        self.input_latency_compensation_ms
            .store((ms.max(0.0) * 100.0).round() as u32, Ordering::Relaxed);
    }

    /// Collects session events and reports stream errors since the last call.
    pub fn poll(&mut self) -> Vec<SessionEvent> {
        let xruns = self.xrun_count.load(Ordering::Relaxed);
        if xruns > self.reported_xruns {
            warn!("{} audio stream errors or overruns", xruns - self.reported_xruns);
            self.reported_xruns = xruns;
        }
        let mut events = std::mem::take(&mut self.pending_events);
        if let Some(session) = self.session.as_mut() {
            events.extend(session.poll());
        }
        events
    }

    /// Runs one calibration to completion. Other events seen while waiting
    /// are handed out by the next `poll`.
    pub fn measure_latency(&mut self, timeout: Duration) -> Result<LatencyMeasurement, LooperError> {
        let session = self.session.as_mut().ok_or(LooperError::AudioNotRunning)?;
        let pending = &mut self.pending_events;
        session.begin_calibration()?;
        let deadline = Instant::now() + timeout;
        loop {
            for event in session.poll() {
                match event {
                    SessionEvent::Calibrated(measurement) => return Ok(measurement),
                    SessionEvent::CalibrationFailed(e) => return Err(e.into()),
                    other => pending.push(other),
                }
            }
            if Instant::now() >= deadline {
                session.cancel_calibration()?;
                // The cancel is answered here, not by the next poll.
                pending.extend(without_cancel_ack(session.poll()));
                return Err(CalibrationError::Cancelled.into());
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Folds live session values back into the settings and writes them.
    pub fn save_settings(&mut self) {
        if let Some(session) = &self.session {
            let tracks = session.tracks();
            self.settings.manual_nudge_ms = tracks[MASTER_TRACK].nudge_ms;
            for (slot, track) in self
                .settings
                .dividers
                .iter_mut()
                .zip(tracks.iter().filter(|t| !t.is_master()))
            {
                *slot = track.divider;
            }
        }
        self.settings.input_latency_compensation_ms =
            self.input_latency_compensation_ms.load(Ordering::Relaxed) as f32 / 100.0;
        settings::save_settings(&self.settings);
    }
}

fn without_cancel_ack(events: Vec<SessionEvent>) -> impl Iterator<Item = SessionEvent> {
    events.into_iter().filter(|event| {
        !matches!(
            event,
            SessionEvent::CalibrationFailed(CalibrationError::Cancelled)
        )
    })
}

impl Drop for LooperApp {
    fn drop(&mut self) {
        self.stop_audio();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_requires_running_audio() {
        let mut app = LooperApp::new(AppSettings::default());
        assert!(!app.is_running());
        assert!(matches!(app.session(), Err(LooperError::AudioNotRunning)));
        assert!(matches!(
            app.measure_latency(Duration::from_millis(1)),
            Err(LooperError::AudioNotRunning)
        ));
        assert!(app.poll().is_empty());
    }

    #[test]
    fn test_timeout_keeps_events_other_than_the_cancel() {
        let events = vec![
            SessionEvent::StateChanged {
                track: 2,
                state: crate::looper::TrackState::Playing,
            },
            SessionEvent::CalibrationFailed(CalibrationError::Cancelled),
            SessionEvent::OverdubMerged {
                track: 2,
                start_sample: 0,
            },
            SessionEvent::CalibrationFailed(CalibrationError::EmptyCapture),
        ];
        let kept: Vec<SessionEvent> = without_cancel_ack(events).collect();
        assert_eq!(kept.len(), 3);
        assert!(matches!(kept[0], SessionEvent::StateChanged { track: 2, .. }));
        assert!(matches!(kept[1], SessionEvent::OverdubMerged { track: 2, .. }));
        assert!(matches!(
            kept[2],
            SessionEvent::CalibrationFailed(CalibrationError::EmptyCapture)
        ));
    }

    #[test]
    fn test_latency_compensation_is_stored_in_hundredths() {
        let app = LooperApp::new(AppSettings::default());
        assert_eq!(app.input_latency_compensation_ms.load(Ordering::Relaxed), 500);
        app.set_input_latency_compensation_ms(12.34);
        assert_eq!(app.input_latency_compensation_ms.load(Ordering::Relaxed), 1_234);
    }
}
