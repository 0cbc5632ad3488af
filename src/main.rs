// src/main.rs

mod app;
mod audio_device;
mod audio_engine;
mod audio_io;
mod channel;
mod cli;
mod error;
mod fx;
mod fx_components;
mod latency;
mod looper;
mod merge;
mod mixer;
mod session;
mod settings;
mod transport;

use crate::app::LooperApp;
use crate::cli::{AudioAction, Command, FxAction};
use crate::error::LooperError;
use crate::session::{Session, SessionEvent};
use log::{error, info, warn};
use std::io::BufRead;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut app = LooperApp::new(settings::load_settings());
    app.start_audio()?;
    info!(
        "Looper running at {} Hz ({} frames per buffer). Type 'help' for commands.",
        app.active_sample_rate, app.active_buffer_size
    );

    let (line_sender, line_receiver) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line_sender.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        match line_receiver.recv_timeout(POLL_INTERVAL) {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => match cli::parse_command(&line) {
                Ok(Command::Quit) => break,
                Ok(command) => {
                    if let Err(e) = run_command(&mut app, command) {
                        warn!("{}", e);
                    }
                }
                Err(e) => warn!("{}", e),
            },
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            // stdin closed
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        for event in app.poll() {
            log_event(&event);
        }
    }

    app.save_settings();
    app.stop_audio();
    Ok(())
}

fn run_command(app: &mut LooperApp, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Press(track) => app.session_mut()?.press(track)?,
        Command::Stop(track) => app.session_mut()?.press_stop(track)?,
        Command::Resume(track) => app.session_mut()?.resume(track)?,
        Command::Clear(track) => app.session_mut()?.clear(track)?,
        Command::Undo(track) => app.session_mut()?.undo(track)?,
        Command::Divider(track, divider) => app.session_mut()?.set_divider(track, divider)?,
        Command::Volume(track, volume) => app.session_mut()?.set_volume(track, volume)?,
        Command::Prerecord(track, ms) => app.session_mut()?.set_prerecord_ms(track, ms)?,
        Command::OverdubGain(track, gain) => app.session_mut()?.set_overdub_gain(track, gain)?,
        Command::Mute(track) => {
            let muted = app.session_mut()?.toggle_mute(track)?;
            info!("Track {} {}", track + 1, if muted { "muted" } else { "unmuted" });
        }
        Command::Solo(track) => {
            let soloed = app.session_mut()?.toggle_solo(track)?;
            info!("Track {} solo {}", track + 1, if soloed { "on" } else { "off" });
        }
        Command::Fx(point, action) => {
            let session = app.session_mut()?;
            match action {
                FxAction::Add(kind) => {
                    let id = session.add_effect(point, kind)?;
                    info!("{}: added {} #{}", point, kind.label(), id);
                }
                FxAction::Remove(id) => session.remove_effect(point, id)?,
                FxAction::Up(id) => session.move_effect_up(point, id)?,
                FxAction::Down(id) => session.move_effect_down(point, id)?,
                FxAction::Bypass(id) => {
                    let bypassed = session.toggle_effect_bypass(point, id)?;
                    info!("{}: #{} {}", point, id, if bypassed { "bypassed" } else { "active" });
                }
                FxAction::Set { id, param, value } => {
                    session.set_effect_param(point, id, &param, value)?
                }
                FxAction::List => {}
            }
            println!("{}: {}", point, session.fx_chain(point)?.summary());
        }
        Command::Monitor(on) => {
            let session = app.session_mut()?;
            let on = on.unwrap_or(!session.is_monitoring());
            session.set_input_monitoring(on)?;
            info!("Input monitoring {}", if on { "on" } else { "off" });
        }
        Command::MonitorGain(gain) => {
            app.session_mut()?.set_monitor_gain(gain)?;
            app.settings.monitor_gain = gain;
        }
        Command::Capture { channels, seconds } => {
            let mut settings = app.settings.clone();
            settings.capture_channels = channels;
            settings.max_seconds_per_track = seconds;
            app.session_mut()?.configure_capture(settings.capture_config())?;
            app.settings = settings;
            info!("Capture rings resized to {} channel(s), {} s", channels, seconds);
        }
        Command::Audio(action) => {
            app.apply_audio_settings(|s| match action {
                AudioAction::SampleRate(rate) => s.sample_rate = rate,
                AudioAction::BufferSize(size) => s.buffer_size = size,
                AudioAction::Input(name) => s.input_device = name,
                AudioAction::Output(name) => s.output_device = name,
            })?;
            info!(
                "Audio restarted at {} Hz ({} frames per buffer)",
                app.active_sample_rate, app.active_buffer_size
            );
        }
        Command::Calibrate => {
            info!("Measuring latency; keep the input close to the speakers");
            let m = app.measure_latency(CALIBRATION_TIMEOUT)?;
            println!(
                "Latency {:.1} ms (median {:.1} ms over {} runs), correlation {:.2} at {} Hz",
                m.latency_ms,
                m.median_latency_ms,
                app.session()?.latency().history().count(),
                m.correlation,
                m.sample_rate
            );
        }
        Command::Nudge(ms) => app.session_mut()?.set_nudge_ms(ms),
        Command::InputLatency(ms) => {
            app.set_input_latency_compensation_ms(ms);
            info!("Input latency compensation set to {} ms", ms.max(0.0));
        }
        Command::Status => println!("{}", status(app.session()?)),
        Command::Devices => print!("{}", audio_device::describe_devices()?),
        Command::Save => {
            app.save_settings();
            info!("Settings saved");
        }
        Command::Help => println!("{}", cli::HELP),
        Command::Quit => {}
    }
    Ok(())
}

fn status(session: &Session) -> String {
    let mut out = match session.master() {
        Some(m) => {
            let clock = session.clock();
            let next_bar = m
                .phase()
                .seconds(clock.sample_rate())
                .time_to_next_boundary(clock.now_seconds());
            format!(
                "master {:.3} s, {} BPM, next bar in {:.3} s\n",
                m.duration, m.bpm, next_bar
            )
        }
        None => "no master loop\n".to_string(),
    };
    for track in session.tracks() {
        let enabled = if session.is_enabled(track.index) { "" } else { " (disabled)" };
        out.push_str(&format!(
            "{} {:<9} {:>7.3} s @{:<8} x{:<5} vol {:.2}{}{}  nudge {} ms  undo {}  fx: {}{}\n",
            track.index + 1,
            track.state.label(),
            track.loop_duration(),
            track.shared_state.get_playhead(),
            track.divider,
            track.volume,
            if track.is_muted { " M" } else { "" },
            if track.is_soloed { " S" } else { "" },
            track.nudge_ms,
            track.overdub_history.len(),
            track.fx_chain.summary(),
            enabled,
        ));
    }
    if let Some(m) = session.last_measurement() {
        out.push_str(&format!(
            "latency {:.1} ms (measured {})\n",
            m.median_latency_ms,
            m.measured_at.format("%H:%M:%S")
        ));
    }
    out.push_str(&format!(
        "monitoring {}",
        if session.is_monitoring() { "on" } else { "off" }
    ));
    out
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged { track, state } => {
            info!("Track {}: {}", track + 1, state.label())
        }
        SessionEvent::MasterSet(m) => info!("Master loop {:.3} s at {} BPM", m.duration, m.bpm),
        SessionEvent::MasterCleared => info!("Master cleared"),
        SessionEvent::LoopInstalled { track, frames } => {
            info!("Track {}: loop of {} frames", track + 1, frames)
        }
        SessionEvent::OverdubMerged { track, .. } => info!("Track {}: overdub merged", track + 1),
        SessionEvent::OverdubUndone { track } => info!("Track {}: overdub undone", track + 1),
        SessionEvent::CaptureEmpty { track } => warn!("Track {}: nothing was captured", track + 1),
        SessionEvent::Calibrated(m) => info!("Latency {:.1} ms", m.median_latency_ms),
        SessionEvent::CalibrationFailed(e) => {
            let e = LooperError::from(e.clone());
            error!("{}", e)
        }
    }
}
