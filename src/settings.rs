// src/settings.rs
use crate::audio_engine::command::{CaptureConfig, MAX_SECONDS_PER_TRACK};
use crate::latency::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::looper::NUM_TRACKS;
use directories::ProjectDirs;
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const SETTINGS_FILE: &str = "settings.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub host_name: Option<String>,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: Option<u32>,
    pub buffer_size: Option<u32>,
    pub input_latency_compensation_ms: f32,
    pub bpm_rounding: bool,
    pub capture_channels: usize,
    pub max_seconds_per_track: f32,
    pub master_max_seconds: f32,
    pub manual_nudge_ms: f32,
    pub prerecord_ms: Option<f32>,
    pub overdub_gain: f32,
    /// Place overdubs by aligning their tail with the loop end instead of
    /// measuring them against the loop phase.
    pub tail_aligned_overdubs: bool,
    pub track_volume: f32,
    /// Dividers of tracks 2..=4 relative to the master loop.
    pub dividers: [f64; NUM_TRACKS - 1],
    pub latency_confidence_threshold: f32,
    pub monitor_gain: f32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            host_name: None,
            input_device: None,
            output_device: None,
            sample_rate: None,
            buffer_size: None,
            input_latency_compensation_ms: 5.0, // Default to 5ms safety buffer
            bpm_rounding: false,
            capture_channels: 1,
            max_seconds_per_track: 60.0,
            master_max_seconds: 60.0,
            manual_nudge_ms: -20.0,
            prerecord_ms: None,
            overdub_gain: 1.0,
            tail_aligned_overdubs: false,
            track_volume: 0.9,
            dividers: [1.0; NUM_TRACKS - 1],
            latency_confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            monitor_gain: 1.0,
        }
    }
}

impl AppSettings {
    pub fn capture_config(&self) -> CaptureConfig {
        let max_seconds_per_track = if self.max_seconds_per_track.is_nan() {
            AppSettings::default().max_seconds_per_track
        } else {
            self.max_seconds_per_track.clamp(1.0, MAX_SECONDS_PER_TRACK)
        };
        CaptureConfig {
            num_tracks: NUM_TRACKS,
            num_channels: self.capture_channels.clamp(1, 2),
            max_seconds_per_track,
        }
    }
}

pub fn get_config_dir() -> Option<PathBuf> {
    let Some(dirs) = ProjectDirs::from("", "", "phase-looper") else {
        error!("Could not determine a configuration directory.");
        return None;
    };
    let dir = dirs.config_dir().to_path_buf();
    if !dir.exists() {
        if let Err(e) = fs::create_dir_all(&dir) {
            error!("Failed to create directory at {}: {}", dir.display(), e);
            return None;
        }
    }
    Some(dir)
}

pub fn save_settings(settings: &AppSettings) {
    if let Some(dir) = get_config_dir() {
        save_settings_to(settings, &dir.join(SETTINGS_FILE));
    }
}

pub fn save_settings_to(settings: &AppSettings, path: &Path) {
    match serde_json::to_string_pretty(settings) {
        Ok(json_string) => {
            if let Err(e) = fs::write(path, json_string) {
                error!("Failed to write settings to {}: {}", path.display(), e);
            }
        }
        Err(e) => {
            error!("Failed to serialize settings: {}", e);
        }
    }
}

pub fn load_settings() -> AppSettings {
    match get_config_dir() {
        Some(dir) => load_settings_from(&dir.join(SETTINGS_FILE)),
        None => AppSettings::default(),
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    if !path.exists() {
        return AppSettings::default();
    }
    match fs::read_to_string(path) {
        Ok(json_string) => match serde_json::from_str(&json_string) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to parse settings file, using defaults. Error: {}", e);
                AppSettings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read settings file, using defaults. Error: {}", e);
            AppSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("phase-looper-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{ "manual_nudge_ms": -35.0, "bpm_rounding": true }"#).unwrap();
        assert_eq!(settings.manual_nudge_ms, -35.0);
        assert!(settings.bpm_rounding);
        assert_eq!(settings.track_volume, 0.9);
        assert_eq!(settings.dividers, [1.0; NUM_TRACKS - 1]);
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("roundtrip");
        let mut settings = AppSettings::default();
        settings.dividers = [1.0, 0.5, 2.0];
        settings.prerecord_ms = Some(200.0);
        save_settings_to(&settings, &path);
        assert_eq!(load_settings_from(&path), settings);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let path = temp_path("corrupt");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings_from(&path), AppSettings::default());
        let _ = fs::remove_file(&path);
        assert_eq!(load_settings_from(&path), AppSettings::default());
    }

    #[test]
    fn test_capture_config_is_bounded() {
        let mut settings = AppSettings::default();
        settings.capture_channels = 8;
        settings.max_seconds_per_track = 0.0;
        let config = settings.capture_config();
        assert_eq!(config.num_channels, 2);
        assert_eq!(config.max_seconds_per_track, 1.0);
        assert_eq!(config.num_tracks, NUM_TRACKS);

        settings.max_seconds_per_track = f32::INFINITY;
        let config = settings.capture_config();
        assert_eq!(config.max_seconds_per_track, MAX_SECONDS_PER_TRACK);
        assert_eq!(config.capacity_frames(48_000), 5_760_000);

        settings.max_seconds_per_track = 1.0e6;
        assert_eq!(settings.capture_config().max_seconds_per_track, MAX_SECONDS_PER_TRACK);

        settings.max_seconds_per_track = f32::NAN;
        assert_eq!(settings.capture_config().max_seconds_per_track, 60.0);
    }

    #[test]
    fn test_raw_capture_config_never_exceeds_ceiling() {
        let config = CaptureConfig {
            num_tracks: 1,
            num_channels: 1,
            max_seconds_per_track: f32::INFINITY,
        };
        assert_eq!(config.capacity_frames(1_000), 120_000);
        let config = CaptureConfig {
            max_seconds_per_track: f32::NAN,
            ..config
        };
        assert_eq!(config.capacity_frames(1_000), 0);
    }
}
