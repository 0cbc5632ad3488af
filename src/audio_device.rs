// src/audio_device.rs

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, Host, HostId};
use log::warn;

fn get_host_from_id(host_id: HostId) -> Result<Host> {
    cpal::host_from_id(host_id).map_err(|e| anyhow::anyhow!("Failed to get audio host: {}", e))
}

/// Host named in the settings, or the platform default.
pub fn resolve_host_id(name: Option<&str>) -> HostId {
    let default = cpal::default_host().id();
    let Some(name) = name else {
        return default;
    };
    match cpal::available_hosts().into_iter().find(|id| id.name() == name) {
        Some(id) => id,
        None => {
            warn!("Audio host '{}' is not available; using {}", name, default.name());
            default
        }
    }
}

pub fn get_input_devices(host_id: HostId) -> Result<Vec<(String, Device)>> {
    let host = get_host_from_id(host_id)?;
    let devices = host.input_devices()?;
    let mut result = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            result.push((name, device));
        }
    }
    Ok(result)
}

pub fn get_output_devices(host_id: HostId) -> Result<Vec<(String, Device)>> {
    let host = get_host_from_id(host_id)?;
    let devices = host.output_devices()?;
    let mut result = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            result.push((name, device));
        }
    }
    Ok(result)
}

/// Human-readable listing of hosts and their devices.
pub fn describe_devices() -> Result<String> {
    let mut out = String::new();
    for host_id in cpal::available_hosts() {
        out.push_str(&format!("{}\n", host_id.name()));
        for (name, _) in get_input_devices(host_id)? {
            out.push_str(&format!("  in:  {}\n", name));
        }
        for (name, _) in get_output_devices(host_id)? {
            out.push_str(&format!("  out: {}\n", name));
        }
    }
    Ok(out)
}
