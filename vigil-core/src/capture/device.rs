//! Input device enumeration and ranking.
//!
//! Activity detection benefits from hearing what the machine plays (a call,
//! a video) as much as what the room sounds like, so ranking is driven by a
//! `DevicePreference` rather than always favouring a speech microphone.

use serde::{Deserialize, Serialize};

/// What kind of input the microphone source should prefer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    /// A physical microphone.
    #[default]
    Microphone,
    /// A loopback/monitor device that captures system output.
    SystemAudio,
}

/// An input device as reported by the host audio API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDevice {
    pub name: String,
    pub is_default: bool,
    /// Name suggests the device captures system output.
    pub is_loopback: bool,
    /// Best match for the requested preference.
    pub is_recommended: bool,
}

const LOOPBACK_HINTS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "wave out",
    "blackhole",
    "soundflower",
    "virtual output",
];

const MICROPHONE_HINTS: &[&str] = &["microphone", "mic", "headset", "array", "webcam", "usb"];

pub fn is_loopback_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_HINTS.iter().any(|hint| lowered.contains(hint))
}

/// Rank a device name for `preference`; higher is better.
pub fn preference_score(name: &str, preference: DevicePreference) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let loopback = is_loopback_name(&lowered);
    let mic = MICROPHONE_HINTS.iter().any(|hint| lowered.contains(hint));
    match preference {
        DevicePreference::Microphone => {
            (if loopback { -10 } else { 5 }) + if mic { 4 } else { 0 }
        }
        DevicePreference::SystemAudio => {
            (if loopback { 10 } else { 0 }) - if mic { 2 } else { 0 }
        }
    }
}

/// Mark the best device for `preference` and order the list best-first.
pub fn rank_devices(devices: &mut Vec<InputDevice>, preference: DevicePreference) {
    for d in devices.iter_mut() {
        d.is_recommended = false;
    }
    let best = devices
        .iter()
        .enumerate()
        .max_by_key(|(_, d)| preference_score(&d.name, preference) + i32::from(d.is_default))
        .map(|(idx, _)| idx);
    if let Some(idx) = best {
        devices[idx].is_recommended = true;
    }
    devices.sort_by_key(|d| (!d.is_recommended, !d.is_default, d.name.to_ascii_lowercase()));
}

/// Enumerate input devices on the default host.
///
/// Returns an empty list when audio support is compiled out or the host
/// cannot enumerate devices.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices(preference: DevicePreference) -> Vec<InputDevice> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            return Vec::new();
        }
    };

    let mut list: Vec<InputDevice> = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Input {}", idx + 1));
            InputDevice {
                is_default: default_name.as_deref() == Some(name.as_str()),
                is_loopback: is_loopback_name(&name),
                is_recommended: false,
                name,
            }
        })
        .collect();
    rank_devices(&mut list, preference);
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices(_preference: DevicePreference) -> Vec<InputDevice> {
    Vec::new()
}
