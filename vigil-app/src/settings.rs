//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_core::capture::{DevicePreference, SyntheticConfig};
use vigil_core::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSourceKind {
    Synthetic,
    Microphone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Rules,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ForwarderSettings {
    /// Closed records are POSTed here when set.
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 3_000,
            retries: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl ForwarderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub engine: EngineConfig,
    /// Defaults to `vigil.db` next to the settings file.
    pub database_path: Option<PathBuf>,
    pub audio_source: AudioSourceKind,
    pub preferred_input_device: Option<String>,
    pub device_preference: DevicePreference,
    pub synthetic: SyntheticConfig,
    pub classifier: ClassifierKind,
    pub classifier_url: Option<String>,
    pub classifier_token: Option<String>,
    pub retention_days: usize,
    pub forwarder: ForwarderSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            database_path: None,
            audio_source: AudioSourceKind::Synthetic,
            preferred_input_device: None,
            device_preference: DevicePreference::Microphone,
            synthetic: SyntheticConfig::default(),
            classifier: ClassifierKind::Rules,
            classifier_url: None,
            classifier_token: None,
            retention_days: 90,
            forwarder: ForwarderSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.retention_days = self.retention_days.clamp(1, 3650);
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.classifier_url = trimmed(self.classifier_url.take());
        self.classifier_token = trimmed(self.classifier_token.take());
        if self.classifier == ClassifierKind::Remote && self.classifier_url.is_none() {
            self.classifier = ClassifierKind::Rules;
        }

        self.forwarder.url = trimmed(self.forwarder.url.take());
        self.forwarder.timeout_ms = self.forwarder.timeout_ms.clamp(100, 60_000);
        self.forwarder.retries = self.forwarder.retries.min(10);
        self.forwarder.retry_delay_ms = self.forwarder.retry_delay_ms.clamp(10, 60_000);

        let engine = &mut self.engine;
        engine.confirm_count = engine.confirm_count.clamp(1, 100);
        engine.high_confidence_override = engine.high_confidence_override.clamp(0.01, 1.0);
        if engine.journal_capacity == 0 {
            engine.journal_capacity = EngineConfig::default().journal_capacity;
        }

        // The synthetic frames must match what the extractor expects.
        self.synthetic.width = engine.features.video_width;
        self.synthetic.height = engine.features.video_height;
        self.synthetic.sample_rate = engine.features.audio_sample_rate;
    }

    pub fn database_path(&self, settings_path: &Path) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            settings_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("vigil.db")
        })
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("VIGIL_SETTINGS") {
        return PathBuf::from(path);
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Vigil")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("vigil")
            .join("settings.json")
    }
}

/// Read settings, falling back to defaults when the file is missing or unreadable.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<AppSettings>(&raw).unwrap_or_else(|e| {
            tracing::warn!("settings file {} is invalid, using defaults: {e}", path.display());
            AppSettings::default()
        }),
        Err(_) => AppSettings::default(),
    };
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
