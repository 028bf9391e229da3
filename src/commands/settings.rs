//! Persistent shell settings under `~/.config/synapse/config.json`.
//! The engines never touch this file; they only see the resolved
//! values.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default)]
    pub auto_accept: bool,
    /// Listener port hint; 0 means OS-chosen.
    #[serde(default)]
    pub port: u16,
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            auto_accept: false,
            port: 0,
            device_name: default_device_name(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Synapse-Downloads")
}

fn default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "my-device".to_string())
}

pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("synapse")
}

impl Settings {
    /// Loads settings, falling back to defaults on any problem; a
    /// missing config file is the common first-run case.
    pub fn load() -> Self {
        let path = config_dir().join(CONFIG_FILE_NAME);
        let Ok(data) = fs::read(&path) else {
            return Self::default();
        };
        let mut settings: Settings = match serde_json::from_slice(&data) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("ignoring malformed settings at {}: {e}", path.display());
                return Self::default();
            }
        };
        if settings.device_name.is_empty() {
            settings.device_name = default_device_name();
        }
        settings
    }

    pub fn save(&self) -> std::io::Result<()> {
        let dir = config_dir();
        fs::create_dir_all(&dir)?;
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(dir.join(CONFIG_FILE_NAME), data)
    }
}
