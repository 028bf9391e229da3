//! Transfer history kept by the CLI shell at
//! `~/.config/synapse/history.json`. Entries are appended from the
//! event sink; the engines never write here.

use std::fs;
use std::io;

use serde::{Deserialize, Serialize};

use super::settings;

const HISTORY_FILE_NAME: &str = "history.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub file_name: String,
    /// "send" or "receive".
    pub direction: String,
    pub peer: String,
    /// "completed" or "failed".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl HistoryEntry {
    pub fn completed(file_name: &str, direction: &str, peer: String) -> Self {
        Self {
            file_name: file_name.to_string(),
            direction: direction.to_string(),
            peer,
            status: "completed".to_string(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn failed(file_name: &str, direction: &str, peer: String, error: String) -> Self {
        Self {
            file_name: file_name.to_string(),
            direction: direction.to_string(),
            peer,
            status: "failed".to_string(),
            error: Some(error),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub fn load() -> Vec<HistoryEntry> {
    let path = settings::config_dir().join(HISTORY_FILE_NAME);
    fs::read(path)
        .ok()
        .and_then(|data| serde_json::from_slice(&data).ok())
        .unwrap_or_default()
}

pub fn append(entry: HistoryEntry) -> io::Result<()> {
    let dir = settings::config_dir();
    fs::create_dir_all(&dir)?;
    let mut entries = load();
    entries.push(entry);
    let data = serde_json::to_vec_pretty(&entries)?;
    fs::write(dir.join(HISTORY_FILE_NAME), data)
}
