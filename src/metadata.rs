//! Session manifest written next to the persisted streams.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::acquisition::TaskReport;
use crate::config::LoadEntry;
use crate::error::AppResult;

/// Everything needed to find and interpret one session's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub experiment_id: String,
    /// Shared timestamp of the session's stream files.
    pub stamp: String,
    /// Index into the automatic load table; 0 in manual mode.
    pub iteration: usize,
    /// Load connected by the relay matrix, if automatic mode selected one.
    pub load: Option<LoadEntry>,
    /// True when the motor controller was unreachable.
    pub standalone: bool,
    pub started_at: DateTime<Local>,
    pub stopped_at: DateTime<Local>,
    pub tasks: Vec<TaskReport>,
    pub remote_files: Vec<PathBuf>,
    pub merged: Option<PathBuf>,
    pub error: Option<String>,
    /// Software version, hostname.
    #[serde(default)]
    pub system_info: HashMap<String, String>,
}

/// Facts about the recording machine stored with every manifest.
pub fn system_info() -> HashMap<String, String> {
    let mut info = HashMap::new();
    info.insert(
        "software_version".to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname) = hostname.into_string() {
            info.insert("hostname".to_string(), hostname);
        }
    }
    info
}

impl SessionManifest {
    pub fn file_name(&self) -> String {
        format!("session_{}.json", self.stamp)
    }

    /// Serialize as pretty JSON into `dir`.
    pub async fn write_to(&self, dir: &Path) -> AppResult<PathBuf> {
        let path = dir.join(self.file_name());
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    pub async fn read_from(path: &Path) -> AppResult<Self> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
