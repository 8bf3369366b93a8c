//! Session configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `TENG_DAQ_` (nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use teng_daq::config::SessionConfig;
//!
//! let config = SessionConfig::load_from("config/bench.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), teng_daq::error::DaqError>(())
//! ```

use crate::acquisition::channel_group::{AcquisitionKind, ChannelGroup, ChannelSpec, TerminalConfig};
use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Sampling, buffering and output settings
    pub acquisition: AcquisitionConfig,
    /// Hardware channel groups, one acquisition task each
    pub channel_groups: Vec<ChannelGroupConfig>,
    /// Physical digital line names
    pub lines: LineNames,
    /// Controller handshake timing
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Remote controller connection
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Automatic load-sweep mode
    #[serde(default)]
    pub automatic: AutomaticConfig,
    /// Post-processing merge
    #[serde(default)]
    pub merge: MergeConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Acquisition and buffering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Default sample rate in Hz for every group
    pub sample_rate: f64,
    /// Samples delivered per driver callback
    pub chunk_size: usize,
    /// Chunks per persisted buffer
    pub buffer_chunks: usize,
    /// Length of the live-view window in seconds
    #[serde(default = "default_plot_window")]
    pub plot_window_secs: f64,
    /// Live-view refresh interval in milliseconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
    /// Root directory for session output
    pub output_dir: PathBuf,
    /// Delay between "task done" polls at stop
    #[serde(default = "default_poll_interval")]
    pub done_poll_interval_ms: u64,
    /// Maximum number of "task done" polls at stop
    #[serde(default = "default_done_max_polls")]
    pub done_max_polls: u32,
    /// Time given to the tasks to sample the released enable line before
    /// motion is disabled
    #[serde(default = "default_poll_interval")]
    pub stop_settle_ms: u64,
}

/// One hardware channel group as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelGroupConfig {
    pub name: String,
    pub kind: AcquisitionKind,
    /// Overrides `acquisition.sample_rate`
    #[serde(default)]
    pub sample_rate: Option<f64>,
    #[serde(default)]
    pub trigger_source: Option<String>,
    pub channels: Vec<ChannelConfig>,
    /// Channel shown in the live view
    #[serde(default)]
    pub plot_channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub port: String,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

/// Digital line names handed to the driver collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineNames {
    /// Motor start trigger output
    pub trigger: String,
    /// "Prepare to record" output towards the controller
    pub prepare: String,
    /// Controller status input, bit 0
    pub status_bit0: String,
    /// Controller status input, bit 1
    pub status_bit1: String,
    /// Relay code output port (load selection)
    pub relay_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_max_polls")]
    pub stop_max_polls: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_polls: default_max_polls(),
            stop_max_polls: default_max_polls(),
            max_retries: default_max_retries(),
        }
    }
}

impl AcquisitionConfig {
    pub fn done_poll_interval(&self) -> Duration {
        Duration::from_millis(self.done_poll_interval_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

impl HandshakeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_remote_port")]
    pub port: u16,
    #[serde(default)]
    pub remote_path: String,
    /// Extension of the files recorded by the controller
    #[serde(default = "default_remote_extension")]
    pub file_extension: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: default_remote_port(),
            remote_path: String::new(),
            file_extension: default_remote_extension(),
        }
    }
}

/// Automatic mode: one session per selected load
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomaticConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Time the motor needs to return to its origin between loads
    #[serde(default)]
    pub return_delay_ms: u64,
    #[serde(default)]
    pub loads: Vec<LoadEntry>,
    /// Relay code used when automatic mode is off
    #[serde(default)]
    pub manual_code: Option<String>,
}

/// One row of the resistance/code table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadEntry {
    pub id: String,
    pub resistance_ohms: f64,
    /// Relay bits, most significant line first (e.g. `"010011"`)
    pub code: String,
}

impl LoadEntry {
    /// Relay code as line levels.
    pub fn bits(&self) -> AppResult<Vec<bool>> {
        parse_code(&self.code)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub experiment_id: String,
    /// Binary column bounding the valid recording window
    #[serde(default)]
    pub enable_column: String,
    /// Columns snapped to {0, 1} after interpolation
    #[serde(default)]
    pub binary_columns: Vec<String>,
}

// Default value functions
fn default_plot_window() -> f64 {
    10.0
}

fn default_refresh_interval() -> u64 {
    100
}

fn default_poll_interval() -> u64 {
    100
}

fn default_done_max_polls() -> u32 {
    50
}

fn default_max_polls() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    1
}

fn default_remote_port() -> u16 {
    22
}

fn default_remote_extension() -> String {
    ".csv".to_string()
}

/// Parse a relay code string such as `"0101"` into line levels.
pub fn parse_code(code: &str) -> AppResult<Vec<bool>> {
    code.chars()
        .map(|c| match c {
            '0' => Ok(false),
            '1' => Ok(true),
            other => Err(DaqError::Configuration(format!(
                "Invalid relay code '{}': unexpected character '{}'",
                code, other
            ))),
        })
        .collect()
}

impl SessionConfig {
    /// Load configuration from a TOML file and `TENG_DAQ_` environment variables.
    ///
    /// Example override: `TENG_DAQ_APPLICATION__LOG_LEVEL=debug`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TENG_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config = Figment::new().merge(Toml::string(toml)).extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let acq = &self.acquisition;
        if !(acq.sample_rate > 0.0) || acq.chunk_size == 0 || acq.buffer_chunks == 0 {
            return Err(DaqError::Configuration(
                "sample_rate, chunk_size and buffer_chunks must be positive".into(),
            ));
        }
        if self.channel_groups.is_empty() {
            return Err(DaqError::Configuration(
                "At least one channel group must be configured".into(),
            ));
        }
        let mut group_names = HashSet::new();
        for group in &self.channel_groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate channel group: {}",
                    group.name
                )));
            }
            if group.channels.is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Channel group '{}' has no channels",
                    group.name
                )));
            }
            if matches!(group.sample_rate, Some(rate) if !(rate > 0.0)) {
                return Err(DaqError::Configuration(format!(
                    "Channel group '{}' has a non-positive sample rate",
                    group.name
                )));
            }
            let mut channel_names = HashSet::new();
            for channel in &group.channels {
                if !channel_names.insert(channel.name.as_str()) {
                    return Err(DaqError::Configuration(format!(
                        "Duplicate channel '{}' in group '{}'",
                        channel.name, group.name
                    )));
                }
            }
            if let Some(plot) = &group.plot_channel {
                if !channel_names.contains(plot.as_str()) {
                    return Err(DaqError::Configuration(format!(
                        "Plot channel '{}' is not part of group '{}'",
                        plot, group.name
                    )));
                }
            }
        }

        for group in self.channel_groups() {
            if self.plot_capacity(&group) < group.chunk_size {
                return Err(DaqError::Configuration(format!(
                    "plot_window_secs {} holds less than one chunk of {} samples in group '{}'",
                    acq.plot_window_secs, group.chunk_size, group.name
                )));
            }
        }

        let mut code_width = None;
        let codes = self
            .automatic
            .loads
            .iter()
            .map(|load| load.code.as_str())
            .chain(self.automatic.manual_code.as_deref());
        for code in codes {
            let bits = parse_code(code)?;
            match code_width {
                None => code_width = Some(bits.len()),
                Some(width) if width != bits.len() => {
                    return Err(DaqError::Configuration(format!(
                        "Relay code '{}' has {} bits, expected {}",
                        code,
                        bits.len(),
                        width
                    )));
                }
                Some(_) => {}
            }
        }
        if self.automatic.enabled && self.automatic.loads.is_empty() {
            return Err(DaqError::Configuration(
                "Automatic mode needs at least one load".into(),
            ));
        }

        if self.merge.enabled {
            if self.merge.enable_column.is_empty() {
                return Err(DaqError::Configuration(
                    "merge.enable_column must be set when merging".into(),
                ));
            }
            if !self.merge.binary_columns.contains(&self.merge.enable_column) {
                return Err(DaqError::Configuration(format!(
                    "Enable column '{}' must be listed in merge.binary_columns",
                    self.merge.enable_column
                )));
            }
        }

        Ok(())
    }

    /// Persisted buffer capacity in samples per channel.
    pub fn buffer_capacity(&self) -> usize {
        self.acquisition.chunk_size * self.acquisition.buffer_chunks
    }

    /// Live-view ring capacity of `group`, rounded down to whole chunks.
    pub fn plot_capacity(&self, group: &ChannelGroup) -> usize {
        let chunk = group.chunk_size.max(1);
        let raw = (group.sample_rate * self.acquisition.plot_window_secs) as usize;
        (raw / chunk) * chunk
    }

    /// Relay width in lines, taken from the first configured code.
    pub fn relay_width(&self) -> usize {
        self.automatic
            .loads
            .first()
            .map(|load| load.code.len())
            .or_else(|| self.automatic.manual_code.as_ref().map(String::len))
            .unwrap_or(0)
    }

    /// Build the immutable channel group descriptors for a session.
    pub fn channel_groups(&self) -> Vec<ChannelGroup> {
        self.channel_groups
            .iter()
            .map(|group| ChannelGroup {
                name: group.name.clone(),
                kind: group.kind,
                sample_rate: group.sample_rate.unwrap_or(self.acquisition.sample_rate),
                chunk_size: self.acquisition.chunk_size,
                capacity: self.buffer_capacity(),
                trigger_source: group.trigger_source.clone(),
                channels: group
                    .channels
                    .iter()
                    .map(|ch| ChannelSpec {
                        name: ch.name.clone(),
                        port: ch.port.clone(),
                        terminal: ch.terminal,
                    })
                    .collect(),
                plot_channel: group
                    .plot_channel
                    .as_ref()
                    .and_then(|name| group.channels.iter().position(|ch| &ch.name == name)),
            })
            .collect()
    }
}
