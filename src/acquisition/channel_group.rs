//! Channel group descriptors and per-callback sample chunks.

use serde::{Deserialize, Serialize};

/// What a channel group samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionKind {
    /// Analog input channels read as volts.
    ContinuousVoltage,
    /// Digital input lines read as 0/1.
    DiscreteLine,
}

impl AcquisitionKind {
    pub fn is_binary(self) -> bool {
        matches!(self, AcquisitionKind::DiscreteLine)
    }
}

/// Analog input terminal configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalConfig {
    /// Referenced single-ended
    Rse,
    #[serde(rename = "diff")]
    Differential,
    /// Non-referenced single-ended
    Nrse,
    /// Whatever the device uses when nothing is requested
    #[default]
    Default,
}

/// One physical port in a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    pub port: String,
    pub terminal: TerminalConfig,
}

/// Static descriptor of a set of lines sampled together at one rate.
///
/// Built from configuration before a session starts and never mutated
/// while the session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelGroup {
    pub name: String,
    pub kind: AcquisitionKind,
    /// Scans per second.
    pub sample_rate: f64,
    /// Scans delivered per driver callback.
    pub chunk_size: usize,
    /// Scans per persisted buffer, a whole multiple of `chunk_size`.
    pub capacity: usize,
    pub trigger_source: Option<String>,
    pub channels: Vec<ChannelSpec>,
    /// Index into `channels` of the column copied to the live view.
    pub plot_channel: Option<usize>,
}

impl ChannelGroup {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|ch| ch.name.clone()).collect()
    }

    /// Interleaved values in one chunk.
    pub fn chunk_len(&self) -> usize {
        self.chunk_size * self.channel_count()
    }

    /// Duration covered by one chunk, in seconds.
    pub fn chunk_period_secs(&self) -> f64 {
        self.chunk_size as f64 / self.sample_rate
    }
}

/// What the driver should do after a chunk was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkControl {
    Continue,
    /// Stop the hardware task; no further callbacks are delivered.
    Stop,
}

/// One callback's worth of samples, borrowed from the driver.
///
/// Layout is scan-major: `[scan0_ch0, scan0_ch1, ..., scan1_ch0, ...]`.
#[derive(Debug, Clone, Copy)]
pub struct SampleChunk<'a> {
    data: &'a [f64],
    n_channels: usize,
}

impl<'a> SampleChunk<'a> {
    /// Wrap an interleaved slice. Trailing values that do not form a full
    /// scan are ignored.
    pub fn new(data: &'a [f64], n_channels: usize) -> Self {
        let usable = if n_channels > 0 {
            data.len() - data.len() % n_channels
        } else {
            0
        };
        Self {
            data: &data[..usable],
            n_channels,
        }
    }

    pub fn data(&self) -> &'a [f64] {
        self.data
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    pub fn n_scans(&self) -> usize {
        if self.n_channels > 0 {
            self.data.len() / self.n_channels
        } else {
            0
        }
    }

    /// Iterate over one channel's column.
    pub fn column(&self, channel: usize) -> impl Iterator<Item = f64> + 'a {
        let step = self.n_channels.max(1);
        let data = self.data;
        let start = if channel < self.n_channels {
            channel
        } else {
            data.len()
        };
        data.get(start..)
            .unwrap_or(&[])
            .iter()
            .step_by(step)
            .copied()
    }

    /// Reshape data into per-channel vectors.
    pub fn deinterleave(&self) -> Vec<Vec<f64>> {
        let mut channels = vec![Vec::with_capacity(self.n_scans()); self.n_channels];
        for (i, &v) in self.data.iter().enumerate() {
            channels[i % self.n_channels].push(v);
        }
        channels
    }
}
