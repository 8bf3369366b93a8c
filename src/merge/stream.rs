//! Multi-rate stream alignment.
//!
//! [`StreamMerger`] takes the persisted streams of one session (each with its
//! own rate and start offset) and produces one table on a common time base:
//!
//! 1. every stream must have strictly increasing timestamps
//! 2. all streams are cut at the earliest end time
//! 3. the stream with the smallest mean step becomes the master time base
//! 4. every other column is linearly interpolated onto the master timestamps
//! 5. binary columns are snapped to {0, 1}
//! 6. the table is trimmed to `[rising - 1, falling]` of the enable column,
//!    which must contain exactly one rising and one falling edge
//!
//! Any violation aborts the merge with [`DaqError::Validation`]; nothing is
//! written.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{AppResult, DaqError};

/// One task's persisted samples, read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedStream {
    pub name: String,
    /// Seconds, strictly increasing.
    pub time: Vec<f64>,
    pub columns: Vec<(String, Vec<f64>)>,
}

impl PersistedStream {
    pub fn new(name: impl Into<String>, time: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            time,
            columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.columns.push((name.into(), values));
        self
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Average spacing between samples.
    pub fn mean_step(&self) -> f64 {
        match self.time.as_slice() {
            [first, .., last] => (last - first) / (self.time.len() - 1) as f64,
            _ => f64::INFINITY,
        }
    }

    pub fn end_time(&self) -> Option<f64> {
        self.time.last().copied()
    }

    fn validate(&self) -> AppResult<()> {
        if self.time.len() < 2 {
            return Err(DaqError::Validation(format!(
                "stream '{}' has {} samples, at least 2 are needed",
                self.name,
                self.time.len()
            )));
        }
        if let Some(i) = self.time.iter().position(|t| !t.is_finite()) {
            return Err(DaqError::Validation(format!(
                "stream '{}' has a non-finite timestamp at row {}",
                self.name, i
            )));
        }
        if let Some(i) = self.time.windows(2).position(|w| w[1] <= w[0]) {
            return Err(DaqError::Validation(format!(
                "stream '{}' timestamps are not strictly increasing at row {} ({} -> {})",
                self.name,
                i + 1,
                self.time[i],
                self.time[i + 1]
            )));
        }
        for (column, values) in &self.columns {
            if values.len() != self.time.len() {
                return Err(DaqError::Validation(format!(
                    "column '{}' of stream '{}' has {} values for {} timestamps",
                    column,
                    self.name,
                    values.len(),
                    self.time.len()
                )));
            }
        }
        Ok(())
    }

    /// Keep samples with `time <= end`.
    fn truncated(&self, end: f64) -> PersistedStream {
        let keep = self.time.partition_point(|&t| t <= end);
        PersistedStream {
            name: self.name.clone(),
            time: self.time[..keep].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), values[..keep].to_vec()))
                .collect(),
        }
    }
}

/// Time-aligned table produced by [`StreamMerger`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergedDataset {
    pub time: Vec<f64>,
    pub columns: Vec<(String, Vec<f64>)>,
    /// Names of the columns holding 0/1 values.
    pub binary_columns: Vec<String>,
    /// Row of the untrimmed table that became row 0.
    pub first_row: usize,
    /// Stream whose timestamps form the time base.
    pub master: String,
}

impl MergedDataset {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, values)| values.as_slice())
    }

    /// Write as CSV with a `time_s` column first. Binary columns are written
    /// as integers.
    pub fn write_csv(&self, path: &Path) -> AppResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = Vec::with_capacity(self.columns.len() + 1);
        header.push("time_s".to_string());
        header.extend(self.columns.iter().map(|(name, _)| name.clone()));
        writer.write_record(&header)?;

        let binary: Vec<bool> = self
            .columns
            .iter()
            .map(|(name, _)| self.binary_columns.contains(name))
            .collect();
        let mut record = Vec::with_capacity(header.len());
        for (row, t) in self.time.iter().enumerate() {
            record.clear();
            record.push(t.to_string());
            for ((_, values), is_binary) in self.columns.iter().zip(&binary) {
                let value = values[row];
                record.push(if *is_binary {
                    (value as i64).to_string()
                } else {
                    value.to_string()
                });
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        info!(path = %path.display(), rows = self.len(), "Merged dataset written");
        Ok(())
    }
}

/// Aligns persisted streams onto the fastest stream's time base.
#[derive(Debug, Clone)]
pub struct StreamMerger {
    enable_column: String,
    binary_columns: Vec<String>,
}

impl StreamMerger {
    /// `enable_column` bounds the valid window; it is always treated as binary.
    pub fn new(enable_column: impl Into<String>) -> Self {
        let enable_column = enable_column.into();
        Self {
            binary_columns: vec![enable_column.clone()],
            enable_column,
        }
    }

    pub fn binary_columns(mut self, columns: impl IntoIterator<Item = String>) -> Self {
        for column in columns {
            if !self.binary_columns.contains(&column) {
                self.binary_columns.push(column);
            }
        }
        self
    }

    /// Align and trim to the enable window.
    pub fn merge(&self, streams: &[PersistedStream]) -> AppResult<MergedDataset> {
        let aligned = self.align(streams)?;
        self.trim_to_enable(aligned)
    }

    /// Steps 1 to 5: validate, truncate, pick the master and interpolate.
    pub fn align(&self, streams: &[PersistedStream]) -> AppResult<MergedDataset> {
        if streams.is_empty() {
            return Err(DaqError::Validation("no streams to merge".into()));
        }
        for stream in streams {
            stream.validate()?;
        }

        let mut seen = HashSet::new();
        for (column, _) in streams.iter().flat_map(|s| &s.columns) {
            if column == "time_s" || !seen.insert(column.as_str()) {
                return Err(DaqError::Validation(format!("duplicate column '{}'", column)));
            }
        }
        if !seen.contains(self.enable_column.as_str()) {
            return Err(DaqError::Validation(format!(
                "enable column '{}' not found",
                self.enable_column
            )));
        }

        let min_end = streams
            .iter()
            .filter_map(PersistedStream::end_time)
            .fold(f64::INFINITY, f64::min);
        let truncated: Vec<PersistedStream> = streams.iter().map(|s| s.truncated(min_end)).collect();
        if let Some(empty) = truncated.iter().find(|s| s.is_empty()) {
            return Err(DaqError::Validation(format!(
                "stream '{}' starts after the common end time {}",
                empty.name, min_end
            )));
        }

        let master_idx = truncated
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.mean_step().total_cmp(&b.mean_step()))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let master = &truncated[master_idx];
        debug!(
            master = %master.name,
            rows = master.len(),
            min_end,
            "Master time base selected"
        );

        let mut columns = Vec::with_capacity(seen.len());
        for (i, stream) in truncated.iter().enumerate() {
            for (name, values) in &stream.columns {
                let mut aligned = if i == master_idx {
                    values.clone()
                } else {
                    interpolate(&stream.time, values, &master.time)
                };
                if self.binary_columns.contains(name) {
                    snap_binary(&mut aligned);
                }
                columns.push((name.clone(), aligned));
            }
        }

        let aligned = MergedDataset {
            time: master.time.clone(),
            columns,
            binary_columns: self
                .binary_columns
                .iter()
                .filter(|name| seen.contains(name.as_str()))
                .cloned()
                .collect(),
            first_row: 0,
            master: master.name.clone(),
        };
        Ok(aligned)
    }

    /// Keep rows `[rising - 1, falling]` of the enable column.
    pub fn trim_to_enable(&self, aligned: MergedDataset) -> AppResult<MergedDataset> {
        let enable = aligned.column(&self.enable_column).ok_or_else(|| {
            DaqError::Validation(format!("enable column '{}' not found", self.enable_column))
        })?;
        let (rising, falling) = enable_window(enable, &self.enable_column)?;
        let start = rising - 1;
        let end = falling + 1;

        let trimmed = MergedDataset {
            time: aligned.time[start..end].to_vec(),
            columns: aligned
                .columns
                .into_iter()
                .map(|(name, values)| (name, values[start..end].to_vec()))
                .collect(),
            binary_columns: aligned.binary_columns,
            first_row: aligned.first_row + start,
            master: aligned.master,
        };
        info!(
            master = %trimmed.master,
            rising,
            falling,
            rows = trimmed.len(),
            "Streams merged"
        );
        Ok(trimmed)
    }
}

/// Read persisted stream files, merge them and write the result to `output`.
///
/// Nothing is written when the merge fails.
pub fn merge_stream_files(merger: &StreamMerger, inputs: &[PathBuf], output: &Path) -> AppResult<MergedDataset> {
    let streams = inputs
        .iter()
        .map(|path| read_stream_csv(path))
        .collect::<AppResult<Vec<_>>>()?;
    let merged = merger.merge(&streams)?;
    merged.write_csv(output)?;
    Ok(merged)
}

/// Linear interpolation of `(src_t, src_v)` at each `target` time.
///
/// Targets outside the source range take the nearest edge value.
/// `src_t` and `target` must be increasing.
pub fn interpolate(src_t: &[f64], src_v: &[f64], target: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(target.len());
    let (Some(&first_t), Some(&last_t)) = (src_t.first(), src_t.last()) else {
        return vec![f64::NAN; target.len()];
    };
    let last = src_t.len() - 1;
    let mut j = 0;

    for &t in target {
        if t <= first_t {
            out.push(src_v[0]);
            continue;
        }
        if t >= last_t {
            out.push(src_v[last]);
            continue;
        }
        while src_t[j + 1] < t {
            j += 1;
        }
        let (t0, t1) = (src_t[j], src_t[j + 1]);
        if t == t1 {
            out.push(src_v[j + 1]);
        } else {
            let w = (t - t0) / (t1 - t0);
            out.push(src_v[j] + w * (src_v[j + 1] - src_v[j]));
        }
    }
    out
}

/// Round to the nearest integer and clamp into {0, 1}.
fn snap_binary(values: &mut [f64]) {
    for v in values.iter_mut() {
        *v = v.round().clamp(0.0, 1.0);
    }
}

/// Index of the first high sample and of the first low sample after it.
fn enable_window(enable: &[f64], column: &str) -> AppResult<(usize, usize)> {
    let mut rising = Vec::new();
    let mut falling = Vec::new();
    for (i, w) in enable.windows(2).enumerate() {
        let step = w[1] - w[0];
        if step > 0.5 {
            rising.push(i + 1);
        } else if step < -0.5 {
            falling.push(i + 1);
        }
    }

    match (rising.as_slice(), falling.as_slice()) {
        ([r], [f]) if r < f => Ok((*r, *f)),
        ([r], [f]) => Err(DaqError::Validation(format!(
            "enable column '{}' falls at row {} before it rises at row {}",
            column, f, r
        ))),
        _ => Err(DaqError::Validation(format!(
            "enable column '{}' has {} rising and {} falling edges, expected exactly one of each",
            column,
            rising.len(),
            falling.len()
        ))),
    }
}

/// Read a persisted stream written with a `time_s` first column.
pub fn read_stream_csv(path: &Path) -> AppResult<PersistedStream> {
    read_stream_csv_with(path, b',')
}

/// Read a stream CSV with a custom delimiter. The first column is time.
pub fn read_stream_csv_with(path: &Path, delimiter: u8) -> AppResult<PersistedStream> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if headers.len() < 2 {
        return Err(DaqError::Validation(format!(
            "{} needs a time column and at least one data column",
            path.display()
        )));
    }

    let mut time = Vec::new();
    let mut values: Vec<Vec<f64>> = vec![Vec::new(); headers.len() - 1];
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (col, field) in record.iter().enumerate().take(headers.len()) {
            let value: f64 = field.trim().parse().map_err(|_| {
                DaqError::Validation(format!(
                    "{}: row {} column '{}' is not a number: '{}'",
                    path.display(),
                    row + 1,
                    headers[col],
                    field
                ))
            })?;
            if col == 0 {
                time.push(value);
            } else {
                values[col - 1].push(value);
            }
        }
    }

    Ok(PersistedStream {
        name,
        time,
        columns: headers.into_iter().skip(1).zip(values).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, rate: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 / rate).collect()
    }

    #[test]
    fn interpolates_between_and_clamps_outside() {
        let src_t = [1.0, 2.0, 4.0];
        let src_v = [10.0, 20.0, 0.0];
        let out = interpolate(&src_t, &src_v, &[0.0, 1.5, 2.0, 3.0, 5.0]);
        assert_eq!(out, vec![10.0, 15.0, 20.0, 10.0, 0.0]);
    }

    #[test]
    fn rejects_duplicate_timestamps() {
        let stream = PersistedStream::new("a", vec![0.0, 0.1, 0.1, 0.2])
            .with_column("LinMot_Enable", vec![0.0; 4]);
        let err = StreamMerger::new("LinMot_Enable").merge(&[stream]).unwrap_err();
        assert!(matches!(err, DaqError::Validation(ref m) if m.contains("strictly increasing")));
    }

    #[test]
    fn rejects_missing_enable_column() {
        let stream = PersistedStream::new("a", ramp(10, 10.0)).with_column("Voltage", vec![0.0; 10]);
        let err = StreamMerger::new("LinMot_Enable").merge(&[stream]).unwrap_err();
        assert!(matches!(err, DaqError::Validation(ref m) if m.contains("not found")));
    }

    #[test]
    fn snaps_interpolated_binary_edges() {
        // 10 Hz enable, offset by 5 ms, rises between 0.305 and 0.405 s and
        // falls between 0.705 and 0.805 s.
        let slow_time = (0..11).map(|i| i as f64 / 10.0 + 0.005).collect();
        let slow = PersistedStream::new("slow", slow_time).with_column(
            "LinMot_Enable",
            vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0],
        );
        let fast = PersistedStream::new("fast", ramp(101, 100.0))
            .with_column("Voltage", (0..101).map(|i| i as f64).collect());

        let merged = StreamMerger::new("LinMot_Enable").merge(&[slow, fast]).unwrap();
        assert_eq!(merged.master, "fast");
        let enable = merged.column("LinMot_Enable").unwrap();
        assert!(enable.iter().all(|v| *v == 0.0 || *v == 1.0));
        // 0.36 s interpolates to 0.55 and is the first high row; 0.76 s to 0.45.
        assert_eq!(merged.first_row, 35);
        assert_eq!(enable.first(), Some(&0.0));
        assert_eq!(enable[1], 1.0);
        assert_eq!(enable.last(), Some(&0.0));
        assert_eq!(merged.len(), 76 - 35 + 1);
    }

    #[test]
    fn falling_before_rising_is_rejected() {
        let stream = PersistedStream::new("a", ramp(6, 10.0))
            .with_column("LinMot_Enable", vec![1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
        assert!(StreamMerger::new("LinMot_Enable").merge(&[stream]).is_err());
    }

    #[test]
    fn reads_stream_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DAQ_digital_x.csv");
        std::fs::write(&path, "time_s,Up_Down\n0,1\n0.5,0\n").unwrap();
        let stream = read_stream_csv(&path).unwrap();
        assert_eq!(stream.name, "DAQ_digital_x");
        assert_eq!(stream.time, vec![0.0, 0.5]);
        assert_eq!(stream.columns, vec![("Up_Down".to_string(), vec![1.0, 0.0])]);
    }
}
