//! Offline concatenation of part files.
//!
//! A measurement folder may hold several part files per task (one per
//! session, or one per controller log rotation). Parts are grouped by task
//! keyword, ordered by the numeric suffix in their names and appended into
//! one table per group.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{AppResult, DaqError};

/// Options for [`concat_parts`].
#[derive(Debug, Clone, Copy)]
pub struct ConcatOptions {
    pub delimiter: u8,
    /// Shift the first column of each later part so time keeps increasing
    /// across part boundaries.
    pub continue_time: bool,
    /// Time step used at a part boundary when no part read so far has two
    /// rows to measure it from.
    pub time_step: Option<f64>,
}

impl Default for ConcatOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            continue_time: true,
            time_step: None,
        }
    }
}

/// Rows of several parts sharing one header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl PartTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn write_csv(&self, path: &Path) -> AppResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Numeric ordering key of a part file.
///
/// Joins the trailing all-digit `_` segments of the file stem, so
/// `DAQ_analog_20260101_120000_123.csv` sorts as `20260101120000123` and
/// `Motor_12.csv` as `12`.
pub fn part_sort_key(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let digits: Vec<&str> = stem
        .rsplit('_')
        .take_while(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.iter().rev().copied().collect::<String>().parse().ok()
}

/// Sort parts by [`part_sort_key`]; parts without a key go last, by name.
pub fn sort_parts(parts: &mut [PathBuf]) {
    parts.sort_by(|a, b| match (part_sort_key(a), part_sort_key(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.cmp(b),
    });
}

/// Group files by the first keyword contained in their file name.
///
/// Files matching no keyword are skipped with a warning.
pub fn group_files_by_keyword(files: &[PathBuf], keywords: &[String]) -> BTreeMap<String, Vec<PathBuf>> {
    let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match keywords.iter().find(|k| name.contains(k.as_str())) {
            Some(keyword) => groups.entry(keyword.clone()).or_default().push(file.clone()),
            None => warn!(file = %name, "File matches no task keyword, skipped"),
        }
    }
    for parts in groups.values_mut() {
        sort_parts(parts);
    }
    groups
}

/// Append parts in the given order. All parts must share the same header.
pub fn concat_parts(parts: &[PathBuf], options: ConcatOptions) -> AppResult<PartTable> {
    let mut table = PartTable::default();
    let mut offset = 0.0;
    let mut last_step = options.time_step;

    for (i, part) in parts.iter().enumerate() {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(options.delimiter)
            .from_path(part)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if i == 0 {
            table.headers = headers;
        } else if headers != table.headers {
            return Err(DaqError::Validation(format!(
                "{} has columns {:?}, expected {:?}",
                part.display(),
                headers,
                table.headers
            )));
        }

        let mut rows: Vec<Vec<String>> = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(str::to_string).collect());
        }

        if options.continue_time && !rows.is_empty() {
            let times = first_column(&rows, part)?;
            if let Some(w) = times.windows(2).next() {
                last_step = Some(w[1] - w[0]);
            }
            if i > 0 {
                let step = last_step.filter(|s| *s > 0.0).ok_or_else(|| {
                    DaqError::Validation(format!(
                        "{}: no time step known to continue time across parts",
                        part.display()
                    ))
                })?;
                let shift = offset + step - times[0];
                for (row, t) in rows.iter_mut().zip(&times) {
                    row[0] = (t + shift).to_string();
                }
                offset = times[times.len() - 1] + shift;
            } else {
                offset = times[times.len() - 1];
            }
        }
        table.rows.extend(rows);
    }
    Ok(table)
}

fn first_column(rows: &[Vec<String>], part: &Path) -> AppResult<Vec<f64>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            row.first()
                .and_then(|v| v.trim().parse::<f64>().ok())
                .ok_or_else(|| {
                    DaqError::Validation(format!("{}: row {} has no numeric time", part.display(), i + 1))
                })
        })
        .collect()
}

/// CSV files directly inside `dir`, excluding already merged outputs.
pub fn list_part_files(dir: &Path, extension: &str) -> AppResult<Vec<PathBuf>> {
    let extension = extension.trim_start_matches('.');
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_part = path.is_file()
            && path.extension().is_some_and(|e| e == extension)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with("DAQ-") && !n.starts_with("Motor-"));
        if is_part {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Part files of a measurement folder: those directly inside `dir` plus
/// those of its `session_*` subdirectories.
pub fn collect_part_files(dir: &Path, extension: &str) -> AppResult<Vec<PathBuf>> {
    let mut files = list_part_files(dir, extension)?;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_session = path.is_dir()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("session_"));
        if is_session {
            files.extend(list_part_files(&path, extension)?);
        }
    }
    Ok(files)
}

/// Concatenate every task group in `dir` and its session subdirectories into
/// `DAQ-{group}-{experiment_id}.csv` under `out_dir`.
pub fn merge_task_parts(
    dir: &Path,
    keywords: &[String],
    experiment_id: &str,
    out_dir: &Path,
) -> AppResult<Vec<PathBuf>> {
    let files = collect_part_files(dir, "csv")?;
    concat_task_groups(&files, keywords, experiment_id, out_dir)
}

/// Group `files` by task keyword and write one `DAQ-{group}-{experiment_id}.csv`
/// per group under `out_dir`.
pub fn concat_task_groups(
    files: &[PathBuf],
    keywords: &[String],
    experiment_id: &str,
    out_dir: &Path,
) -> AppResult<Vec<PathBuf>> {
    let groups = group_files_by_keyword(files, keywords);
    let mut outputs = Vec::with_capacity(groups.len());

    for (group, parts) in groups {
        let table = concat_parts(&parts, ConcatOptions::default())?;
        let output = out_dir.join(format!("DAQ-{}-{}.csv", group, experiment_id));
        table.write_csv(&output)?;
        info!(
            group = %group,
            parts = parts.len(),
            rows = table.len(),
            path = %output.display(),
            "Task parts concatenated"
        );
        outputs.push(output);
    }
    Ok(outputs)
}

/// Concatenate the controller's `;`-delimited log parts into
/// `Motor-{experiment_id}.csv`. Returns `None` when there are none.
pub fn merge_controller_parts(dir: &Path, experiment_id: &str, out_dir: &Path) -> AppResult<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut parts = list_part_files(dir, "csv")?;
    if parts.is_empty() {
        return Ok(None);
    }
    sort_parts(&mut parts);

    let table = concat_parts(
        &parts,
        ConcatOptions {
            delimiter: b';',
            continue_time: false,
            time_step: None,
        },
    )?;
    let output = out_dir.join(format!("Motor-{}.csv", experiment_id));
    table.write_csv(&output)?;
    info!(parts = parts.len(), rows = table.len(), path = %output.display(), "Controller parts concatenated");
    Ok(Some(output))
}
