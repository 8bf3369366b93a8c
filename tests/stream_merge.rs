//! Integration tests for offline stream merging
//!
//! Streams are written to disk in the persisted CSV format, then read back,
//! aligned and trimmed the way a finished session is post-processed.

use std::fs;
use std::path::{Path, PathBuf};

use teng_daq::error::DaqError;
use teng_daq::merge::{
    merge_controller_parts, merge_stream_files, merge_task_parts, read_stream_csv, PersistedStream, StreamMerger,
};

fn times(n: usize, rate: f64) -> Vec<f64> {
    (0..n).map(|i| i as f64 / rate).collect()
}

/// 0 before `rise`, 1 from `rise` up to `fall`, 0 from `fall` on.
fn pulse(n: usize, rise: usize, fall: usize) -> Vec<f64> {
    (0..n).map(|i| if (rise..fall).contains(&i) { 1.0 } else { 0.0 }).collect()
}

fn write_stream(path: &Path, stream: &PersistedStream) {
    let mut out = String::from("time_s");
    for (name, _) in &stream.columns {
        out.push(',');
        out.push_str(name);
    }
    out.push('\n');
    for (row, t) in stream.time.iter().enumerate() {
        out.push_str(&t.to_string());
        for (_, values) in &stream.columns {
            out.push(',');
            out.push_str(&values[row].to_string());
        }
        out.push('\n');
    }
    fs::write(path, out).unwrap();
}

// =============================================================================
// Alignment
// =============================================================================

#[test]
fn test_slow_stream_is_upsampled_onto_fast_time_base() {
    // 100 Hz over [0, 10] s and 10 Hz over [0, 8] s.
    let fast = PersistedStream::new("fast", times(1001, 100.0))
        .with_column("LinMot_Enable", pulse(1001, 100, 700))
        .with_column("Voltage", times(1001, 100.0));
    let slow = PersistedStream::new("slow", times(81, 10.0))
        .with_column("Current", (0..81).map(|i| i as f64 * 10.0).collect());

    let aligned = StreamMerger::new("LinMot_Enable").align(&[slow, fast]).unwrap();
    assert_eq!(aligned.master, "fast");
    assert_eq!(aligned.len(), 801);
    assert_eq!(aligned.time.last(), Some(&8.0));

    // Current is 100 A/s, so at 0.25 s it reads 25.
    let current = aligned.column("Current").unwrap();
    assert!((current[25] - 25.0).abs() < 1e-9);
    assert!((current[800] - 800.0).abs() < 1e-9);
    assert_eq!(aligned.column("Voltage").unwrap().len(), 801);
}

#[test]
fn test_equal_rates_pick_first_stream_as_master() {
    let a = PersistedStream::new("a", times(10, 10.0)).with_column("LinMot_Enable", vec![0.0; 10]);
    let b = PersistedStream::new("b", times(10, 10.0)).with_column("Voltage", vec![1.0; 10]);
    let aligned = StreamMerger::new("LinMot_Enable").align(&[a, b]).unwrap();
    assert_eq!(aligned.master, "a");
}

#[test]
fn test_non_monotonic_timestamps_are_rejected() {
    let mut time = times(20, 100.0);
    time.swap(5, 6);
    let stream = PersistedStream::new("analog", time).with_column("LinMot_Enable", pulse(20, 2, 10));
    let err = StreamMerger::new("LinMot_Enable").merge(&[stream]).unwrap_err();
    assert!(matches!(err, DaqError::Validation(_)));
}

#[test]
fn test_duplicate_column_names_are_rejected() {
    let a = PersistedStream::new("a", times(10, 10.0)).with_column("LinMot_Enable", pulse(10, 2, 5));
    let b = PersistedStream::new("b", times(10, 10.0)).with_column("LinMot_Enable", pulse(10, 2, 5));
    assert!(matches!(
        StreamMerger::new("LinMot_Enable").merge(&[a, b]),
        Err(DaqError::Validation(_))
    ));
}

// =============================================================================
// Enable window
// =============================================================================

#[test]
fn test_trim_keeps_one_row_before_rise_through_falling_row() {
    let n = 1000;
    let stream = PersistedStream::new("analog", times(n, 1000.0))
        .with_column("LinMot_Enable", pulse(n, 50, 950))
        .with_column("Voltage", (0..n).map(|i| i as f64).collect());

    let merged = StreamMerger::new("LinMot_Enable").merge(&[stream]).unwrap();
    // Rows 49 through 950 inclusive.
    assert_eq!(merged.first_row, 49);
    assert_eq!(merged.len(), 902);
    let voltage = merged.column("Voltage").unwrap();
    assert_eq!(voltage.first(), Some(&49.0));
    assert_eq!(voltage.last(), Some(&950.0));
    let enable = merged.column("LinMot_Enable").unwrap();
    assert_eq!(enable[0], 0.0);
    assert!(enable[1..901].iter().all(|v| *v == 1.0));
    assert_eq!(enable[901], 0.0);
}

#[test]
fn test_two_rising_edges_fail_without_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let n = 200;
    let mut enable = pulse(n, 20, 60);
    for v in &mut enable[100..150] {
        *v = 1.0;
    }
    let input = dir.path().join("DAQ_analog_20260101_120000_000.csv");
    write_stream(
        &input,
        &PersistedStream::new("analog", times(n, 100.0)).with_column("LinMot_Enable", enable),
    );

    let output = dir.path().join("DAQ-EXP01-manual.csv");
    let err = merge_stream_files(&StreamMerger::new("LinMot_Enable"), &[input], &output).unwrap_err();
    assert!(matches!(err, DaqError::Validation(ref msg) if msg.contains("2 rising")));
    assert!(!output.exists());
}

#[test]
fn test_missing_edge_fails() {
    let stream = PersistedStream::new("analog", times(100, 100.0)).with_column("LinMot_Enable", pulse(100, 10, 100));
    assert!(matches!(
        StreamMerger::new("LinMot_Enable").merge(&[stream]),
        Err(DaqError::Validation(_))
    ));
}

// =============================================================================
// Files on disk
// =============================================================================

#[test]
fn test_merged_file_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let analog = dir.path().join("DAQ_analog_20260101_120000_000.csv");
    let digital = dir.path().join("DAQ_digital_20260101_120000_000.csv");
    write_stream(
        &analog,
        &PersistedStream::new("analog", times(400, 1000.0))
            .with_column("LinMot_Enable", pulse(400, 100, 300))
            .with_column("Voltage", vec![0.5; 400]),
    );
    write_stream(
        &digital,
        &PersistedStream::new("digital", times(200, 500.0)).with_column("Up_Down", pulse(200, 60, 120)),
    );

    let output = dir.path().join("DAQ-EXP01-R1.csv");
    let merger = StreamMerger::new("LinMot_Enable").binary_columns(["Up_Down".to_string()]);
    let merged = merge_stream_files(&merger, &[analog, digital], &output).unwrap();
    assert_eq!(merged.master, "DAQ_analog_20260101_120000_000");
    assert_eq!(merged.len(), 202);

    let back = read_stream_csv(&output).unwrap();
    assert_eq!(back.len(), 202);
    let names: Vec<_> = back.columns.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["LinMot_Enable", "Voltage", "Up_Down"]);
    let up_down = &back.columns[2].1;
    assert!(up_down.iter().all(|v| *v == 0.0 || *v == 1.0));

    let text = fs::read_to_string(&output).unwrap();
    let first_row = text.lines().nth(1).unwrap();
    assert_eq!(first_row, "0.099,0,0.5,0");
}

#[test]
fn test_session_folder_parts_are_concatenated_then_merged() {
    let dir = tempfile::tempdir().unwrap();
    // Two recordings of the analog task, one of the digital task.
    write_stream(
        &dir.path().join("DAQ_analog_20260101_120000_000.csv"),
        &PersistedStream::new("a1", times(100, 100.0))
            .with_column("LinMot_Enable", pulse(100, 30, 100))
            .with_column("Voltage", vec![1.0; 100]),
    );
    write_stream(
        &dir.path().join("DAQ_analog_20260101_120001_000.csv"),
        &PersistedStream::new("a2", times(100, 100.0))
            .with_column("LinMot_Enable", pulse(100, 0, 40))
            .with_column("Voltage", vec![2.0; 100]),
    );
    write_stream(
        &dir.path().join("DAQ_digital_20260101_120000_000.csv"),
        &PersistedStream::new("d", times(100, 50.0)).with_column("Up_Down", vec![1.0; 100]),
    );
    let remote = dir.path().join("remote");
    fs::create_dir(&remote).unwrap();
    fs::write(remote.join("Motor_2.csv"), "t;pos\n2;20\n").unwrap();
    fs::write(remote.join("Motor_1.csv"), "t;pos\n1;10\n").unwrap();

    let keywords = vec!["analog".to_string(), "digital".to_string()];
    let outputs = merge_task_parts(dir.path(), &keywords, "EXP01", dir.path()).unwrap();
    assert_eq!(
        outputs,
        vec![
            dir.path().join("DAQ-analog-EXP01.csv"),
            dir.path().join("DAQ-digital-EXP01.csv"),
        ]
    );
    let analog = read_stream_csv(&outputs[0]).unwrap();
    assert_eq!(analog.len(), 200);
    // Second part continues one step after the first.
    assert!((analog.time[100] - 1.0).abs() < 1e-9);

    let motor = merge_controller_parts(&remote, "EXP01", dir.path()).unwrap().unwrap();
    assert_eq!(fs::read_to_string(motor).unwrap(), "t,pos\n1,10\n2,20\n");

    let output: PathBuf = dir.path().join("DAQ-EXP01.csv");
    let merged = merge_stream_files(&StreamMerger::new("LinMot_Enable"), &outputs, &output).unwrap();
    // Enable rises at row 30 and falls at row 140 of the concatenated analog stream.
    assert_eq!(merged.first_row, 29);
    assert_eq!(merged.len(), 112);
}
