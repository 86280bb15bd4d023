// src/csv_export.rs
//
// CSV persistence for probe, sweep, normalization, and extrapolation
// records. Schemas are the serde field names of the record types in
// trial.rs / normalize.rs / extrapolate.rs.
//
// Sweep rows are appended one at a time (header written once) so a
// crashed sweep keeps everything it measured. All other writers produce
// whole files.

use anyhow::{Context, Result};
use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::extrapolate::ExtrapolationResult;
use crate::normalize::{DbNormalized, MqNormalized};
use crate::trial::{DbTrialRecord, TimeseriesRecord, TrialResult};

/// Timestamp suffix shared by all result filenames.
pub fn file_timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn summary_path(out_dir: &Path, component: &str, ts: &str) -> PathBuf {
    out_dir.join(format!("{component}_perftest_summary_{ts}.csv"))
}

pub fn timeseries_path(out_dir: &Path, component: &str, ts: &str) -> PathBuf {
    out_dir.join(format!("{component}_perftest_timeseries_{ts}.csv"))
}

pub fn sweep_path(out_dir: &Path, component: &str, ts: &str) -> PathBuf {
    out_dir.join(format!("{component}_kbbench_results_{ts}.csv"))
}

pub fn normalized_db_path(out_dir: &Path, component: &str, ts: &str) -> PathBuf {
    out_dir.join(format!("normalized_db_{component}_{ts}.csv"))
}

pub fn normalized_mq_path(out_dir: &Path, component: &str, ts: &str) -> PathBuf {
    out_dir.join(format!("normalized_mq_{component}_{ts}.csv"))
}

pub fn recommendation_path(out_dir: &Path, ts: &str) -> PathBuf {
    out_dir.join(format!("capacity_recommendation_{ts}.csv"))
}

fn write_all<T: Serialize, P: AsRef<Path>>(path: P, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())
        .with_context(|| format!("Failed to create {}", path.as_ref().display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_all<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("Failed to open {}", path.as_ref().display()))?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record.with_context(|| {
            format!("Malformed record in {}", path.as_ref().display())
        })?);
    }
    Ok(rows)
}

pub fn write_trial_summaries<P: AsRef<Path>>(path: P, rows: &[TrialResult]) -> Result<()> {
    write_all(path, rows)
}

pub fn write_timeseries<P: AsRef<Path>>(path: P, rows: &[TimeseriesRecord]) -> Result<()> {
    write_all(path, rows)
}

pub fn write_db_normalized<P: AsRef<Path>>(path: P, rows: &[DbNormalized]) -> Result<()> {
    write_all(path, rows)
}

pub fn write_mq_normalized<P: AsRef<Path>>(path: P, rows: &[MqNormalized]) -> Result<()> {
    write_all(path, rows)
}

pub fn write_recommendations<P: AsRef<Path>>(path: P, rows: &[ExtrapolationResult]) -> Result<()> {
    write_all(path, rows)
}

pub fn read_db_records<P: AsRef<Path>>(path: P) -> Result<Vec<DbTrialRecord>> {
    read_all(path)
}

pub fn read_trial_summaries<P: AsRef<Path>>(path: P) -> Result<Vec<TrialResult>> {
    read_all(path)
}

pub fn read_db_normalized<P: AsRef<Path>>(path: P) -> Result<Vec<DbNormalized>> {
    read_all(path)
}

pub fn read_mq_normalized<P: AsRef<Path>>(path: P) -> Result<Vec<MqNormalized>> {
    read_all(path)
}

/// Append one sweep row, writing the header only when the file is new or
/// empty.
pub fn append_db_record<P: AsRef<Path>>(path: P, record: &DbTrialRecord) -> Result<()> {
    let path = path.as_ref();
    let need_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(need_header)
        .from_writer(file);
    writer.serialize(record)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(clients: u32) -> DbTrialRecord {
        DbTrialRecord {
            timestamp: "2025-01-01T00:00:00".to_string(),
            clients,
            jobs: 4,
            duration_s: 60,
            tps_including: Some(1234.5),
            tps_excluding: Some(1240.0),
            latency_ms_avg: Some(6.48),
            tx_processed: Some(74073),
            return_code: 0,
            error: None,
        }
    }

    #[test]
    fn test_append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        append_db_record(&path, &record(4)).unwrap();
        append_db_record(&path, &record(8)).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("timestamp").count(), 1);

        let rows = read_db_records(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].clients, 8);
    }

    #[test]
    fn test_trial_summary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");

        let rows = vec![TrialResult {
            run_id: "auto-r1000".to_string(),
            target_rate_msg_s: 1000,
            avg_sent_msg_s: 1000.0,
            avg_received_msg_s: 980.0,
            worst_p95_ms: 800,
            success: true,
            note: String::new(),
            duration_s: 15,
            producers: 4,
            consumers: 4,
            size_bytes: 1024,
            queue: "perf_queue".to_string(),
            return_code: 0,
            error: None,
        }];
        write_trial_summaries(&path, &rows).unwrap();
        let back = read_trial_summaries(&path).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].run_id, "auto-r1000");
        assert!(back[0].success);
        assert_eq!(back[0].worst_p95_ms, 800);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "timestamp,clients\nnot-a-row").unwrap();
        assert!(read_db_records(&path).is_err());
    }
}
