// src/collect.rs
//
// Batch collection: scan a data directory for the newest raw result files,
// normalize every row independently, persist normalized records, and
// aggregate per-component summaries.
//
// File conventions match what the probe and sweep commands write:
//   {Component}_kbbench_results_{ts}.csv    DB sweep rows
//   {Component}_perftest_summary_{ts}.csv   broker trial summaries
// The component name is recovered from the filename prefix. One bad file
// or row is reported and skipped; it never blocks the rest of the batch.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::ResourceAssumptions;
use crate::csv_export;
use crate::glob_to_regex;
use crate::normalize::{summarize, ComponentSummary, NormalizationEngine, NormalizedMetric, SkippedRow};

/// Everything one batch run produced.
#[derive(Debug, Default)]
pub struct CollectReport {
    pub metrics: Vec<NormalizedMetric>,
    pub summaries: Vec<ComponentSummary>,
    /// Normalized CSV files written
    pub outputs: Vec<PathBuf>,
    /// Input files that were picked up
    pub inputs: Vec<PathBuf>,
    /// (file, row index, reason) for every row that failed normalization
    pub skipped: Vec<(PathBuf, SkippedRow)>,
}

/// Newest file under `dir` (non-recursive) whose name matches the glob.
pub fn find_latest_csv(dir: &Path, glob: &str) -> Option<PathBuf> {
    let re = regex::Regex::new(&glob_to_regex(glob)).ok()?;
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| re.is_match(&e.file_name().to_string_lossy()))
        .max_by_key(|e| {
            e.metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
        .map(|e| e.into_path())
}

/// Component name from `{Component}_kbbench_results_*.csv`, defaulting to
/// the given fallback.
pub fn component_from_filename<'a>(name: &'a str, marker: &str, fallback: &'a str) -> &'a str {
    match name.split_once(marker) {
        Some((prefix, _)) if !prefix.is_empty() => prefix,
        _ => fallback,
    }
}

/// Scan `data_dir`, normalize the newest DB and MQ result files, and write
/// normalized CSVs into `out_dir`.
pub fn collect(
    data_dir: &Path,
    out_dir: &Path,
    assumptions: ResourceAssumptions,
    db_component: &str,
    mq_component: &str,
) -> Result<CollectReport> {
    let engine = NormalizationEngine::new(assumptions)?;
    std::fs::create_dir_all(out_dir)?;
    let ts = csv_export::file_timestamp();

    let mut report = CollectReport::default();

    // DB rows: prefer an explicit results.csv, then the standard naming,
    // then anything mentioning kbbench.
    let db_file = Some(data_dir.join("results.csv"))
        .filter(|p| p.is_file())
        .or_else(|| find_latest_csv(data_dir, "*_kbbench_results_*.csv"))
        .or_else(|| find_latest_csv(data_dir, "*kbbench*.csv"));

    if let Some(path) = db_file {
        let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
        let component = component_from_filename(&name, "_kbbench_results_", db_component).to_string();
        info!(file = %path.display(), component, "processing DB results");
        match csv_export::read_db_records(&path) {
            Ok(rows) => {
                let out = engine.normalize_db_batch(&component, &rows);
                for s in out.skipped {
                    report.skipped.push((path.clone(), s));
                }
                if !out.metrics.is_empty() {
                    let dest = csv_export::normalized_db_path(out_dir, &component, &ts);
                    csv_export::write_db_normalized(&dest, &out.metrics)?;
                    report.outputs.push(dest);
                    report
                        .metrics
                        .extend(out.metrics.into_iter().map(NormalizedMetric::Db));
                }
                report.inputs.push(path);
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "failed to read DB results");
            }
        }
    } else {
        warn!(dir = %data_dir.display(), "no DB result file found");
    }

    // MQ summaries.
    if let Some(path) = find_latest_csv(data_dir, "*_perftest_summary_*.csv") {
        let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
        let component =
            component_from_filename(&name, "_perftest_summary_", mq_component).to_string();
        info!(file = %path.display(), component, "processing MQ results");
        match csv_export::read_trial_summaries(&path) {
            Ok(rows) => {
                let out = engine.normalize_mq_batch(&component, &rows);
                for s in out.skipped {
                    report.skipped.push((path.clone(), s));
                }
                if !out.metrics.is_empty() {
                    let dest = csv_export::normalized_mq_path(out_dir, &component, &ts);
                    csv_export::write_mq_normalized(&dest, &out.metrics)?;
                    report.outputs.push(dest);
                    report
                        .metrics
                        .extend(out.metrics.into_iter().map(NormalizedMetric::Mq));
                }
                report.inputs.push(path);
            }
            Err(err) => {
                warn!(file = %path.display(), error = %err, "failed to read MQ results");
            }
        }
    } else {
        warn!(dir = %data_dir.display(), "no MQ summary file found");
    }

    report.summaries = summarize(&report.metrics);
    Ok(report)
}

/// Load previously normalized metrics back from `dir` (newest DB and MQ
/// normalized files), for extrapolation.
pub fn load_normalized(dir: &Path) -> Result<Vec<NormalizedMetric>> {
    let mut metrics = Vec::new();
    if let Some(path) = find_latest_csv(dir, "normalized_db_*.csv") {
        metrics.extend(
            csv_export::read_db_normalized(&path)?
                .into_iter()
                .map(NormalizedMetric::Db),
        );
    }
    if let Some(path) = find_latest_csv(dir, "normalized_mq_*.csv") {
        metrics.extend(
            csv_export::read_mq_normalized(&path)?
                .into_iter()
                .map(NormalizedMetric::Mq),
        );
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::DbTrialRecord;

    fn write_db_file(dir: &Path, name: &str, tps: &[Option<f64>]) {
        let rows: Vec<DbTrialRecord> = tps
            .iter()
            .enumerate()
            .map(|(i, t)| DbTrialRecord {
                timestamp: format!("2025-01-01T00:00:{i:02}"),
                clients: 8,
                jobs: 4,
                duration_s: 60,
                tps_including: *t,
                tps_excluding: *t,
                latency_ms_avg: Some(6.0),
                tx_processed: Some(1000),
                return_code: 0,
                error: None,
            })
            .collect();
        let mut w = csv::Writer::from_path(dir.join(name)).unwrap();
        for r in &rows {
            w.serialize(r).unwrap();
        }
        w.flush().unwrap();
    }

    #[test]
    fn test_component_from_filename() {
        assert_eq!(
            component_from_filename(
                "KingbaseES_kbbench_results_20250101_000000.csv",
                "_kbbench_results_",
                "fallback"
            ),
            "KingbaseES"
        );
        assert_eq!(
            component_from_filename("results.csv", "_kbbench_results_", "KingbaseES"),
            "KingbaseES"
        );
    }

    #[test]
    fn test_find_latest_csv_matches_glob() {
        let dir = tempfile::tempdir().unwrap();
        write_db_file(dir.path(), "A_kbbench_results_1.csv", &[Some(100.0)]);
        write_db_file(dir.path(), "unrelated.txt.csv", &[Some(100.0)]);
        let found = find_latest_csv(dir.path(), "*_kbbench_results_*.csv").unwrap();
        assert!(found
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("_kbbench_results_"));
    }

    #[test]
    fn test_collect_skips_bad_rows_without_aborting() {
        let data = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write_db_file(
            data.path(),
            "KingbaseES_kbbench_results_20250101_000000.csv",
            &[Some(2000.0), None, Some(1000.0)],
        );

        let report = collect(
            data.path(),
            out.path(),
            ResourceAssumptions::default(),
            "KingbaseES",
            "RabbitMQ",
        )
        .unwrap();

        assert_eq!(report.metrics.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.outputs.len(), 1);
        assert_eq!(report.summaries.len(), 1);

        // Written file reads back as the same metrics.
        let reloaded = load_normalized(out.path()).unwrap();
        assert_eq!(reloaded.len(), 2);
    }
}
