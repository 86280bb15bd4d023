// src/trial.rs
//
// Trial types shared by the probe controller and the trial drivers.
//
// A trial is one fixed-duration load run at a requested target rate. The
// driver that executes it (perf-test child process, or a scripted runner in
// tests) returns exactly one TrialResult per TrialRequest; the probe
// controller owns the result for the duration of the search and hands it
// off as a record afterwards.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One load trial to execute: target rate plus fixed run parameters.
/// Immutable once issued.
#[derive(Debug, Clone)]
pub struct TrialRequest {
    /// Identifier embedded in records and the load generator's output
    pub run_id: String,
    /// Requested publish rate (msg/s)
    pub target_rate: u64,
    /// Wall time the trial runs for
    pub duration: Duration,
    /// Concurrent producers
    pub producers: u32,
    /// Concurrent consumers
    pub consumers: u32,
    /// Message payload size (bytes)
    pub size_bytes: u64,
    /// Queue the load generator publishes to
    pub queue: String,
}

/// Aggregated outcome of one broker trial.
///
/// `worst_p95_ms` is -1 when no per-second row carried latency data.
/// `return_code` / `error` capture infrastructure-level failure detail;
/// such trials are treated as unstable by the search but are still recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub run_id: String,
    pub target_rate_msg_s: u64,
    pub avg_sent_msg_s: f64,
    pub avg_received_msg_s: f64,
    pub worst_p95_ms: i64,
    pub success: bool,
    /// Semicolon-joined violation tags, e.g. "ratio_below_0.95;p95_over_2000ms"
    pub note: String,
    pub duration_s: u64,
    pub producers: u32,
    pub consumers: u32,
    pub size_bytes: u64,
    pub queue: String,
    pub return_code: i32,
    pub error: Option<String>,
}

impl TrialResult {
    /// A result standing in for a trial that never produced measurements
    /// (spawn failure, non-zero exit with no parsable output, parse failure).
    pub fn infrastructure_failure(req: &TrialRequest, return_code: i32, detail: String) -> Self {
        TrialResult {
            run_id: req.run_id.clone(),
            target_rate_msg_s: req.target_rate,
            avg_sent_msg_s: 0.0,
            avg_received_msg_s: 0.0,
            worst_p95_ms: -1,
            success: false,
            note: "infrastructure_error".to_string(),
            duration_s: req.duration.as_secs(),
            producers: req.producers,
            consumers: req.consumers,
            size_bytes: req.size_bytes,
            queue: req.queue.clone(),
            return_code,
            error: Some(detail),
        }
    }
}

/// One per-second sample from the load generator's compact output.
/// Percentiles are -1 when the line carried no usable latency field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesRow {
    pub time_s: f64,
    pub sent_msg_s: u64,
    pub received_msg_s: u64,
    pub p50_ms: i64,
    pub p95_ms: i64,
    pub p99_ms: i64,
}

/// A TimeseriesRow tagged with the trial it came from, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeseriesRecord {
    pub run_id: String,
    pub target_rate_msg_s: u64,
    pub time_s: f64,
    pub sent_msg_s: u64,
    pub received_msg_s: u64,
    pub p50_ms: i64,
    pub p95_ms: i64,
    pub p99_ms: i64,
}

impl TimeseriesRecord {
    pub fn from_row(run_id: &str, target_rate: u64, row: &TimeseriesRow) -> Self {
        TimeseriesRecord {
            run_id: run_id.to_string(),
            target_rate_msg_s: target_rate,
            time_s: row.time_s,
            sent_msg_s: row.sent_msg_s,
            received_msg_s: row.received_msg_s,
            p50_ms: row.p50_ms,
            p95_ms: row.p95_ms,
            p99_ms: row.p99_ms,
        }
    }
}

/// Raw measurements a driver hands back before stability evaluation:
/// the aggregated trial result and the per-second rows behind it.
#[derive(Debug, Clone)]
pub struct TrialMeasurement {
    pub result: TrialResult,
    pub timeseries: Vec<TimeseriesRow>,
}

/// One row of a DB concurrency sweep, as persisted.
///
/// Parse fields are optional: a run whose output lacked a metric records
/// `None` there rather than failing the sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbTrialRecord {
    pub timestamp: String,
    pub clients: u32,
    pub jobs: u32,
    pub duration_s: u64,
    pub tps_including: Option<f64>,
    pub tps_excluding: Option<f64>,
    pub latency_ms_avg: Option<f64>,
    pub tx_processed: Option<u64>,
    pub return_code: i32,
    pub error: Option<String>,
}

/// Executes one load trial. Implementations own process lifecycle and
/// parsing; the probe controller owns only the search decision logic.
///
/// An `Err` from `run_trial` means the measurement itself failed at the
/// infrastructure level; the caller maps it to an unstable trial record
/// and continues the search.
#[async_trait]
pub trait TrialRunner: Send + Sync {
    async fn run_trial(&self, req: &TrialRequest) -> Result<TrialMeasurement>;
}
