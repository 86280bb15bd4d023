// src/normalize.rs
//
// Normalization: convert raw trial results into hardware-unit metrics.
//
// Every derived field is a pure function of (raw result, resource
// assumptions) — recomputing from identical inputs is bit-identical.
// cpu_utilization_pct is an estimate against an assumed per-core capacity
// ceiling, clamped to [0, 100]; it is not measured CPU time.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::ResourceAssumptions;
use crate::trial::{DbTrialRecord, TrialResult};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Which measured component a metric came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    Db,
    Mq,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Db => "DB",
            ComponentKind::Mq => "MQ",
        }
    }
}

/// Normalized metrics for one DB benchmark run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbNormalized {
    pub component: String,
    pub component_type: String,
    pub timestamp: String,
    pub clients: u32,
    pub jobs: u32,
    pub duration_s: u64,

    // raw
    pub tps: f64,
    pub latency_ms: f64,
    pub tx_processed: u64,

    // per-core
    pub tps_per_core: f64,
    // per-resource
    pub tps_per_client: f64,
    pub tps_per_job: f64,
    pub tps_per_gb_memory: f64,
    // per-transaction
    pub latency_per_tx_ms: f64,
    pub memory_per_tx_bytes: f64,
    // estimated, clamped to [0, 100]
    pub cpu_utilization_pct: f64,

    pub test_cpu_cores: u32,
    pub test_memory_gb: f64,
}

/// Normalized metrics for one broker trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqNormalized {
    pub component: String,
    pub component_type: String,
    pub run_id: String,
    pub target_rate_msg_s: u64,
    pub duration_s: u64,

    // raw
    pub avg_sent_msg_s: f64,
    pub avg_received_msg_s: f64,
    pub worst_p95_ms: i64,
    pub producers: u32,
    pub consumers: u32,
    pub size_bytes: u64,

    // per-core
    pub msg_per_sec_per_core: f64,
    // per-resource
    pub msg_per_sec_per_producer: f64,
    pub msg_per_sec_per_consumer: f64,
    pub msg_per_sec_per_gb_memory: f64,
    pub msg_per_sec_per_kb: f64,
    // per-message
    pub latency_per_msg_ms: f64,
    pub memory_per_msg_bytes: f64,
    // derived throughput, megabits/sec
    pub throughput_mbps: f64,
    // estimated, clamped to [0, 100]
    pub cpu_utilization_pct: f64,
    pub loss_ratio: f64,

    pub test_cpu_cores: u32,
    pub test_memory_gb: f64,
}

/// A normalized metric of either kind, with the accessors the
/// extrapolator and summaries need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NormalizedMetric {
    Db(DbNormalized),
    Mq(MqNormalized),
}

impl NormalizedMetric {
    pub fn kind(&self) -> ComponentKind {
        match self {
            NormalizedMetric::Db(_) => ComponentKind::Db,
            NormalizedMetric::Mq(_) => ComponentKind::Mq,
        }
    }

    pub fn component(&self) -> &str {
        match self {
            NormalizedMetric::Db(m) => &m.component,
            NormalizedMetric::Mq(m) => &m.component,
        }
    }

    /// Measured throughput in the component's native unit (TPS or msg/s).
    pub fn rate(&self) -> f64 {
        match self {
            NormalizedMetric::Db(m) => m.tps,
            NormalizedMetric::Mq(m) => m.avg_received_msg_s,
        }
    }

    /// The latency figure the SLO constraint compares against
    /// (avg tx latency for DB, worst p95 for MQ).
    pub fn latency_ms(&self) -> f64 {
        match self {
            NormalizedMetric::Db(m) => m.latency_ms,
            NormalizedMetric::Mq(m) => m.worst_p95_ms as f64,
        }
    }

    pub fn rate_per_core(&self) -> f64 {
        match self {
            NormalizedMetric::Db(m) => m.tps_per_core,
            NormalizedMetric::Mq(m) => m.msg_per_sec_per_core,
        }
    }

    pub fn rate_per_gb_memory(&self) -> f64 {
        match self {
            NormalizedMetric::Db(m) => m.tps_per_gb_memory,
            NormalizedMetric::Mq(m) => m.msg_per_sec_per_gb_memory,
        }
    }

    pub fn cpu_utilization_pct(&self) -> f64 {
        match self {
            NormalizedMetric::Db(m) => m.cpu_utilization_pct,
            NormalizedMetric::Mq(m) => m.cpu_utilization_pct,
        }
    }
}

/// A batch row that failed normalization, with its position and the reason.
/// One bad row never aborts the rest of a batch.
#[derive(Debug, Clone)]
pub struct SkippedRow {
    pub index: usize,
    pub reason: String,
}

/// Outcome of normalizing a batch: everything that normalized, plus the
/// rows that did not and why.
#[derive(Debug, Clone)]
pub struct BatchOutcome<T> {
    pub metrics: Vec<T>,
    pub skipped: Vec<SkippedRow>,
}

/// Pure transformation from raw results to normalized metrics under a
/// fixed set of resource assumptions.
pub struct NormalizationEngine {
    assumptions: ResourceAssumptions,
}

impl NormalizationEngine {
    pub fn new(assumptions: ResourceAssumptions) -> Result<Self> {
        assumptions.validate()?;
        Ok(NormalizationEngine { assumptions })
    }

    pub fn assumptions(&self) -> &ResourceAssumptions {
        &self.assumptions
    }

    /// Normalize one DB benchmark run. Rows without a usable TPS figure
    /// (missing, non-positive, or from a failed run) are rejected.
    pub fn normalize_db(&self, component: &str, rec: &DbTrialRecord) -> Result<DbNormalized> {
        if rec.return_code != 0 {
            bail!("run failed with return code {}", rec.return_code);
        }
        let tps = match rec.tps_including {
            Some(v) if v > 0.0 => v,
            Some(v) => bail!("non-positive tps_including ({v})"),
            None => bail!("missing tps_including"),
        };
        let latency_ms = rec.latency_ms_avg.unwrap_or(0.0);
        let a = &self.assumptions;

        let cores = a.cpu_cores as f64;
        let tps_per_core = tps / cores;
        let tps_per_client = if rec.clients > 0 { tps / rec.clients as f64 } else { 0.0 };
        let tps_per_job = if rec.jobs > 0 { tps / rec.jobs as f64 } else { 0.0 };
        let tps_per_gb = tps / a.memory_gb;

        // Rough working-set estimate: ~30% of memory serving a minute of
        // transactions.
        let memory_per_tx = (a.memory_gb * BYTES_PER_GB * 0.3) / (tps * 60.0);

        let assumed_max_tps = a.db_tps_per_core * cores;
        let cpu_utilization = clamp_pct(tps / assumed_max_tps * 100.0);

        Ok(DbNormalized {
            component: component.to_string(),
            component_type: ComponentKind::Db.as_str().to_string(),
            timestamp: rec.timestamp.clone(),
            clients: rec.clients,
            jobs: rec.jobs,
            duration_s: rec.duration_s,
            tps,
            latency_ms,
            tx_processed: rec.tx_processed.unwrap_or(0),
            tps_per_core: round2(tps_per_core),
            tps_per_client: round2(tps_per_client),
            tps_per_job: round2(tps_per_job),
            tps_per_gb_memory: round2(tps_per_gb),
            latency_per_tx_ms: round2(latency_ms),
            memory_per_tx_bytes: round2(memory_per_tx),
            cpu_utilization_pct: round2(cpu_utilization),
            test_cpu_cores: a.cpu_cores,
            test_memory_gb: a.memory_gb,
        })
    }

    /// Normalize one broker trial. Only stable trials with a positive
    /// received rate are usable baselines.
    pub fn normalize_mq(&self, component: &str, res: &TrialResult) -> Result<MqNormalized> {
        if !res.success {
            bail!("unstable trial ({})", if res.note.is_empty() { "no note" } else { &res.note });
        }
        if res.avg_received_msg_s <= 0.0 {
            bail!("non-positive received rate ({})", res.avg_received_msg_s);
        }
        let a = &self.assumptions;
        let recv = res.avg_received_msg_s;

        let cores = a.cpu_cores as f64;
        let per_core = recv / cores;
        let per_producer = if res.producers > 0 { recv / res.producers as f64 } else { 0.0 };
        let per_consumer = if res.consumers > 0 { recv / res.consumers as f64 } else { 0.0 };
        let per_gb = recv / a.memory_gb;
        let per_kb = if res.size_bytes > 0 {
            recv / (res.size_bytes as f64 / 1024.0)
        } else {
            0.0
        };

        // Payload plus broker bookkeeping overhead.
        let memory_per_msg = res.size_bytes as f64 * 1.5;

        let throughput_mbps = recv * res.size_bytes as f64 * 8.0 / 1e6;

        let assumed_max_msg = a.mq_msg_per_core * cores;
        let cpu_utilization = clamp_pct(recv / assumed_max_msg * 100.0);

        let loss_ratio = if res.avg_sent_msg_s > 0.0 {
            1.0 - recv / res.avg_sent_msg_s
        } else {
            0.0
        };

        Ok(MqNormalized {
            component: component.to_string(),
            component_type: ComponentKind::Mq.as_str().to_string(),
            run_id: res.run_id.clone(),
            target_rate_msg_s: res.target_rate_msg_s,
            duration_s: res.duration_s,
            avg_sent_msg_s: res.avg_sent_msg_s,
            avg_received_msg_s: recv,
            worst_p95_ms: res.worst_p95_ms,
            producers: res.producers,
            consumers: res.consumers,
            size_bytes: res.size_bytes,
            msg_per_sec_per_core: round2(per_core),
            msg_per_sec_per_producer: round2(per_producer),
            msg_per_sec_per_consumer: round2(per_consumer),
            msg_per_sec_per_gb_memory: round2(per_gb),
            msg_per_sec_per_kb: round2(per_kb),
            latency_per_msg_ms: round2(res.worst_p95_ms as f64),
            memory_per_msg_bytes: round2(memory_per_msg),
            throughput_mbps: round2(throughput_mbps),
            cpu_utilization_pct: round2(cpu_utilization),
            loss_ratio: round4(loss_ratio),
            test_cpu_cores: a.cpu_cores,
            test_memory_gb: a.memory_gb,
        })
    }

    /// Normalize every row independently; bad rows are skipped with a
    /// reason, never aborting the batch.
    pub fn normalize_db_batch(
        &self,
        component: &str,
        rows: &[DbTrialRecord],
    ) -> BatchOutcome<DbNormalized> {
        let mut metrics = Vec::new();
        let mut skipped = Vec::new();
        for (index, rec) in rows.iter().enumerate() {
            match self.normalize_db(component, rec) {
                Ok(m) => metrics.push(m),
                Err(e) => skipped.push(SkippedRow { index, reason: e.to_string() }),
            }
        }
        BatchOutcome { metrics, skipped }
    }

    /// Batch variant for broker trial summaries.
    pub fn normalize_mq_batch(
        &self,
        component: &str,
        rows: &[TrialResult],
    ) -> BatchOutcome<MqNormalized> {
        let mut metrics = Vec::new();
        let mut skipped = Vec::new();
        for (index, res) in rows.iter().enumerate() {
            match self.normalize_mq(component, res) {
                Ok(m) => metrics.push(m),
                Err(e) => skipped.push(SkippedRow { index, reason: e.to_string() }),
            }
        }
        BatchOutcome { metrics, skipped }
    }
}

/// Mean/median/min/max over one derived field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldStats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

/// None for an empty slice.
pub fn field_stats(values: &[f64]) -> Option<FieldStats> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };
    Some(FieldStats {
        mean: values.iter().sum::<f64>() / n as f64,
        median,
        min: sorted[0],
        max: sorted[n - 1],
    })
}

/// Aggregate statistics for one (component, kind) group.
#[derive(Debug, Clone)]
pub struct ComponentSummary {
    pub component: String,
    pub kind: ComponentKind,
    pub count: usize,
    pub rate_per_core: FieldStats,
    pub rate_per_gb_memory: FieldStats,
    pub latency_ms: FieldStats,
    pub cpu_utilization_pct: FieldStats,
    /// MQ only
    pub throughput_mbps: Option<FieldStats>,
    /// MQ only
    pub loss_ratio: Option<FieldStats>,
}

/// Aggregate a batch into per-component summaries. Inputs are read only;
/// no metric is mutated.
pub fn summarize(metrics: &[NormalizedMetric]) -> Vec<ComponentSummary> {
    let mut groups: Vec<(String, ComponentKind)> = Vec::new();
    for m in metrics {
        let key = (m.component().to_string(), m.kind());
        if !groups.contains(&key) {
            groups.push(key);
        }
    }

    groups
        .into_iter()
        .filter_map(|(component, kind)| {
            let members: Vec<&NormalizedMetric> = metrics
                .iter()
                .filter(|m| m.component() == component && m.kind() == kind)
                .collect();

            let per_core: Vec<f64> = members.iter().map(|m| m.rate_per_core()).collect();
            let per_gb: Vec<f64> = members.iter().map(|m| m.rate_per_gb_memory()).collect();
            let latency: Vec<f64> = members.iter().map(|m| m.latency_ms()).collect();
            let util: Vec<f64> = members.iter().map(|m| m.cpu_utilization_pct()).collect();

            let mbps: Vec<f64> = members
                .iter()
                .filter_map(|m| match m {
                    NormalizedMetric::Mq(q) => Some(q.throughput_mbps),
                    NormalizedMetric::Db(_) => None,
                })
                .collect();
            let loss: Vec<f64> = members
                .iter()
                .filter_map(|m| match m {
                    NormalizedMetric::Mq(q) => Some(q.loss_ratio),
                    NormalizedMetric::Db(_) => None,
                })
                .collect();

            Some(ComponentSummary {
                component,
                kind,
                count: members.len(),
                rate_per_core: field_stats(&per_core)?,
                rate_per_gb_memory: field_stats(&per_gb)?,
                latency_ms: field_stats(&latency)?,
                cpu_utilization_pct: field_stats(&util)?,
                throughput_mbps: field_stats(&mbps),
                loss_ratio: field_stats(&loss),
            })
        })
        .collect()
}

fn clamp_pct(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assumptions() -> ResourceAssumptions {
        ResourceAssumptions::default()
    }

    fn db_record(tps: f64) -> DbTrialRecord {
        DbTrialRecord {
            timestamp: "2025-01-01T00:00:00".to_string(),
            clients: 8,
            jobs: 4,
            duration_s: 60,
            tps_including: Some(tps),
            tps_excluding: Some(tps * 1.01),
            latency_ms_avg: Some(6.48),
            tx_processed: Some(74_073),
            return_code: 0,
            error: None,
        }
    }

    fn mq_result(recv: f64) -> TrialResult {
        TrialResult {
            run_id: "auto-r8000".to_string(),
            target_rate_msg_s: 8_000,
            avg_sent_msg_s: recv * 1.02,
            avg_received_msg_s: recv,
            worst_p95_ms: 120,
            success: true,
            note: String::new(),
            duration_s: 15,
            producers: 4,
            consumers: 4,
            size_bytes: 1_024,
            queue: "perf_queue".to_string(),
            return_code: 0,
            error: None,
        }
    }

    #[test]
    fn test_db_per_core_and_utilization_at_assumed_ceiling() {
        // tps_including=2000, 4 cores: 500 tps/core; utilization
        // min(100, 2000/(500*4)*100) = 100
        let engine = NormalizationEngine::new(assumptions()).unwrap();
        let m = engine.normalize_db("KingbaseES", &db_record(2_000.0)).unwrap();
        assert_eq!(m.tps_per_core, 500.0);
        assert_eq!(m.cpu_utilization_pct, 100.0);
        assert_eq!(m.tps_per_gb_memory, 500.0);
        assert_eq!(m.latency_per_tx_ms, 6.48);
    }

    #[test]
    fn test_utilization_clamped_to_100() {
        let engine = NormalizationEngine::new(assumptions()).unwrap();
        let m = engine.normalize_db("KingbaseES", &db_record(1_000_000.0)).unwrap();
        assert!(m.cpu_utilization_pct >= 0.0 && m.cpu_utilization_pct <= 100.0);
        assert_eq!(m.cpu_utilization_pct, 100.0);

        let q = engine.normalize_mq("RabbitMQ", &mq_result(10_000_000.0)).unwrap();
        assert!(q.cpu_utilization_pct >= 0.0 && q.cpu_utilization_pct <= 100.0);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let engine = NormalizationEngine::new(assumptions()).unwrap();
        let rec = db_record(1_234.5);
        let a = engine.normalize_db("KingbaseES", &rec).unwrap();
        let b = engine.normalize_db("KingbaseES", &rec).unwrap();
        assert_eq!(a, b);

        let res = mq_result(43_210.9);
        let x = engine.normalize_mq("RabbitMQ", &res).unwrap();
        let y = engine.normalize_mq("RabbitMQ", &res).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_mq_derived_fields() {
        let engine = NormalizationEngine::new(assumptions()).unwrap();
        let m = engine.normalize_mq("RabbitMQ", &mq_result(20_000.0)).unwrap();
        assert_eq!(m.msg_per_sec_per_core, 5_000.0);
        assert_eq!(m.msg_per_sec_per_gb_memory, 5_000.0);
        // 20000 msg/s * 1024 B * 8 / 1e6 = 163.84 Mbps
        assert_eq!(m.throughput_mbps, 163.84);
        // 20000 / (10000 * 4) * 100 = 50%
        assert_eq!(m.cpu_utilization_pct, 50.0);
        assert!((m.loss_ratio - round4(1.0 - 1.0 / 1.02)).abs() < 1e-12);
    }

    #[test]
    fn test_db_batch_skips_bad_rows() {
        let engine = NormalizationEngine::new(assumptions()).unwrap();
        let mut failed = db_record(1_000.0);
        failed.return_code = 1;
        let mut missing = db_record(1_000.0);
        missing.tps_including = None;

        let rows = vec![db_record(1_000.0), failed, missing, db_record(2_000.0)];
        let out = engine.normalize_db_batch("KingbaseES", &rows);
        assert_eq!(out.metrics.len(), 2);
        assert_eq!(out.skipped.len(), 2);
        assert_eq!(out.skipped[0].index, 1);
        assert_eq!(out.skipped[1].index, 2);
    }

    #[test]
    fn test_mq_batch_skips_unstable() {
        let engine = NormalizationEngine::new(assumptions()).unwrap();
        let mut unstable = mq_result(5_000.0);
        unstable.success = false;
        unstable.note = "ratio_below_0.95".to_string();

        let out = engine.normalize_mq_batch("RabbitMQ", &[mq_result(5_000.0), unstable]);
        assert_eq!(out.metrics.len(), 1);
        assert_eq!(out.skipped.len(), 1);
        assert!(out.skipped[0].reason.contains("unstable"));
    }

    #[test]
    fn test_engine_rejects_bad_assumptions() {
        let mut a = assumptions();
        a.cpu_cores = 0;
        assert!(NormalizationEngine::new(a).is_err());

        let mut b = assumptions();
        b.memory_gb = 0.0;
        assert!(NormalizationEngine::new(b).is_err());
    }

    #[test]
    fn test_field_stats() {
        let s = field_stats(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(s.mean, 2.5);
        assert_eq!(s.median, 2.5);
        assert_eq!(s.min, 1.0);
        assert_eq!(s.max, 4.0);
        assert!(field_stats(&[]).is_none());
    }

    #[test]
    fn test_summarize_groups_by_component() {
        let engine = NormalizationEngine::new(assumptions()).unwrap();
        let db = NormalizedMetric::Db(engine.normalize_db("KingbaseES", &db_record(2_000.0)).unwrap());
        let mq = NormalizedMetric::Mq(engine.normalize_mq("RabbitMQ", &mq_result(20_000.0)).unwrap());
        let metrics = vec![db, mq];

        let summaries = summarize(&metrics);
        assert_eq!(summaries.len(), 2);
        let db_sum = summaries.iter().find(|s| s.kind == ComponentKind::Db).unwrap();
        assert_eq!(db_sum.count, 1);
        assert_eq!(db_sum.rate_per_core.mean, 500.0);
        assert!(db_sum.throughput_mbps.is_none());
        let mq_sum = summaries.iter().find(|s| s.kind == ComponentKind::Mq).unwrap();
        assert!(mq_sum.throughput_mbps.is_some());
    }
}
