// src/extrapolate.rs
//
// Capacity extrapolation: project the resources a target SLO needs from
// measured per-unit rates.
//
// The model assumes near-linear scaling of throughput with the resource
// dimension used for normalization, and is only trustworthy within (or
// near) the measured operating range. No curve fitting happens here; a
// query beyond the highest measured rate is answered, but flagged as
// extrapolated rather than asserted.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::normalize::{ComponentKind, NormalizedMetric};

/// A target SLO: reach `target_rate` (TPS or msg/s, matching `kind`)
/// while staying under `max_latency_ms`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtrapolationQuery {
    pub kind: ComponentKind,
    pub target_rate: f64,
    pub max_latency_ms: f64,
}

impl ExtrapolationQuery {
    pub fn validate(&self) -> Result<()> {
        if self.target_rate <= 0.0 {
            bail!("target_rate must be > 0 (got {})", self.target_rate);
        }
        if self.max_latency_ms <= 0.0 {
            bail!("max_latency_ms must be > 0 (got {})", self.max_latency_ms);
        }
        Ok(())
    }
}

/// How much to trust a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    /// Target lies at or below the highest measured rate
    InRange,
    /// Target exceeds every measured operating point; linear scaling is
    /// assumed, not observed
    Extrapolated,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::InRange => "in-range",
            Confidence::Extrapolated => "extrapolated",
        }
    }
}

/// Projected resource requirement for one query, with the baseline
/// operating point the projection scaled from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtrapolationResult {
    pub component: String,
    pub component_type: String,
    pub target_rate: f64,
    pub max_latency_ms: f64,

    pub required_cpu_cores: u64,
    pub required_memory_gb: u64,
    /// Baseline latency scaled linearly to the target rate
    pub estimated_latency_ms: f64,
    /// True iff some measured operating point met the latency constraint
    pub feasible: bool,
    pub confidence: Confidence,

    pub baseline_rate_per_core: f64,
    pub baseline_rate_per_gb: f64,
    pub baseline_rate: f64,
    pub baseline_latency_ms: f64,
}

/// Project the resources needed to reach `query.target_rate`.
///
/// The baseline is the metric with the highest per-core rate among those
/// meeting the latency constraint. When no measured point meets it, the
/// result is infeasible but still carries a projection from the best
/// operating point overall, so the caller can see how far off it is.
pub fn extrapolate(
    metrics: &[NormalizedMetric],
    query: &ExtrapolationQuery,
) -> Result<ExtrapolationResult> {
    query.validate()?;

    let candidates: Vec<&NormalizedMetric> =
        metrics.iter().filter(|m| m.kind() == query.kind).collect();
    if candidates.is_empty() {
        bail!(
            "no normalized {} metrics to extrapolate from",
            query.kind.as_str()
        );
    }

    let within_latency: Vec<&NormalizedMetric> = candidates
        .iter()
        .copied()
        .filter(|m| m.latency_ms() <= query.max_latency_ms)
        .collect();
    let feasible = !within_latency.is_empty();

    let baseline: &NormalizedMetric = if feasible {
        best_per_core(within_latency.iter().copied())
    } else {
        best_per_core(candidates.iter().copied())
    };

    let per_core = baseline.rate_per_core();
    let per_gb = baseline.rate_per_gb_memory();
    if per_core <= 0.0 || per_gb <= 0.0 {
        bail!("baseline has non-positive per-unit rate");
    }

    let highest_measured = candidates
        .iter()
        .map(|m| m.rate())
        .fold(f64::NEG_INFINITY, f64::max);
    let confidence = if query.target_rate > highest_measured {
        Confidence::Extrapolated
    } else {
        Confidence::InRange
    };

    let required_cpu_cores = (query.target_rate / per_core).ceil() as u64;
    let required_memory_gb = (query.target_rate / per_gb).ceil() as u64;
    let estimated_latency_ms =
        baseline.latency_ms() * (query.target_rate / baseline.rate());

    Ok(ExtrapolationResult {
        component: baseline.component().to_string(),
        component_type: query.kind.as_str().to_string(),
        target_rate: query.target_rate,
        max_latency_ms: query.max_latency_ms,
        required_cpu_cores,
        required_memory_gb,
        estimated_latency_ms: (estimated_latency_ms * 100.0).round() / 100.0,
        feasible,
        confidence,
        baseline_rate_per_core: per_core,
        baseline_rate_per_gb: per_gb,
        baseline_rate: baseline.rate(),
        baseline_latency_ms: baseline.latency_ms(),
    })
}

fn best_per_core<'a>(iter: impl Iterator<Item = &'a NormalizedMetric>) -> &'a NormalizedMetric {
    iter.max_by(|a, b| a.rate_per_core().total_cmp(&b.rate_per_core()))
        .expect("caller guarantees a non-empty candidate set")
}
