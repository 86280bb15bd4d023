// src/stability.rs
//
// Dual stability criterion for trial classification.
//
// A trial is stable iff BOTH hold:
//   achieved_rate / target_rate >= success_ratio
//   worst_p95_ms <= p95_limit_ms
//
// This is a logical AND, not a weighted score: a high-throughput trial with
// excessive tail latency is unstable, and a low-latency trial that cannot
// sustain the requested rate is unstable. Reported numbers are trusted
// verbatim; the evaluator never re-derives them.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::trial::TrialResult;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct StabilityPolicy {
    /// Minimum achieved/target rate ratio
    #[serde(default = "default_success_ratio")]
    pub success_ratio: f64,

    /// Worst per-second p95 latency (ms) a stable trial may exhibit
    #[serde(default = "default_p95_limit_ms")]
    pub p95_limit_ms: i64,
}

fn default_success_ratio() -> f64 {
    crate::constants::DEFAULT_SUCCESS_RATIO
}

fn default_p95_limit_ms() -> i64 {
    crate::constants::DEFAULT_P95_LIMIT_MS
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        StabilityPolicy {
            success_ratio: crate::constants::DEFAULT_SUCCESS_RATIO,
            p95_limit_ms: crate::constants::DEFAULT_P95_LIMIT_MS,
        }
    }
}

/// Outcome of evaluating one trial against a policy.
#[derive(Debug, Clone, PartialEq)]
pub enum Stability {
    Stable,
    /// Violation tags, e.g. ["ratio_below_0.95", "p95_over_2000ms"]
    Unstable(Vec<String>),
}

impl Stability {
    pub fn is_stable(&self) -> bool {
        matches!(self, Stability::Stable)
    }

    /// Semicolon-joined violation tags for the result record's note field.
    pub fn note(&self) -> String {
        match self {
            Stability::Stable => String::new(),
            Stability::Unstable(tags) => tags.join(";"),
        }
    }
}

impl StabilityPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.success_ratio <= 0.0 || self.success_ratio > 1.0 {
            bail!(
                "stability.success_ratio must be in (0, 1] (got {})",
                self.success_ratio
            );
        }
        if self.p95_limit_ms <= 0 {
            bail!(
                "stability.p95_limit_ms must be > 0 (got {})",
                self.p95_limit_ms
            );
        }
        Ok(())
    }

    /// Classify a trial. The caller must have rejected target_rate == 0
    /// before the trial ran; this function requires a positive target.
    ///
    /// A trial that produced no send data at all is unstable with the
    /// `no_data` tag. A worst_p95 of -1 (no latency data in any row) passes
    /// the latency check; the rate check still applies.
    pub fn evaluate(&self, result: &TrialResult) -> Stability {
        debug_assert!(result.target_rate_msg_s > 0, "target_rate must be positive");

        let mut tags = Vec::new();

        if result.avg_sent_msg_s <= 0.0 {
            tags.push("no_data".to_string());
        } else {
            let ratio = result.avg_received_msg_s / result.target_rate_msg_s as f64;
            if ratio < self.success_ratio {
                tags.push(format!("ratio_below_{}", self.success_ratio));
            }
            if result.worst_p95_ms >= 0 && result.worst_p95_ms > self.p95_limit_ms {
                tags.push(format!("p95_over_{}ms", self.p95_limit_ms));
            }
        }

        if tags.is_empty() {
            Stability::Stable
        } else {
            Stability::Unstable(tags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(target: u64, sent: f64, recv: f64, p95: i64) -> TrialResult {
        TrialResult {
            run_id: "t".to_string(),
            target_rate_msg_s: target,
            avg_sent_msg_s: sent,
            avg_received_msg_s: recv,
            worst_p95_ms: p95,
            success: false,
            note: String::new(),
            duration_s: 15,
            producers: 4,
            consumers: 4,
            size_bytes: 1024,
            queue: "q".to_string(),
            return_code: 0,
            error: None,
        }
    }

    fn policy() -> StabilityPolicy {
        StabilityPolicy {
            success_ratio: 0.95,
            p95_limit_ms: 2000,
        }
    }

    #[test]
    fn test_stable_when_both_criteria_hold() {
        let s = policy().evaluate(&result(1000, 1000.0, 980.0, 800));
        assert!(s.is_stable());
        assert_eq!(s.note(), "");
    }

    #[test]
    fn test_unstable_on_low_ratio() {
        let s = policy().evaluate(&result(2000, 2000.0, 1600.0, 800));
        assert!(!s.is_stable());
        assert_eq!(s.note(), "ratio_below_0.95");
    }

    #[test]
    fn test_unstable_on_high_p95() {
        let s = policy().evaluate(&result(1000, 1000.0, 990.0, 2500));
        assert!(!s.is_stable());
        assert_eq!(s.note(), "p95_over_2000ms");
    }

    #[test]
    fn test_both_violations_recorded() {
        let s = policy().evaluate(&result(2000, 2000.0, 1000.0, 9000));
        assert_eq!(s.note(), "ratio_below_0.95;p95_over_2000ms");
    }

    #[test]
    fn test_no_data_is_unstable() {
        let s = policy().evaluate(&result(1000, 0.0, 0.0, -1));
        assert!(!s.is_stable());
        assert_eq!(s.note(), "no_data");
    }

    #[test]
    fn test_unknown_p95_passes_latency_check() {
        let s = policy().evaluate(&result(1000, 1000.0, 990.0, -1));
        assert!(s.is_stable());
    }

    #[test]
    fn test_policy_validation() {
        assert!(policy().validate().is_ok());
        assert!(StabilityPolicy { success_ratio: 0.0, p95_limit_ms: 2000 }.validate().is_err());
        assert!(StabilityPolicy { success_ratio: 1.5, p95_limit_ms: 2000 }.validate().is_err());
        assert!(StabilityPolicy { success_ratio: 0.95, p95_limit_ms: 0 }.validate().is_err());
    }
}
