// tests/probe_search_tests.rs
//
// State-machine tests for the max-stable-throughput search, driven by
// scripted in-memory trial runners. No external process is involved; the
// runners fabricate measurements whose stability the controller's own
// evaluator classifies.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use cap_bench::config::ProbeConfig;
use cap_bench::probe::{Diagnosis, ProbeController, ProbePhase, ProbeReport};
use cap_bench::stability::StabilityPolicy;
use cap_bench::trial::{TimeseriesRow, TrialMeasurement, TrialRequest, TrialResult, TrialRunner};

/// Stable iff the requested rate is at or below `max_stable`. Stable
/// trials achieve the full target under low latency; unstable ones lose
/// 20% of messages and blow the p95 ceiling.
struct ThresholdRunner {
    max_stable: u64,
    rates: Mutex<Vec<u64>>,
}

impl ThresholdRunner {
    fn new(max_stable: u64) -> Self {
        ThresholdRunner {
            max_stable,
            rates: Mutex::new(Vec::new()),
        }
    }

    fn rates(&self) -> Vec<u64> {
        self.rates.lock().unwrap().clone()
    }
}

fn measurement(req: &TrialRequest, recv_ratio: f64, p95_ms: i64) -> TrialMeasurement {
    let rate = req.target_rate as f64;
    let row = TimeseriesRow {
        time_s: 1.0,
        sent_msg_s: req.target_rate,
        received_msg_s: (rate * recv_ratio) as u64,
        p50_ms: p95_ms / 4,
        p95_ms,
        p99_ms: p95_ms * 2,
    };
    TrialMeasurement {
        result: TrialResult {
            run_id: req.run_id.clone(),
            target_rate_msg_s: req.target_rate,
            avg_sent_msg_s: rate,
            avg_received_msg_s: rate * recv_ratio,
            worst_p95_ms: p95_ms,
            success: false,
            note: String::new(),
            duration_s: req.duration.as_secs(),
            producers: req.producers,
            consumers: req.consumers,
            size_bytes: req.size_bytes,
            queue: req.queue.clone(),
            return_code: 0,
            error: None,
        },
        timeseries: vec![row],
    }
}

#[async_trait]
impl TrialRunner for ThresholdRunner {
    async fn run_trial(&self, req: &TrialRequest) -> Result<TrialMeasurement> {
        self.rates.lock().unwrap().push(req.target_rate);
        if req.target_rate <= self.max_stable {
            Ok(measurement(req, 1.0, 100))
        } else {
            Ok(measurement(req, 0.8, 2_500))
        }
    }
}

/// Fails at the infrastructure level for the listed rates, behaves like a
/// ThresholdRunner otherwise.
struct FlakyRunner {
    inner: ThresholdRunner,
    error_rates: Vec<u64>,
}

#[async_trait]
impl TrialRunner for FlakyRunner {
    async fn run_trial(&self, req: &TrialRequest) -> Result<TrialMeasurement> {
        if self.error_rates.contains(&req.target_rate) {
            self.inner.rates.lock().unwrap().push(req.target_rate);
            bail!("perf-test exited with code 137 and produced no parsable output");
        }
        self.inner.run_trial(req).await
    }
}

/// Never completes a trial; only useful for cancellation tests.
struct HangingRunner;

#[async_trait]
impl TrialRunner for HangingRunner {
    async fn run_trial(&self, _req: &TrialRequest) -> Result<TrialMeasurement> {
        tokio::time::sleep(Duration::from_secs(3_600)).await;
        bail!("unreachable");
    }
}

fn config(start: u64, growth: f64, max: u64) -> ProbeConfig {
    let mut cfg = ProbeConfig::default();
    cfg.start_rate = start;
    cfg.growth = growth;
    cfg.max_rate = max;
    cfg.duration = Duration::from_secs(1);
    cfg.stability = StabilityPolicy {
        success_ratio: 0.95,
        p95_limit_ms: 2_000,
    };
    cfg
}

/// Replay the recorded trials to reconstruct the bisection brackets, and
/// assert the invariants: lower stays stable, upper stays unstable, and
/// the width at least halves (within one rate unit) every iteration.
fn assert_bracket_narrowing(report: &ProbeReport) {
    let mut lower: Option<u64> = None;
    let mut upper: Option<u64> = None;
    let mut last_width: Option<u64> = None;

    for trial in &report.trials {
        if trial.run_id.contains("warmup") {
            continue;
        }
        let rate = trial.target_rate_msg_s;
        if trial.success {
            lower = Some(rate);
        } else if lower.is_some() {
            upper = Some(rate);
        }
        if let (Some(lo), Some(hi)) = (lower, upper) {
            assert!(lo < hi, "stable bound {lo} must stay below unstable bound {hi}");
            let width = hi - lo;
            if let Some(prev) = last_width {
                assert!(
                    width <= prev / 2 + 1,
                    "bracket width {width} did not halve from {prev}"
                );
            }
            last_width = Some(width);
        }
    }
}

#[tokio::test]
async fn scenario_ramp_then_bisect_converges_near_boundary() {
    let runner = ThresholdRunner::new(1_600);
    let controller = ProbeController::new(config(1_000, 2.0, 1_000_000), runner).unwrap();
    let report = controller.search().await;

    assert_eq!(report.phase, ProbePhase::Converged);
    assert_eq!(report.diagnosis, Diagnosis::Converged);
    assert!(!report.diagnosis.low_confidence());

    // Ramp brackets at (1000, 2000), bisection walks toward 1600.
    assert_eq!(report.trials[0].target_rate_msg_s, 1_000);
    assert!(report.trials[0].success);
    assert_eq!(report.trials[1].target_rate_msg_s, 2_000);
    assert!(!report.trials[1].success);
    assert_eq!(report.trials[2].target_rate_msg_s, 1_500);
    assert_eq!(report.trials[3].target_rate_msg_s, 1_750);

    let achieved = report.achieved_max_rate.unwrap();
    assert!(
        (1_500..=1_600).contains(&achieved),
        "estimate {achieved} should sit just under the 1600 boundary"
    );

    // Final bracket is within tolerance and correctly ordered.
    let (lo, hi) = (report.lower_bound.unwrap(), report.upper_bound.unwrap());
    assert_eq!(lo, achieved);
    assert!(lo < hi);
    assert!((hi - lo) as f64 / hi as f64 <= 0.02);

    assert_bracket_narrowing(&report);

    // Every trial produced per-second records.
    assert_eq!(report.timeseries.len(), report.trials.len());
}

#[tokio::test]
async fn scenario_unstable_start_rate_fails_immediately() {
    let runner = ThresholdRunner::new(0);
    let controller = ProbeController::new(config(1_000, 2.0, 1_000_000), runner).unwrap();
    let report = controller.search().await;

    assert_eq!(report.phase, ProbePhase::Failed);
    assert_eq!(report.diagnosis, Diagnosis::NoStableStartRate);
    assert_eq!(report.achieved_max_rate, None);
    assert_eq!(report.trials.len(), 1);
    assert!(!report.trials[0].success);
}

#[tokio::test]
async fn stable_at_ceiling_reports_ceiling_limited() {
    let runner = ThresholdRunner::new(u64::MAX);
    let controller = ProbeController::new(config(1_000, 2.0, 8_000), runner).unwrap();
    let report = controller.search().await;

    assert_eq!(report.phase, ProbePhase::Converged);
    assert_eq!(report.diagnosis, Diagnosis::CeilingLimited);
    assert!(report.diagnosis.low_confidence());
    assert_eq!(report.achieved_max_rate, Some(8_000));

    // Growth is clamped to the cap, so the cap itself was measured.
    let rates: Vec<u64> = report.trials.iter().map(|t| t.target_rate_msg_s).collect();
    assert_eq!(rates, vec![1_000, 2_000, 4_000, 8_000]);
}

#[tokio::test]
async fn unstable_at_clamped_ceiling_still_bisects() {
    let runner = ThresholdRunner::new(6_000);
    let controller = ProbeController::new(config(1_000, 2.0, 8_000), runner).unwrap();
    let report = controller.search().await;

    assert_eq!(report.diagnosis, Diagnosis::Converged);
    let achieved = report.achieved_max_rate.unwrap();
    assert!((5_900..=6_000).contains(&achieved), "got {achieved}");
    assert_bracket_narrowing(&report);
}

#[tokio::test]
async fn infrastructure_error_counts_as_unstable_and_search_continues() {
    let runner = FlakyRunner {
        inner: ThresholdRunner::new(u64::MAX),
        error_rates: vec![2_000],
    };
    let controller = ProbeController::new(config(1_000, 2.0, 1_000_000), runner).unwrap();
    let report = controller.search().await;

    // The errored trial at 2000 becomes the unstable upper bound; the
    // search bisects below it instead of aborting.
    assert_eq!(report.phase, ProbePhase::Converged);
    let errored = report
        .trials
        .iter()
        .find(|t| t.target_rate_msg_s == 2_000)
        .unwrap();
    assert!(!errored.success);
    assert_eq!(errored.note, "infrastructure_error");
    assert!(errored.error.as_deref().unwrap_or("").contains("code 137"));

    let achieved = report.achieved_max_rate.unwrap();
    assert!((1_900..=2_000).contains(&achieved), "got {achieved}");
}

#[tokio::test]
async fn error_on_first_trial_is_no_stable_start_rate() {
    let runner = FlakyRunner {
        inner: ThresholdRunner::new(u64::MAX),
        error_rates: vec![1_000],
    };
    let controller = ProbeController::new(config(1_000, 2.0, 1_000_000), runner).unwrap();
    let report = controller.search().await;

    assert_eq!(report.phase, ProbePhase::Failed);
    assert_eq!(report.diagnosis, Diagnosis::NoStableStartRate);
    assert!(report.trials[0].error.is_some());
}

#[tokio::test]
async fn exhausted_bisection_budget_reports_low_confidence() {
    let mut cfg = config(1_000, 2.0, 1_000_000);
    cfg.max_iterations = 1;
    let runner = ThresholdRunner::new(1_600);
    let controller = ProbeController::new(cfg, runner).unwrap();
    let report = controller.search().await;

    assert_eq!(report.phase, ProbePhase::Converged);
    assert_eq!(report.diagnosis, Diagnosis::ConvergenceExhausted);
    assert!(report.diagnosis.low_confidence());
    // Best bounds so far: one midpoint (1500) was trialed.
    assert_eq!(report.achieved_max_rate, Some(1_500));
    assert_eq!(report.lower_bound, Some(1_500));
    assert_eq!(report.upper_bound, Some(2_000));
}

#[tokio::test]
async fn cancellation_discards_in_flight_trial() {
    let (tx, rx) = tokio::sync::watch::channel(false);
    let controller = ProbeController::new(config(1_000, 2.0, 1_000_000), HangingRunner)
        .unwrap()
        .with_cancel(rx);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.send(true);
    });

    let report = controller.search().await;
    assert_eq!(report.phase, ProbePhase::Failed);
    assert_eq!(report.diagnosis, Diagnosis::Cancelled);
    assert_eq!(report.achieved_max_rate, None);
    // The in-flight trial never completed, so nothing was recorded.
    assert!(report.trials.is_empty());
}

#[tokio::test]
async fn warmup_trial_is_recorded_but_never_a_bound() {
    let mut cfg = config(1_000, 2.0, 1_000_000);
    cfg.warmup_rate = 500;
    let runner = ThresholdRunner::new(1_600);
    let controller = ProbeController::new(cfg, runner).unwrap();
    let report = controller.search().await;

    assert!(report.trials[0].run_id.contains("warmup"));
    assert_eq!(report.trials[0].target_rate_msg_s, 500);
    // Search still starts at start_rate, not above the warmup rate.
    assert_eq!(report.trials[1].target_rate_msg_s, 1_000);
    assert_eq!(report.diagnosis, Diagnosis::Converged);
}

#[tokio::test]
async fn growth_from_rate_one_cannot_stall() {
    let runner = ThresholdRunner::new(4);
    let controller = ProbeController::new(config(1, 1.5, 1_000_000), runner).unwrap();
    let report = controller.search().await;

    assert_eq!(report.phase, ProbePhase::Converged);
    assert_eq!(report.achieved_max_rate, Some(4));

    // Rates must be strictly increasing during the ramp.
    let rates = {
        let mut ramp = Vec::new();
        for t in &report.trials {
            ramp.push(t.target_rate_msg_s);
            if !t.success {
                break;
            }
        }
        ramp
    };
    for pair in rates.windows(2) {
        assert!(pair[1] > pair[0], "ramp stalled at {}", pair[0]);
    }
}

#[tokio::test]
async fn invalid_configuration_fails_before_any_trial() {
    let cfg = config(0, 2.0, 1_000_000);
    assert!(ProbeController::new(cfg, ThresholdRunner::new(100)).is_err());

    let cfg = config(1_000, 1.0, 1_000_000);
    assert!(ProbeController::new(cfg, ThresholdRunner::new(100)).is_err());

    let cfg = config(1_000, 2.0, 500);
    assert!(ProbeController::new(cfg, ThresholdRunner::new(100)).is_err());
}

#[tokio::test]
async fn searches_do_not_share_state() {
    // Two independent searches over different boundaries: each report
    // reflects only its own runner.
    let a = ProbeController::new(
        config(1_000, 2.0, 1_000_000),
        ThresholdRunner::new(1_600),
    )
    .unwrap();
    let b = ProbeController::new(
        config(1_000, 2.0, 1_000_000),
        ThresholdRunner::new(50_000),
    )
    .unwrap();

    let (ra, rb) = tokio::join!(a.search(), b.search());
    let got_a = ra.achieved_max_rate.unwrap();
    let got_b = rb.achieved_max_rate.unwrap();
    assert!(got_a <= 1_600);
    assert!(got_b > 40_000);
}
