// src/probe.rs
//
// Adaptive maximum-stable-throughput search.
//
// The controller drives a TrialRunner through two phases: an exponential
// ramp that brackets the stability boundary, then bisection that narrows
// the bracket until its relative width drops under the configured
// tolerance. Each decision depends on the previous trial's outcome, so the
// search is strictly sequential: one trial completes before the next rate
// is chosen. Concurrency inside a trial (producers/consumers) belongs to
// the runner and is opaque here.
//
// Every executed trial is recorded (summary plus per-second rows) and
// returned with the search outcome. A trial that fails at the
// infrastructure level counts as unstable but keeps its error detail.

use tokio::sync::watch;
use tracing::{debug, info, warn};

use anyhow::Result;

use crate::config::ProbeConfig;
use crate::trial::{TimeseriesRecord, TrialRequest, TrialResult, TrialRunner};

/// Search lifecycle. Converged and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    Init,
    ExponentialGrowth,
    Bisection,
    Converged,
    Failed,
}

impl ProbePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbePhase::Init => "init",
            ProbePhase::ExponentialGrowth => "exponential-growth",
            ProbePhase::Bisection => "bisection",
            ProbePhase::Converged => "converged",
            ProbePhase::Failed => "failed",
        }
    }
}

/// Why the search ended. Reported instead of a raw error so callers can
/// present a clear outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    /// Bracket narrowed under tolerance
    Converged,
    /// Still stable at the configured rate cap; the true maximum may be higher
    CeilingLimited,
    /// Bisection budget exhausted before tolerance; bounds are best-effort
    ConvergenceExhausted,
    /// The very first trial was already unstable
    NoStableStartRate,
    /// Aborted mid-search; the in-flight trial's partial result was discarded
    Cancelled,
}

impl Diagnosis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Diagnosis::Converged => "converged",
            Diagnosis::CeilingLimited => "ceiling-limited",
            Diagnosis::ConvergenceExhausted => "convergence-exhausted",
            Diagnosis::NoStableStartRate => "no-stable-start-rate",
            Diagnosis::Cancelled => "cancelled",
        }
    }

    /// Converged results are high-confidence; everything else is not.
    pub fn low_confidence(&self) -> bool {
        !matches!(self, Diagnosis::Converged)
    }
}

/// Final outcome of one search, with everything the caller needs to
/// persist: the estimate, the terminal phase and diagnosis, the final
/// bracket, and every recorded trial.
#[derive(Debug)]
pub struct ProbeReport {
    /// Highest rate the system sustained stably; None when no stable rate
    /// was ever observed
    pub achieved_max_rate: Option<u64>,
    pub phase: ProbePhase,
    pub diagnosis: Diagnosis,
    /// Last known stable rate
    pub lower_bound: Option<u64>,
    /// First known unstable rate
    pub upper_bound: Option<u64>,
    /// Midpoint trials executed during bisection
    pub bisection_iterations: u32,
    pub trials: Vec<TrialResult>,
    pub timeseries: Vec<TimeseriesRecord>,
}

enum TrialOutcome {
    Completed { stable: bool },
    Cancelled,
}

/// Resolves only on an actual cancel. A dropped sender means nobody can
/// cancel anymore, not that a cancel happened.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// The search state machine. One controller owns one search; nothing is
/// shared across concurrent searches.
pub struct ProbeController<R: TrialRunner> {
    config: ProbeConfig,
    runner: R,
    cancel: Option<watch::Receiver<bool>>,
    phase: ProbePhase,
    lower_bound: Option<u64>,
    upper_bound: Option<u64>,
    trials: Vec<TrialResult>,
    timeseries: Vec<TimeseriesRecord>,
}

impl<R: TrialRunner> ProbeController<R> {
    /// Fails fast on an invalid configuration; no trial is issued.
    pub fn new(config: ProbeConfig, runner: R) -> Result<Self> {
        config.validate()?;
        Ok(ProbeController {
            config,
            runner,
            cancel: None,
            phase: ProbePhase::Init,
            lower_bound: None,
            upper_bound: None,
            trials: Vec::new(),
            timeseries: Vec::new(),
        })
    }

    /// Attach a cancellation channel. When the value flips to true the
    /// in-flight trial is dropped and the search reports cancelled.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run the search to a terminal phase.
    pub async fn search(mut self) -> ProbeReport {
        if self.config.warmup_rate > 0 {
            let rate = self.config.warmup_rate;
            let run_id = format!("{}-warmup-{}", self.config.id_prefix, rate);
            info!(rate, "warmup trial");
            // Warmup is recorded but never used for bounds.
            if matches!(self.execute_trial(rate, run_id).await, TrialOutcome::Cancelled) {
                return self.finish_cancelled();
            }
        }

        self.phase = ProbePhase::ExponentialGrowth;
        let mut rate = self.config.start_rate;

        // Coarse phase: multiply the rate until the first unstable trial
        // brackets the boundary, or the cap itself proves stable.
        loop {
            let run_id = format!("{}-r{}", self.config.id_prefix, rate);
            match self.execute_trial(rate, run_id).await {
                TrialOutcome::Cancelled => return self.finish_cancelled(),
                TrialOutcome::Completed { stable: true } => {
                    self.lower_bound = Some(rate);
                    if rate >= self.config.max_rate {
                        info!(rate, "stable at rate cap");
                        let cap = self.config.max_rate;
                        return self.finish(
                            ProbePhase::Converged,
                            Diagnosis::CeilingLimited,
                            Some(cap),
                            0,
                        );
                    }
                    // Grow by at least one unit so rate=1 cannot stall, and
                    // clamp to the cap so a ceiling-limited result is always
                    // a measured rate.
                    let grown = (rate as f64 * self.config.growth).round() as u64;
                    rate = grown.max(rate + 1).min(self.config.max_rate);
                }
                TrialOutcome::Completed { stable: false } => {
                    if self.lower_bound.is_none() {
                        warn!(rate, "unstable at start rate");
                        return self.finish(
                            ProbePhase::Failed,
                            Diagnosis::NoStableStartRate,
                            None,
                            0,
                        );
                    }
                    self.upper_bound = Some(rate);
                    break;
                }
            }
        }

        // Refinement phase: trial the midpoint, tighten whichever bound
        // matches the outcome. lower stays stable, upper stays unstable.
        self.phase = ProbePhase::Bisection;
        let mut lower = self.lower_bound.unwrap_or(0);
        let mut upper = self.upper_bound.unwrap_or(lower + 1);
        let mut iterations = 0u32;
        let mut diagnosis = Diagnosis::Converged;

        while !self.within_tolerance(lower, upper) {
            if iterations >= self.config.max_iterations {
                warn!(lower, upper, iterations, "bisection budget exhausted");
                diagnosis = Diagnosis::ConvergenceExhausted;
                break;
            }
            let mid = lower + (upper - lower) / 2;
            if mid <= lower || mid >= upper {
                // Bracket is one rate unit wide; nothing left to trial.
                break;
            }
            let run_id = format!("{}-r{}", self.config.id_prefix, mid);
            match self.execute_trial(mid, run_id).await {
                TrialOutcome::Cancelled => return self.finish_cancelled(),
                TrialOutcome::Completed { stable } => {
                    if stable {
                        lower = mid;
                    } else {
                        upper = mid;
                    }
                }
            }
            iterations += 1;
            self.lower_bound = Some(lower);
            self.upper_bound = Some(upper);
        }

        self.lower_bound = Some(lower);
        self.upper_bound = Some(upper);
        info!(
            lower,
            upper,
            iterations,
            diagnosis = diagnosis.as_str(),
            "search finished"
        );
        self.finish(ProbePhase::Converged, diagnosis, Some(lower), iterations)
    }

    fn within_tolerance(&self, lower: u64, upper: u64) -> bool {
        if upper == 0 {
            return true;
        }
        (upper - lower) as f64 / upper as f64 <= self.config.tolerance
    }

    /// Run one trial, classify it, and record the result. An `Err` from the
    /// runner is mapped to an unstable result carrying the error detail;
    /// the search continues.
    async fn execute_trial(&mut self, rate: u64, run_id: String) -> TrialOutcome {
        let req = TrialRequest {
            run_id,
            target_rate: rate,
            duration: self.config.duration,
            producers: self.config.producers,
            consumers: self.config.consumers,
            size_bytes: self.config.size_bytes,
            queue: self.config.queue.clone(),
        };

        debug!(rate, run_id = %req.run_id, "issuing trial");

        let measured = match &mut self.cancel {
            Some(cancel) => {
                tokio::select! {
                    res = self.runner.run_trial(&req) => res,
                    _ = wait_cancelled(cancel) => {
                        warn!(rate, "search cancelled; discarding in-flight trial");
                        return TrialOutcome::Cancelled;
                    }
                }
            }
            None => self.runner.run_trial(&req).await,
        };

        let (mut result, rows) = match measured {
            Ok(m) => (m.result, m.timeseries),
            Err(err) => {
                warn!(rate, error = %err, "trial failed at infrastructure level; treating as unstable");
                (
                    TrialResult::infrastructure_failure(&req, -1, format!("{err:#}")),
                    Vec::new(),
                )
            }
        };

        let verdict = self.config.stability.evaluate(&result);
        result.success = verdict.is_stable();
        if result.note.is_empty() {
            result.note = verdict.note();
        }

        info!(
            rate,
            stable = result.success,
            avg_sent = result.avg_sent_msg_s,
            avg_received = result.avg_received_msg_s,
            worst_p95_ms = result.worst_p95_ms,
            note = %result.note,
            "trial complete"
        );

        for row in &rows {
            self.timeseries
                .push(TimeseriesRecord::from_row(&result.run_id, rate, row));
        }
        let stable = result.success;
        self.trials.push(result);
        TrialOutcome::Completed { stable }
    }

    fn finish_cancelled(self) -> ProbeReport {
        self.finish(ProbePhase::Failed, Diagnosis::Cancelled, None, 0)
    }

    fn finish(
        mut self,
        phase: ProbePhase,
        diagnosis: Diagnosis,
        achieved: Option<u64>,
        bisection_iterations: u32,
    ) -> ProbeReport {
        self.phase = phase;
        ProbeReport {
            achieved_max_rate: achieved,
            phase: self.phase,
            diagnosis,
            lower_bound: self.lower_bound,
            upper_bound: self.upper_bound,
            bisection_iterations,
            trials: self.trials,
            timeseries: self.timeseries,
        }
    }
}
