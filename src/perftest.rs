// src/perftest.rs
//
// Broker trial driver: runs the perf-test load generator as a child
// process, streams its compact-format stdout, and aggregates the
// per-second rows into one TrialResult.
//
// The driver owns process lifecycle and parsing only. Stability
// classification and rate decisions stay with the probe controller.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::ProbeConfig;
use crate::parse::{aggregate_timeseries, parse_compact_line};
use crate::trial::{TimeseriesRow, TrialMeasurement, TrialRequest, TrialResult, TrialRunner};

/// Drives perf-test.jar. One instance serves a whole search; each
/// run_trial call spawns a fresh child process.
pub struct PerfTestRunner {
    jar: String,
    uri: String,
    java_opts: String,
    /// Echo the child's raw output lines at trace level
    stream_output: bool,
}

impl PerfTestRunner {
    pub fn new(config: &ProbeConfig) -> Self {
        PerfTestRunner {
            jar: config.jar.clone(),
            uri: config.uri.clone(),
            java_opts: config.java_opts.clone(),
            stream_output: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.stream_output = false;
        self
    }

    fn build_command(&self, req: &TrialRequest) -> Command {
        let mut cmd = Command::new("java");
        for opt in self.java_opts.split_whitespace() {
            cmd.arg(opt);
        }
        cmd.arg("-jar")
            .arg(&self.jar)
            .arg("--uri")
            .arg(&self.uri)
            .arg("--metrics-format")
            .arg("compact")
            .arg("--rate")
            .arg(req.target_rate.to_string())
            .arg("-x")
            .arg(req.producers.to_string())
            .arg("-y")
            .arg(req.consumers.to_string())
            .arg("-s")
            .arg(req.size_bytes.to_string())
            .arg("-u")
            .arg(&req.queue)
            .arg("-z")
            .arg(req.duration.as_secs().to_string())
            .arg("--id")
            .arg(&req.run_id);
        // Child diagnostics go straight to our stderr; only stdout is parsed.
        cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl TrialRunner for PerfTestRunner {
    async fn run_trial(&self, req: &TrialRequest) -> Result<TrialMeasurement> {
        let mut cmd = self.build_command(req);
        debug!(run_id = %req.run_id, rate = req.target_rate, "spawning perf-test");

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn perf-test for {}", req.run_id))?;

        let stdout = child
            .stdout
            .take()
            .context("Failed to capture perf-test stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        let mut rows: Vec<TimeseriesRow> = Vec::new();
        while let Some(line) = lines
            .next_line()
            .await
            .context("Failed to read perf-test output")?
        {
            if self.stream_output {
                trace!("{line}");
            }
            if let Some(row) = parse_compact_line(&line) {
                rows.push(row);
            }
        }

        let status = child.wait().await.context("Failed to wait for perf-test")?;
        let return_code = status.code().unwrap_or(-1);

        if !status.success() && rows.is_empty() {
            bail!(
                "perf-test exited with code {} and produced no parsable output",
                return_code
            );
        }

        let (avg_sent, avg_recv, worst_p95) = aggregate_timeseries(&rows);

        let result = TrialResult {
            run_id: req.run_id.clone(),
            target_rate_msg_s: req.target_rate,
            avg_sent_msg_s: avg_sent,
            avg_received_msg_s: avg_recv,
            worst_p95_ms: worst_p95,
            // The probe controller's stability evaluation fills these in.
            success: false,
            note: String::new(),
            duration_s: req.duration.as_secs(),
            producers: req.producers,
            consumers: req.consumers,
            size_bytes: req.size_bytes,
            queue: req.queue.clone(),
            return_code,
            error: None,
        };

        Ok(TrialMeasurement {
            result,
            timeseries: rows,
        })
    }
}
