// src/kbbench.rs
//
// DB trial driver: executes the kbbench benchmark (pgbench-compatible)
// inside a container via `docker exec` and parses TPS, average latency,
// and processed-transaction count from its report.
//
// Credentials reach the container through environment variables and a
// generated ~/.pgpass line, so no interactive password prompt can stall a
// run. A concurrency sweep iterates client counts, repeating each point
// and cooling down between runs; failures are recorded in the row and the
// sweep continues.

use anyhow::{Context, Result};
use chrono::Local;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SweepConfig;
use crate::constants::MAX_ERROR_DETAIL_BYTES;
use crate::parse::{parse_latency_avg, parse_tps, parse_tx_processed};
use crate::trial::DbTrialRecord;

pub struct KbbenchRunner {
    config: SweepConfig,
}

impl KbbenchRunner {
    pub fn new(config: SweepConfig) -> Result<Self> {
        config.validate()?;
        Ok(KbbenchRunner { config })
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Run kbbench once at the given client count. Returns the exit code
    /// and combined output; parsing happens in `record_from_output`.
    pub async fn run_once(&self, clients: u32) -> Result<(i32, String)> {
        let c = &self.config;

        let kb_cmd = self.kbbench_argv(clients).join(" ");

        // host:port:db:user:password for libpq; '*' matches any port.
        let port_field = c
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "*".to_string());
        let pgpass_line = format!("{}:{}:{}:{}:{}", c.host, port_field, c.db, c.user, c.password);

        let host_opt = format!("-H {}", sh_quote(&c.host));
        let port_opt = c.port.map(|p| format!("-P {p}")).unwrap_or_default();
        let script = format!(
            "set -euo pipefail\n\
             umask 077\n\
             printf \"%s\\n\" \"$PGPASSLINE\" > \"$HOME/.pgpass\"\n\
             chmod 600 \"$HOME/.pgpass\"\n\
             if command -v sys_encpwd >/dev/null 2>&1; then\n\
                 sys_encpwd {host_opt} {port_opt} -D {db} -U {user} -W {password} >/dev/null 2>&1 || true\n\
             fi\n\
             exec {kb_cmd}\n",
            db = sh_quote(&c.db),
            user = sh_quote(&c.user),
            password = sh_quote(&c.password),
        );

        let mut cmd = Command::new("docker");
        cmd.arg("exec")
            .arg("-e")
            .arg(format!("PGPASSWORD={}", c.password))
            .arg("-e")
            .arg(format!("KINGBASE_PASSWORD={}", c.password))
            .arg("-e")
            .arg(format!("PGPASSLINE={pgpass_line}"))
            .arg(&c.container)
            .arg("bash")
            .arg("-lc")
            .arg(script)
            .kill_on_drop(true);

        debug!(clients, container = %c.container, "running kbbench");

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to exec kbbench in container {}", c.container))?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code().unwrap_or(-1), text))
    }

    fn kbbench_argv(&self, clients: u32) -> Vec<String> {
        let c = &self.config;
        let mut argv = vec![
            "kbbench".to_string(),
            "-h".to_string(),
            sh_quote(&c.host),
            "-M".to_string(),
            "extended".to_string(),
            "-c".to_string(),
            clients.to_string(),
            "-j".to_string(),
            c.jobs.to_string(),
            "-T".to_string(),
            c.duration.as_secs().to_string(),
            "-P".to_string(),
            c.progress.to_string(),
            "-d".to_string(),
            sh_quote(&c.db),
            "-U".to_string(),
            sh_quote(&c.user),
            "-r".to_string(),
        ];
        if let Some(port) = c.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        argv
    }

    /// Build the persisted row for one run from its raw output. A failed
    /// run keeps truncated output as its error detail.
    pub fn record_from_output(&self, clients: u32, return_code: i32, output: &str) -> DbTrialRecord {
        let (tps_including, tps_excluding) = parse_tps(output);
        DbTrialRecord {
            timestamp: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            clients,
            jobs: self.config.jobs,
            duration_s: self.config.duration.as_secs(),
            tps_including,
            tps_excluding,
            latency_ms_avg: parse_latency_avg(output),
            tx_processed: parse_tx_processed(output),
            return_code,
            error: if return_code == 0 {
                None
            } else {
                Some(truncate_detail(output))
            },
        }
    }

    /// Sweep the configured client counts, invoking `on_record` after each
    /// run so records can be persisted incrementally. A run that fails at
    /// the infrastructure level is recorded and the sweep continues.
    pub async fn run_sweep<F>(&self, mut on_record: F) -> Result<Vec<DbTrialRecord>>
    where
        F: FnMut(&DbTrialRecord) -> Result<()>,
    {
        let clients = self.config.client_list();
        let repeats = self.config.repeats;
        let total = clients.len() as u64 * repeats as u64;
        let mut records = Vec::with_capacity(total as usize);

        for (ci, &c) in clients.iter().enumerate() {
            for round in 1..=repeats {
                info!(clients = c, round, repeats, "sweep run");
                let record = match self.run_once(c).await {
                    Ok((rc, output)) => {
                        if rc != 0 {
                            warn!(clients = c, rc, "kbbench exited non-zero");
                        }
                        self.record_from_output(c, rc, &output)
                    }
                    Err(err) => {
                        warn!(clients = c, error = %err, "kbbench invocation failed");
                        self.record_from_output(c, -1, &format!("{err:#}"))
                    }
                };
                on_record(&record)?;
                records.push(record);

                let is_last = ci == clients.len() - 1 && round == repeats;
                if !is_last && !self.config.cooldown.is_zero() {
                    tokio::time::sleep(self.config.cooldown).await;
                }
            }
        }
        Ok(records)
    }
}

fn truncate_detail(output: &str) -> String {
    if output.len() <= MAX_ERROR_DETAIL_BYTES {
        return output.to_string();
    }
    let mut end = MAX_ERROR_DETAIL_BYTES;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output[..end].to_string()
}

/// Single-quote a value for embedding in a bash -c script.
fn sh_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "_-./:".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("kbbenchdb"), "kbbenchdb");
        assert_eq!(sh_quote("127.0.0.1"), "127.0.0.1");
        assert_eq!(sh_quote("pa ss"), "'pa ss'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn test_record_from_failed_output_keeps_detail() {
        let runner = KbbenchRunner::new(SweepConfig::default()).unwrap();
        let rec = runner.record_from_output(8, 1, "connection to database failed");
        assert_eq!(rec.return_code, 1);
        assert_eq!(rec.tps_including, None);
        assert_eq!(rec.error.as_deref(), Some("connection to database failed"));
    }

    #[test]
    fn test_record_from_good_output() {
        let out = "latency average = 6.48 ms\n\
                   tps = 1234.56 (including connections establishing)\n\
                   tps = 1240.01 (excluding connections establishing)\n\
                   number of transactions actually processed: 74073\n";
        let runner = KbbenchRunner::new(SweepConfig::default()).unwrap();
        let rec = runner.record_from_output(8, 0, out);
        assert_eq!(rec.tps_including, Some(1234.56));
        assert_eq!(rec.tps_excluding, Some(1240.01));
        assert_eq!(rec.latency_ms_avg, Some(6.48));
        assert_eq!(rec.tx_processed, Some(74073));
        assert!(rec.error.is_none());
    }

    #[test]
    fn test_truncate_detail_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_DETAIL_BYTES);
        let truncated = truncate_detail(&long);
        assert!(truncated.len() <= MAX_ERROR_DETAIL_BYTES);
        assert!(long.len() > truncated.len());
    }
}
