// src/config.rs
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::stability::StabilityPolicy;

/// Probe configuration: adaptive max-stable-throughput search parameters
/// plus the fixed shape of every trial.
///
/// All fields have defaults, so a minimal YAML file only needs the values
/// being overridden. Passed explicitly into the probe controller; there is
/// no process-wide configuration state.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProbeConfig {
    /// AMQP URI the load generator connects to
    #[serde(default = "default_amqp_uri")]
    pub uri: String,

    /// Path to the perf-test jar
    #[serde(default = "default_jar")]
    pub jar: String,

    /// JVM options for the load generator process
    #[serde(default = "default_java_opts")]
    pub java_opts: String,

    /// Queue name trials publish to
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Concurrent producers per trial
    #[serde(default = "default_producers")]
    pub producers: u32,

    /// Concurrent consumers per trial
    #[serde(default = "default_consumers")]
    pub consumers: u32,

    /// Message payload size (bytes)
    #[serde(default = "default_size_bytes")]
    pub size_bytes: u64,

    /// Wall time per trial (e.g. "15s", "1m")
    #[serde(default = "default_trial_duration", with = "humantime_serde")]
    pub duration: std::time::Duration,

    /// Initial target rate (msg/s)
    #[serde(default = "default_start_rate")]
    pub start_rate: u64,

    /// Hard cap for the target rate (msg/s)
    #[serde(default = "default_max_rate")]
    pub max_rate: u64,

    /// Growth factor for the coarse exponential phase (> 1.0)
    #[serde(default = "default_growth")]
    pub growth: f64,

    /// Optional warmup rate (msg/s) run once before the search; 0 = skip
    #[serde(default)]
    pub warmup_rate: u64,

    /// Relative bracket width at which bisection stops
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// Maximum bisection trials before convergence-exhausted
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Prefix for run ids embedded in records
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,

    /// Component name embedded in output filenames
    #[serde(default = "default_mq_component")]
    pub component_name: String,

    /// Dual stability criterion for trial classification
    #[serde(default)]
    pub stability: StabilityPolicy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        // serde_yaml on an empty mapping fills every field from its default fn
        serde_yaml::from_str("{}").expect("default probe config")
    }
}

impl ProbeConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config {}", path.as_ref().display()))?;
        let cfg: ProbeConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.as_ref().display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fail fast on parameters the search cannot run with. Called before any
    /// trial is issued.
    pub fn validate(&self) -> Result<()> {
        if self.start_rate == 0 {
            bail!("start_rate must be > 0");
        }
        if self.max_rate < self.start_rate {
            bail!(
                "max_rate ({}) must be >= start_rate ({})",
                self.max_rate,
                self.start_rate
            );
        }
        if self.growth <= 1.0 {
            bail!("growth must be > 1.0 (got {})", self.growth);
        }
        if self.tolerance <= 0.0 || self.tolerance >= 1.0 {
            bail!("tolerance must be in (0, 1) (got {})", self.tolerance);
        }
        if self.max_iterations == 0 {
            bail!("max_iterations must be > 0");
        }
        if self.duration.is_zero() {
            bail!("trial duration must be non-zero");
        }
        if self.producers == 0 || self.consumers == 0 {
            bail!("producers and consumers must be > 0");
        }
        self.stability.validate()?;
        Ok(())
    }
}

/// DB concurrency sweep configuration: connection parameters for the
/// containerized benchmark plus the client counts to sweep over.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SweepConfig {
    /// Container the benchmark binary runs in
    #[serde(default = "default_container")]
    pub container: String,

    /// Database host as seen from inside the container
    #[serde(default = "default_db_host")]
    pub host: String,

    /// Database port; omit to let the client library pick
    #[serde(default)]
    pub port: Option<u16>,

    /// Database name
    #[serde(default = "default_db_name")]
    pub db: String,

    /// Database user
    #[serde(default = "default_db_user")]
    pub user: String,

    /// Database password, plumbed into the container via environment
    #[serde(default)]
    pub password: String,

    /// Benchmark worker threads (-j)
    #[serde(default = "default_jobs")]
    pub jobs: u32,

    /// Wall time per run (-T)
    #[serde(default = "default_db_duration", with = "humantime_serde")]
    pub duration: std::time::Duration,

    /// Progress print interval in seconds (-P)
    #[serde(default = "default_progress")]
    pub progress: u32,

    /// Explicit client counts to sweep, e.g. [4, 8, 16, 32].
    /// Takes priority over the range fields below.
    #[serde(default)]
    pub clients_seq: Vec<u32>,

    /// Range sweep start (inclusive)
    #[serde(default)]
    pub clients_start: Option<u32>,

    /// Range sweep end (inclusive)
    #[serde(default)]
    pub clients_end: Option<u32>,

    /// Range sweep step
    #[serde(default)]
    pub clients_step: Option<u32>,

    /// Single-run client count used when no sweep is configured
    #[serde(default = "default_clients")]
    pub clients: u32,

    /// Runs per client count
    #[serde(default = "default_repeats")]
    pub repeats: u32,

    /// Cooldown between consecutive runs
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: std::time::Duration,

    /// Component name embedded in output filenames
    #[serde(default = "default_db_component")]
    pub component_name: String,
}

impl Default for SweepConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default sweep config")
    }
}

impl SweepConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config {}", path.as_ref().display()))?;
        let cfg: SweepConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.as_ref().display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs == 0 {
            bail!("jobs must be > 0");
        }
        if self.repeats == 0 {
            bail!("repeats must be > 0");
        }
        if self.duration.is_zero() {
            bail!("run duration must be non-zero");
        }
        if let Some(step) = self.clients_step {
            if step == 0 {
                bail!("clients_step must be > 0");
            }
        }
        if self.clients_seq.iter().any(|&c| c == 0) {
            bail!("clients_seq entries must be > 0");
        }
        Ok(())
    }

    /// The client counts this sweep will run, in order. Falls back to a
    /// single run at `clients` when no sweep is configured.
    pub fn client_list(&self) -> Vec<u32> {
        if !self.clients_seq.is_empty() {
            return self.clients_seq.clone();
        }
        if let (Some(start), Some(end)) = (self.clients_start, self.clients_end) {
            let step = self.clients_step.unwrap_or(1).max(1);
            return (start..=end).step_by(step as usize).collect();
        }
        vec![self.clients]
    }
}

/// Hardware the measurements were taken on, plus the assumed per-core
/// capacity constants. The constants are heuristics; utilization derived
/// from them is an estimate of load against an assumed ceiling, not
/// measured CPU time.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct ResourceAssumptions {
    /// CPU cores of the measured environment
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,

    /// Memory (GB) of the measured environment
    #[serde(default = "default_memory_gb")]
    pub memory_gb: f64,

    /// Assumed max DB transactions/sec one core can sustain
    #[serde(default = "default_db_tps_per_core")]
    pub db_tps_per_core: f64,

    /// Assumed max broker messages/sec one core can sustain
    #[serde(default = "default_mq_msg_per_core")]
    pub mq_msg_per_core: f64,
}

impl Default for ResourceAssumptions {
    fn default() -> Self {
        ResourceAssumptions {
            cpu_cores: crate::constants::DEFAULT_CPU_CORES,
            memory_gb: crate::constants::DEFAULT_MEMORY_GB,
            db_tps_per_core: crate::constants::DEFAULT_DB_TPS_PER_CORE,
            mq_msg_per_core: crate::constants::DEFAULT_MQ_MSG_PER_CORE,
        }
    }
}

impl ResourceAssumptions {
    pub fn validate(&self) -> Result<()> {
        if self.cpu_cores == 0 {
            bail!("cpu_cores must be > 0");
        }
        if self.memory_gb <= 0.0 {
            bail!("memory_gb must be > 0");
        }
        if self.db_tps_per_core <= 0.0 || self.mq_msg_per_core <= 0.0 {
            bail!("assumed per-core capacities must be > 0");
        }
        Ok(())
    }
}

fn default_amqp_uri() -> String {
    crate::constants::DEFAULT_AMQP_URI.to_string()
}

fn default_jar() -> String {
    "perf-test.jar".to_string()
}

fn default_java_opts() -> String {
    crate::constants::DEFAULT_JAVA_OPTS.to_string()
}

fn default_queue() -> String {
    crate::constants::DEFAULT_QUEUE.to_string()
}

fn default_producers() -> u32 {
    crate::constants::DEFAULT_PRODUCERS
}

fn default_consumers() -> u32 {
    crate::constants::DEFAULT_CONSUMERS
}

fn default_size_bytes() -> u64 {
    crate::constants::DEFAULT_MESSAGE_SIZE
}

fn default_trial_duration() -> std::time::Duration {
    crate::constants::DEFAULT_TRIAL_DURATION
}

fn default_start_rate() -> u64 {
    crate::constants::DEFAULT_START_RATE
}

fn default_max_rate() -> u64 {
    crate::constants::DEFAULT_MAX_RATE
}

fn default_growth() -> f64 {
    crate::constants::DEFAULT_GROWTH_FACTOR
}

fn default_tolerance() -> f64 {
    crate::constants::DEFAULT_CONVERGENCE_TOLERANCE
}

fn default_max_iterations() -> u32 {
    crate::constants::DEFAULT_MAX_BISECTION_ITERATIONS
}

fn default_id_prefix() -> String {
    "auto".to_string()
}

fn default_mq_component() -> String {
    "RabbitMQ".to_string()
}

fn default_db_component() -> String {
    "KingbaseES".to_string()
}

fn default_container() -> String {
    crate::constants::DEFAULT_DB_CONTAINER.to_string()
}

fn default_db_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_name() -> String {
    "kbbenchdb".to_string()
}

fn default_db_user() -> String {
    "system".to_string()
}

fn default_jobs() -> u32 {
    crate::constants::DEFAULT_DB_JOBS
}

fn default_db_duration() -> std::time::Duration {
    crate::constants::DEFAULT_DB_DURATION
}

fn default_progress() -> u32 {
    crate::constants::DEFAULT_DB_PROGRESS_SECS
}

fn default_clients() -> u32 {
    crate::constants::DEFAULT_DB_CLIENTS
}

fn default_repeats() -> u32 {
    crate::constants::DEFAULT_SWEEP_REPEATS
}

fn default_cooldown() -> std::time::Duration {
    crate::constants::DEFAULT_SWEEP_COOLDOWN
}

fn default_cpu_cores() -> u32 {
    crate::constants::DEFAULT_CPU_CORES
}

fn default_memory_gb() -> f64 {
    crate::constants::DEFAULT_MEMORY_GB
}

fn default_db_tps_per_core() -> f64 {
    crate::constants::DEFAULT_DB_TPS_PER_CORE
}

fn default_mq_msg_per_core() -> f64 {
    crate::constants::DEFAULT_MQ_MSG_PER_CORE
}
