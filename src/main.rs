// -----------------------------------------------------------------------------
// cap-bench - capacity benchmarking CLI: probe max stable throughput of
// DB/MQ components, normalize results to per-resource-unit metrics, and
// extrapolate the resources a target SLO needs
// -----------------------------------------------------------------------------

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::runtime::Builder as RtBuilder;
use tokio::sync::watch;
use tracing::info;

use cap_bench::collect::{collect, load_normalized};
use cap_bench::config::{ProbeConfig, ResourceAssumptions, SweepConfig};
use cap_bench::constants;
use cap_bench::csv_export;
use cap_bench::extrapolate::{extrapolate, ExtrapolationQuery, ExtrapolationResult};
use cap_bench::kbbench::KbbenchRunner;
use cap_bench::normalize::{ComponentKind, ComponentSummary};
use cap_bench::perftest::PerfTestRunner;
use cap_bench::probe::{ProbeController, ProbeReport};
use cap_bench::results_dir::ResultsDir;

// -----------------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------------
#[derive(Parser)]
#[command(
    name = "cap-bench",
    version,
    about = "Probe, normalize, and extrapolate DB/MQ capacity"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Find the broker's max stable throughput (exponential ramp + bisection)
    ///
    /// Examples:
    ///   cap-bench probe
    ///   cap-bench probe --config probe.yaml
    ///   cap-bench probe --config probe.yaml --results-name rmq-baseline
    Probe {
        /// YAML probe configuration; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory result CSVs land in
        #[arg(long, default_value = constants::DEFAULT_OUT_DIR)]
        out_dir: PathBuf,

        /// Create a structured results directory (capb-{date}-{name}/)
        /// under out_dir instead of writing flat files
        #[arg(long)]
        results_name: Option<String>,
    },
    /// Sweep DB benchmark concurrency and record one row per run
    ///
    /// Examples:
    ///   cap-bench sweep --config sweep.yaml
    ///   cap-bench sweep --config sweep.yaml --results-name kb-c4-32
    Sweep {
        /// YAML sweep configuration; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory result CSVs land in
        #[arg(long, default_value = constants::DEFAULT_OUT_DIR)]
        out_dir: PathBuf,

        /// Create a structured results directory under out_dir
        #[arg(long)]
        results_name: Option<String>,
    },
    /// Normalize the newest raw result files into per-unit metrics
    ///
    /// Examples:
    ///   cap-bench normalize
    ///   cap-bench normalize --data-dir datas --cpu-cores 8 --memory-gb 16
    Normalize {
        /// Directory holding raw result CSVs
        #[arg(long, default_value = constants::DEFAULT_OUT_DIR)]
        data_dir: PathBuf,

        /// Directory normalized CSVs land in
        #[arg(long, default_value = constants::DEFAULT_OUT_DIR)]
        out_dir: PathBuf,

        /// CPU cores of the measured environment
        #[arg(long, default_value_t = constants::DEFAULT_CPU_CORES)]
        cpu_cores: u32,

        /// Memory (GB) of the measured environment
        #[arg(long, default_value_t = constants::DEFAULT_MEMORY_GB)]
        memory_gb: f64,

        /// Assumed max DB TPS one core can sustain
        #[arg(long, default_value_t = constants::DEFAULT_DB_TPS_PER_CORE)]
        db_tps_per_core: f64,

        /// Assumed max broker msg/s one core can sustain
        #[arg(long, default_value_t = constants::DEFAULT_MQ_MSG_PER_CORE)]
        mq_msg_per_core: f64,

        /// DB component name when the filename carries no prefix
        #[arg(long, default_value = "KingbaseES")]
        db_component: String,

        /// MQ component name when the filename carries no prefix
        #[arg(long, default_value = "RabbitMQ")]
        mq_component: String,
    },
    /// Project resources needed for a target SLO from normalized metrics
    ///
    /// Examples:
    ///   cap-bench extrapolate --target-tps 10000 --max-latency-ms 50
    ///   cap-bench extrapolate --target-msg-per-sec 50000 --max-latency-ms 100
    Extrapolate {
        /// Directory holding normalized_db_*/normalized_mq_* CSVs
        #[arg(long, default_value = constants::DEFAULT_OUT_DIR)]
        data_dir: PathBuf,

        /// Directory the recommendation CSV lands in
        #[arg(long, default_value = constants::DEFAULT_OUT_DIR)]
        out_dir: PathBuf,

        /// Target database throughput (TPS)
        #[arg(long)]
        target_tps: Option<f64>,

        /// Target broker throughput (msg/s)
        #[arg(long)]
        target_msg_per_sec: Option<f64>,

        /// Latency ceiling for the SLO (ms)
        #[arg(long, default_value_t = 50.0)]
        max_latency_ms: f64,
    },
}

// -----------------------------------------------------------------------------
// main
// -----------------------------------------------------------------------------
fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::new(format!("cap_bench={level}"));
    fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Probe {
            config,
            out_dir,
            results_name,
        } => probe_cmd(config.as_deref(), &out_dir, results_name.as_deref()),
        Commands::Sweep {
            config,
            out_dir,
            results_name,
        } => sweep_cmd(config.as_deref(), &out_dir, results_name.as_deref()),
        Commands::Normalize {
            data_dir,
            out_dir,
            cpu_cores,
            memory_gb,
            db_tps_per_core,
            mq_msg_per_core,
            db_component,
            mq_component,
        } => normalize_cmd(
            &data_dir,
            &out_dir,
            ResourceAssumptions {
                cpu_cores,
                memory_gb,
                db_tps_per_core,
                mq_msg_per_core,
            },
            &db_component,
            &mq_component,
        ),
        Commands::Extrapolate {
            data_dir,
            out_dir,
            target_tps,
            target_msg_per_sec,
            max_latency_ms,
        } => extrapolate_cmd(
            &data_dir,
            &out_dir,
            target_tps,
            target_msg_per_sec,
            max_latency_ms,
        ),
    }
}

// -----------------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------------

fn probe_cmd(
    config_path: Option<&Path>,
    out_dir: &Path,
    results_name: Option<&str>,
) -> Result<()> {
    let config = match config_path {
        Some(p) => ProbeConfig::from_yaml_file(p)?,
        None => {
            let cfg = ProbeConfig::default();
            cfg.validate()?;
            cfg
        }
    };

    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        let start = Instant::now();
        let mut results = match results_name {
            Some(name) => Some(ResultsDir::create(config_path, Some(name), out_dir)?),
            None => None,
        };
        let target_dir = results
            .as_ref()
            .map(|r| r.path().to_path_buf())
            .unwrap_or_else(|| out_dir.to_path_buf());
        std::fs::create_dir_all(&target_dir)?;

        // Ctrl-C aborts the search; the in-flight trial is discarded and
        // everything recorded so far is still persisted.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = cancel_tx.send(true);
            }
        });

        let runner = PerfTestRunner::new(&config);
        let controller = ProbeController::new(config.clone(), runner)?.with_cancel(cancel_rx);
        let report = controller.search().await;

        let ts = csv_export::file_timestamp();
        let summary_path = csv_export::summary_path(&target_dir, &config.component_name, &ts);
        csv_export::write_trial_summaries(&summary_path, &report.trials)?;
        let timeseries_path =
            csv_export::timeseries_path(&target_dir, &config.component_name, &ts);
        csv_export::write_timeseries(&timeseries_path, &report.timeseries)?;

        print_probe_report(&report, &config);
        println!(
            "Records written to:\n  {}\n  {}",
            summary_path.display(),
            timeseries_path.display()
        );

        if let Some(dir) = results.as_mut() {
            dir.finalize(start.elapsed().as_secs_f64())?;
        }
        Ok(())
    })
}

fn sweep_cmd(
    config_path: Option<&Path>,
    out_dir: &Path,
    results_name: Option<&str>,
) -> Result<()> {
    let config = match config_path {
        Some(p) => SweepConfig::from_yaml_file(p)?,
        None => {
            let cfg = SweepConfig::default();
            cfg.validate()?;
            cfg
        }
    };

    let rt = RtBuilder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        let start = Instant::now();
        let mut results = match results_name {
            Some(name) => Some(ResultsDir::create(config_path, Some(name), out_dir)?),
            None => None,
        };
        let target_dir = results
            .as_ref()
            .map(|r| r.path().to_path_buf())
            .unwrap_or_else(|| out_dir.to_path_buf());
        std::fs::create_dir_all(&target_dir)?;

        let runner = KbbenchRunner::new(config.clone())?;
        let ts = csv_export::file_timestamp();
        let path = csv_export::sweep_path(&target_dir, &config.component_name, &ts);

        let total = config.client_list().len() as u64 * config.repeats as u64;
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} runs",
            )
            .expect("progress template")
            .progress_chars("#>-"),
        );

        let records = runner
            .run_sweep(|record| {
                csv_export::append_db_record(&path, record)?;
                pb.inc(1);
                Ok(())
            })
            .await?;
        pb.finish_and_clear();

        let ok = records.iter().filter(|r| r.return_code == 0).count();
        println!(
            "✅ Sweep complete: {}/{} runs succeeded",
            ok,
            records.len()
        );
        println!("Records written to: {}", path.display());

        if let Some(dir) = results.as_mut() {
            dir.finalize(start.elapsed().as_secs_f64())?;
        }
        Ok(())
    })
}

fn normalize_cmd(
    data_dir: &Path,
    out_dir: &Path,
    assumptions: ResourceAssumptions,
    db_component: &str,
    mq_component: &str,
) -> Result<()> {
    let report = collect(data_dir, out_dir, assumptions, db_component, mq_component)?;

    for (file, skipped) in &report.skipped {
        println!(
            "⚠ {}: row {} skipped ({})",
            file.display(),
            skipped.index,
            skipped.reason
        );
    }
    for path in &report.outputs {
        println!("✅ Normalized metrics written to: {}", path.display());
    }

    if report.metrics.is_empty() {
        println!("⚠ No usable result data found under {}", data_dir.display());
        return Ok(());
    }

    println!();
    for summary in &report.summaries {
        print_component_summary(summary);
    }
    info!(
        metrics = report.metrics.len(),
        skipped = report.skipped.len(),
        "normalization complete"
    );
    Ok(())
}

fn extrapolate_cmd(
    data_dir: &Path,
    out_dir: &Path,
    target_tps: Option<f64>,
    target_msg_per_sec: Option<f64>,
    max_latency_ms: f64,
) -> Result<()> {
    if target_tps.is_none() && target_msg_per_sec.is_none() {
        anyhow::bail!("provide --target-tps and/or --target-msg-per-sec");
    }

    let metrics = load_normalized(data_dir)?;
    if metrics.is_empty() {
        anyhow::bail!(
            "no normalized metrics under {} (run `cap-bench normalize` first)",
            data_dir.display()
        );
    }

    let mut recommendations: Vec<ExtrapolationResult> = Vec::new();
    if let Some(target) = target_tps {
        let query = ExtrapolationQuery {
            kind: ComponentKind::Db,
            target_rate: target,
            max_latency_ms,
        };
        recommendations.push(extrapolate(&metrics, &query)?);
    }
    if let Some(target) = target_msg_per_sec {
        let query = ExtrapolationQuery {
            kind: ComponentKind::Mq,
            target_rate: target,
            max_latency_ms,
        };
        recommendations.push(extrapolate(&metrics, &query)?);
    }

    for rec in &recommendations {
        print_recommendation(rec);
    }

    std::fs::create_dir_all(out_dir)?;
    let path = csv_export::recommendation_path(out_dir, &csv_export::file_timestamp());
    csv_export::write_recommendations(&path, &recommendations)?;
    println!("Recommendation written to: {}", path.display());
    Ok(())
}

// -----------------------------------------------------------------------------
// Console output
// -----------------------------------------------------------------------------

fn print_probe_report(report: &ProbeReport, config: &ProbeConfig) {
    println!();
    println!("┌─ Probe Result ───────────────────────────────────────────────────────┐");
    println!("│ Component:      {}", config.component_name);
    println!("│ Phase:          {}", report.phase.as_str());
    println!("│ Diagnosis:      {}", report.diagnosis.as_str());
    match report.achieved_max_rate {
        Some(rate) => println!("│ Max stable:     {} msg/s", rate),
        None => println!("│ Max stable:     (none found)"),
    }
    if let (Some(lo), Some(hi)) = (report.lower_bound, report.upper_bound) {
        println!("│ Final bracket:  [{lo}, {hi}) msg/s");
    }
    println!(
        "│ Trials:         {} ({} bisection)",
        report.trials.len(),
        report.bisection_iterations
    );
    println!(
        "│ Criteria:       received/target ≥ {}, p95 ≤ {} ms",
        config.stability.success_ratio, config.stability.p95_limit_ms
    );
    if report.diagnosis.low_confidence() {
        println!("│ Note:           low-confidence result ({})", report.diagnosis.as_str());
    }
    println!("└──────────────────────────────────────────────────────────────────────┘");
}

fn print_component_summary(summary: &ComponentSummary) {
    let unit = match summary.kind {
        ComponentKind::Db => "TPS",
        ComponentKind::Mq => "msg/s",
    };
    println!(
        "┌─ {} ({}) — {} records ─────────────────────────────┐",
        summary.component,
        summary.kind.as_str(),
        summary.count
    );
    println!(
        "│ {unit}/core:       mean {:.2}  median {:.2}  min {:.2}  max {:.2}",
        summary.rate_per_core.mean,
        summary.rate_per_core.median,
        summary.rate_per_core.min,
        summary.rate_per_core.max
    );
    println!(
        "│ {unit}/GB:         mean {:.2}  max {:.2}",
        summary.rate_per_gb_memory.mean, summary.rate_per_gb_memory.max
    );
    println!(
        "│ latency (ms):   mean {:.2}  min {:.2}",
        summary.latency_ms.mean, summary.latency_ms.min
    );
    println!(
        "│ est. CPU util:  mean {:.2}%",
        summary.cpu_utilization_pct.mean
    );
    if let Some(mbps) = summary.throughput_mbps {
        println!("│ throughput:     mean {:.2} Mbps  max {:.2} Mbps", mbps.mean, mbps.max);
    }
    if let Some(loss) = summary.loss_ratio {
        println!("│ loss ratio:     mean {:.4}", loss.mean);
    }
    println!("└──────────────────────────────────────────────────────────────────────┘");
}

fn print_recommendation(rec: &ExtrapolationResult) {
    println!();
    println!("┌─ Capacity Recommendation ({}) ──────────────────────────────────────┐", rec.component_type);
    println!("│ Component:        {}", rec.component);
    println!("│ Target rate:      {:.0}", rec.target_rate);
    println!("│ Latency ceiling:  {:.0} ms", rec.max_latency_ms);
    println!("│ Required cores:   {}", rec.required_cpu_cores);
    println!("│ Required memory:  {} GB", rec.required_memory_gb);
    println!("│ Est. latency:     {:.2} ms", rec.estimated_latency_ms);
    println!(
        "│ Feasible:         {}",
        if rec.feasible { "✅ yes" } else { "❌ no measured point meets the latency ceiling" }
    );
    println!("│ Confidence:       {}", rec.confidence.as_str());
    println!(
        "│ Baseline:         {:.2}/core at {:.2} ms ({:.2} measured)",
        rec.baseline_rate_per_core, rec.baseline_latency_ms, rec.baseline_rate
    );
    println!("└──────────────────────────────────────────────────────────────────────┘");
}
