// src/parse.rs
//
// Output parsing for the external benchmark processes.
//
// Two formats are handled here:
// - perf-test compact lines, one per second:
//     "1.000s 173,920 msg/s 84,405 msg/s 1/25/189/312/331 ms"
//   The latency field is min/p50/p75/p95/p99 in ms or µs.
// - kbbench (pgbench-compatible) final report text:
//     "tps = 1234.56 (including connections establishing)"
//     "tps = 1240.01 (excluding connections establishing)"
//     "latency average = 6.48 ms"
//     "number of transactions actually processed: 74073"
//
// All parsing is tolerant: unmatched lines yield None and the caller decides
// whether the run as a whole produced usable data.

use regex::Regex;
use std::sync::LazyLock;

use crate::trial::TimeseriesRow;

static COMPACT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<tsec>\d+(?:\.\d+)?)s\s+(?P<sent>[\d,]+)\s+msg/s\s+(?P<recv>[\d,]+)\s+msg/s\s+(?P<lat>[\d/]+)\s+(?P<unit>µs|μs|us|ms)\s*$",
    )
    .expect("compact line regex")
});

static TPS_INC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)tps\s*=\s*([0-9.]+)\s*\(including").expect("tps including regex")
});

static TPS_EXC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)tps\s*=\s*([0-9.]+)\s*\(excluding").expect("tps excluding regex")
});

static LAT_AVG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)latency\s+average\s*=\s*([0-9.]+)\s*ms").expect("latency average regex")
});

static TX_PROC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)number\s+of\s+transactions\s+actually\s+processed:\s*([0-9]+)")
        .expect("tx processed regex")
});

/// Parse one compact-format line into a per-second sample.
///
/// Latency values in µs are converted to whole ms. Lines whose latency field
/// does not carry the expected five slots keep the rates but record -1 for
/// every percentile.
pub fn parse_compact_line(line: &str) -> Option<TimeseriesRow> {
    let caps = COMPACT_LINE_RE.captures(line)?;

    let time_s: f64 = caps["tsec"].parse().ok()?;
    let sent: u64 = caps["sent"].replace(',', "").parse().ok()?;
    let recv: u64 = caps["recv"].replace(',', "").parse().ok()?;

    let unit = &caps["unit"];
    let factor = if unit == "ms" { 1.0 } else { 0.001 };

    let lat_parts: Vec<i64> = caps["lat"]
        .split('/')
        .filter_map(|x| x.parse().ok())
        .collect();

    let (p50, p95, p99) = if lat_parts.len() == 5 {
        (
            (lat_parts[1] as f64 * factor).round() as i64,
            (lat_parts[3] as f64 * factor).round() as i64,
            (lat_parts[4] as f64 * factor).round() as i64,
        )
    } else {
        (-1, -1, -1)
    };

    Some(TimeseriesRow {
        time_s,
        sent_msg_s: sent,
        received_msg_s: recv,
        p50_ms: p50,
        p95_ms: p95,
        p99_ms: p99,
    })
}

/// Aggregate per-second rows into (avg_sent, avg_received, worst_p95_ms).
///
/// worst_p95 only considers rows that carried latency data; it is -1 when
/// none did. An empty slice aggregates to all zeros / -1.
pub fn aggregate_timeseries(rows: &[TimeseriesRow]) -> (f64, f64, i64) {
    if rows.is_empty() {
        return (0.0, 0.0, -1);
    }
    let n = rows.len() as f64;
    let avg_sent = rows.iter().map(|r| r.sent_msg_s as f64).sum::<f64>() / n;
    let avg_recv = rows.iter().map(|r| r.received_msg_s as f64).sum::<f64>() / n;
    let worst_p95 = rows
        .iter()
        .filter(|r| r.p95_ms >= 0)
        .map(|r| r.p95_ms)
        .max()
        .unwrap_or(-1);
    (avg_sent, avg_recv, worst_p95)
}

/// Extract (tps_including, tps_excluding) from kbbench report text.
pub fn parse_tps(text: &str) -> (Option<f64>, Option<f64>) {
    let inc = TPS_INC_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    let exc = TPS_EXC_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    (inc, exc)
}

/// Extract the average latency in ms from kbbench report text.
pub fn parse_latency_avg(text: &str) -> Option<f64> {
    LAT_AVG_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extract the processed transaction count from kbbench report text.
pub fn parse_tx_processed(text: &str) -> Option<u64> {
    TX_PROC_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
