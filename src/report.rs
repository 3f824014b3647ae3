use std::{
    io::{self, Write},
    path::Path,
    time::Duration,
};

use anyhow::Context;
use tracing::info;

/// Upper bound of the summary histogram: one minute, in nanoseconds.
const HISTOGRAM_MAX_NANOS: u64 = 60_000_000_000;

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Writes one latency per line, in nanoseconds, in the given order.
pub fn write_latencies<W: Write>(out: W, latencies: &[Duration]) -> io::Result<()> {
    let mut out = io::BufWriter::new(out);
    for latency in latencies {
        writeln!(out, "{}", nanos(*latency))?;
    }
    out.flush()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Summary {
    pub count: u64,
    pub min_ns: u64,
    pub mean_ns: f64,
    pub p50_ns: u64,
    pub p90_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
    pub max_ns: u64,
}

pub fn summarize(latencies: &[Duration]) -> anyhow::Result<Summary> {
    let mut histo = hdrhistogram::Histogram::<u64>::new_with_bounds(1, HISTOGRAM_MAX_NANOS, 3)
        .context("create latency histogram")?;
    for latency in latencies {
        histo.saturating_record(nanos(*latency));
    }
    Ok(Summary {
        count: histo.len(),
        min_ns: histo.min(),
        mean_ns: histo.mean(),
        p50_ns: histo.value_at_percentile(50.0),
        p90_ns: histo.value_at_percentile(90.0),
        p99_ns: histo.value_at_percentile(99.0),
        p999_ns: histo.value_at_percentile(99.9),
        max_ns: histo.max(),
    })
}

pub fn log_summary(label: &str, s: &Summary) {
    info!(
        "{label}: n={} LAT(us): min={:.1} mean={:.1} p50={:.1} p90={:.1} p99={:.1} p999={:.1} max={:.1}",
        s.count,
        s.min_ns as f64 / 1e3,
        s.mean_ns / 1e3,
        s.p50_ns as f64 / 1e3,
        s.p90_ns as f64 / 1e3,
        s.p99_ns as f64 / 1e3,
        s.p999_ns as f64 / 1e3,
        s.max_ns as f64 / 1e3,
    );
}

#[derive(serde::Serialize)]
struct JsonReport<'a> {
    mode: &'a str,
    summary: &'a Summary,
    latencies_ns: Vec<u64>,
}

pub fn write_json(path: &Path, mode: &str, summary: &Summary, latencies: &[Duration]) -> anyhow::Result<()> {
    let report = JsonReport {
        mode,
        summary,
        latencies_ns: latencies.iter().copied().map(nanos).collect(),
    };
    info!("writing latency report to {:?}", path);
    std::fs::write(path, serde_json::to_string(&report)?)
        .with_context(|| format!("write {path:?}"))
}
