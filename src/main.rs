use std::{path::PathBuf, time::Duration};

use clap::Parser;
use tracing::info;

mod buffer;
mod driver;
mod error;
mod pipeline;
mod report;
mod ring;
mod sync_bench;
mod sys;
mod target;

/// Per-request latency of block reads, pipelined through io_uring or issued
/// from blocking threads. Prints one latency in nanoseconds per line.
#[derive(clap::Parser)]
struct Args {
    /// Also write the latencies and their summary as JSON to this path
    #[clap(long, global = true)]
    json: Option<PathBuf>,
    #[clap(subcommand)]
    work_kind: WorkKind,
}

#[derive(clap::Subcommand)]
enum WorkKind {
    /// Pipelined reads through a raw io_uring; one total per logical request
    Uring(driver::UringArgs),
    /// Blocking positioned reads from one thread per client; one line per read
    Sync(sync_bench::SyncArgs),
}

impl WorkKind {
    fn name(&self) -> &'static str {
        match self {
            WorkKind::Uring(_) => "uring",
            WorkKind::Sync(_) => "sync",
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let latencies: Vec<Duration> = match &args.work_kind {
        WorkKind::Uring(uring_args) => driver::run(uring_args)?,
        WorkKind::Sync(sync_args) => sync_bench::run(sync_args)?,
    };

    let summary = report::summarize(&latencies)?;
    report::log_summary(args.work_kind.name(), &summary);
    if let Some(path) = &args.json {
        report::write_json(path, args.work_kind.name(), &summary, &latencies)?;
    }
    report::write_latencies(std::io::stdout().lock(), &latencies)?;
    info!("done");
    Ok(())
}
