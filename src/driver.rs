use std::{
    num::{NonZeroU32, NonZeroU64},
    os::fd::{AsRawFd, RawFd},
    path::PathBuf,
    time::{Duration, Instant},
};

use itertools::Itertools;
use tracing::{debug, info, trace};

use crate::{
    buffer::IoVecTable,
    error::BenchError,
    pipeline::{Pipeline, PipelineShape, Routing},
    ring::{self, Kernel, Uring},
    sys::{self, Sqe},
    target::{self, Placement, PlacementKind, ReadShape},
};

#[derive(Debug, Clone, clap::Args)]
pub struct UringArgs {
    /// Logical requests in flight at once; also the submission ring size
    pub batch_size: NonZeroU32,
    /// Rounds each logical request goes through before it completes
    pub level: NonZeroU32,
    /// Batches issued back to back
    pub iteration: NonZeroU64,
    /// Files or block devices to read from
    #[clap(required = true)]
    pub files: Vec<PathBuf>,
    #[clap(flatten)]
    pub read: ReadShape,
    #[clap(long, value_enum, default_value_t)]
    pub placement: PlacementKind,
    /// Sleep in io_uring_enter until a completion arrives instead of busy polling
    #[clap(long)]
    pub wait: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DriveStats {
    pub enters: u64,
    pub submissions: u64,
    pub reaped: u64,
    pub empty_polls: u64,
}

/// Sets up the ring over `args.files` and runs the pipelined benchmark,
/// returning the accumulated latency of every slot in slot order.
pub fn run(args: &UringArgs) -> anyhow::Result<Vec<Duration>> {
    args.read.validate()?;
    let batch_size = args.batch_size.get();
    if batch_size > sys::IORING_MAX_ENTRIES {
        return Err(BenchError::InvalidConfig(format!(
            "batch size {batch_size} exceeds ring limit {}",
            sys::IORING_MAX_ENTRIES
        ))
        .into());
    }
    let shape = PipelineShape {
        batch_size,
        level: args.level.get(),
        iteration: args.iteration.get(),
    };
    let mut pipeline = Pipeline::new(shape)?;

    let files = target::open_all(args.read.disk_access_kind(), &args.files)?;
    let mut uring = ring::setup(batch_size)?;
    let fds: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();
    uring.register_files(&fds)?;
    info!(
        "registered {} files: {}",
        fds.len(),
        args.files.iter().map(|p| p.display()).join(", ")
    );

    let read_size = args.read.read_size();
    let iovecs = IoVecTable::new(batch_size as usize, read_size)?;
    let mut placement = Placement::new(args.placement, files.len(), args.read.max_page_index)?;

    let start = Instant::now();
    let stats = drive(
        &mut uring,
        &mut pipeline,
        &iovecs,
        &mut placement,
        read_size as i32,
        args.wait,
    )?;
    info!(
        "{} reads in {} ({} enter calls, {} empty polls)",
        stats.reaped,
        humantime::format_duration(start.elapsed()),
        stats.enters,
        stats.empty_polls
    );
    Ok(pipeline.totals().collect())
}

/// The poll loop: seeds the first batch, then alternates draining the
/// completion ring with re-submitting the next round of every reaped slot,
/// until the pipeline has seen all of its completions.
///
/// Every completion must have transferred exactly `expected_res` bytes.
pub fn drive<K: Kernel>(
    uring: &mut Uring<K>,
    pipeline: &mut Pipeline,
    iovecs: &IoVecTable,
    placement: &mut Placement,
    expected_res: i32,
    wait: bool,
) -> Result<DriveStats, BenchError> {
    let batch_size = pipeline.shape().batch_size;
    if iovecs.len() != batch_size as usize {
        return Err(BenchError::InvalidConfig(format!(
            "{} buffers for batch size {batch_size}",
            iovecs.len()
        )));
    }
    let min_complete = u32::from(wait);
    let mut stats = DriveStats::default();

    // send the first batch
    for sub_index in 0..batch_size {
        let tag = u64::from(sub_index);
        issue(uring, pipeline, placement, iovecs, tag, sub_index as usize, 0)?;
        stats.submissions += 1;
    }
    uring.submit(min_complete)?;
    stats.enters += 1;

    let mut reaped_tags = Vec::with_capacity(uring.completion().entries() as usize);
    while !pipeline.is_done() {
        reaped_tags.clear();
        let reaped = uring.completion().reap(expected_res, &mut reaped_tags)?;
        if reaped == 0 {
            stats.empty_polls += 1;
        }
        stats.reaped += reaped as u64;

        let mut submitted = 0;
        for &tag in &reaped_tags {
            match pipeline.complete(tag, Instant::now())? {
                Routing::Finished => trace!(tag, "slot retired"),
                Routing::Resubmit {
                    tag: next,
                    position,
                    round,
                } => {
                    issue(uring, pipeline, placement, iovecs, next, position, round)?;
                    submitted += 1;
                }
            }
        }
        stats.submissions += submitted;

        if submitted > 0 || (wait && !pipeline.is_done()) {
            uring.submit(min_complete)?;
            stats.enters += 1;
        }
    }
    debug!(?stats, "pipeline drained");
    Ok(stats)
}

fn issue<K: Kernel>(
    uring: &mut Uring<K>,
    pipeline: &mut Pipeline,
    placement: &mut Placement,
    iovecs: &IoVecTable,
    tag: u64,
    position: usize,
    round: u32,
) -> Result<(), BenchError> {
    let target = placement.target(tag, round);
    trace!(tag, round, file = target.file_index, offset = target.offset(), "submit");
    pipeline.start(tag, Instant::now())?;
    uring.submission().push(Sqe::readv_fixed(
        target.file_index,
        iovecs.get(position),
        1,
        target.offset(),
        tag,
    ))
}
