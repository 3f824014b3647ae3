//! Blocking comparison harness: one OS thread per client issuing positioned
//! reads through its own descriptors, optionally tagged with a kernel level
//! hint first.

use std::{
    num::{NonZeroU32, NonZeroU64},
    os::{fd::AsRawFd, unix::prelude::FileExt},
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::Context;
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info};

use crate::{
    buffer::AlignedBuf,
    error::BenchError,
    sys,
    target::{self, ReadShape, Target, PAGE_SHIFT},
};

#[derive(Debug, Clone, clap::Args)]
pub struct SyncArgs {
    /// Reader threads, each with private descriptors and buffer
    pub num_thread: NonZeroU32,
    /// Level passed to the kernel hint syscall for every descriptor
    pub level: NonZeroU32,
    /// Reads issued by each thread
    pub iteration: NonZeroU64,
    /// Files or block devices to read from
    #[clap(required = true)]
    pub files: Vec<PathBuf>,
    #[clap(flatten)]
    pub read: ReadShape,
    /// Syscall number of the per-descriptor level hint; the hint is skipped when unset
    #[clap(long)]
    pub level_hint_syscall: Option<i64>,
}

/// Runs every reader to completion and concatenates their latencies in
/// thread order.
pub fn run(args: &SyncArgs) -> anyhow::Result<Vec<Duration>> {
    args.read.validate()?;
    if args.level_hint_syscall.is_none() {
        info!("no level hint syscall configured, descriptors stay untagged");
    }
    let start = Instant::now();
    let per_thread = std::thread::scope(|scope| -> anyhow::Result<Vec<Vec<Duration>>> {
        let mut handles = Vec::new();
        for thread_idx in 0..args.num_thread.get() {
            let handle = std::thread::Builder::new()
                .name(format!("reader-{thread_idx}"))
                .spawn_scoped(scope, move || client(thread_idx, args))
                .with_context(|| format!("spawn reader {thread_idx}"))?;
            handles.push(handle);
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let latencies = handle
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
            results.push(latencies);
        }
        Ok(results)
    })?;
    let latencies: Vec<Duration> = per_thread.into_iter().flatten().collect();
    info!(
        "{} reads by {} threads in {}",
        latencies.len(),
        args.num_thread,
        humantime::format_duration(start.elapsed())
    );
    Ok(latencies)
}

fn client(thread_idx: u32, args: &SyncArgs) -> Result<Vec<Duration>, BenchError> {
    debug!("reader {thread_idx} starting");
    let mut rng = StdRng::seed_from_u64(u64::from(thread_idx));
    let mut buf = AlignedBuf::new(1 << PAGE_SHIFT)?;
    let read_size = args.read.read_size();

    let files = target::open_all(args.read.disk_access_kind(), &args.files)?;
    if let Some(syscall_nr) = args.level_hint_syscall {
        for (file, path) in files.iter().zip(&args.files) {
            let ret = sys::set_level_hint(
                syscall_nr as libc::c_long,
                file.as_raw_fd(),
                args.level.get(),
            );
            if ret < 0 {
                return Err(BenchError::LevelHint {
                    syscall_nr,
                    path: path.clone(),
                    ret: ret as i64,
                });
            }
        }
    }
    let num_files = u32::try_from(files.len())
        .map_err(|_| BenchError::InvalidConfig(format!("{} files", files.len())))?;

    let mut latencies = Vec::new();
    usize::try_from(args.iteration.get())
        .ok()
        .and_then(|n| latencies.try_reserve_exact(n).ok())
        .ok_or_else(|| {
            BenchError::InvalidConfig(format!("{} reads per thread", args.iteration))
        })?;
    for _ in 0..args.iteration.get() {
        let target = Target::pick(&mut rng, num_files, args.read.max_page_index);
        let offset = target.offset();
        let file = &files[target.file_index as usize];
        let start = Instant::now();
        let res = file.read_at(&mut buf.as_mut_slice()[..read_size], offset);
        let elapsed = start.elapsed();
        let path = || args.files[target.file_index as usize].clone();
        match res {
            Ok(n) if n == read_size => {}
            Ok(got) => {
                return Err(BenchError::ShortRead {
                    path: path(),
                    offset,
                    got,
                    expected: read_size,
                })
            }
            Err(source) => {
                return Err(BenchError::Read {
                    path: path(),
                    offset,
                    source,
                })
            }
        }
        latencies.push(elapsed);
    }
    debug!("reader {thread_idx} done");
    Ok(latencies)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn data_file(pages: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0xa5; pages << PAGE_SHIFT]).unwrap();
        file.flush().unwrap();
        file
    }

    fn args(files: Vec<PathBuf>, num_thread: u32, iteration: u64, max_page_index: u64) -> SyncArgs {
        SyncArgs {
            num_thread: NonZeroU32::new(num_thread).unwrap(),
            level: NonZeroU32::new(2).unwrap(),
            iteration: NonZeroU64::new(iteration).unwrap(),
            files,
            read: ReadShape {
                read_size_shift: 9,
                max_page_index,
                buffered: true,
            },
            level_hint_syscall: None,
        }
    }

    #[test]
    fn merges_per_thread_results() {
        let a = data_file(4);
        let b = data_file(4);
        let args = args(vec![a.path().into(), b.path().into()], 3, 5, 4);
        let latencies = run(&args).unwrap();
        assert_eq!(latencies.len(), 15);
    }

    #[test]
    fn read_past_end_is_fatal() {
        let f = data_file(1);
        let args = args(vec![f.path().into()], 1, 50, 8);
        let err = run(&args).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::ShortRead { got: 0, expected: 512, .. })
        ));
    }

    #[test]
    fn failing_level_hint_is_fatal() {
        let f = data_file(1);
        let mut args = args(vec![f.path().into()], 2, 1, 1);
        args.level_hint_syscall = Some(100_000);
        let err = run(&args).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::LevelHint { syscall_nr: 100_000, .. })
        ));
    }

    #[test]
    fn accepted_level_hint_lets_reads_proceed() {
        let f = data_file(2);
        let mut args = args(vec![f.path().into()], 1, 3, 2);
        // getpid ignores its arguments and never fails
        args.level_hint_syscall = Some(libc::SYS_getpid as i64);
        assert_eq!(run(&args).unwrap().len(), 3);
    }

    #[test]
    fn oversized_iteration_is_invalid_not_a_panic() {
        let f = data_file(1);
        let args = args(vec![f.path().into()], 1, 1 << 60, 1);
        let err = run(&args).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(vec![dir.path().join("absent")], 1, 1, 1);
        let err = run(&args).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::OpenFile { .. })
        ));
    }
}
