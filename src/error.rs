use std::{io, path::PathBuf};

/// Every failure the benchmark can hit. All of them are fatal: a run either
/// completes and reports, or stops with one of these and prints nothing.
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("io_uring_setup failed: {0}")]
    RingSetup(#[source] io::Error),

    #[error("mmap of {what} ({len} bytes) failed: {source}")]
    Mmap {
        what: &'static str,
        len: usize,
        #[source]
        source: nix::Error,
    },

    #[error("ring layout reported by the kernel is unusable: {0}")]
    RingLayout(String),

    #[error("io_uring_register(IORING_REGISTER_FILES) with {count} files failed: {source}")]
    RegisterFiles {
        count: usize,
        #[source]
        source: io::Error,
    },

    #[error("cannot open {path:?}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("io_uring_enter(to_submit={to_submit}, min_complete={min_complete}) failed: {source}")]
    Enter {
        to_submit: u32,
        min_complete: u32,
        #[source]
        source: io::Error,
    },

    /// A completion did not transfer exactly the fixed read size.
    #[error("completion for tag {tag} returned {result}, expected {expected}")]
    Integrity { tag: u64, result: i32, expected: i32 },

    #[error("submission queue full ({entries} entries)")]
    SubmissionQueueFull { entries: u32 },

    #[error("completion carries unknown tag {tag} (slot count {slots})")]
    UnknownTag { tag: u64, slots: usize },

    #[error("slot {tag} submitted while a request for it is still in flight")]
    SlotInFlight { tag: u64 },

    #[error("completion for slot {tag} which has no request in flight")]
    SlotNotInFlight { tag: u64 },

    #[error("level hint syscall {syscall_nr} on {path:?} returned {ret}")]
    LevelHint {
        syscall_nr: i64,
        path: PathBuf,
        ret: i64,
    },

    #[error("read of {path:?} at offset {offset} returned {got} bytes, expected {expected}")]
    ShortRead {
        path: PathBuf,
        offset: u64,
        got: usize,
        expected: usize,
    },

    #[error("positioned read of {path:?} at offset {offset} failed: {source}")]
    Read {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
