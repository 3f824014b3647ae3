//! User side of the io_uring submission and completion rings.
//!
//! The kernel owns the SQ head and the CQ tail, we own the SQ tail and the CQ
//! head. Every index word lives in the shared mapping and is only touched
//! through [`SharedIndex`], so the ordering requirement of each access is
//! spelled out at the call site: entry contents are written before a
//! `publish` (release), and a peer's index is read with `observe` (acquire)
//! before the entries it exposes are read.

use std::{
    mem::{align_of, size_of},
    num::NonZeroUsize,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};

use nix::sys::mman::{self, MapFlags, ProtFlags};
use tracing::{debug, error, info};

use crate::{
    error::BenchError,
    sys::{self, Cqe, CqRingOffsets, IoUringParams, Sqe, SqRingOffsets},
};

#[cfg(test)]
pub(crate) mod sim;

/// The kernel half of the ring protocol.
pub trait Kernel {
    /// Registers `fds` so submissions can address them by table index.
    fn register_files(&mut self, fds: &[RawFd]) -> Result<(), BenchError>;

    /// Hands `to_submit` queued entries to the kernel and, with
    /// `IORING_ENTER_GETEVENTS`, waits for `min_complete` completions.
    fn enter(&mut self, to_submit: u32, min_complete: u32, flags: u32) -> Result<u32, BenchError>;
}

/// A mapped span of known length. Every pointer handed out by it has been
/// checked to lie inside the span and to be aligned for its type.
#[derive(Clone, Copy)]
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// # Safety
    ///
    /// `base..base+len` must stay mapped and writable for as long as any
    /// value derived from the region is used.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Region { base, len }
    }

    fn span<T>(&self, offset: u32, count: u32, what: &str) -> Result<NonNull<T>, BenchError> {
        let start = offset as usize;
        let end = size_of::<T>()
            .checked_mul(count as usize)
            .and_then(|bytes| bytes.checked_add(start));
        match end {
            Some(end) if end <= self.len => {}
            _ => {
                return Err(BenchError::RingLayout(format!(
                    "{what} at offset {offset} x{count} exceeds mapping of {} bytes",
                    self.len
                )))
            }
        }
        // SAFETY: start <= len was checked above
        let ptr = unsafe { self.base.as_ptr().add(start) };
        if ptr as usize % align_of::<T>() != 0 {
            return Err(BenchError::RingLayout(format!(
                "{what} at offset {offset} is misaligned"
            )));
        }
        NonNull::new(ptr.cast::<T>())
            .ok_or_else(|| BenchError::RingLayout(format!("{what} resolves to null")))
    }

    fn index(&self, offset: u32, what: &str) -> Result<SharedIndex, BenchError> {
        Ok(SharedIndex(self.span::<AtomicU32>(offset, 1, what)?))
    }

    /// Reads a word the kernel filled in at setup and never changes.
    fn constant(&self, offset: u32, what: &str) -> Result<u32, BenchError> {
        Ok(self.index(offset, what)?.observe())
    }
}

/// A `u32` ring index in memory shared with the kernel.
#[derive(Clone, Copy)]
pub(crate) struct SharedIndex(NonNull<AtomicU32>);

impl SharedIndex {
    /// Acquire load: entries the peer wrote before publishing this value are
    /// visible afterwards.
    pub(crate) fn observe(&self) -> u32 {
        unsafe { self.0.as_ref() }.load(Ordering::Acquire)
    }

    /// Release store: entries written before this call are visible to a peer
    /// that observes `value`.
    pub(crate) fn publish(&self, value: u32) {
        unsafe { self.0.as_ref() }.store(value, Ordering::Release)
    }
}

/// Fixed-capacity array addressed by a free-running ring position.
pub(crate) struct RingView<T> {
    base: NonNull<T>,
    mask: u32,
}

impl<T: Copy> RingView<T> {
    fn new(region: &Region, offset: u32, entries: u32, mask: u32, what: &str) -> Result<Self, BenchError> {
        if !entries.is_power_of_two() || mask != entries - 1 {
            return Err(BenchError::RingLayout(format!(
                "{what}: entries={entries} mask={mask:#x}"
            )));
        }
        Ok(RingView {
            base: region.span::<T>(offset, entries, what)?,
            mask,
        })
    }

    pub(crate) fn entries(&self) -> u32 {
        self.mask + 1
    }

    pub(crate) fn slot_of(&self, pos: u32) -> u32 {
        pos & self.mask
    }

    pub(crate) fn read(&self, pos: u32) -> T {
        // SAFETY: slot_of(pos) < entries and the span was bounds-checked at construction
        unsafe { self.base.as_ptr().add(self.slot_of(pos) as usize).read() }
    }

    pub(crate) fn write(&self, pos: u32, value: T) {
        unsafe { self.base.as_ptr().add(self.slot_of(pos) as usize).write(value) }
    }
}

pub struct SubmissionQueue {
    head: SharedIndex,
    tail: SharedIndex,
    local_tail: u32,
    array: RingView<u32>,
    sqes: RingView<Sqe>,
}

impl SubmissionQueue {
    pub(crate) fn new(ring: &Region, off: &SqRingOffsets, sqes: &Region) -> Result<Self, BenchError> {
        let entries = ring.constant(off.ring_entries, "sq ring_entries")?;
        let mask = ring.constant(off.ring_mask, "sq ring_mask")?;
        let tail = ring.index(off.tail, "sq tail")?;
        Ok(SubmissionQueue {
            head: ring.index(off.head, "sq head")?,
            local_tail: tail.observe(),
            tail,
            array: RingView::new(ring, off.array, entries, mask, "sq array")?,
            sqes: RingView::new(sqes, 0, entries, mask, "sqes")?,
        })
    }

    pub fn entries(&self) -> u32 {
        self.sqes.entries()
    }

    /// Entries published to the ring that the kernel has not consumed yet.
    pub fn pending(&self) -> u32 {
        self.local_tail.wrapping_sub(self.head.observe())
    }

    /// Writes `sqe` at the tail, points the indirection array at it and
    /// publishes the advanced tail.
    pub fn push(&mut self, sqe: Sqe) -> Result<(), BenchError> {
        if self.pending() >= self.entries() {
            return Err(BenchError::SubmissionQueueFull {
                entries: self.entries(),
            });
        }
        let pos = self.local_tail;
        self.sqes.write(pos, sqe);
        self.array.write(pos, self.sqes.slot_of(pos));
        self.local_tail = pos.wrapping_add(1);
        self.tail.publish(self.local_tail);
        Ok(())
    }
}

pub struct CompletionQueue {
    head: SharedIndex,
    tail: SharedIndex,
    local_head: u32,
    cqes: RingView<Cqe>,
}

impl CompletionQueue {
    pub(crate) fn new(ring: &Region, off: &CqRingOffsets) -> Result<Self, BenchError> {
        let entries = ring.constant(off.ring_entries, "cq ring_entries")?;
        let mask = ring.constant(off.ring_mask, "cq ring_mask")?;
        let head = ring.index(off.head, "cq head")?;
        Ok(CompletionQueue {
            local_head: head.observe(),
            head,
            tail: ring.index(off.tail, "cq tail")?,
            cqes: RingView::new(ring, off.cqes, entries, mask, "cqes")?,
        })
    }

    pub fn entries(&self) -> u32 {
        self.cqes.entries()
    }

    /// The entry at the head, if the kernel has posted one.
    pub fn peek_completed(&self) -> Option<Cqe> {
        if self.local_head == self.tail.observe() {
            return None;
        }
        Some(self.cqes.read(self.local_head))
    }

    /// Consumes the entry returned by the last `peek_completed`. The kernel
    /// sees the slot as free only after [`CompletionQueue::publish`].
    pub fn advance(&mut self) {
        self.local_head = self.local_head.wrapping_add(1);
    }

    pub fn publish(&self) {
        self.head.publish(self.local_head);
    }

    /// Drains every posted completion, appending its tag to `tags`.
    ///
    /// Each completion must report exactly `expected_res` bytes; anything else
    /// is an [`BenchError::Integrity`] violation. Returns the number reaped,
    /// zero meaning nothing was ready.
    pub fn reap(&mut self, expected_res: i32, tags: &mut Vec<u64>) -> Result<usize, BenchError> {
        let ready = self.tail.observe().wrapping_sub(self.local_head);
        if ready > self.entries() {
            return Err(BenchError::RingLayout(format!(
                "completion ring reports {ready} ready entries, capacity {}",
                self.entries()
            )));
        }
        let mut reaped = 0;
        while let Some(cqe) = self.peek_completed() {
            if cqe.res != expected_res {
                return Err(BenchError::Integrity {
                    tag: cqe.user_data,
                    result: cqe.res,
                    expected: expected_res,
                });
            }
            tags.push(cqe.user_data);
            self.advance();
            reaped += 1;
        }
        self.publish();
        Ok(reaped)
    }
}

/// A set-up ring: both user-side queues plus the kernel endpoint they talk to.
pub struct Uring<K> {
    sq: SubmissionQueue,
    cq: CompletionQueue,
    kernel: K,
}

impl<K: Kernel> Uring<K> {
    pub(crate) fn from_parts(sq: SubmissionQueue, cq: CompletionQueue, kernel: K) -> Self {
        Uring { sq, cq, kernel }
    }

    pub fn submission(&mut self) -> &mut SubmissionQueue {
        &mut self.sq
    }

    pub fn completion(&mut self) -> &mut CompletionQueue {
        &mut self.cq
    }

    #[cfg(test)]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn register_files(&mut self, fds: &[RawFd]) -> Result<(), BenchError> {
        self.kernel.register_files(fds)
    }

    /// Notifies the kernel of everything queued since the last call and asks
    /// for completions to be posted, waiting for `min_complete` of them.
    pub fn submit(&mut self, min_complete: u32) -> Result<u32, BenchError> {
        let to_submit = self.sq.pending();
        let submitted = self
            .kernel
            .enter(to_submit, min_complete, sys::IORING_ENTER_GETEVENTS)?;
        if submitted < to_submit {
            debug!(submitted, to_submit, "kernel consumed fewer entries than queued");
        }
        Ok(submitted)
    }
}

struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mmap {
    fn map(fd: RawFd, len: usize, offset: libc::off_t, what: &'static str) -> Result<Self, BenchError> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| BenchError::RingLayout(format!("{what} has zero length")))?;
        let ptr = unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_POPULATE,
                fd,
                offset,
            )
        }
        .map_err(|source| BenchError::Mmap { what, len, source })?;
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| BenchError::RingLayout(format!("{what} mapped at null")))?;
        Ok(Mmap { ptr, len })
    }

    fn region(&self) -> Region {
        // SAFETY: the mapping lives as long as the KernelRing that owns it,
        // which outlives the queues built from it inside the same Uring
        unsafe { Region::from_raw(self.ptr, self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        if let Err(e) = unsafe { mman::munmap(self.ptr.as_ptr().cast(), self.len) } {
            error!("munmap of {} bytes failed: {}", self.len, e);
        }
    }
}

/// The real kernel endpoint: the ring descriptor and the mappings backing the
/// queues.
pub struct KernelRing {
    _sq_ring: Mmap,
    _cq_ring: Option<Mmap>,
    _sqes: Mmap,
    fd: OwnedFd,
}

impl Kernel for KernelRing {
    fn register_files(&mut self, fds: &[RawFd]) -> Result<(), BenchError> {
        sys::io_uring_register(
            self.fd.as_raw_fd(),
            sys::IORING_REGISTER_FILES,
            fds.as_ptr().cast(),
            fds.len() as u32,
        )
        .map_err(|source| BenchError::RegisterFiles {
            count: fds.len(),
            source,
        })
    }

    fn enter(&mut self, to_submit: u32, min_complete: u32, flags: u32) -> Result<u32, BenchError> {
        sys::io_uring_enter(self.fd.as_raw_fd(), to_submit, min_complete, flags).map_err(
            |source| BenchError::Enter {
                to_submit,
                min_complete,
                source,
            },
        )
    }
}

/// Creates a ring with `entries` submission slots and maps both queues.
///
/// The two ring headers share one mapping when the kernel advertises
/// `IORING_FEAT_SINGLE_MMAP`, otherwise the completion ring is mapped on its
/// own. Any failure unmaps whatever was already mapped.
pub fn setup(entries: u32) -> Result<Uring<KernelRing>, BenchError> {
    let mut params = IoUringParams::default();
    let fd = sys::io_uring_setup(entries, &mut params).map_err(BenchError::RingSetup)?;
    let raw_fd = fd.as_raw_fd();

    let mut sq_len = params.sq_off.array as usize + params.sq_entries as usize * size_of::<u32>();
    let mut cq_len = params.cq_off.cqes as usize + params.cq_entries as usize * size_of::<Cqe>();
    let single_mmap = params.features & sys::IORING_FEAT_SINGLE_MMAP != 0;
    if single_mmap {
        sq_len = sq_len.max(cq_len);
        cq_len = sq_len;
    }

    let sq_ring = Mmap::map(raw_fd, sq_len, sys::IORING_OFF_SQ_RING, "submission ring")?;
    let cq_ring = if single_mmap {
        None
    } else {
        Some(Mmap::map(raw_fd, cq_len, sys::IORING_OFF_CQ_RING, "completion ring")?)
    };
    let sqes = Mmap::map(
        raw_fd,
        params.sq_entries as usize * size_of::<Sqe>(),
        sys::IORING_OFF_SQES,
        "submission entries",
    )?;

    let cq_region = cq_ring.as_ref().unwrap_or(&sq_ring).region();
    let sq = SubmissionQueue::new(&sq_ring.region(), &params.sq_off, &sqes.region())?;
    let cq = CompletionQueue::new(&cq_region, &params.cq_off)?;
    info!(
        sq_entries = params.sq_entries,
        cq_entries = params.cq_entries,
        single_mmap,
        "io_uring set up"
    );

    Ok(Uring::from_parts(
        sq,
        cq,
        KernelRing {
            _sq_ring: sq_ring,
            _cq_ring: cq_ring,
            _sqes: sqes,
            fd,
        },
    ))
}

/// Whether a setup failure means this host cannot create rings at all
/// (no io_uring in the kernel, or disabled by sysctl/seccomp/rlimit).
#[cfg(test)]
pub(crate) fn ring_unavailable(err: &BenchError) -> bool {
    match err {
        BenchError::RingSetup(e) => matches!(
            e.raw_os_error(),
            Some(libc::ENOSYS | libc::EPERM | libc::EACCES | libc::ENOMEM)
        ),
        _ => false,
    }
}
