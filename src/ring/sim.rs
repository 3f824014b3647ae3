//! In-process stand-in for the kernel side of the ring.
//!
//! Lays the queues out in heap memory the same way the kernel describes them
//! through `IoUringParams`, then plays the kernel's role on `enter`: it
//! consumes submission entries from its head and posts completions at its
//! tail. Completions are posted synchronously inside `enter`.

use std::{
    alloc::{self, Layout},
    collections::{HashSet, VecDeque},
    io,
    os::fd::RawFd,
    ptr::NonNull,
};

use super::{CompletionQueue, Kernel, Region, RingView, SharedIndex, SubmissionQueue, Uring};
use crate::{
    error::BenchError,
    sys::{self, Cqe, CqRingOffsets, Sqe, SqRingOffsets},
};

const HEADER: u32 = 64;

const SQ_OFF: SqRingOffsets = SqRingOffsets {
    head: 0,
    tail: 4,
    ring_mask: 8,
    ring_entries: 12,
    flags: 16,
    dropped: 20,
    array: HEADER,
    resv1: 0,
    user_addr: 0,
};

const CQ_OFF: CqRingOffsets = CqRingOffsets {
    head: 0,
    tail: 4,
    ring_mask: 8,
    ring_entries: 12,
    overflow: 16,
    cqes: HEADER,
    flags: 20,
    resv1: 0,
    user_addr: 0,
};

struct Backing {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Backing {
    fn zeroed(len: usize) -> Self {
        let layout = Layout::from_size_align(len, 64).unwrap();
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).unwrap();
        Backing { ptr, layout }
    }

    fn region(&self) -> Region {
        unsafe { Region::from_raw(self.ptr, self.layout.size()) }
    }

    fn set_word(&self, offset: u32, value: u32) {
        self.region().index(offset, "word").unwrap().publish(value);
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

type Respond = Box<dyn FnMut(u64, &Sqe) -> i32>;

pub(crate) struct SimKernelBuilder {
    sq_entries: u32,
    respond: Respond,
    reverse: bool,
}

impl SimKernelBuilder {
    /// Every completion reports `res`.
    pub(crate) fn result(mut self, res: i32) -> Self {
        self.respond = Box::new(move |_, _| res);
        self
    }

    /// Computes each completion's result from its sequence number and entry.
    pub(crate) fn respond(mut self, f: impl FnMut(u64, &Sqe) -> i32 + 'static) -> Self {
        self.respond = Box::new(f);
        self
    }

    /// Posts the completions of each `enter` call in reverse submission order.
    pub(crate) fn reverse_completions(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub(crate) fn build(self) -> Uring<SimKernel> {
        let entries = self.sq_entries;
        assert!(entries.is_power_of_two());
        let cq_entries = entries * 2;

        let sq_mem = Backing::zeroed((HEADER + entries * 4) as usize);
        let cq_mem = Backing::zeroed((HEADER + cq_entries * 16) as usize);
        let sqe_mem = Backing::zeroed(entries as usize * std::mem::size_of::<Sqe>());
        sq_mem.set_word(SQ_OFF.ring_mask, entries - 1);
        sq_mem.set_word(SQ_OFF.ring_entries, entries);
        cq_mem.set_word(CQ_OFF.ring_mask, cq_entries - 1);
        cq_mem.set_word(CQ_OFF.ring_entries, cq_entries);

        let (sq_region, cq_region, sqe_region) = (sq_mem.region(), cq_mem.region(), sqe_mem.region());
        let sq = SubmissionQueue::new(&sq_region, &SQ_OFF, &sqe_region).unwrap();
        let cq = CompletionQueue::new(&cq_region, &CQ_OFF).unwrap();

        let kernel = SimKernel {
            sq_head: sq_region.index(SQ_OFF.head, "sq head").unwrap(),
            sq_tail: sq_region.index(SQ_OFF.tail, "sq tail").unwrap(),
            array: RingView::new(&sq_region, SQ_OFF.array, entries, entries - 1, "array").unwrap(),
            sqes: RingView::new(&sqe_region, 0, entries, entries - 1, "sqes").unwrap(),
            cq_head: cq_region.index(CQ_OFF.head, "cq head").unwrap(),
            cq_tail: cq_region.index(CQ_OFF.tail, "cq tail").unwrap(),
            cqes: RingView::new(&cq_region, CQ_OFF.cqes, cq_entries, cq_entries - 1, "cqes")
                .unwrap(),
            local_sq_head: 0,
            local_cq_tail: 0,
            retired_cq_head: 0,
            registered: None,
            respond: self.respond,
            reverse: self.reverse,
            posted: VecDeque::new(),
            in_flight: HashSet::new(),
            submitted: Vec::new(),
            max_in_flight: 0,
            enter_calls: Vec::new(),
            _memory: [sq_mem, cq_mem, sqe_mem],
        };
        Uring::from_parts(sq, cq, kernel)
    }
}

pub(crate) struct SimKernel {
    sq_head: SharedIndex,
    sq_tail: SharedIndex,
    array: RingView<u32>,
    sqes: RingView<Sqe>,
    cq_head: SharedIndex,
    cq_tail: SharedIndex,
    cqes: RingView<Cqe>,
    local_sq_head: u32,
    local_cq_tail: u32,
    retired_cq_head: u32,
    registered: Option<usize>,
    respond: Respond,
    reverse: bool,
    /// Tags of posted completions the user has not consumed yet, in ring order.
    posted: VecDeque<u64>,
    /// Tags submitted and not yet consumed from the completion ring.
    in_flight: HashSet<u64>,
    submitted: Vec<u64>,
    max_in_flight: usize,
    enter_calls: Vec<(u32, u32)>,
    _memory: [Backing; 3],
}

impl SimKernel {
    pub(crate) fn builder(sq_entries: u32) -> SimKernelBuilder {
        SimKernelBuilder {
            sq_entries,
            respond: Box::new(|_, _| 512),
            reverse: false,
        }
    }

    pub(crate) fn sq_tail(&self) -> u32 {
        self.sq_tail.observe()
    }

    pub(crate) fn sq_array(&self, slot: u32) -> u32 {
        self.array.read(slot)
    }

    pub(crate) fn sqe(&self, slot: u32) -> Sqe {
        self.sqes.read(slot)
    }

    pub(crate) fn cq_head(&self) -> u32 {
        self.cq_head.observe()
    }

    /// Tags in the order the kernel consumed them.
    pub(crate) fn submitted(&self) -> &[u64] {
        &self.submitted
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// `(to_submit, min_complete)` of every enter call.
    pub(crate) fn enter_calls(&self) -> &[(u32, u32)] {
        &self.enter_calls
    }

    fn retire_consumed(&mut self) {
        let head = self.cq_head.observe();
        while self.retired_cq_head != head {
            let tag = self.posted.pop_front().expect("user consumed an unposted completion");
            self.in_flight.remove(&tag);
            self.retired_cq_head = self.retired_cq_head.wrapping_add(1);
        }
    }

    fn execute(&mut self, seq: u64, sqe: &Sqe) -> i32 {
        let files = self.registered.unwrap_or(0);
        if sqe.opcode != sys::IORING_OP_READV {
            return -libc::EINVAL;
        }
        if sqe.flags & sys::IOSQE_FIXED_FILE == 0 || sqe.fd < 0 || sqe.fd as usize >= files {
            return -libc::EBADF;
        }
        (self.respond)(seq, sqe)
    }
}

impl Kernel for SimKernel {
    fn register_files(&mut self, fds: &[RawFd]) -> Result<(), BenchError> {
        if fds.is_empty() {
            return Err(BenchError::RegisterFiles {
                count: 0,
                source: io::Error::from_raw_os_error(libc::EINVAL),
            });
        }
        self.registered = Some(fds.len());
        Ok(())
    }

    fn enter(&mut self, to_submit: u32, min_complete: u32, flags: u32) -> Result<u32, BenchError> {
        self.enter_calls.push((to_submit, min_complete));
        self.retire_consumed();

        let queued = self.sq_tail.observe().wrapping_sub(self.local_sq_head);
        if queued > self.sqes.entries() {
            return Err(BenchError::RingLayout(format!(
                "submission ring over-full: {queued} queued"
            )));
        }

        let mut batch = Vec::new();
        for _ in 0..to_submit.min(queued) {
            let slot = self.array.read(self.local_sq_head);
            let sqe = self.sqes.read(slot);
            self.local_sq_head = self.local_sq_head.wrapping_add(1);
            if !self.in_flight.insert(sqe.user_data) {
                return Err(BenchError::SlotInFlight { tag: sqe.user_data });
            }
            self.submitted.push(sqe.user_data);
            let res = self.execute(self.submitted.len() as u64 - 1, &sqe);
            batch.push(Cqe {
                user_data: sqe.user_data,
                res,
                flags: 0,
            });
        }
        self.sq_head.publish(self.local_sq_head);
        self.max_in_flight = self.max_in_flight.max(self.in_flight.len());

        if self.reverse {
            batch.reverse();
        }
        for cqe in &batch {
            let used = self.local_cq_tail.wrapping_sub(self.cq_head.observe());
            if used >= self.cqes.entries() {
                return Err(BenchError::RingLayout("completion ring overflow".into()));
            }
            self.cqes.write(self.local_cq_tail, *cqe);
            self.posted.push_back(cqe.user_data);
            self.local_cq_tail = self.local_cq_tail.wrapping_add(1);
        }
        self.cq_tail.publish(self.local_cq_tail);

        let available = self.local_cq_tail.wrapping_sub(self.cq_head.observe());
        if flags & sys::IORING_ENTER_GETEVENTS != 0 && available < min_complete {
            return Err(BenchError::Enter {
                to_submit,
                min_complete,
                source: io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "simulated kernel would wait forever",
                ),
            });
        }
        Ok(batch.len() as u32)
    }
}
