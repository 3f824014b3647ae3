//! Kernel io_uring ABI records and the raw syscall wrappers around them.
//!
//! Layouts follow `<linux/io_uring.h>`. Field offsets inside the mapped rings
//! are never assumed here; they come back from `io_uring_setup` in
//! [`IoUringParams`].

use std::{
    io,
    os::fd::{FromRawFd, OwnedFd, RawFd},
};

pub const IORING_OFF_SQ_RING: libc::off_t = 0;
pub const IORING_OFF_CQ_RING: libc::off_t = 0x8000000;
pub const IORING_OFF_SQES: libc::off_t = 0x10000000;

pub const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;

pub const IORING_ENTER_GETEVENTS: u32 = 1 << 0;

pub const IORING_REGISTER_FILES: u32 = 2;

pub const IORING_OP_READV: u8 = 1;

pub const IOSQE_FIXED_FILE: u8 = 1 << 0;

/// Upper bound the kernel accepts for `entries` in `io_uring_setup`.
pub const IORING_MAX_ENTRIES: u32 = 32768;

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv1: u32,
    pub user_addr: u64,
}

#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IoUringParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

/// Submission queue entry, 64 bytes.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub rw_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub addr3: u64,
    pub pad: u64,
}

impl Sqe {
    /// A vectored positional read against a registered (fixed) file.
    ///
    /// `file_index` indexes the table passed to `IORING_REGISTER_FILES`, not a
    /// raw descriptor.
    pub fn readv_fixed(
        file_index: u32,
        iovecs: *const libc::iovec,
        nr_vecs: u32,
        offset: u64,
        user_data: u64,
    ) -> Self {
        Sqe {
            opcode: IORING_OP_READV,
            flags: IOSQE_FIXED_FILE,
            fd: file_index as i32,
            off: offset,
            addr: iovecs as u64,
            len: nr_vecs,
            user_data,
            ..Default::default()
        }
    }
}

/// Completion queue entry, 16 bytes.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

const _: () = assert!(std::mem::size_of::<IoUringParams>() == 120);
const _: () = assert!(std::mem::size_of::<Sqe>() == 64);
const _: () = assert!(std::mem::size_of::<Cqe>() == 16);

pub fn io_uring_setup(entries: u32, params: &mut IoUringParams) -> io::Result<OwnedFd> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries as libc::c_uint,
            params as *mut IoUringParams,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the kernel just handed us a fresh descriptor that nobody else owns
    Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) })
}

pub fn io_uring_enter(
    ring_fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
) -> io::Result<u32> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            ring_fd,
            to_submit as libc::c_uint,
            min_complete as libc::c_uint,
            flags as libc::c_uint,
            std::ptr::null::<libc::c_void>(),
            0 as libc::size_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u32)
}

pub fn io_uring_register(
    ring_fd: RawFd,
    opcode: u32,
    arg: *const libc::c_void,
    nr_args: u32,
) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_io_uring_register,
            ring_fd,
            opcode as libc::c_uint,
            arg,
            nr_args as libc::c_uint,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Invokes the out-of-tree "set level" hint syscall on a descriptor.
///
/// Returns the raw syscall result; negative means the kernel refused.
pub fn set_level_hint(syscall_nr: libc::c_long, fd: RawFd, level: u32) -> libc::c_long {
    unsafe { libc::syscall(syscall_nr, fd, level as libc::c_int) }
}
