use std::{alloc::Layout, ptr::NonNull};

use crate::error::BenchError;

/// Alignment of every read buffer; satisfies `O_DIRECT` on 4k-sector devices.
pub const BUFFER_ALIGN: usize = 4096;

/// A zeroed heap buffer aligned for direct I/O.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    pub fn new(len: usize) -> Result<Self, BenchError> {
        let layout = Layout::from_size_align(len.max(1), BUFFER_ALIGN)
            .map_err(|e| BenchError::InvalidConfig(format!("buffer of {len} bytes: {e}")))?;
        // alloc aligned to make O_DIRECT work
        let Some(ptr) = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }) else {
            std::alloc::handle_alloc_error(layout)
        };
        Ok(AlignedBuf { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// One buffer and one single-element iovec per pipeline position.
///
/// The iovec array is allocated once and never resized, so the pointers
/// handed to submissions stay valid for the whole run.
pub struct IoVecTable {
    iovecs: Box<[libc::iovec]>,
    _buffers: Vec<AlignedBuf>,
}

impl IoVecTable {
    pub fn new(positions: usize, read_size: usize) -> Result<Self, BenchError> {
        let mut buffers = (0..positions)
            .map(|_| AlignedBuf::new(read_size))
            .collect::<Result<Vec<_>, _>>()?;
        let iovecs = buffers
            .iter_mut()
            .map(|buf| libc::iovec {
                iov_base: buf.as_mut_ptr().cast(),
                iov_len: buf.len(),
            })
            .collect();
        Ok(IoVecTable {
            iovecs,
            _buffers: buffers,
        })
    }

    pub fn len(&self) -> usize {
        self.iovecs.len()
    }

    /// The iovec of pipeline position `position`.
    pub fn get(&self, position: usize) -> *const libc::iovec {
        &self.iovecs[position]
    }
}
