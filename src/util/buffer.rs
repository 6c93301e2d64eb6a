//! Aligned I/O buffers
//!
//! Every task owns a data buffer (and a metadata buffer when the device keeps
//! metadata separate) allocated once at job construction and freed exactly
//! once when the task pool is dropped. Buffers are moved into a request while
//! the backend works on them and handed back with the completion.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};

/// Zero-initialised buffer with a fixed power-of-two alignment
pub struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
    layout: Layout,
}

// The buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate a zeroed buffer
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two. Aborts the process if the
    /// allocation itself fails.
    pub fn new(size: usize, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two(), "Alignment must be a power of 2");
        // Zero-sized allocations are not allowed by the global allocator.
        let alloc_size = size.max(1);
        let layout = match Layout::from_size_align(alloc_size, alignment) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid buffer layout: size {} alignment {}", size, alignment),
        };

        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }

        AlignedBuffer { ptr, size, layout }
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline(always)]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Verify that the buffer is properly aligned
    #[inline(always)]
    pub fn is_aligned(&self) -> bool {
        (self.ptr as usize) % self.layout.align() == 0
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr, self.layout);
        }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("size", &self.size)
            .field("alignment", &self.layout.align())
            .finish()
    }
}

/// Data buffer plus optional separate metadata buffer for one I/O
///
/// With interleaved metadata the metadata lives inside each block of `data`
/// and `md` is `None`.
#[derive(Debug)]
pub struct IoBuffers {
    pub data: AlignedBuffer,
    pub md: Option<AlignedBuffer>,
}

impl IoBuffers {
    /// Allocate buffers for `buf_size` bytes of data and, when `md_len` is
    /// non-zero, a separate metadata buffer of `md_len` bytes
    pub fn new(buf_size: usize, md_len: usize, alignment: usize) -> Self {
        let md = if md_len > 0 {
            Some(AlignedBuffer::new(md_len, alignment))
        } else {
            None
        };
        IoBuffers {
            data: AlignedBuffer::new(buf_size, alignment),
            md,
        }
    }

    pub fn md_slice(&self) -> Option<&[u8]> {
        self.md.as_ref().map(|md| md.as_slice())
    }

    /// Mutable views of the data and metadata regions at once
    pub fn split_mut(&mut self) -> (&mut [u8], Option<&mut [u8]>) {
        (
            self.data.as_mut_slice(),
            self.md.as_mut().map(|md| md.as_mut_slice()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer_creation() {
        let buffer = AlignedBuffer::new(4096, 4096);
        assert_eq!(buffer.len(), 4096);
        assert_eq!(buffer.alignment(), 4096);
        assert!(buffer.is_aligned());
    }

    #[test]
    fn test_aligned_buffer_is_zeroed() {
        let buffer = AlignedBuffer::new(8192, 512);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_aligned_buffer_write() {
        let mut buffer = AlignedBuffer::new(512, 512);
        buffer.as_mut_slice()[10] = 0xAB;
        assert_eq!(buffer.as_slice()[10], 0xAB);
    }

    #[test]
    fn test_zero_length_buffer() {
        let buffer = AlignedBuffer::new(0, 64);
        assert!(buffer.is_empty());
        assert!(buffer.as_slice().is_empty());
    }

    #[test]
    #[should_panic(expected = "Alignment must be a power of 2")]
    fn test_invalid_alignment() {
        AlignedBuffer::new(4096, 1000);
    }

    #[test]
    fn test_io_buffers_separate_md() {
        let mut bufs = IoBuffers::new(4096, 64, 4096);
        assert_eq!(bufs.data.len(), 4096);
        assert_eq!(bufs.md_slice().map(|m| m.len()), Some(64));

        let (data, md) = bufs.split_mut();
        data[0] = 1;
        md.unwrap()[0] = 2;
        assert_eq!(bufs.data.as_slice()[0], 1);
        assert_eq!(bufs.md_slice().unwrap()[0], 2);
    }

    #[test]
    fn test_io_buffers_without_md() {
        let bufs = IoBuffers::new(1024, 0, 512);
        assert!(bufs.md.is_none());
    }
}
