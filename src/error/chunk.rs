//! Page-sized mmap arenas backing the error-frame log.
//!
//! Frames are appended here instead of in a `Vec` because the error-frame
//! path must remain usable from code that is itself reporting an
//! allocator failure: routing frame storage through the global allocator
//! would make that failure mode recursive. Anonymous `mmap` sidesteps
//! it, the same way a lock-free primitive avoids calling back into
//! anything that could itself need a lock.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use super::frame::ErrorFrame;

/// Process-wide switch that shrinks chunks to their minimum size to
/// make chunk-rollover paths easy to hit under test.
static RACE_TEST_MODE: AtomicBool = AtomicBool::new(false);

pub fn set_race_test_mode(enabled: bool) {
    RACE_TEST_MODE.store(enabled, Ordering::Relaxed);
}

pub fn race_test_mode() -> bool {
    RACE_TEST_MODE.load(Ordering::Relaxed)
}

fn frames_per_chunk() -> usize {
    if race_test_mode() {
        return 2;
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(4096) as usize;
    (page_size / std::mem::size_of::<ErrorFrame>()).max(2)
}

struct Chunk {
    ptr: NonNull<ErrorFrame>,
    byte_len: usize,
    capacity: usize,
}

unsafe impl Send for Chunk {}

impl Chunk {
    fn new(capacity: usize) -> Self {
        let byte_len = capacity * std::mem::size_of::<ErrorFrame>();

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                byte_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        assert!(
            addr != libc::MAP_FAILED,
            "mmap failed while allocating error frame chunk"
        );

        Self {
            ptr: NonNull::new(addr as *mut ErrorFrame).unwrap(),
            byte_len,
            capacity,
        }
    }

    #[inline]
    unsafe fn slot(&self, offset: usize) -> *mut ErrorFrame {
        self.ptr.as_ptr().add(offset)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.byte_len);
        }
    }
}

/// An append-mostly, index-addressed log of frames backed by a growing
/// list of mmap chunks. Indices below the current logical tail may be
/// rewritten (this is how [`super::stack::StackState`] reclaims storage
/// for frame-sequences that were pushed and then popped without being
/// propagated).
pub struct ChunkArena {
    chunks: Vec<Chunk>,
    chunk_capacity: usize,
}

impl ChunkArena {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            chunk_capacity: frames_per_chunk(),
        }
    }

    fn ensure_capacity(&mut self, index: usize) {
        while index >= self.chunks.len() * self.chunk_capacity {
            self.chunks.push(Chunk::new(self.chunk_capacity));
        }
    }

    pub fn write(&mut self, index: usize, frame: ErrorFrame) {
        self.ensure_capacity(index);
        let chunk_ix = index / self.chunk_capacity;
        let offset = index % self.chunk_capacity;
        unsafe {
            ptr::write(self.chunks[chunk_ix].slot(offset), frame);
        }
    }

    pub fn read(&self, index: usize) -> ErrorFrame {
        let chunk_ix = index / self.chunk_capacity;
        let offset = index % self.chunk_capacity;
        unsafe { ptr::read(self.chunks[chunk_ix].slot(offset)) }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for ChunkArena {
    fn default() -> Self {
        Self::new()
    }
}
