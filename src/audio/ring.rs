//! Lock-free single-producer single-consumer ring buffer
//!
//! The basis of every real-time boundary in the engine: network pipeline
//! threads exchange samples with the host audio callback exclusively
//! through these rings.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Lock-free SPSC ring buffer over trivially copyable elements
///
/// One slot is reserved to distinguish full from empty, so a ring built
/// with `new(capacity)` holds at most `capacity` elements.
///
/// # Contract
///
/// `write` must only ever be called from a single designated producer
/// thread and `read` from a single designated consumer thread (the two
/// may differ). Both are wait-free and allocation-free: under- and
/// over-subscription return a short count, never block.
///
/// The cursors live on independent cache lines so the producer and
/// consumer do not false-share.
pub struct SpscRing<T: Copy> {
    data: UnsafeCell<Box<[T]>>,
    /// Storage length, capacity + 1
    storage_len: usize,
    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,
}

// The SPSC contract above is what makes the UnsafeCell sound.
unsafe impl<T: Copy + Send> Send for SpscRing<T> {}
unsafe impl<T: Copy + Send> Sync for SpscRing<T> {}

impl<T: Copy + Default> SpscRing<T> {
    /// Create a ring holding up to `capacity` elements
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: UnsafeCell::new(vec![T::default(); capacity + 1].into_boxed_slice()),
            storage_len: capacity + 1,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }
}

impl<T: Copy> SpscRing<T> {
    /// Usable capacity (excludes the reserved slot)
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage_len - 1
    }

    /// Write elements from `src` (PRODUCER side only)
    ///
    /// Returns the number of elements actually written; 0 when the ring
    /// is full or `src` is empty. Wrap-around is handled as up to two
    /// contiguous copies.
    pub fn write(&self, src: &[T]) -> usize {
        let write_idx = self.write_pos.load(Ordering::Relaxed);
        let read_idx = self.read_pos.load(Ordering::Acquire);

        let free = self.free_between(write_idx, read_idx);
        let to_write = src.len().min(free);
        if to_write == 0 {
            return 0;
        }

        // Safety: SPSC contract, we are the only writer; the consumer
        // only touches slots outside [write_idx, write_idx + to_write).
        let data = unsafe { (*self.data.get()).as_mut_ptr() };

        let first = to_write.min(self.storage_len - write_idx);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), data.add(write_idx), first);
            if first < to_write {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), data, to_write - first);
            }
        }

        self.write_pos
            .store((write_idx + to_write) % self.storage_len, Ordering::Release);

        to_write
    }

    /// Read elements into `dst` (CONSUMER side only)
    ///
    /// Returns the number of elements actually read; 0 when the ring is
    /// empty or `dst` is empty.
    pub fn read(&self, dst: &mut [T]) -> usize {
        let read_idx = self.read_pos.load(Ordering::Relaxed);
        let write_idx = self.write_pos.load(Ordering::Acquire);

        let avail = self.available_between(read_idx, write_idx);
        let to_read = dst.len().min(avail);
        if to_read == 0 {
            return 0;
        }

        // Safety: SPSC contract, we are the only reader.
        let data = unsafe { (*self.data.get()).as_ptr() };

        let first = to_read.min(self.storage_len - read_idx);
        unsafe {
            std::ptr::copy_nonoverlapping(data.add(read_idx), dst.as_mut_ptr(), first);
            if first < to_read {
                std::ptr::copy_nonoverlapping(data, dst.as_mut_ptr().add(first), to_read - first);
            }
        }

        self.read_pos
            .store((read_idx + to_read) % self.storage_len, Ordering::Release);

        to_read
    }

    /// Elements available for reading; callable from either side
    #[must_use]
    pub fn available(&self) -> usize {
        let write_idx = self.write_pos.load(Ordering::Acquire);
        let read_idx = self.read_pos.load(Ordering::Acquire);
        self.available_between(read_idx, write_idx)
    }

    /// Free space available for writing; callable from either side
    #[must_use]
    pub fn free(&self) -> usize {
        let write_idx = self.write_pos.load(Ordering::Acquire);
        let read_idx = self.read_pos.load(Ordering::Acquire);
        self.free_between(write_idx, read_idx)
    }

    /// Check if the ring is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    /// Check if the ring is full
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Reset to empty
    ///
    /// Not safe to call while a producer or consumer is active.
    pub fn reset(&self) {
        self.write_pos.store(0, Ordering::Release);
        self.read_pos.store(0, Ordering::Release);
    }

    fn available_between(&self, read_idx: usize, write_idx: usize) -> usize {
        if write_idx >= read_idx {
            write_idx - read_idx
        } else {
            self.storage_len - read_idx + write_idx
        }
    }

    fn free_between(&self, write_idx: usize, read_idx: usize) -> usize {
        if read_idx > write_idx {
            read_idx - write_idx - 1
        } else {
            self.storage_len - write_idx + read_idx - 1
        }
    }
}
