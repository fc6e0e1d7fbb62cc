// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Result;
use crate::heap::{GlobalHeap, HeapAllocator};

/// A heap allocator that delegates to [`GlobalHeap`] and counts every call.
///
/// Clones share the same counters, so a test can keep one clone for inspection
/// while handing others to the buffers under test.
#[derive(Clone, Debug, Default)]
pub struct CountingHeap {
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicUsize,
    resizes: AtomicUsize,
    frees: AtomicUsize,
    live_bytes: AtomicUsize,
}

/// A point-in-time snapshot of the counters of a [`CountingHeap`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeapCounters {
    /// Number of successful `allocate()` calls.
    pub allocations: usize,
    /// Number of successful `resize()` calls.
    pub resizes: usize,
    /// Number of `free()` calls.
    pub frees: usize,
    /// Total size of all blocks currently allocated and not yet freed.
    pub live_bytes: usize,
}

impl HeapCounters {
    /// Number of blocks allocated and not yet freed.
    #[must_use]
    pub const fn live_blocks(&self) -> usize {
        self.allocations.saturating_sub(self.frees)
    }
}

impl CountingHeap {
    /// Creates a new allocator with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn counters(&self) -> HeapCounters {
        HeapCounters {
            allocations: self.counters.allocations.load(Ordering::SeqCst),
            resizes: self.counters.resizes.load(Ordering::SeqCst),
            frees: self.counters.frees.load(Ordering::SeqCst),
            live_bytes: self.counters.live_bytes.load(Ordering::SeqCst),
        }
    }
}

// SAFETY: Every block comes from GlobalHeap.
unsafe impl HeapAllocator for CountingHeap {
    fn allocate(&self, byte_count: NonZero<usize>) -> Result<NonNull<u8>> {
        let block = GlobalHeap.allocate(byte_count)?;

        self.counters.allocations.fetch_add(1, Ordering::SeqCst);
        self.counters.live_bytes.fetch_add(byte_count.get(), Ordering::SeqCst);

        Ok(block)
    }

    unsafe fn resize(
        &self,
        block: NonNull<u8>,
        old_byte_count: NonZero<usize>,
        new_byte_count: NonZero<usize>,
    ) -> Result<NonNull<u8>> {
        // SAFETY: Forwarding the safety requirements of the caller.
        let block = unsafe { GlobalHeap.resize(block, old_byte_count, new_byte_count) }?;

        self.counters.resizes.fetch_add(1, Ordering::SeqCst);
        self.counters.live_bytes.fetch_sub(old_byte_count.get(), Ordering::SeqCst);
        self.counters.live_bytes.fetch_add(new_byte_count.get(), Ordering::SeqCst);

        Ok(block)
    }

    unsafe fn free(&self, block: NonNull<u8>, byte_count: NonZero<usize>) {
        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe { GlobalHeap.free(block, byte_count) };

        self.counters.frees.fetch_add(1, Ordering::SeqCst);
        self.counters.live_bytes.fetch_sub(byte_count.get(), Ordering::SeqCst);
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_block_lifecycle() {
        let heap = CountingHeap::new();
        let observer = heap.clone();

        let small = NonZero::new(10).unwrap();
        let large = NonZero::new(30).unwrap();

        let block = heap.allocate(small).unwrap();
        assert_eq!(observer.counters().live_bytes, 10);
        assert_eq!(observer.counters().live_blocks(), 1);

        // SAFETY: Allocated above with the small size, not yet freed.
        let block = unsafe { heap.resize(block, small, large) }.unwrap();
        assert_eq!(observer.counters().live_bytes, 30);
        assert_eq!(observer.counters().resizes, 1);

        // SAFETY: Resized above to the large size, not yet freed.
        unsafe { heap.free(block, large) };

        assert_eq!(
            observer.counters(),
            HeapCounters {
                allocations: 1,
                resizes: 1,
                frees: 1,
                live_bytes: 0,
            }
        );
        assert_eq!(observer.counters().live_blocks(), 0);
    }
}
