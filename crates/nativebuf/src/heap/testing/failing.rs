// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::num::NonZero;
use std::ptr::NonNull;

use crate::heap::{GlobalHeap, HeapAllocator};
use crate::{Error, Result};

/// A heap allocator that refuses every request above a configurable limit.
///
/// Requests at or below the limit are served by [`GlobalHeap`]. Use a limit of zero to
/// simulate an exhausted heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingHeap {
    limit: usize,
}

impl FailingHeap {
    /// Creates an allocator that fails every request.
    #[must_use]
    pub const fn new() -> Self {
        Self { limit: 0 }
    }

    /// Creates an allocator that fails every request for more than `limit` bytes.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self { limit }
    }
}

// SAFETY: Every block comes from GlobalHeap.
unsafe impl HeapAllocator for FailingHeap {
    fn allocate(&self, byte_count: NonZero<usize>) -> Result<NonNull<u8>> {
        if byte_count.get() > self.limit {
            return Err(Error::out_of_memory(byte_count.get()));
        }

        GlobalHeap.allocate(byte_count)
    }

    unsafe fn resize(
        &self,
        block: NonNull<u8>,
        old_byte_count: NonZero<usize>,
        new_byte_count: NonZero<usize>,
    ) -> Result<NonNull<u8>> {
        if new_byte_count.get() > self.limit {
            return Err(Error::out_of_memory(new_byte_count.get()));
        }

        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe { GlobalHeap.resize(block, old_byte_count, new_byte_count) }
    }

    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    unsafe fn free(&self, block: NonNull<u8>, byte_count: NonZero<usize>) {
        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe { GlobalHeap.free(block, byte_count) };
    }
}
