// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::alloc::{Layout, alloc_zeroed, dealloc, realloc};
use std::num::NonZero;
use std::ptr::NonNull;

use crate::heap::HeapAllocator;
use crate::{Error, Result};

/// The alignment of every block provided by [`GlobalHeap`].
///
/// Matches the guarantee of native process heaps, which is enough for the natural
/// alignment of every primitive that [`BufferReader`][crate::BufferReader] decodes.
pub const HEAP_ALIGNMENT: usize = 8;

/// A heap allocator that obtains memory from the Rust global allocator.
///
/// This is the default allocator for all buffer types in this crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct GlobalHeap;

impl GlobalHeap {
    /// Creates a new instance of the allocator.
    ///
    /// All instances are interchangeable - a block allocated via one may be freed via another.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

// SAFETY: The global allocator returns blocks valid for the requested layout, which
// always uses HEAP_ALIGNMENT.
unsafe impl HeapAllocator for GlobalHeap {
    fn allocate(&self, byte_count: NonZero<usize>) -> Result<NonNull<u8>> {
        let layout = block_layout(byte_count)?;

        // SAFETY: Layout has a non-zero size, guaranteed by NonZero.
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr).ok_or_else(|| Error::out_of_memory(byte_count.get()))
    }

    unsafe fn resize(
        &self,
        block: NonNull<u8>,
        old_byte_count: NonZero<usize>,
        new_byte_count: NonZero<usize>,
    ) -> Result<NonNull<u8>> {
        // Validates that the new size, rounded up to the alignment, does not overflow isize.
        _ = block_layout(new_byte_count)?;
        let old_layout = block_layout(old_byte_count)?;

        // SAFETY: The caller guarantees the block came from us with the old size, so the
        // layout matches. The new size is non-zero and was validated above.
        let ptr = unsafe { realloc(block.as_ptr(), old_layout, new_byte_count.get()) };

        NonNull::new(ptr).ok_or_else(|| Error::out_of_memory(new_byte_count.get()))
    }

    unsafe fn free(&self, block: NonNull<u8>, byte_count: NonZero<usize>) {
        // The layout was valid when the block was allocated, so it is still valid now.
        let Ok(layout) = block_layout(byte_count) else {
            return;
        };

        // SAFETY: The caller guarantees the block came from us with this size.
        unsafe { dealloc(block.as_ptr(), layout) };
    }
}

fn block_layout(byte_count: NonZero<usize>) -> Result<Layout> {
    Layout::from_size_align(byte_count.get(), HEAP_ALIGNMENT).map_err(|_layout_error| {
        Error::out_of_range(format!(
            "byte capacity {byte_count} exceeds the maximum allocation size of this platform"
        ))
    })
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::ErrorKind;

    assert_impl_all!(GlobalHeap: HeapAllocator, Send, Sync, Copy);

    #[test]
    fn allocate_is_zeroed_and_aligned() {
        let heap = GlobalHeap::new();
        let size = NonZero::new(64).unwrap();

        let block = heap.allocate(size).unwrap();
        assert_eq!(block.as_ptr().align_offset(HEAP_ALIGNMENT), 0);

        // SAFETY: We just allocated 64 bytes.
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 64) };
        assert!(bytes.iter().all(|b| *b == 0));

        // SAFETY: Allocated above with this size, not yet freed.
        unsafe { heap.free(block, size) };
    }

    #[test]
    fn resize_preserves_contents() {
        let heap = GlobalHeap::new();
        let small = NonZero::new(4).unwrap();
        let large = NonZero::new(4096).unwrap();

        let block = heap.allocate(small).unwrap();

        // SAFETY: The block is 4 bytes long.
        unsafe { block.as_ptr().copy_from_nonoverlapping([1_u8, 2, 3, 4].as_ptr(), 4) };

        // SAFETY: Allocated above with the small size, not yet freed.
        let block = unsafe { heap.resize(block, small, large) }.unwrap();

        // SAFETY: The block is now 4096 bytes long.
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 4) };
        assert_eq!(bytes, &[1, 2, 3, 4]);

        // SAFETY: Resized above to the large size, not yet freed.
        unsafe { heap.free(block, large) };
    }

    #[test]
    fn allocate_beyond_address_space_is_out_of_range() {
        let heap = GlobalHeap::new();

        let error = heap.allocate(NonZero::new(usize::MAX).unwrap()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn resize_beyond_address_space_keeps_block() {
        let heap = GlobalHeap::new();
        let size = NonZero::new(16).unwrap();

        let block = heap.allocate(size).unwrap();

        // SAFETY: Allocated above with this size, not yet freed.
        let error = unsafe { heap.resize(block, size, NonZero::new(usize::MAX).unwrap()) }.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::OutOfRange);

        // The old block is still ours to free.
        // SAFETY: Allocated above with this size, not yet freed.
        unsafe { heap.free(block, size) };
    }
}
