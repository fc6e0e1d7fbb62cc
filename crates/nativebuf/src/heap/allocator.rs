// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::num::NonZero;
use std::ptr::NonNull;

use crate::Result;

/// Provides raw blocks of heap memory to [`NativeBuffer`][crate::NativeBuffer].
///
/// An allocator hands out contiguous blocks of memory of an exact byte count, can resize
/// a block it previously handed out and takes blocks back when they are freed.
///
/// Blocks are never zero-sized - a buffer with no capacity holds no block at all.
///
/// # Safety
///
/// Every block returned by [`allocate()`][Self::allocate] or [`resize()`][Self::resize] must
/// be valid for reads and writes of the requested byte count and aligned to at least
/// [`HEAP_ALIGNMENT`][crate::heap::HEAP_ALIGNMENT] bytes. Buffers rely on this to view their
/// memory as typed slices.
///
/// # Failure
///
/// An allocator signals an inability to satisfy a request by returning an error of kind
/// [`OutOfMemory`][crate::ErrorKind::OutOfMemory]. A request that can never be satisfied
/// on the current platform (e.g. larger than the address space) returns an error of kind
/// [`OutOfRange`][crate::ErrorKind::OutOfRange]. A failed call leaves any existing block
/// untouched and still owned by the caller.
///
/// # Thread safety
///
/// Allocators are shared between buffers that may live on different threads, so they
/// must be thread-safe. A block may be freed on a different thread than it was allocated on.
pub unsafe trait HeapAllocator: Debug + Send + Sync {
    /// Allocates a block of exactly `byte_count` bytes.
    ///
    /// The contents of the block are zeroed.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the memory
    /// is not available or [`OutOfRange`][crate::ErrorKind::OutOfRange] if the size cannot be
    /// represented as an allocation on this platform.
    fn allocate(&self, byte_count: NonZero<usize>) -> Result<NonNull<u8>>;

    /// Resizes a block, possibly moving it.
    ///
    /// The contents up to the smaller of the two sizes are preserved. Any bytes beyond
    /// the old size have unspecified contents.
    ///
    /// # Errors
    ///
    /// Same as [`allocate()`][Self::allocate]. On error, `block` remains valid with its old size.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by this allocator with a current size of
    /// `old_byte_count` and must not have been freed.
    unsafe fn resize(
        &self,
        block: NonNull<u8>,
        old_byte_count: NonZero<usize>,
        new_byte_count: NonZero<usize>,
    ) -> Result<NonNull<u8>>;

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by this allocator with a current size of
    /// `byte_count` and must not have been freed. It must not be used afterwards.
    unsafe fn free(&self, block: NonNull<u8>, byte_count: NonZero<usize>);
}
