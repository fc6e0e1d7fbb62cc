// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::num::NonZero;
use std::ptr::{self, NonNull};
use std::slice;

use nm::{Event, Magnitude};
use tracing::{Level, event};

use crate::heap::{GlobalHeap, HEAP_ALIGNMENT, HeapAllocator, HeapHandle};
use crate::{Error, Result};

/// A single contiguous block of heap memory with an explicitly managed byte capacity.
///
/// The buffer never holds a zero-length allocation: a capacity of zero always means there is
/// no backing memory. Capacity only grows via [`ensure_byte_capacity()`][Self::ensure_byte_capacity],
/// which grows to exactly the requested size - any geometric growth policy belongs to the caller.
/// [`free()`][Self::free] releases the memory and resets the capacity to zero.
///
/// Newly obtained capacity is always zero-filled.
///
/// # Thread safety
///
/// Capacity changes require `&mut self`, so they are serialized by the borrow checker. Callers
/// that need to share a buffer between threads and still change its capacity must wrap it in a
/// lock, which is what [`CharBuffer`][crate::CharBuffer] does.
///
/// # Examples
///
/// ```
/// use nativebuf::NativeBuffer;
///
/// let mut buffer = NativeBuffer::new();
/// assert_eq!(buffer.byte_capacity(), 0);
///
/// buffer.ensure_byte_capacity(16)?;
/// buffer.set(0, 0xA)?;
/// assert_eq!(buffer.get(0)?, 0xA);
///
/// buffer.free();
/// assert_eq!(buffer.byte_capacity(), 0);
/// # Ok::<(), nativebuf::Error>(())
/// ```
#[derive(Debug)]
pub struct NativeBuffer<H: HeapAllocator = GlobalHeap> {
    // None if and only if byte_capacity is zero.
    block: Option<NonNull<u8>>,
    byte_capacity: usize,
    heap: H,
}

impl NativeBuffer {
    /// Creates an empty buffer that obtains memory from the [`GlobalHeap`].
    #[must_use]
    pub const fn new() -> Self {
        Self::new_in(GlobalHeap::new())
    }

    /// Creates a buffer with exactly `min_capacity` bytes of capacity.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the memory
    /// cannot be allocated.
    pub fn with_byte_capacity(min_capacity: usize) -> Result<Self> {
        Self::with_byte_capacity_in(min_capacity, GlobalHeap::new())
    }
}

impl Default for NativeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HeapAllocator> NativeBuffer<H> {
    /// Creates an empty buffer that obtains memory from the provided allocator.
    #[must_use]
    pub const fn new_in(heap: H) -> Self {
        Self {
            block: None,
            byte_capacity: 0,
            heap,
        }
    }

    /// Creates a buffer with exactly `min_capacity` bytes of capacity, obtained from the
    /// provided allocator.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the memory
    /// cannot be allocated.
    pub fn with_byte_capacity_in(min_capacity: usize, heap: H) -> Result<Self> {
        let mut buffer = Self::new_in(heap);
        buffer.ensure_byte_capacity(min_capacity)?;
        Ok(buffer)
    }

    /// The capacity of the buffer in bytes.
    #[must_use]
    pub const fn byte_capacity(&self) -> usize {
        self.byte_capacity
    }

    /// The allocator that provides the memory of this buffer.
    #[must_use]
    pub const fn heap(&self) -> &H {
        &self.heap
    }

    /// Ensures the capacity is at least `min_capacity` bytes.
    ///
    /// Grows to exactly `min_capacity` if the buffer is smaller, allocating if the buffer is
    /// empty and resizing the existing block otherwise. Does nothing if the capacity is
    /// already sufficient - in particular, requesting zero bytes never frees anything.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the allocator
    /// cannot satisfy the request or [`OutOfRange`][crate::ErrorKind::OutOfRange] if
    /// `min_capacity` exceeds the maximum allocation size of the platform. The buffer is
    /// unchanged on error.
    pub fn ensure_byte_capacity(&mut self, min_capacity: usize) -> Result<()> {
        if min_capacity <= self.byte_capacity {
            return Ok(());
        }

        let Some(new_size) = NonZero::new(min_capacity) else {
            return Ok(());
        };

        let block = match (self.block, NonZero::new(self.byte_capacity)) {
            (Some(block), Some(old_size)) => {
                // SAFETY: The block came from our allocator with the current capacity as size.
                let block = unsafe { self.heap.resize(block, old_size, new_size) }?;

                // SAFETY: The block is new_size bytes long and old_size < new_size.
                let tail = unsafe { block.as_ptr().add(old_size.get()) };

                // SAFETY: The tail is the newly obtained new_size - old_size bytes of the block.
                unsafe { ptr::write_bytes(tail, 0, new_size.get() - old_size.get()) };

                block
            }
            _ => self.heap.allocate(new_size)?,
        };

        debug_assert_eq!(block.as_ptr().align_offset(HEAP_ALIGNMENT), 0);

        event!(
            Level::TRACE,
            message = "native buffer grown",
            old_byte_capacity = self.byte_capacity,
            new_byte_capacity = min_capacity
        );
        HEAP_GROWN_SIZE.with(|e| e.observe(min_capacity));

        self.block = Some(block);
        self.byte_capacity = min_capacity;

        Ok(())
    }

    /// Reads the byte at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if
    /// `index >= byte_capacity()`. The buffer never grows on access.
    pub fn get(&self, index: usize) -> Result<u8> {
        self.as_bytes()
            .get(index)
            .copied()
            .ok_or_else(|| Error::out_of_range(format!("index {index} is beyond byte capacity {}", self.byte_capacity)))
    }

    /// Writes the byte at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if
    /// `index >= byte_capacity()`. The buffer never grows on access.
    pub fn set(&mut self, index: usize, value: u8) -> Result<()> {
        let byte_capacity = self.byte_capacity;
        let slot = self
            .as_bytes_mut()
            .get_mut(index)
            .ok_or_else(|| Error::out_of_range(format!("index {index} is beyond byte capacity {byte_capacity}")))?;

        *slot = value;
        Ok(())
    }

    /// The entire capacity of the buffer as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self.block {
            // SAFETY: The block is byte_capacity bytes long and fully initialized, as every
            // byte is zeroed when obtained. The shared borrow of self prevents resizing.
            Some(block) => unsafe { slice::from_raw_parts(block.as_ptr(), self.byte_capacity) },
            None => &[],
        }
    }

    /// The entire capacity of the buffer as a mutable byte slice.
    #[must_use]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self.block {
            // SAFETY: See as_bytes(). The exclusive borrow of self prevents aliasing.
            Some(block) => unsafe { slice::from_raw_parts_mut(block.as_ptr(), self.byte_capacity) },
            None => &mut [],
        }
    }

    /// The entire capacity of the buffer as UTF-16 code units. A trailing odd byte is excluded.
    pub(crate) fn as_units(&self) -> &[u16] {
        match self.block {
            // SAFETY: HeapAllocator guarantees HEAP_ALIGNMENT, which is enough for u16.
            // Every byte is initialized and any bit pattern is a valid u16.
            Some(block) => unsafe { slice::from_raw_parts(block.as_ptr().cast::<u16>(), self.byte_capacity / 2) },
            None => &[],
        }
    }

    pub(crate) fn as_units_mut(&mut self) -> &mut [u16] {
        match self.block {
            // SAFETY: See as_units(). The exclusive borrow of self prevents aliasing.
            Some(block) => unsafe { slice::from_raw_parts_mut(block.as_ptr().cast::<u16>(), self.byte_capacity / 2) },
            None => &mut [],
        }
    }

    /// The address of the backing memory, or null if the buffer has no capacity.
    ///
    /// The pointer is invalidated by any capacity change.
    #[must_use]
    pub fn as_ptr(&self) -> *const u8 {
        self.block.map_or(ptr::null(), |block| block.as_ptr().cast_const())
    }

    /// The mutable address of the backing memory, or null if the buffer has no capacity.
    ///
    /// The pointer is invalidated by any capacity change.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.block.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// A handle to the backing memory for passing into native calls.
    ///
    /// Returns [`HeapHandle::EMPTY`] rather than a missing handle when there is no backing memory.
    #[must_use]
    pub fn handle(&self) -> HeapHandle {
        self.block.map_or(HeapHandle::EMPTY, |block| HeapHandle::new(block.as_ptr()))
    }

    /// Releases the backing memory and resets the capacity to zero.
    ///
    /// Does nothing if the buffer has no backing memory, so it is safe to call repeatedly.
    pub fn free(&mut self) {
        if let (Some(block), Some(size)) = (self.block.take(), NonZero::new(self.byte_capacity)) {
            // SAFETY: The block came from our allocator with the current capacity as size.
            // We took it out of self, so it cannot be used again.
            unsafe { self.heap.free(block, size) };

            event!(Level::TRACE, message = "native buffer freed", byte_capacity = size.get());
        }

        self.byte_capacity = 0;
    }
}

impl<H: HeapAllocator> Drop for NativeBuffer<H> {
    fn drop(&mut self) {
        self.free();
    }
}

impl<H: HeapAllocator> From<&NativeBuffer<H>> for HeapHandle {
    fn from(buffer: &NativeBuffer<H>) -> Self {
        buffer.handle()
    }
}

// SAFETY: The buffer exclusively owns its block, like a Box<[u8]> would. The allocator is
// required to be thread-safe, so the block may be freed on any thread.
unsafe impl<H: HeapAllocator> Send for NativeBuffer<H> {}

// SAFETY: Shared references only permit reading the block, and every mutation
// (content or capacity) requires an exclusive reference.
unsafe impl<H: HeapAllocator> Sync for NativeBuffer<H> {}

// Histogram buckets for the byte capacity that buffers grow to.
const GROWN_SIZE_BUCKETS: &[Magnitude] = &[0, 64, 256, 1024, 4096, 16_384, 65_536, 262_144, 1_048_576];

thread_local! {
    static HEAP_GROWN_SIZE: Event = Event::builder()
        .name("nativebuf_heap_grown_size")
        .histogram(GROWN_SIZE_BUCKETS)
        .build();
}
