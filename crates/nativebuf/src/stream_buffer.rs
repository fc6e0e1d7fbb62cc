// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::heap::{GlobalHeap, HeapAllocator, HeapHandle};
use crate::{Error, NativeBuffer, Result};

/// A seekable byte stream over native heap memory that grows as it is written.
///
/// The stream has a length separate from the capacity of its memory. Writing past the end
/// extends the length, growing the capacity as needed. Reading stops at the length. The
/// position always stays within `0..=len()`.
///
/// The memory can be handed to native calls via [`handle()`][Self::handle] or
/// [`as_mut_ptr()`][Self::as_mut_ptr]. It is freed when the stream is dropped.
///
/// # Examples
///
/// ```
/// use std::io::{Read, Seek, SeekFrom, Write};
///
/// use nativebuf::StreamBuffer;
///
/// let mut stream = StreamBuffer::new();
/// stream.write_all(b"native")?;
/// assert_eq!(stream.len(), 6);
///
/// stream.seek(SeekFrom::Start(0))?;
/// let mut content = String::new();
/// stream.read_to_string(&mut content)?;
///
/// assert_eq!(content, "native");
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug)]
pub struct StreamBuffer<H: HeapAllocator = GlobalHeap> {
    memory: NativeBuffer<H>,
    length: usize,
    position: usize,
}

impl StreamBuffer {
    /// Creates an empty stream without allocating.
    #[must_use]
    pub const fn new() -> Self {
        Self::new_in(GlobalHeap::new())
    }

    /// Creates a stream of `length` zero bytes with room for at least `capacity` bytes.
    ///
    /// A capacity smaller than the length is raised to the length.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if the memory cannot be provided.
    pub fn with_len(length: usize, capacity: usize) -> Result<Self> {
        Self::with_len_in(length, capacity, GlobalHeap::new())
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HeapAllocator> StreamBuffer<H> {
    /// Creates an empty stream that takes its memory from `heap`.
    #[must_use]
    pub const fn new_in(heap: H) -> Self {
        Self {
            memory: NativeBuffer::new_in(heap),
            length: 0,
            position: 0,
        }
    }

    /// Creates a stream of `length` zero bytes with room for at least `capacity` bytes, taking
    /// its memory from `heap`.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if the memory cannot be provided.
    pub fn with_len_in(length: usize, capacity: usize, heap: H) -> Result<Self> {
        let mut stream = Self {
            memory: NativeBuffer::with_byte_capacity_in(capacity.max(length), heap)?,
            length: 0,
            position: 0,
        };
        stream.set_len(length)?;
        Ok(stream)
    }

    /// The number of bytes in the stream.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length
    }

    /// Whether the stream holds no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The byte capacity of the underlying memory.
    #[must_use]
    pub const fn byte_capacity(&self) -> usize {
        self.memory.byte_capacity()
    }

    /// The position of the next read or write.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Moves the position of the next read or write.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if `position`
    /// is beyond the length. The position is unchanged in that case.
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.length {
            return Err(Error::out_of_range(format!(
                "position {position} is beyond stream length {}",
                self.length
            )));
        }

        self.position = position;
        Ok(())
    }

    /// Sets the length of the stream.
    ///
    /// Bytes exposed by growing are zero. Shrinking keeps the capacity and pulls the position
    /// back to the new end if it was beyond it.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if the capacity cannot grow. The stream is unchanged
    /// in that case.
    pub fn set_len(&mut self, length: usize) -> Result<()> {
        if length > self.length {
            self.memory.ensure_byte_capacity(length)?;
            self.memory.as_bytes_mut()[self.length..length].fill(0);
        }

        self.length = length;
        self.position = self.position.min(length);
        Ok(())
    }

    /// Grows the stream to at least `length` bytes. A longer stream is left as is.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if the capacity cannot grow.
    pub fn ensure_len(&mut self, length: usize) -> Result<()> {
        if self.length < length {
            self.set_len(length)?;
        }

        Ok(())
    }

    /// The content of the stream.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.memory.as_bytes()[..self.length]
    }

    /// The content of the stream, for in-place modification.
    #[must_use]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let length = self.length;
        &mut self.memory.as_bytes_mut()[..length]
    }

    /// The address of the underlying memory, for passing into native calls.
    ///
    /// The pointer is null if no memory has been allocated yet. It is invalidated by any
    /// operation that grows the stream.
    #[must_use]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.memory.as_mut_ptr()
    }

    /// A handle to the underlying memory that is never absent.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn handle(&self) -> HeapHandle {
        self.memory.handle()
    }

    fn remaining(&self) -> &[u8] {
        &self.as_bytes()[self.position..]
    }
}

impl<H: HeapAllocator> Read for StreamBuffer<H> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let to_read = buf.len().min(self.remaining().len());
        buf[..to_read].copy_from_slice(&self.remaining()[..to_read]);

        self.position += to_read;
        Ok(to_read)
    }
}

impl<H: HeapAllocator> Write for StreamBuffer<H> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let end = self
            .position
            .checked_add(buf.len())
            .ok_or_else(|| Error::overflow(format!("writing {} bytes overflows the stream length", buf.len())))?;

        self.ensure_len(end)?;
        self.memory.as_bytes_mut()[self.position..end].copy_from_slice(buf);

        self.position = end;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<H: HeapAllocator> Seek for StreamBuffer<H> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(offset) => (0, i128::from(offset)),
            SeekFrom::End(offset) => (self.length, i128::from(offset)),
            SeekFrom::Current(offset) => (self.position, i128::from(offset)),
        };

        let target = i128::try_from(base)
            .ok()
            .and_then(|base| base.checked_add(offset))
            .and_then(|target| usize::try_from(target).ok())
            .ok_or_else(|| Error::out_of_range(format!("seek to {pos:?} is before the start of the stream")))?;

        self.set_position(target)?;
        Ok(self.position as u64)
    }
}
