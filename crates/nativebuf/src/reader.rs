// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use num_traits::PrimInt;

use crate::decode::read_le;
use crate::heap::{GlobalHeap, HeapAllocator};
use crate::{Error, NativeBuffer, Result};

/// A cursor that decodes primitive values and UTF-16 character runs from a [`NativeBuffer`].
///
/// The reader borrows the buffer and never copies or resizes it. Every read starts at the
/// current byte offset and advances it by exactly the number of bytes consumed. All
/// multi-byte values are little-endian and may start at any byte offset, aligned or not.
///
/// The only way to move backwards is [`set_byte_offset()`][Self::set_byte_offset].
///
/// # Examples
///
/// ```
/// use nativebuf::{BufferReader, NativeBuffer};
///
/// let mut buffer = NativeBuffer::with_byte_capacity(6)?;
/// buffer.as_bytes_mut().copy_from_slice(&[0x01, 0x00, 0x00, 0x00, b'A', 0x00]);
///
/// let mut reader = BufferReader::new(&buffer);
/// assert_eq!(reader.read_u32()?, 1);
/// assert_eq!(reader.read_string(1)?, "A");
/// assert_eq!(reader.byte_offset(), 6);
/// # Ok::<(), nativebuf::Error>(())
/// ```
#[derive(Debug)]
pub struct BufferReader<'a, H: HeapAllocator = GlobalHeap> {
    buffer: &'a NativeBuffer<H>,
    byte_offset: usize,
}

impl<'a, H: HeapAllocator> BufferReader<'a, H> {
    /// Creates a reader positioned at the start of the buffer.
    #[must_use]
    pub const fn new(buffer: &'a NativeBuffer<H>) -> Self {
        Self { buffer, byte_offset: 0 }
    }

    /// The offset of the next read, in bytes from the start of the buffer.
    #[must_use]
    pub const fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Moves the cursor to `offset` bytes from the start of the buffer.
    ///
    /// The offset may be equal to the byte capacity, in which case every further read fails.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if `offset` is
    /// greater than the byte capacity of the buffer. The cursor is unchanged on error.
    pub fn set_byte_offset(&mut self, offset: usize) -> Result<()> {
        if offset > self.buffer.byte_capacity() {
            return Err(Error::out_of_range(format!(
                "offset {offset} is beyond byte capacity {}",
                self.buffer.byte_capacity()
            )));
        }

        self.byte_offset = offset;
        Ok(())
    }

    /// Reads a run of `char_count` UTF-16 code units as a string.
    ///
    /// Unpaired surrogates are replaced with `U+FFFD`. Embedded nulls are kept.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if the run extends
    /// past the end of the buffer.
    pub fn read_string(&mut self, char_count: usize) -> Result<String> {
        if char_count == 0 {
            return Ok(String::new());
        }

        let units = self.read_utf16(char_count)?;
        Ok(String::from_utf16_lossy(&units))
    }

    /// Reads a run of `char_count` UTF-16 code units without decoding them.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if the run extends
    /// past the end of the buffer.
    pub fn read_utf16(&mut self, char_count: usize) -> Result<Vec<u16>> {
        let byte_count = char_count
            .checked_mul(2)
            .filter(|byte_count| *byte_count <= self.remaining())
            .ok_or_else(|| {
                Error::out_of_range(format!(
                    "char count {char_count} exceeds the {} bytes remaining",
                    self.remaining()
                ))
            })?;

        let bytes = &self.buffer.as_bytes()[self.byte_offset..self.byte_offset + byte_count];
        let units = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        self.byte_offset += byte_count;
        Ok(units)
    }

    /// Reads a little-endian `i16`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`EndOfData`][crate::ErrorKind::EndOfData] if fewer than
    /// 2 bytes remain.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn read_i16(&mut self) -> Result<i16> {
        self.read_num()
    }

    /// Reads a little-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`EndOfData`][crate::ErrorKind::EndOfData] if fewer than
    /// 2 bytes remain.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_num()
    }

    /// Reads a little-endian `i32`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`EndOfData`][crate::ErrorKind::EndOfData] if fewer than
    /// 4 bytes remain.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_num()
    }

    /// Reads a little-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`EndOfData`][crate::ErrorKind::EndOfData] if fewer than
    /// 4 bytes remain.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_num()
    }

    /// Reads a little-endian `i64`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`EndOfData`][crate::ErrorKind::EndOfData] if fewer than
    /// 8 bytes remain.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_num()
    }

    /// Reads a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`EndOfData`][crate::ErrorKind::EndOfData] if fewer than
    /// 8 bytes remain.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_num()
    }

    /// Reads a little-endian pointer-sized signed integer.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`EndOfData`][crate::ErrorKind::EndOfData] if fewer than
    /// `size_of::<isize>()` bytes remain.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn read_isize(&mut self) -> Result<isize> {
        self.read_num()
    }

    /// Reads a little-endian pointer-sized unsigned integer.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`EndOfData`][crate::ErrorKind::EndOfData] if fewer than
    /// `size_of::<usize>()` bytes remain.
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    pub fn read_usize(&mut self) -> Result<usize> {
        self.read_num()
    }

    fn read_num<T: PrimInt>(&mut self) -> Result<T> {
        let value = read_le::<T>(&self.buffer.as_bytes()[self.byte_offset..]).ok_or_else(|| {
            Error::end_of_data(format!(
                "reading {} bytes at offset {} exceeds byte capacity {}",
                size_of::<T>(),
                self.byte_offset,
                self.buffer.byte_capacity()
            ))
        })?;

        self.byte_offset += size_of::<T>();
        Ok(value)
    }

    fn remaining(&self) -> usize {
        self.buffer.byte_capacity() - self.byte_offset
    }
}
