// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::ptr;
use std::str::FromStr;

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

use crate::heap::{GlobalHeap, HeapAllocator, HeapHandle};
use crate::{BufferReader, Error, NativeBuffer, Result};

/// The longest run of characters that can be materialized as a single string.
///
/// Matches the string size limit of the native interop layer, so buffers may hold more
/// characters than this but cannot convert them to a string in one piece.
pub const MAX_STRING_LENGTH: u32 = 0x7FFF_FFFF;

/// A growable, always null-terminated buffer of UTF-16 code units.
///
/// `CharBuffer` is a replacement for building strings when calling native APIs that take a
/// character buffer and a capacity. It separates the logical length (the characters in use)
/// from the character capacity (the allocated slots, including the one reserved for the
/// null terminator). After every successful mutation the unit at index [`len()`][Self::len]
/// is null.
///
/// Positions and counts are in UTF-16 code units. Where an operation accepts an
/// `Option<u32>` count, `None` means "everything remaining".
///
/// # Thread safety
///
/// The buffer is safe to share between threads. Each instance owns a reader/writer lock:
///
/// * Searches, comparisons and materialization take a shared lock for the duration of the scan.
/// * Appends take an upgradable lock to read the current length and only upgrade to exclusive
///   access for the write, so concurrent appends never lose each other's data.
/// * Length changes, trimming and indexed writes take an exclusive lock.
/// * Copies between two buffers hold the source shared and the destination exclusively for the
///   whole copy. The two locks are always taken in address order, so opposing copies between
///   the same pair of buffers cannot deadlock.
///
/// # Examples
///
/// ```
/// use nativebuf::CharBuffer;
///
/// let buffer = CharBuffer::new();
/// buffer.append_str("a,b,,c", 0, None)?;
///
/// assert_eq!(buffer.len(), 6);
/// assert_eq!(buffer.split(u16::from(b','), false)?, ["a", "b", "", "c"]);
/// assert_eq!(buffer.split(u16::from(b','), true)?, ["a", "b", "c"]);
/// # Ok::<(), nativebuf::Error>(())
/// ```
#[derive(Debug)]
pub struct CharBuffer<H: HeapAllocator = GlobalHeap> {
    state: RwLock<State<H>>,
}

#[derive(Debug)]
struct State<H: HeapAllocator> {
    memory: NativeBuffer<H>,

    // Always less than the character capacity, except for an empty buffer without memory.
    length: u32,
}

impl CharBuffer {
    /// Creates an empty buffer without any capacity.
    #[must_use]
    pub const fn new() -> Self {
        Self::new_in(GlobalHeap::new())
    }

    /// Creates an empty buffer with exactly `char_capacity` character slots, including the
    /// slot for the null terminator.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the memory
    /// cannot be allocated.
    pub fn with_char_capacity(char_capacity: u32) -> Result<Self> {
        Self::with_char_capacity_in(char_capacity, GlobalHeap::new())
    }

    /// Creates a buffer holding a copy of the UTF-16 code units.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`Overflow`][crate::ErrorKind::Overflow] if the input is too
    /// long for a buffer or [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the memory cannot
    /// be allocated.
    pub fn from_utf16(units: &[u16]) -> Result<Self> {
        Self::from_utf16_in(units, GlobalHeap::new())
    }
}

impl Default for CharBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for CharBuffer {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::from_str_in(value, GlobalHeap::new())
    }
}

impl<H: HeapAllocator> CharBuffer<H> {
    /// Creates an empty buffer that obtains memory from the provided allocator.
    #[must_use]
    pub const fn new_in(heap: H) -> Self {
        Self {
            state: RwLock::new(State {
                memory: NativeBuffer::new_in(heap),
                length: 0,
            }),
        }
    }

    /// Creates an empty buffer with exactly `char_capacity` character slots, obtained from
    /// the provided allocator.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the memory
    /// cannot be allocated.
    pub fn with_char_capacity_in(char_capacity: u32, heap: H) -> Result<Self> {
        let mut buffer = Self::new_in(heap);
        buffer.state.get_mut().ensure_char_capacity(char_capacity)?;
        Ok(buffer)
    }

    /// Creates a buffer holding a copy of the string, encoded as UTF-16.
    ///
    /// The capacity is exactly one more than the encoded length.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`Overflow`][crate::ErrorKind::Overflow] if the input is too
    /// long for a buffer or [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the memory cannot
    /// be allocated.
    pub fn from_str_in(value: &str, heap: H) -> Result<Self> {
        let units: Vec<u16> = value.encode_utf16().collect();
        Self::from_utf16_in(&units, heap)
    }

    /// Creates a buffer holding a copy of the UTF-16 code units, obtained from the provided
    /// allocator.
    ///
    /// An empty input creates a buffer without any capacity.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`Overflow`][crate::ErrorKind::Overflow] if the input is too
    /// long for a buffer or [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the memory cannot
    /// be allocated.
    pub fn from_utf16_in(units: &[u16], heap: H) -> Result<Self> {
        let mut buffer = Self::new_in(heap);

        if !units.is_empty() {
            buffer.state.get_mut().write_at(0, units)?;
        }

        Ok(buffer)
    }

    /// The number of character slots, including the slot for the null terminator.
    ///
    /// Saturates at `u32::MAX` for buffers with an even larger byte capacity.
    #[must_use]
    pub fn char_capacity(&self) -> u32 {
        self.state.read().char_capacity()
    }

    /// Ensures the capacity is at least `min_capacity` character slots.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the memory
    /// cannot be allocated. The buffer is unchanged on error.
    pub fn ensure_char_capacity(&self, min_capacity: u32) -> Result<()> {
        self.state.write().ensure_char_capacity(min_capacity)
    }

    /// The logical length in characters, not counting the null terminator.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.state.read().length
    }

    /// Whether the logical length is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets the logical length, growing the capacity to `length + 1` if needed and writing the
    /// null terminator at `length`.
    ///
    /// Shrinking never reduces the capacity. Growing exposes whatever the capacity held beyond
    /// the old length, which is zero for never-written memory.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`Overflow`][crate::ErrorKind::Overflow] if `length + 1` does
    /// not fit in a `u32` or [`OutOfMemory`][crate::ErrorKind::OutOfMemory] if the capacity
    /// cannot grow. The buffer is unchanged on error.
    pub fn set_len(&self, length: u32) -> Result<()> {
        self.state.write().set_len(length)
    }

    /// Sets the logical length to zero, keeping the capacity.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.length = 0;

        if let Some(first) = state.memory.as_units_mut().first_mut() {
            *first = 0;
        }
    }

    /// Sets the length to the index of the first null within the capacity.
    ///
    /// Intended for native APIs that null-terminate their output without reporting its length.
    /// If there is no null anywhere within the capacity, the length is left unchanged.
    pub fn set_len_to_first_null(&self) {
        let mut state = self.state.write();
        let char_capacity = state.char_capacity() as usize;

        let first_null = state.memory.as_units()[..char_capacity]
            .iter()
            .position(|unit| *unit == 0)
            .and_then(|index| u32::try_from(index).ok());

        if let Some(index) = first_null {
            state.length = index;
        }
    }

    /// Reads the character at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if
    /// `index >= len()`.
    pub fn get(&self, index: u32) -> Result<u16> {
        let state = self.state.read();

        state
            .content()
            .get(index as usize)
            .copied()
            .ok_or_else(|| Error::out_of_range(format!("index {index} is beyond length {}", state.length)))
    }

    /// Overwrites the character at `index`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if
    /// `index >= len()`. The buffer never grows on indexed access.
    pub fn set(&self, index: u32, value: u16) -> Result<()> {
        let mut state = self.state.write();
        let length = state.length;

        let slot = state
            .content_mut()
            .get_mut(index as usize)
            .ok_or_else(|| Error::out_of_range(format!("index {index} is beyond length {length}")))?;

        *slot = value;
        Ok(())
    }

    /// Searches for `value`, skipping the first `skip` characters.
    ///
    /// Returns whether the character was found and its index. If it was not found, the index
    /// is `len() + 1`, which callers may rely on as "past the end".
    #[must_use]
    pub fn index_of(&self, value: u16, skip: u32) -> (bool, u32) {
        let state = self.state.read();

        let found = state
            .content()
            .get(skip as usize..)
            .and_then(|tail| tail.iter().position(|unit| *unit == value))
            .and_then(|offset| u32::try_from(offset).ok());

        match found {
            Some(offset) => (true, skip + offset),
            None => (false, state.length.saturating_add(1)),
        }
    }

    /// Whether the content starts with the string, compared ordinally by UTF-16 code unit.
    #[must_use]
    pub fn starts_with(&self, value: &str) -> bool {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.starts_with_utf16(&units)
    }

    /// Whether the content starts with the UTF-16 code units.
    ///
    /// Returns `false` if `value` is longer than the content.
    #[must_use]
    pub fn starts_with_utf16(&self, value: &[u16]) -> bool {
        self.state.read().content().starts_with(value)
    }

    /// Whether the substring of `count` characters at `start_index` equals the string.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if the substring
    /// extends past the end of the content.
    pub fn substring_equals(&self, value: &str, start_index: u32, count: Option<u32>) -> Result<bool> {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.substring_equals_utf16(&units, start_index, count)
    }

    /// Whether the substring of `count` characters at `start_index` equals the UTF-16 code units.
    ///
    /// A substring of a different length than `value` is not equal, which is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if the substring
    /// extends past the end of the content.
    pub fn substring_equals_utf16(&self, value: &[u16], start_index: u32, count: Option<u32>) -> Result<bool> {
        let state = self.state.read();
        let range = state.range(start_index, count)?;

        Ok(&state.content()[range] == value)
    }

    /// Appends a single character.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if the length is
    /// already at its maximum or an allocation error if the capacity cannot grow.
    pub fn push(&self, value: u16) -> Result<()> {
        let state = self.state.upgradable_read();

        let old_length = state.length;
        if old_length == u32::MAX {
            return Err(Error::out_of_range("value: the buffer is at its maximum length"));
        }

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.set_len(old_length + 1)?;
        state.memory.as_units_mut()[old_length as usize] = value;

        Ok(())
    }

    /// Appends `count` copies of a character.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if the resulting
    /// length would not fit or an allocation error if the capacity cannot grow.
    pub fn push_repeated(&self, value: u16, count: u32) -> Result<()> {
        let state = self.state.upgradable_read();

        let old_length = state.length;
        if count >= u32::MAX - old_length {
            return Err(Error::out_of_range(format!(
                "count {count} would overflow length {old_length}"
            )));
        }

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        let new_length = old_length + count;
        state.set_len(new_length)?;
        state.memory.as_units_mut()[old_length as usize..new_length as usize].fill(value);

        Ok(())
    }

    /// Appends `count` characters of the string, starting at `start_index`.
    ///
    /// Positions within `value` count UTF-16 code units of its encoding.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if the range
    /// falls outside `value` or an allocation error if the capacity cannot grow.
    pub fn append_str(&self, value: &str, start_index: u32, count: Option<u32>) -> Result<()> {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.append_utf16(&units, start_index, count)
    }

    /// Appends `count` UTF-16 code units from `value`, starting at `start_index`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if the range
    /// falls outside `value`, [`Overflow`][crate::ErrorKind::Overflow] if the resulting length
    /// would not fit or an allocation error if the capacity cannot grow.
    pub fn append_utf16(&self, value: &[u16], start_index: u32, count: Option<u32>) -> Result<()> {
        let units = source_range(value, start_index, count)?;
        if units.is_empty() {
            return Ok(());
        }

        let state = self.state.upgradable_read();
        let length = state.length;
        end_index(length, units)?;

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.write_at(length, units)
    }

    /// Appends `count` characters of another buffer, starting at `start_index`.
    ///
    /// With a `count` of `None`, appends everything from `start_index` to the end of `source`.
    /// The source is locked for the duration of the copy, so its length cannot change between
    /// computing the count and copying.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`InvalidArgument`][crate::ErrorKind::InvalidArgument] if
    /// `source` is this buffer, [`OutOfRange`][crate::ErrorKind::OutOfRange] if the range
    /// falls outside `source` or an allocation error if the capacity cannot grow.
    pub fn append_buffer(&self, source: &Self, start_index: u32, count: Option<u32>) -> Result<()> {
        if count == Some(0) {
            return Ok(());
        }

        let (source, mut destination) = lock_pair(source, self)?;

        let count = match count {
            Some(count) => count,
            None => source.length.checked_sub(start_index).ok_or_else(|| {
                Error::out_of_range(format!(
                    "start index {start_index} is beyond source length {}",
                    source.length
                ))
            })?,
        };

        let destination_index = destination.length;
        copy_between(&source, start_index, &mut destination, destination_index, count)
    }

    /// Copies `count` characters starting at `buffer_index` into `destination` at
    /// `destination_index`, growing the destination if needed.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`InvalidArgument`][crate::ErrorKind::InvalidArgument] if
    /// `destination` is this buffer or [`OutOfRange`][crate::ErrorKind::OutOfRange] if
    /// `destination_index` is beyond the length of the destination or the range extends past
    /// the end of this buffer. Returns an allocation error if the destination cannot grow.
    pub fn copy_to(&self, buffer_index: u32, destination: &Self, destination_index: u32, count: u32) -> Result<()> {
        let (source, mut destination) = lock_pair(self, destination)?;
        copy_between(&source, buffer_index, &mut destination, destination_index, count)
    }

    /// Copies `count` characters of the string, starting at `source_index`, into this buffer
    /// at `buffer_index`, growing the buffer if needed.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if the range
    /// falls outside `source` or `buffer_index` is beyond the length of this buffer.
    pub fn copy_from_str(&self, buffer_index: u32, source: &str, source_index: u32, count: Option<u32>) -> Result<()> {
        let units: Vec<u16> = source.encode_utf16().collect();
        self.copy_from_utf16(buffer_index, &units, source_index, count)
    }

    /// Copies `count` UTF-16 code units of `source`, starting at `source_index`, into this
    /// buffer at `buffer_index`, growing the buffer if needed.
    ///
    /// Characters already present past the copied range are kept.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if the range
    /// falls outside `source` or `buffer_index` is beyond the length of this buffer.
    pub fn copy_from_utf16(&self, buffer_index: u32, source: &[u16], source_index: u32, count: Option<u32>) -> Result<()> {
        let units = source_range(source, source_index, count)?;
        self.state.write().write_at(buffer_index, units)
    }

    /// Splits the content at every occurrence of `separator`.
    ///
    /// Behaves like splitting an ordinary string: the segment after the last separator is
    /// always produced, even if empty, and content without any separator yields a single
    /// segment. With `remove_empty`, zero-length segments are omitted.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`Overflow`][crate::ErrorKind::Overflow] if a segment is longer
    /// than [`MAX_STRING_LENGTH`].
    pub fn split(&self, separator: u16, remove_empty: bool) -> Result<Vec<String>> {
        let state = self.state.read();

        state
            .content()
            .split(|unit| *unit == separator)
            .filter(|segment| !remove_empty || !segment.is_empty())
            .map(materialize)
            .collect()
    }

    /// Splits the content at every character that is in `separators`, or at every whitespace
    /// character if `separators` is empty.
    ///
    /// Empty segments are kept, including the one after a trailing separator.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`Overflow`][crate::ErrorKind::Overflow] if a segment is longer
    /// than [`MAX_STRING_LENGTH`].
    pub fn split_any(&self, separators: &[u16]) -> Result<Vec<String>> {
        let state = self.state.read();

        state
            .content()
            .split(|unit| {
                if separators.is_empty() {
                    is_whitespace(*unit)
                } else {
                    separators.contains(unit)
                }
            })
            .map(materialize)
            .collect()
    }

    /// Splits a list of null-terminated strings that ends with an additional null.
    ///
    /// Native APIs return such lists without reporting their length, so this scans the whole
    /// capacity rather than the logical length. Scanning stops at the double null or at the end
    /// of the capacity, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`Overflow`][crate::ErrorKind::Overflow] if a string is longer
    /// than [`MAX_STRING_LENGTH`].
    pub fn split_null_terminated(&self) -> Result<Vec<String>> {
        let state = self.state.read();
        let char_capacity = state.char_capacity() as usize;
        let mut remaining = &state.memory.as_units()[..char_capacity];
        let mut strings = Vec::new();

        while !remaining.is_empty() {
            let Some(end) = remaining.iter().position(|unit| *unit == 0) else {
                strings.push(materialize(remaining)?);
                break;
            };

            strings.push(materialize(&remaining[..end])?);
            remaining = &remaining[end + 1..];

            if remaining.first().is_none_or(|unit| *unit == 0) {
                break;
            }
        }

        Ok(strings)
    }

    /// Whether the content contains `value`.
    #[must_use]
    pub fn contains(&self, value: u16) -> bool {
        self.state.read().content().contains(&value)
    }

    /// Whether the content contains any of `values`. Always `false` for an empty set.
    #[must_use]
    pub fn contains_any(&self, values: &[u16]) -> bool {
        if values.is_empty() {
            return false;
        }

        self.state.read().content().iter().any(|unit| values.contains(unit))
    }

    /// Removes every trailing character that is in `values`.
    ///
    /// Does nothing if `values` is empty or the buffer is empty.
    pub fn trim_end(&self, values: &[u16]) {
        if values.is_empty() {
            return;
        }

        let mut state = self.state.write();
        if state.length == 0 {
            return;
        }

        let kept = state
            .content()
            .iter()
            .rposition(|unit| !values.contains(unit))
            .map_or(0, |index| index + 1);

        // kept <= length, which is a u32.
        let length = u32::try_from(kept).unwrap_or(state.length);
        state.length = length;
        state.memory.as_units_mut()[length as usize] = 0;
    }

    /// Materializes the whole content as a string.
    ///
    /// Unpaired surrogates are replaced with `U+FFFD`.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`Overflow`][crate::ErrorKind::Overflow] if the length exceeds
    /// [`MAX_STRING_LENGTH`].
    pub fn to_string(&self) -> Result<String> {
        let state = self.state.read();

        if state.length == 0 {
            return Ok(String::new());
        }

        if state.length > MAX_STRING_LENGTH {
            return Err(Error::overflow(format!(
                "length {} exceeds the maximum string length {MAX_STRING_LENGTH}",
                state.length
            )));
        }

        materialize(state.content())
    }

    /// Copies the content out as UTF-16 code units.
    #[must_use]
    pub fn to_utf16(&self) -> Vec<u16> {
        self.state.read().content().to_vec()
    }

    /// Materializes `count` characters starting at `start_index` as a string.
    ///
    /// On an empty buffer a `start_index` of zero is accepted and yields an empty string.
    ///
    /// # Errors
    ///
    /// Returns an error of kind [`OutOfRange`][crate::ErrorKind::OutOfRange] if `start_index`
    /// is beyond the last character, or if the count extends past the end of the content or
    /// exceeds [`MAX_STRING_LENGTH`].
    pub fn substring(&self, start_index: u32, count: Option<u32>) -> Result<String> {
        let state = self.state.read();
        let length = state.length;

        if start_index > length.saturating_sub(1) {
            return Err(Error::out_of_range(format!(
                "start_index {start_index} is beyond the last character of length {length}"
            )));
        }

        let count = count.unwrap_or(length - start_index);
        if count > MAX_STRING_LENGTH || u64::from(start_index) + u64::from(count) > u64::from(length) {
            return Err(Error::out_of_range(format!(
                "count {count} from index {start_index} exceeds length {length}"
            )));
        }

        if count == 0 {
            return Ok(String::new());
        }

        let start = start_index as usize;
        materialize(&state.content()[start..start + count as usize])
    }

    /// Calls `f` with the content as UTF-16 code units, holding a shared lock.
    pub fn with_units<R>(&self, f: impl FnOnce(&[u16]) -> R) -> R {
        f(self.state.read().content())
    }

    /// Calls `f` with the entire capacity as UTF-16 code units, holding an exclusive lock.
    ///
    /// This lends the memory to code that fills it the way a native API would. The length is
    /// not updated and the terminator at the current length may be overwritten, so follow up
    /// with [`set_len()`][Self::set_len] or [`set_len_to_first_null()`][Self::set_len_to_first_null].
    pub fn with_capacity_mut<R>(&self, f: impl FnOnce(&mut [u16]) -> R) -> R {
        let mut state = self.state.write();
        let char_capacity = state.char_capacity() as usize;

        f(&mut state.memory.as_units_mut()[..char_capacity])
    }

    /// Calls `f` with a [`BufferReader`] over the backing memory, holding a shared lock.
    ///
    /// The reader sees the whole capacity, not only the content, so it can decode structured
    /// output a native call wrote into the buffer. Text is read as UTF-16, two bytes per
    /// character.
    ///
    /// # Examples
    ///
    /// ```
    /// use nativebuf::CharBuffer;
    ///
    /// let buffer: CharBuffer = "AB".parse()?;
    ///
    /// let (first, rest) = buffer.with_reader(|reader| {
    ///     Ok::<_, nativebuf::Error>((reader.read_u16()?, reader.read_string(1)?))
    /// })?;
    ///
    /// assert_eq!(first, u16::from(b'A'));
    /// assert_eq!(rest, "B");
    /// # Ok::<(), nativebuf::Error>(())
    /// ```
    pub fn with_reader<R>(&self, f: impl FnOnce(&mut BufferReader<'_, H>) -> R) -> R {
        let state = self.state.read();
        let mut reader = BufferReader::new(&state.memory);
        f(&mut reader)
    }

    /// A handle to the backing memory for passing into native calls.
    ///
    /// Returns [`HeapHandle::EMPTY`] rather than a missing handle when there is no backing memory.
    #[must_use]
    pub fn handle(&self) -> HeapHandle {
        self.state.read().memory.handle()
    }

    /// Resets the length to zero and releases the backing memory.
    ///
    /// The buffer remains usable and grows again on the next write. Calling this repeatedly
    /// is harmless.
    pub fn free(&self) {
        let mut state = self.state.write();
        state.length = 0;
        state.memory.free();
    }
}

impl<H: HeapAllocator> fmt::Write for CharBuffer<H> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append_str(s, 0, None).map_err(|_error| fmt::Error)
    }
}

impl<H: HeapAllocator> State<H> {
    fn char_capacity(&self) -> u32 {
        u32::try_from(self.memory.byte_capacity() / 2).unwrap_or(u32::MAX)
    }

    fn ensure_char_capacity(&mut self, min_capacity: u32) -> Result<()> {
        let byte_count = usize::try_from(u64::from(min_capacity) * 2).map_err(|_conversion_error| {
            Error::overflow(format!(
                "char capacity {min_capacity} exceeds the address space of this platform"
            ))
        })?;

        self.memory.ensure_byte_capacity(byte_count)
    }

    fn set_len(&mut self, length: u32) -> Result<()> {
        let char_capacity = length.checked_add(1).ok_or_else(|| {
            Error::overflow(format!("length {length} leaves no room for the null terminator"))
        })?;

        self.ensure_char_capacity(char_capacity)?;

        self.length = length;
        self.memory.as_units_mut()[length as usize] = 0;
        Ok(())
    }

    fn content(&self) -> &[u16] {
        &self.memory.as_units()[..self.length as usize]
    }

    fn content_mut(&mut self) -> &mut [u16] {
        let length = self.length as usize;
        &mut self.memory.as_units_mut()[..length]
    }

    /// Resolves a start index and optional count to a range within the content.
    fn range(&self, start_index: u32, count: Option<u32>) -> Result<std::ops::Range<usize>> {
        let length = self.length;

        let end = match count {
            Some(count) => start_index.checked_add(count),
            None => Some(length),
        }
        .filter(|end| start_index <= length && *end <= length)
        .ok_or_else(|| {
            Error::out_of_range(format!(
                "count {count:?} at start_index {start_index} exceeds length {length}"
            ))
        })?;

        Ok(start_index as usize..end as usize)
    }

    /// Writes `units` starting at `index`, extending the length if the write goes past it.
    fn write_at(&mut self, index: u32, units: &[u16]) -> Result<()> {
        if index > self.length {
            return Err(Error::out_of_range(format!(
                "buffer_index {index} is beyond length {}",
                self.length
            )));
        }

        if units.is_empty() {
            return Ok(());
        }

        let end = end_index(index, units)?;
        if self.length < end {
            self.set_len(end)?;
        }

        self.memory.as_units_mut()[index as usize..end as usize].copy_from_slice(units);
        Ok(())
    }
}

/// The index one past the end of `units` written at `index`.
fn end_index(index: u32, units: &[u16]) -> Result<u32> {
    u32::try_from(units.len())
        .ok()
        .and_then(|count| index.checked_add(count))
        .ok_or_else(|| Error::overflow(format!("writing {} characters at index {index} overflows the length", units.len())))
}

/// Resolves a start index and optional count to a sub-slice of a caller-provided source.
fn source_range(source: &[u16], source_index: u32, count: Option<u32>) -> Result<&[u16]> {
    let start = source_index as usize;
    if start > source.len() {
        return Err(Error::out_of_range(format!(
            "source_index {source_index} is beyond source length {}",
            source.len()
        )));
    }

    let end = match count {
        Some(count) => start.checked_add(count as usize).filter(|end| *end <= source.len()),
        None => Some(source.len()),
    }
    .ok_or_else(|| {
        Error::out_of_range(format!(
            "count {count:?} at source_index {source_index} exceeds source length {}",
            source.len()
        ))
    })?;

    Ok(&source[start..end])
}

/// Locks `source` shared and `destination` exclusively, in address order.
fn lock_pair<'a, H: HeapAllocator>(
    source: &'a CharBuffer<H>,
    destination: &'a CharBuffer<H>,
) -> Result<(RwLockReadGuard<'a, State<H>>, RwLockWriteGuard<'a, State<H>>)> {
    if ptr::eq(source, destination) {
        return Err(Error::invalid_argument(
            "destination: a buffer cannot be both the source and the destination of a copy",
        ));
    }

    if ptr::from_ref(source).addr() < ptr::from_ref(destination).addr() {
        let source = source.state.read();
        let destination = destination.state.write();
        Ok((source, destination))
    } else {
        let destination = destination.state.write();
        let source = source.state.read();
        Ok((source, destination))
    }
}

fn copy_between<H: HeapAllocator>(
    source: &State<H>,
    buffer_index: u32,
    destination: &mut State<H>,
    destination_index: u32,
    count: u32,
) -> Result<()> {
    if destination_index > destination.length {
        return Err(Error::out_of_range(format!(
            "destination_index {destination_index} is beyond destination length {}",
            destination.length
        )));
    }

    let range = source.range(buffer_index, Some(count))?;
    destination.write_at(destination_index, &source.content()[range])
}

fn materialize(units: &[u16]) -> Result<String> {
    if units.len() > MAX_STRING_LENGTH as usize {
        return Err(Error::overflow(format!(
            "{} characters exceed the maximum string length {MAX_STRING_LENGTH}",
            units.len()
        )));
    }

    Ok(String::from_utf16_lossy(units))
}

fn is_whitespace(unit: u16) -> bool {
    char::from_u32(u32::from(unit)).is_some_and(char::is_whitespace)
}
