// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::ptr;

/// A raw handle to the memory block backing a buffer, for passing into native calls.
///
/// A buffer without backing memory never produces a "missing" handle. It yields
/// [`HeapHandle::EMPTY`] instead, which marshalling layers that reject absent handles
/// accept as a legitimate value. Callers that need to tell the two apart can
/// check [`is_empty()`][Self::is_empty].
///
/// The handle does not own the memory and is only valid for as long as the buffer
/// it came from is neither resized nor freed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HeapHandle {
    ptr: *mut u8,
}

impl HeapHandle {
    /// The sentinel handle of a buffer without backing memory.
    pub const EMPTY: Self = Self { ptr: ptr::null_mut() };

    pub(crate) const fn new(ptr: *mut u8) -> Self {
        Self { ptr }
    }

    /// Whether this is the [`EMPTY`][Self::EMPTY] sentinel.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.ptr.is_null()
    }

    /// The address of the memory block, or null for the sentinel.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.ptr
    }
}

impl Default for HeapHandle {
    fn default() -> Self {
        Self::EMPTY
    }
}
