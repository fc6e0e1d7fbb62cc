// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Little-endian decoding of primitive integers from raw bytes.

use num_traits::PrimInt;

/// Decodes a little-endian `T` from the start of `bytes`.
///
/// If the start of the slice is naturally aligned for `T`, the value is loaded as a single
/// native-width read. Otherwise it is composed one byte at a time, low byte first, so the
/// result never depends on the platform tolerating unaligned loads.
///
/// Returns `None` if `bytes` is shorter than `T`.
pub(crate) fn read_le<T: PrimInt>(bytes: &[u8]) -> Option<T> {
    let bytes = bytes.get(..size_of::<T>())?;
    let ptr = bytes.as_ptr();

    if ptr.align_offset(align_of::<T>()) == 0 {
        // SAFETY: The slice covers size_of::<T>() bytes, the pointer is aligned for T
        // and every bit pattern is a valid value of a primitive integer.
        let native = unsafe { ptr.cast::<T>().read() };
        return Some(T::from_le(native));
    }

    bytes.iter().enumerate().try_fold(T::zero(), |value, (index, byte)| {
        let byte = T::from(*byte)?;
        Some(value | byte.unsigned_shl(u32::try_from(index * 8).ok()?))
    })
}
