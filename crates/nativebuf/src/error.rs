// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::io;

/// The result for fallible operations that use the [`Error`] type of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error raised by a buffer, reader, heap or pool operation.
///
/// Errors are raised at the point of violation and are never retried or suppressed internally.
/// Validation always happens before mutation, so an operation that returns an error has left
/// the buffer it operated on unchanged.
///
/// Use [`kind()`][Self::kind] to react to specific conditions.
///
/// # Examples
///
/// ```
/// use nativebuf::{CharBuffer, ErrorKind};
///
/// let buffer = CharBuffer::new();
/// let error = buffer.get(0).unwrap_err();
///
/// assert_eq!(error.kind(), ErrorKind::OutOfRange);
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: Cow<'static, str>,
}

/// The category of an [`Error`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An argument is structurally invalid, e.g. the same buffer was supplied as both the source
    /// and the destination of a cross-buffer copy.
    #[error("invalid argument")]
    InvalidArgument,

    /// An index, offset or count falls outside the valid bounds of the target.
    #[error("argument out of range")]
    OutOfRange,

    /// A computed size exceeds a representable numeric range.
    #[error("arithmetic overflow")]
    Overflow,

    /// The heap allocator could not satisfy a request.
    #[error("out of memory")]
    OutOfMemory,

    /// A fixed-width read would consume past the end of the buffer.
    #[error("unexpected end of data")]
    EndOfData,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub(crate) fn out_of_range(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::OutOfRange, message)
    }

    pub(crate) fn overflow(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::Overflow, message)
    }

    pub(crate) fn out_of_memory(byte_count: usize) -> Self {
        Self::new(
            ErrorKind::OutOfMemory,
            format!("the heap could not provide {byte_count} bytes"),
        )
    }

    pub(crate) fn end_of_data(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::EndOfData, message)
    }

    /// The category of the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// A human-readable description naming the offending argument, if any.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        let kind = match error.kind {
            ErrorKind::OutOfMemory => io::ErrorKind::OutOfMemory,
            ErrorKind::EndOfData => io::ErrorKind::UnexpectedEof,
            ErrorKind::InvalidArgument | ErrorKind::OutOfRange | ErrorKind::Overflow => io::ErrorKind::InvalidInput,
        };

        Self::new(kind, error)
    }
}
