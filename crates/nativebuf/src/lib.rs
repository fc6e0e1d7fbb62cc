// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Heap-backed buffers for exchanging data with native APIs.
//!
//! Native APIs typically take a raw pointer to caller-owned memory plus a capacity, write into
//! that memory and report how much they wrote or how much they would need. This crate provides
//! the buffers that sit on the caller side of such calls:
//!
//! * [`NativeBuffer`] owns a raw heap block with a byte capacity that only ever grows. Newly
//!   exposed memory is always zeroed and the block is freed exactly once.
//! * [`BufferReader`] decodes little-endian integers and UTF-16 text sequentially from a
//!   [`NativeBuffer`], wherever they happen to be aligned.
//! * [`CharBuffer`] is a growable, null-terminated UTF-16 string builder on top of a
//!   [`NativeBuffer`], safe to share between threads.
//! * [`StreamBuffer`] is a seekable byte stream over native memory that implements
//!   [`std::io::Read`], [`std::io::Write`] and [`std::io::Seek`], growing as it is written.
//! * [`ObjectPool`] and [`CharBufferPool`] keep a bounded number of idle buffers around so
//!   repeated calls do not allocate every time.
//!
//! # Filling a buffer from a native call
//!
//! The typical pattern is to lend a pooled [`CharBuffer`] to the call, retrying with a larger
//! capacity until the output fits:
//!
//! ```
//! use nativebuf::{CharBuffer, CharBufferPool, Error};
//!
//! # fn native_get_name(buffer: &CharBuffer) -> Result<u32, Error> {
//! #     let name: Vec<u16> = "machine-01".encode_utf16().collect();
//! #     let required = 11;
//! #     if buffer.char_capacity() < required {
//! #         return Ok(required);
//! #     }
//! #     buffer.with_capacity_mut(|capacity| capacity[..name.len()].copy_from_slice(&name));
//! #     Ok(required - 1)
//! # }
//! let name = CharBufferPool::global().cached_api_invoke(native_get_name)?;
//!
//! assert_eq!(name, "machine-01");
//! # Ok::<(), Error>(())
//! ```
//!
//! # Reading structured output
//!
//! Binary output is consumed with a [`BufferReader`]:
//!
//! ```
//! use nativebuf::{BufferReader, NativeBuffer};
//!
//! let mut buffer = NativeBuffer::with_byte_capacity(16)?;
//! buffer.as_bytes_mut()[..6].copy_from_slice(&[0x2A, 0, 0, 0, b'o', 0]);
//!
//! let mut reader = BufferReader::new(&buffer);
//!
//! assert_eq!(reader.read_u32()?, 42);
//! assert_eq!(reader.read_string(1)?, "o");
//! assert_eq!(reader.byte_offset(), 6);
//! # Ok::<(), nativebuf::Error>(())
//! ```
//!
//! # Allocators
//!
//! Every buffer takes its memory from a [`HeapAllocator`][heap::HeapAllocator], which is
//! [`GlobalHeap`][heap::GlobalHeap] unless specified otherwise via the `_in` constructors.
//! With the `test-util` feature, [`heap::testing`] offers allocators that count or refuse
//! allocations.
//!
//! # Metrics
//!
//! Buffer growth and pool reuse are reported via [`nm`] events:
//!
//! * `nativebuf_heap_grown_size` - the byte capacity requested whenever a buffer grows.
//! * `nativebuf_pool_acquire_reused` - an acquisition was served from idle instances.
//! * `nativebuf_pool_acquire_created` - an acquisition had to create a new instance.

mod char_buffer;
mod decode;
mod error;
pub mod heap;
mod native_buffer;
mod pool;
mod reader;
mod stream_buffer;

pub use char_buffer::{CharBuffer, MAX_STRING_LENGTH};
pub use error::{Error, ErrorKind, Result};
pub use native_buffer::NativeBuffer;
pub use pool::{CharBufferPool, DEFAULT_INVOKE_CAPACITY, ObjectPool, Pooled};
pub use reader::BufferReader;
pub use stream_buffer::StreamBuffer;
