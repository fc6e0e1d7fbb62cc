// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types for using and implementing raw heap allocators.

mod allocator;
mod global;
mod handle;

pub use allocator::HeapAllocator;
pub use global::{GlobalHeap, HEAP_ALIGNMENT};
pub use handle::HeapHandle;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;
