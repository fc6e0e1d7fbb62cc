// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Instrumented heap allocators for testing buffer management logic.

mod counting;
mod failing;

pub use counting::{CountingHeap, HeapCounters};
pub use failing::FailingHeap;
