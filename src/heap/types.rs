/*!
 * Heap Types
 * Errors, policies, and statistics for the heap subsystem
 */

use crate::core::types::{Address, Size};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Heap operation result
pub type HeapResult<T> = Result<T, HeapError>;

/// Recoverable heap errors.
///
/// Allocation and resize failures are expected runtime conditions and are
/// always returned as values, never panicked. Invariant violations (double
/// free, free of a foreign pointer, arena double-initialize, disposer
/// double-destruct) are logic bugs and panic with a message naming the
/// violated invariant.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
pub enum HeapError {
    #[error("Out of memory: requested {requested} bytes (align {align}), {available} bytes free, largest usable span {largest} bytes")]
    #[diagnostic(
        code(heap::out_of_memory),
        help("Free unused blocks, fall back to another heap, or request less.")
    )]
    OutOfMemory {
        requested: Size,
        align: Size,
        available: Size,
        largest: Size,
    },

    #[error("Cannot resize block at 0x{address:x} to {requested} bytes: only {available} adjacent free bytes")]
    #[diagnostic(
        code(heap::resize_unavailable),
        help("Adjacent free space is insufficient. Allocate a new block and copy instead.")
    )]
    ResizeUnavailable {
        address: Address,
        requested: Size,
        available: Size,
    },

    #[error("Heap '{name}' cannot carve a child heap of {requested} bytes")]
    #[diagnostic(
        code(heap::exhausted),
        help("The parent heap has no contiguous span large enough. Check getMaxAllocatableSize first.")
    )]
    HeapExhausted { name: String, requested: Size },

    #[error("Invalid alignment {align}: must be a nonzero power of two")]
    #[diagnostic(code(heap::bad_alignment))]
    BadAlignment { align: Size },

    #[error("Heap '{name}' is {state}: no further allocations are permitted")]
    #[diagnostic(
        code(heap::invalid_state),
        help("Allocation is only valid while a heap is Active.")
    )]
    InvalidState { name: String, state: HeapState },

    #[error("No current heap is set for this thread")]
    #[diagnostic(
        code(heap::no_current_heap),
        help("Pass an explicit parent heap or install one with scoped_current_heap.")
    )]
    NoCurrentHeap,
}

/// Free-block selection policy, configurable per heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocPolicy {
    /// Scan the free list from the lowest address, take the first fit
    FirstFit,
    /// Scan the whole free list, take the smallest fit (ties by address)
    BestFit,
}

/// Which end of its parent's region a heap is carved from, and which end
/// of its own region its allocations and `adjust` work against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    FromFront,
    FromBack,
}

/// Null-heap handling for disposer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeapNullPolicy {
    /// A null heap is a fatal error
    NotAllow,
    /// Resolve the owning heap by address containment search
    FindContainHeap,
    /// Skip registration silently; the object gets no automatic teardown
    NotDispose,
    /// Use the calling thread's current heap
    UseCurrentHeap,
}

/// Heap lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeapState {
    /// Serving allocations
    Active,
    /// Running disposers and draining children; allocation rejected
    Destroying,
    /// Region returned to the parent, node removed from the tree
    Destroyed,
}

impl std::fmt::Display for HeapState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HeapState::Active => write!(f, "active"),
            HeapState::Destroying => write!(f, "destroying"),
            HeapState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Point-in-time snapshot of a heap's bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapStats {
    pub name: String,
    pub region_start: Address,
    pub region_size: Size,
    pub used_size: Size,
    pub free_size: Size,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub largest_free_span: Size,
}

impl HeapStats {
    pub fn usage_percentage(&self) -> f64 {
        if self.region_size == 0 {
            0.0
        } else {
            (self.used_size as f64 / self.region_size as f64) * 100.0
        }
    }
}
