/*!
 * Heaptree Library
 *
 * Hierarchical heap management: heap trees with per-thread current-heap
 * context, a free-list expanding allocator, and disposer-guaranteed
 * teardown.
 */

pub mod core;
pub mod heap;

// Re-exports
pub use crate::core::types::{Address, Size};
pub use heap::{
    AllocPolicy, Arena, CurrentHeapScope, Direction, Disposer, Heap, HeapError, HeapMgr,
    HeapNullPolicy, HeapOptions, HeapResult, HeapState, HeapStats,
};
