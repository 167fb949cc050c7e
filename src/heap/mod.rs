/*!
 * Heap Module
 *
 * Hierarchical heap management: nameable, inspectable memory regions with
 * bounded lifetime and deterministic teardown.
 *
 * ## Pieces
 *
 * - **Arena**: the flat backing region root heaps are carved from
 * - **Heap**: a node in the heap tree, serving allocations from an
 *   address-ordered free list with first-fit or best-fit selection,
 *   block splitting, and coalescing on free
 * - **Disposer**: a registration handle guaranteeing an object's teardown
 *   runs when its owning heap is destroyed, in reverse registration order
 * - **HeapMgr**: the explicit process-wide context holding root heaps,
 *   independent heaps, containment lookup, and per-thread current-heap
 *   state
 *
 * ## Failure model
 *
 * Exhaustion and impossible resizes are ordinary `Err` values the caller
 * must check. Double frees, foreign pointers, arena double-initialize,
 * and disposer double-destructs are logic bugs and panic with a message
 * naming the violated invariant.
 */

mod arena;
mod disposer;
mod free_list;
mod handle;
mod manager;
mod space;
pub mod types;

pub use arena::Arena;
pub use disposer::Disposer;
pub use handle::{Heap, HeapOptions, MAX_NAME_LEN};
pub use manager::{CurrentHeapScope, HeapMgr};
pub use types::{
    AllocPolicy, Direction, HeapError, HeapNullPolicy, HeapResult, HeapState, HeapStats,
};
