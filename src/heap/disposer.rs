/*!
 * Disposer Registry
 * Guaranteed teardown of objects owned by a heap
 *
 * Registration is a capability held by composition: registering returns a
 * `Disposer` handle instead of requiring inheritance from the owning type,
 * which removes the wrong-destruction-order failure mode entirely.
 */

use super::handle::{Heap, HeapInner};
use super::manager::HeapMgr;
use super::types::HeapNullPolicy;
use crate::core::types::Address;
use log::warn;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

const STATE_REGISTERED: u8 = 0;
/// Sentinel marking an entry whose teardown already ran. Seeing it again
/// is the double-destruct bug this registry exists to catch.
const STATE_DISPOSED: u8 = 1;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// State shared between a heap's registry entry and the `Disposer` handle
pub(super) struct DisposerShared {
    state: AtomicU8,
    callback: Mutex<Option<Callback>>,
}

impl DisposerShared {
    fn new(callback: Callback) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(STATE_REGISTERED),
            callback: Mutex::new(Some(callback)),
        })
    }

    /// Flip to the disposed sentinel and run the callback.
    ///
    /// # Panics
    /// Panics if the entry was already disposed.
    pub(super) fn run(&self) {
        let prev = self
            .state
            .compare_exchange(
                STATE_REGISTERED,
                STATE_DISPOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|found| {
                panic!(
                    "invariant violated: disposer destructed twice (state {})",
                    found
                )
            });
        debug_assert_eq!(prev, STATE_REGISTERED);
        if let Some(callback) = self.callback.lock().take() {
            callback();
        }
    }

    fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_REGISTERED,
                STATE_DISPOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// One registered entry in a heap's disposer list
pub(super) struct DisposerEntry {
    pub id: u64,
    pub shared: Arc<DisposerShared>,
}

/// Registration handle for heap-owned teardown.
///
/// The callback runs when the owning heap is destroyed, in reverse
/// registration order across the heap's list. Dropping the handle first
/// cancels the registration without running the callback; calling
/// [`Disposer::dispose`] runs it early.
pub struct Disposer {
    heap: Weak<HeapInner>,
    id: u64,
    shared: Arc<DisposerShared>,
}

impl Disposer {
    /// Register `on_dispose` with an explicit owning heap.
    pub fn register(heap: &Heap, on_dispose: impl FnOnce() + Send + 'static) -> Self {
        let shared = DisposerShared::new(Box::new(on_dispose));
        let id = heap.push_disposer(Arc::clone(&shared));
        Self {
            heap: heap.downgrade(),
            id,
            shared,
        }
    }

    /// Register with null-heap handling per `policy`.
    ///
    /// `heap` is the explicitly chosen owner, if any; `address` is the
    /// object's location, used by `FindContainHeap` resolution. Returns
    /// `None` when no heap ends up owning the object (it participates in
    /// no automatic teardown).
    ///
    /// # Panics
    /// Panics under `HeapNullPolicy::NotAllow` when `heap` is `None`.
    pub fn register_with(
        mgr: &HeapMgr,
        heap: Option<&Heap>,
        policy: HeapNullPolicy,
        address: Address,
        on_dispose: impl FnOnce() + Send + 'static,
    ) -> Option<Self> {
        let resolved: Option<Heap> = match heap {
            Some(h) => Some(h.clone()),
            None => match policy {
                HeapNullPolicy::NotAllow => {
                    panic!("invariant violated: disposer registered with a null heap under NotAllow")
                }
                HeapNullPolicy::NotDispose => None,
                HeapNullPolicy::FindContainHeap => mgr.find_contain_heap(address),
                HeapNullPolicy::UseCurrentHeap => mgr.current_heap(),
            },
        };

        match resolved {
            Some(heap) => Some(Self::register(&heap, on_dispose)),
            None => {
                if policy != HeapNullPolicy::NotDispose {
                    warn!(
                        "No owning heap resolved for disposer at 0x{:x}: no automatic teardown",
                        address
                    );
                }
                None
            }
        }
    }

    /// Run the teardown callback now and deregister from the owning heap.
    ///
    /// # Panics
    /// Panics if the heap already ran this disposer: that is the
    /// double-destruct condition the sentinel exists to detect.
    pub fn dispose(self) {
        self.shared.run();
        if let Some(heap) = self.heap.upgrade() {
            Heap::from_inner(heap).remove_disposer(self.id);
        }
        // Drop glue sees the sentinel and does nothing further.
    }

    /// Whether the callback has already run (heap destroyed or disposed early).
    pub fn is_disposed(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_DISPOSED
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        // Cancel the registration if the heap has not torn us down yet.
        // The callback deliberately does not run here: dropping the handle
        // means the owner is going away on its own terms.
        if self.shared.cancel() {
            if let Some(heap) = self.heap.upgrade() {
                Heap::from_inner(heap).remove_disposer(self.id);
            }
        }
    }
}
