/*!
 * Heap Manager
 *
 * Process-wide heap services as one explicit context object: the arena,
 * the root and independent heap registries, the tree-shape lock, and the
 * per-thread current-heap state. Created once at framework startup and
 * passed by handle to every subsystem that needs heap services; cloning
 * is cheap and shares state.
 */

use super::arena::Arena;
use super::handle::{Heap, HeapOptions, Parentage, TreeShape};
use super::space::ExpSpace;
use super::types::{AllocPolicy, Direction, HeapError, HeapResult, HeapStats};
use crate::core::types::{Address, Size, DEFAULT_ALIGNMENT};
use ahash::RandomState;
use dashmap::DashMap;
use log::{error, info};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

pub(super) struct MgrInner {
    /// Backing region; kept alive for the manager's whole lifetime
    arena: Mutex<Arena>,
    /// Allocator carving root heap regions out of the arena
    arena_space: Mutex<ExpSpace>,
    shape: Arc<TreeShape>,
    roots: Mutex<Vec<Heap>>,
    independents: Mutex<Vec<Heap>>,
    /// Arenas backing independent heaps, held so their memory outlives
    /// the heaps carved over them
    independent_arenas: Mutex<Vec<Arena>>,
    /// Per-thread current-heap stacks; an explicit thread-context
    /// structure instead of hidden thread-local statics
    current: DashMap<ThreadId, Vec<Heap>, RandomState>,
}

/// The heap-tree context.
///
/// Owns the arena, the root heaps carved from it, independent heaps over
/// external memory, and the per-thread "current heap" used when no heap
/// is named explicitly.
#[derive(Clone)]
pub struct HeapMgr {
    inner: Arc<MgrInner>,
}

impl HeapMgr {
    /// Build the manager over a freshly allocated arena of `size` bytes.
    pub fn new(size: Size) -> Self {
        Self::with_arena(Arena::with_size(size))
    }

    /// Build the manager over a pre-built arena.
    ///
    /// # Panics
    /// Panics if the arena was never initialized.
    pub fn with_arena(arena: Arena) -> Self {
        assert!(
            arena.is_initialized(),
            "invariant violated: HeapMgr built over an uninitialized arena"
        );
        let arena_space = ExpSpace::new(arena.start(), arena.size());
        info!(
            "Heap manager initialized: arena of {} bytes at 0x{:x}",
            arena.size(),
            arena.start()
        );
        Self {
            inner: Arc::new(MgrInner {
                arena: Mutex::new(arena),
                arena_space: Mutex::new(arena_space),
                shape: TreeShape::new(),
                roots: Mutex::new(Vec::new()),
                independents: Mutex::new(Vec::new()),
                independent_arenas: Mutex::new(Vec::new()),
                current: DashMap::with_hasher(RandomState::new()),
            }),
        }
    }

    /// Carve a root heap out of the arena. `opts.size == 0` takes all
    /// remaining allocatable arena space.
    pub fn create_root_heap(&self, opts: HeapOptions) -> HeapResult<Heap> {
        let start_size = {
            let mut space = self.inner.arena_space.lock();
            let size = if opts.size == 0 {
                space.max_allocatable(DEFAULT_ALIGNMENT)
            } else {
                opts.size
            };
            if size == 0 {
                error!("Arena: no space left to carve root heap '{}'", opts.name);
                return Err(HeapError::HeapExhausted {
                    name: "arena".to_string(),
                    requested: 0,
                });
            }
            let start = space
                .alloc_region(size, DEFAULT_ALIGNMENT, opts.direction, AllocPolicy::FirstFit)
                .map_err(|err| {
                    error!(
                        "Arena: cannot carve root heap '{}' of {} bytes: {}",
                        opts.name, size, err
                    );
                    HeapError::HeapExhausted {
                        name: "arena".to_string(),
                        requested: size,
                    }
                })?;
            (start, size)
        };

        let heap = Heap::construct(
            Arc::clone(&self.inner.shape),
            Parentage::Root(Arc::downgrade(&self.inner)),
            start_size.0,
            start_size.1,
            &opts,
        );

        {
            let _shape = self.inner.shape.lock.lock();
            self.inner.roots.lock().push(heap.clone());
        }

        info!(
            "Root heap '{}' created: {} bytes at 0x{:x}",
            heap.name(),
            start_size.1,
            start_size.0
        );
        Ok(heap)
    }

    /// Wrap an initialized arena as an independent heap: findable via
    /// containment search, but outside every root heap's descent.
    pub fn create_independent_heap(&self, arena: Arena, opts: HeapOptions) -> Heap {
        assert!(
            arena.is_initialized(),
            "invariant violated: independent heap over an uninitialized arena"
        );
        let heap = Heap::construct(
            Arc::clone(&self.inner.shape),
            Parentage::Independent(Arc::downgrade(&self.inner)),
            arena.start(),
            arena.size(),
            &opts,
        );
        {
            let _shape = self.inner.shape.lock.lock();
            self.inner.independents.lock().push(heap.clone());
            self.inner.independent_arenas.lock().push(arena);
        }
        info!(
            "Independent heap '{}' created: {} bytes at 0x{:x}",
            heap.name(),
            heap.region_size(),
            heap.region_start()
        );
        heap
    }

    /// Create a heap under `parent`, or under the calling thread's current
    /// heap when `parent` is `None`.
    pub fn create_heap(&self, parent: Option<&Heap>, opts: HeapOptions) -> HeapResult<Heap> {
        match parent {
            Some(parent) => parent.create_child(opts),
            None => {
                let current = self.current_heap().ok_or(HeapError::NoCurrentHeap)?;
                current.create_child(opts)
            }
        }
    }

    pub fn root_heap(&self, index: usize) -> Option<Heap> {
        self.inner.roots.lock().get(index).cloned()
    }

    pub fn root_heap_count(&self) -> usize {
        self.inner.roots.lock().len()
    }

    /// Deepest heap whose region contains `addr`: root heaps and their
    /// descendants first, then independent heaps.
    ///
    /// Holds the shape lock for the whole walk so heap creation and
    /// destruction cannot reshape the tree mid-search.
    pub fn find_contain_heap(&self, addr: Address) -> Option<Heap> {
        let _shape = self.inner.shape.lock.lock();
        let roots = self.inner.roots.lock().clone();
        for root in &roots {
            if let Some(found) = root.find_contain(addr) {
                return Some(found);
            }
        }
        let independents = self.inner.independents.lock().clone();
        for heap in &independents {
            if let Some(found) = heap.find_contain(addr) {
                return Some(found);
            }
        }
        None
    }

    /// The calling thread's current heap, if one is installed.
    pub fn current_heap(&self) -> Option<Heap> {
        self.inner
            .current
            .get(&thread::current().id())
            .and_then(|stack| stack.last().cloned())
    }

    /// Install `heap` as the calling thread's current heap until the
    /// returned scope drops; the previous current heap is then restored.
    pub fn scoped_current_heap(&self, heap: &Heap) -> CurrentHeapScope {
        let tid = thread::current().id();
        self.inner
            .current
            .entry(tid)
            .or_default()
            .push(heap.clone());
        CurrentHeapScope {
            mgr: self.clone(),
            tid,
            _not_send: PhantomData,
        }
    }

    /// Stats snapshot for every heap in the tree, depth-first.
    pub fn stats(&self) -> Vec<HeapStats> {
        fn collect(heap: &Heap, out: &mut Vec<HeapStats>) {
            out.push(heap.stats());
            for child in heap.children() {
                collect(&child, out);
            }
        }
        let _shape = self.inner.shape.lock.lock();
        let mut out = Vec::new();
        for root in self.inner.roots.lock().iter() {
            collect(root, &mut out);
        }
        for heap in self.inner.independents.lock().iter() {
            collect(heap, &mut out);
        }
        out
    }

    /// Total free bytes remaining in the arena outside all root heaps.
    pub fn arena_free_size(&self) -> Size {
        self.inner.arena_space.lock().free_size()
    }

    /// Whether `addr` lies anywhere in the arena.
    pub fn arena_is_include(&self, addr: Address) -> bool {
        self.inner.arena.lock().is_include(addr)
    }

    /// Destroy all remaining heaps, independents first, then roots in
    /// reverse creation order. Called automatically when the last manager
    /// handle drops.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl MgrInner {
    fn shutdown(&self) {
        let independents = std::mem::take(&mut *self.independents.lock());
        for heap in independents.iter().rev() {
            heap.destroy();
        }
        let roots = std::mem::take(&mut *self.roots.lock());
        for heap in roots.iter().rev() {
            heap.destroy();
        }
    }

    pub(super) fn release_root(&self, heap: &Heap) {
        self.arena_space.lock().free_region(heap.region_start());
        let _shape = self.shape.lock.lock();
        self.roots.lock().retain(|h| h.id() != heap.id());
    }

    pub(super) fn release_independent(&self, heap: &Heap) {
        let _shape = self.shape.lock.lock();
        self.independents.lock().retain(|h| h.id() != heap.id());
        // The backing arena stays until manager teardown; external memory
        // is never released here.
    }

    pub(super) fn resize_root_region(
        &self,
        old_start: Address,
        new_len: Size,
        direction: Direction,
    ) {
        let mut space = self.arena_space.lock();
        match direction {
            Direction::FromFront => {
                let _ = space.resize_back(old_start, new_len);
            }
            Direction::FromBack => {
                let _ = space.resize_front(old_start, new_len);
            }
        }
    }
}

impl Drop for MgrInner {
    fn drop(&mut self) {
        // Run remaining disposers deterministically at process teardown.
        self.shutdown();
    }
}

/// RAII scope installing a thread's current heap; restores the previous
/// one on drop. Deliberately `!Send`: the scope must end on the thread
/// that opened it.
pub struct CurrentHeapScope {
    mgr: HeapMgr,
    tid: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CurrentHeapScope {
    fn drop(&mut self) {
        debug_assert_eq!(self.tid, thread::current().id());
        if let Some(mut stack) = self.mgr.inner.current.get_mut(&self.tid) {
            stack.pop();
            if stack.is_empty() {
                drop(stack);
                self.mgr.inner.current.remove(&self.tid);
            }
        }
    }
}
