/*!
 * Heap Handle
 *
 * A heap is a node in a tree: a named region carved from its parent,
 * serving allocations from a free list and guaranteeing registered
 * disposers run when it is destroyed.
 *
 * `Heap` is a cheap clone over shared state; all mutation goes through
 * the per-heap lock, and tree-shape changes additionally hold the
 * process-wide shape lock owned by the manager.
 */

use super::disposer::{DisposerEntry, DisposerShared};
use super::manager::MgrInner;
use super::space::ExpSpace;
use super::types::{AllocPolicy, Direction, HeapError, HeapResult, HeapState, HeapStats};
use crate::core::types::{Address, HeapId, Size, DEFAULT_ALIGNMENT};
use log::{error, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Heap names longer than this are truncated at a char boundary
pub const MAX_NAME_LEN: usize = 24;

const STATE_ACTIVE: u8 = 0;
const STATE_DESTROYING: u8 = 1;
const STATE_DESTROYED: u8 = 2;

/// Shared tree-wide state: the shape lock serializing attach/detach and
/// containment walks, and the heap id generator.
pub(super) struct TreeShape {
    pub lock: Mutex<()>,
    next_id: AtomicU64,
}

impl TreeShape {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn next_id(&self) -> HeapId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Where a heap's region came from, and where it goes back on destroy
pub(super) enum Parentage {
    /// Carved from the manager's arena
    Root(Weak<MgrInner>),
    /// Carved from another heap
    Child(Weak<HeapInner>),
    /// Wraps external memory; nothing to give back
    Independent(Weak<MgrInner>),
}

/// Creation parameters for a heap
#[derive(Debug, Clone)]
pub struct HeapOptions {
    pub name: String,
    /// Requested region size; `0` means "all currently allocatable space
    /// in the parent"
    pub size: Size,
    pub direction: Direction,
    /// Advisory in this implementation: the per-heap mutex is always
    /// present, the flag is kept for introspection and API parity
    pub lock_enabled: bool,
    pub policy: AllocPolicy,
}

impl HeapOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = size;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_lock(mut self, enabled: bool) -> Self {
        self.lock_enabled = enabled;
        self
    }

    pub fn with_policy(mut self, policy: AllocPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            name: "noname".to_string(),
            size: 0,
            direction: Direction::FromFront,
            lock_enabled: true,
            policy: AllocPolicy::FirstFit,
        }
    }
}

pub(super) struct HeapInner {
    id: HeapId,
    name: String,
    direction: Direction,
    lock_enabled: bool,
    parentage: Parentage,
    shape: Arc<TreeShape>,
    state: AtomicU8,
    policy: Mutex<AllocPolicy>,
    space: Mutex<ExpSpace>,
    children: Mutex<Vec<Heap>>,
    disposers: Mutex<Vec<DisposerEntry>>,
    next_disposer_id: AtomicU64,
}

/// Handle to one heap in the tree
#[derive(Clone)]
pub struct Heap {
    inner: Arc<HeapInner>,
}

fn bound_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

impl Heap {
    pub(super) fn construct(
        shape: Arc<TreeShape>,
        parentage: Parentage,
        start: Address,
        size: Size,
        opts: &HeapOptions,
    ) -> Heap {
        let inner = Arc::new(HeapInner {
            id: shape.next_id(),
            name: bound_name(&opts.name),
            direction: opts.direction,
            lock_enabled: opts.lock_enabled,
            parentage,
            shape,
            state: AtomicU8::new(STATE_ACTIVE),
            policy: Mutex::new(opts.policy),
            space: Mutex::new(ExpSpace::new(start, size)),
            children: Mutex::new(Vec::new()),
            disposers: Mutex::new(Vec::new()),
            next_disposer_id: AtomicU64::new(1),
        });
        Heap { inner }
    }

    pub(super) fn from_inner(inner: Arc<HeapInner>) -> Heap {
        Heap { inner }
    }

    pub(super) fn downgrade(&self) -> Weak<HeapInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> HeapId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn lock_enabled(&self) -> bool {
        self.inner.lock_enabled
    }

    pub fn state(&self) -> HeapState {
        match self.inner.state.load(Ordering::Acquire) {
            STATE_ACTIVE => HeapState::Active,
            STATE_DESTROYING => HeapState::Destroying,
            _ => HeapState::Destroyed,
        }
    }

    /// Fatal-path state check for operations that have no error return.
    /// `Destroying` is allowed: disposer callbacks may legitimately free
    /// blocks from the heap being torn down.
    fn assert_not_destroyed(&self, op: &str) {
        if self.state() == HeapState::Destroyed {
            panic!(
                "invariant violated: {} on heap '{}' which is already destroyed",
                op, self.inner.name
            );
        }
    }

    fn ensure_active(&self) -> HeapResult<()> {
        match self.state() {
            HeapState::Active => Ok(()),
            state => Err(HeapError::InvalidState {
                name: self.inner.name.clone(),
                state,
            }),
        }
    }

    /// Free-block selection policy for subsequent allocations
    pub fn alloc_policy(&self) -> AllocPolicy {
        *self.inner.policy.lock()
    }

    pub fn set_alloc_policy(&self, policy: AllocPolicy) {
        *self.inner.policy.lock() = policy;
    }

    /// Carve a child heap out of this heap's free space.
    ///
    /// `opts.size == 0` uses all currently allocatable space. Failure to
    /// carve is recoverable: the caller gets `HeapExhausted` and this heap
    /// is unchanged.
    pub fn create_child(&self, opts: HeapOptions) -> HeapResult<Heap> {
        self.ensure_active()?;
        let policy = *self.inner.policy.lock();

        let (start, size) = {
            let mut space = self.inner.space.lock();
            let size = if opts.size == 0 {
                space.max_allocatable(DEFAULT_ALIGNMENT)
            } else {
                opts.size
            };
            if size == 0 {
                error!("Heap '{}': no space left to carve child '{}'", self.name(), opts.name);
                return Err(HeapError::HeapExhausted {
                    name: self.inner.name.clone(),
                    requested: 0,
                });
            }
            let start = space
                .alloc_region(size, DEFAULT_ALIGNMENT, opts.direction, policy)
                .map_err(|err| {
                    error!(
                        "Heap '{}': cannot carve child '{}' of {} bytes: {}",
                        self.name(),
                        opts.name,
                        size,
                        err
                    );
                    HeapError::HeapExhausted {
                        name: self.inner.name.clone(),
                        requested: size,
                    }
                })?;
            (start, size)
        };

        let child = Heap::construct(
            Arc::clone(&self.inner.shape),
            Parentage::Child(Arc::downgrade(&self.inner)),
            start,
            size,
            &opts,
        );

        {
            let _shape = self.inner.shape.lock.lock();
            self.inner.children.lock().push(child.clone());
        }

        info!(
            "Heap '{}' created: {} bytes at 0x{:x}, parent '{}'",
            child.name(),
            size,
            start,
            self.name()
        );
        Ok(child)
    }

    /// Allocate `size` bytes at the default alignment.
    pub fn try_alloc(&self, size: Size) -> HeapResult<Address> {
        self.try_alloc_aligned(size, DEFAULT_ALIGNMENT)
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// A `FromBack` heap carves from its high end. Exhaustion is returned,
    /// never panicked; the diagnostic is logged here so hot callers only
    /// pattern-match the error.
    pub fn try_alloc_aligned(&self, size: Size, align: Size) -> HeapResult<Address> {
        self.ensure_active()?;
        let policy = *self.inner.policy.lock();
        let result = {
            let mut space = self.inner.space.lock();
            match self.inner.direction {
                Direction::FromFront => space.try_alloc(size, align, policy),
                Direction::FromBack => space.alloc_back(size, align),
            }
        };
        if let Err(err) = &result {
            error!("Heap '{}': allocation failed: {}", self.name(), err);
        }
        result
    }

    /// Return a block to this heap's free list, coalescing with free
    /// neighbors on both sides.
    ///
    /// # Panics
    /// Panics on double free, a pointer this heap never produced, the
    /// region of a live child heap, or a heap that was already destroyed.
    pub fn free(&self, addr: Address) {
        self.assert_not_destroyed("free");
        self.inner.space.lock().free(addr);
    }

    /// Move a block's back boundary to make it `new_size` bytes.
    pub fn resize_back(&self, addr: Address, new_size: Size) -> HeapResult<()> {
        self.ensure_active()?;
        self.inner.space.lock().resize_back(addr, new_size)
    }

    /// Move a block's front boundary to make it `new_size` bytes; returns
    /// the block's new address.
    pub fn resize_front(&self, addr: Address, new_size: Size) -> HeapResult<Address> {
        self.ensure_active()?;
        self.inner.space.lock().resize_front(addr, new_size)
    }

    /// Free every used block at once by rebuilding the free list over the
    /// whole region.
    ///
    /// Registered disposers are NOT run and remain registered; this is a
    /// fast path for heaps holding raw memory only. Using it while
    /// disposer-tracked objects live in the heap leaks their teardown
    /// until the heap itself is destroyed.
    ///
    /// # Panics
    /// Panics if a live child heap is carved from this heap, or if this
    /// heap was already destroyed.
    pub fn free_all(&self) {
        self.assert_not_destroyed("free_all");
        self.inner.space.lock().free_all();
    }

    /// Shrink this heap's region to its high-water mark, returning the
    /// reclaimed bytes to the parent. A `FromFront` heap gives back its
    /// tail, a `FromBack` heap its head. Returns the number of bytes
    /// reclaimed; calling again without intervening allocation returns 0.
    pub fn adjust(&self) -> Size {
        let (old_region, new_region, reclaimed) = {
            let mut space = self.inner.space.lock();
            let old = space.region();
            let reclaimed = space.adjust(self.inner.direction);
            (old, space.region(), reclaimed)
        };
        if reclaimed == 0 {
            return 0;
        }

        match &self.inner.parentage {
            Parentage::Child(weak) => {
                if let Some(parent) = weak.upgrade() {
                    let parent = Heap::from_inner(parent);
                    let mut pspace = parent.inner.space.lock();
                    match self.inner.direction {
                        Direction::FromFront => {
                            let _ = pspace.resize_back(old_region.start, new_region.len());
                        }
                        Direction::FromBack => {
                            let _ = pspace.resize_front(old_region.start, new_region.len());
                        }
                    }
                }
            }
            Parentage::Root(weak) => {
                if let Some(mgr) = weak.upgrade() {
                    mgr.resize_root_region(old_region.start, new_region.len(), self.inner.direction);
                }
            }
            Parentage::Independent(_) => {}
        }

        info!(
            "Heap '{}' adjusted: {} bytes returned, region now {} bytes",
            self.name(),
            reclaimed,
            new_region.len()
        );
        reclaimed
    }

    /// Destroy this heap: children are destroyed first in reverse creation
    /// order, disposers run in reverse registration order, then the region
    /// returns to the parent and the node leaves the tree.
    ///
    /// # Panics
    /// Panics if the heap was already destroyed.
    pub fn destroy(&self) {
        self.inner
            .state
            .compare_exchange(
                STATE_ACTIVE,
                STATE_DESTROYING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|_| {
                panic!(
                    "invariant violated: heap '{}' destroyed twice",
                    self.inner.name
                )
            });

        // Children leave the tree as a batch; each child's own destroy
        // skips the (now empty) detach.
        let children = {
            let _shape = self.inner.shape.lock.lock();
            std::mem::take(&mut *self.inner.children.lock())
        };
        for child in children.iter().rev() {
            child.destroy();
        }

        // LIFO teardown: later-constructed objects go first.
        let entries = std::mem::take(&mut *self.inner.disposers.lock());
        for entry in entries.into_iter().rev() {
            entry.shared.run();
        }

        let region_start = self.inner.space.lock().region().start;
        match &self.inner.parentage {
            Parentage::Child(weak) => {
                if let Some(parent) = weak.upgrade() {
                    let parent = Heap::from_inner(parent);
                    parent.inner.space.lock().free_region(region_start);
                    let _shape = self.inner.shape.lock.lock();
                    parent
                        .inner
                        .children
                        .lock()
                        .retain(|h| h.id() != self.inner.id);
                }
            }
            Parentage::Root(weak) => {
                if let Some(mgr) = weak.upgrade() {
                    mgr.release_root(self);
                }
            }
            Parentage::Independent(weak) => {
                if let Some(mgr) = weak.upgrade() {
                    mgr.release_independent(self);
                }
            }
        }

        self.inner.state.store(STATE_DESTROYED, Ordering::Release);
        info!("Heap '{}' destroyed", self.inner.name);
    }

    // Queries

    pub fn free_size(&self) -> Size {
        self.inner.space.lock().free_size()
    }

    pub fn used_size(&self) -> Size {
        self.inner.space.lock().used_size()
    }

    /// Largest single allocation that would currently succeed at `align`,
    /// after alignment padding loss.
    pub fn max_allocatable_size(&self, align: Size) -> Size {
        self.inner.space.lock().max_allocatable(align)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.space.lock().is_empty()
    }

    pub fn is_include(&self, addr: Address) -> bool {
        self.inner.space.lock().is_include(addr)
    }

    pub fn block_size(&self, addr: Address) -> Option<Size> {
        self.inner.space.lock().block_size(addr)
    }

    pub fn region_start(&self) -> Address {
        self.inner.space.lock().region().start
    }

    pub fn region_size(&self) -> Size {
        self.inner.space.lock().region().len()
    }

    pub fn child_count(&self) -> usize {
        self.inner.children.lock().len()
    }

    /// Snapshot of this heap's direct children, oldest first.
    pub fn children(&self) -> Vec<Heap> {
        self.inner.children.lock().clone()
    }

    pub fn disposer_count(&self) -> usize {
        self.inner.disposers.lock().len()
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.space.lock().stats(&self.inner.name)
    }

    // Disposer registry plumbing

    pub(super) fn push_disposer(&self, shared: Arc<DisposerShared>) -> u64 {
        let id = self.inner.next_disposer_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .disposers
            .lock()
            .push(DisposerEntry { id, shared });
        id
    }

    pub(super) fn remove_disposer(&self, id: u64) {
        self.inner.disposers.lock().retain(|e| e.id != id);
    }

    /// Deepest heap in this subtree whose region contains `addr`.
    ///
    /// Caller holds the shape lock, so the walk never races attach/detach.
    pub(super) fn find_contain(&self, addr: Address) -> Option<Heap> {
        if !self.is_include(addr) {
            return None;
        }
        let children = self.inner.children.lock().clone();
        for child in &children {
            if let Some(found) = child.find_contain(addr) {
                return Some(found);
            }
        }
        Some(self.clone())
    }

    /// Verify free-list bookkeeping invariants; test support.
    #[doc(hidden)]
    pub fn check_invariants(&self) {
        self.inner.space.lock().check_invariants();
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("direction", &self.inner.direction)
            .finish()
    }
}
