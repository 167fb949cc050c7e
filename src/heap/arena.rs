/*!
 * Arena
 * Raw backing memory region from which root heaps are carved
 */

use crate::core::types::{Address, Size};
use log::info;

enum Backing {
    /// Not yet initialized
    Unbound,
    /// Self-allocated region; released when the arena is destroyed
    Owned(Box<[u8]>),
    /// Externally supplied region; never released by the arena
    External { start: Address, size: Size },
}

/// The flat memory region backing a heap tree.
///
/// An arena is initialized exactly once, either by allocating its own
/// backing buffer or by wrapping externally owned memory. Initializing
/// twice, or destroying before initializing, is a fatal logic error.
pub struct Arena {
    backing: Backing,
    initialized: bool,
}

impl Arena {
    /// Create an unbound arena; call `initialize` before use.
    pub fn new() -> Self {
        Self {
            backing: Backing::Unbound,
            initialized: false,
        }
    }

    /// Allocate `size` bytes of backing memory from the system allocator.
    ///
    /// # Panics
    /// Panics if the arena was already initialized.
    pub fn initialize(&mut self, size: Size) {
        assert!(
            !self.initialized,
            "invariant violated: Arena::initialize called twice"
        );
        self.backing = Backing::Owned(vec![0u8; size].into_boxed_slice());
        self.initialized = true;
        info!("Arena initialized: {} bytes (self-allocated)", size);
    }

    /// Wrap an externally owned region `[start, start + size)`.
    ///
    /// The arena records the range for containment queries but never
    /// releases the memory.
    ///
    /// # Panics
    /// Panics if the arena was already initialized.
    pub fn initialize_external(&mut self, start: Address, size: Size) {
        assert!(
            !self.initialized,
            "invariant violated: Arena::initialize called twice"
        );
        self.backing = Backing::External { start, size };
        self.initialized = true;
        info!(
            "Arena initialized: {} bytes at 0x{:x} (externally owned)",
            size, start
        );
    }

    /// Convenience constructor: a freshly initialized self-allocated arena.
    pub fn with_size(size: Size) -> Self {
        let mut arena = Self::new();
        arena.initialize(size);
        arena
    }

    /// Release the backing memory if self-allocated.
    ///
    /// # Panics
    /// Panics if the arena was never initialized.
    pub fn destroy(&mut self) {
        assert!(
            self.initialized,
            "invariant violated: Arena::destroy before initialize"
        );
        if let Backing::Owned(_) = self.backing {
            info!("Arena destroyed: releasing {} bytes", self.size());
        }
        // External memory is left untouched.
        self.backing = Backing::Unbound;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Start address of the region. Zero when unbound.
    pub fn start(&self) -> Address {
        match &self.backing {
            Backing::Unbound => 0,
            Backing::Owned(buf) => buf.as_ptr() as Address,
            Backing::External { start, .. } => *start,
        }
    }

    /// Size of the region in bytes. Zero when unbound.
    pub fn size(&self) -> Size {
        match &self.backing {
            Backing::Unbound => 0,
            Backing::Owned(buf) => buf.len(),
            Backing::External { size, .. } => *size,
        }
    }

    /// Whether `addr` lies in `[start, start + size)`.
    pub fn is_include(&self, addr: Address) -> bool {
        let start = self.start();
        addr >= start && addr < start + self.size()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
