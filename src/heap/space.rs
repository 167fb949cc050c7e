/*!
 * Expanding Heap Space
 * Free-list allocator state for one heap region
 */

use super::free_list::{FreeList, MemBlock, MIN_FRAGMENT};
use super::types::{AllocPolicy, Direction, HeapError, HeapResult, HeapStats};
use crate::core::types::{Address, Size};
use std::collections::BTreeMap;

/// Contiguous managed range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Region {
    pub start: Address,
    pub end: Address,
}

impl Region {
    pub fn len(&self) -> Size {
        self.end - self.start
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Allocator state for an expanding heap: the region, the address-ordered
/// free list, and the used-block map.
///
/// The union of free spans and used spans always reconstructs the region;
/// alignment padding is carried inside used blocks so nothing is lost.
pub(super) struct ExpSpace {
    region: Region,
    free: FreeList,
    used: BTreeMap<Address, MemBlock>,
}

impl ExpSpace {
    pub fn new(start: Address, size: Size) -> Self {
        let mut free = FreeList::new();
        free.insert(start, size);
        Self {
            region: Region {
                start,
                end: start + size,
            },
            free,
            used: BTreeMap::new(),
        }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    fn check_alignment(align: Size) -> HeapResult<()> {
        if align == 0 || !align.is_power_of_two() {
            return Err(HeapError::BadAlignment { align });
        }
        Ok(())
    }

    /// Carve `size` bytes at `align` from the front of the region.
    ///
    /// Splits the chosen free span when the remainder is worth keeping;
    /// sub-fragment remainders are absorbed into the allocated block.
    pub fn try_alloc(&mut self, size: Size, align: Size, policy: AllocPolicy) -> HeapResult<Address> {
        Self::check_alignment(align)?;
        let size = size.max(1);

        let fit = self
            .free
            .find(policy, size, align)
            .ok_or_else(|| HeapError::OutOfMemory {
                requested: size,
                align,
                available: self.free.total(),
                largest: self.free.max_allocatable(align),
            })?;

        self.free.remove(fit.address);
        let aligned = fit.address + fit.pad;

        // Large front padding goes back to the free list; small padding
        // rides along inside the block.
        let pad = if fit.pad >= MIN_FRAGMENT {
            self.free.insert(fit.address, fit.pad);
            0
        } else {
            fit.pad
        };

        let remainder = fit.size - fit.pad - size;
        let block_size = if remainder >= MIN_FRAGMENT {
            self.free.insert(aligned + size, remainder);
            size
        } else {
            size + remainder
        };

        self.used.insert(
            aligned,
            MemBlock {
                address: aligned,
                size: block_size,
                pad,
                child: false,
            },
        );
        Ok(aligned)
    }

    /// Carve `size` bytes at `align` from the back of the region.
    pub fn alloc_back(&mut self, size: Size, align: Size) -> HeapResult<Address> {
        Self::check_alignment(align)?;
        let size = size.max(1);

        let fit = self
            .free
            .find_back(size, align)
            .ok_or_else(|| HeapError::OutOfMemory {
                requested: size,
                align,
                available: self.free.total(),
                largest: self.free.max_allocatable(align),
            })?;

        self.free.remove(fit.address);
        let aligned = fit.address + fit.pad;
        let span_end = fit.address + fit.size;

        let pad = if fit.pad >= MIN_FRAGMENT {
            self.free.insert(fit.address, fit.pad);
            0
        } else {
            fit.pad
        };

        // Alignment can leave a sliver between block end and span end.
        let tail = span_end - aligned - size;
        let block_size = if tail >= MIN_FRAGMENT {
            self.free.insert(aligned + size, tail);
            size
        } else {
            size + tail
        };

        self.used.insert(
            aligned,
            MemBlock {
                address: aligned,
                size: block_size,
                pad,
                child: false,
            },
        );
        Ok(aligned)
    }

    /// Return a block to the free list, merging with free neighbors.
    ///
    /// # Panics
    /// Panics if `addr` is not a live allocation of this space: that is a
    /// double free or a foreign pointer, and nothing is mutated before the
    /// check fires.
    pub fn free(&mut self, addr: Address) {
        match self.used.get(&addr) {
            Some(block) if block.child => panic!(
                "invariant violated: free of 0x{:x} which is a live child heap region; destroy the child heap instead",
                addr
            ),
            Some(_) => {}
            None => panic!(
                "invariant violated: free of 0x{:x} which is not an allocated block of this heap (double free or foreign pointer)",
                addr
            ),
        }
        let block = self.used.remove(&addr).unwrap();
        self.free.insert(block.span_start(), block.span_size());
    }

    /// Carve a span to serve as a child heap's region. The block is marked
    /// so ordinary `free` rejects it; it comes back via `free_region` when
    /// the child heap is destroyed.
    pub fn alloc_region(
        &mut self,
        size: Size,
        align: Size,
        direction: Direction,
        policy: AllocPolicy,
    ) -> HeapResult<Address> {
        let addr = match direction {
            Direction::FromFront => self.try_alloc(size, align, policy)?,
            Direction::FromBack => self.alloc_back(size, align)?,
        };
        self.used.get_mut(&addr).expect("freshly carved block").child = true;
        Ok(addr)
    }

    /// Release a destroyed child heap's region back to the free list.
    pub fn free_region(&mut self, addr: Address) {
        let block = match self.used.remove(&addr) {
            Some(block) if block.child => block,
            _ => panic!(
                "invariant violated: free_region of 0x{:x} which is not a child heap region of this heap",
                addr
            ),
        };
        self.free.insert(block.span_start(), block.span_size());
    }

    /// Grow or shrink a block in place by moving its back boundary.
    pub fn resize_back(&mut self, addr: Address, new_size: Size) -> HeapResult<()> {
        let new_size = new_size.max(1);
        let block = match self.used.get(&addr) {
            Some(b) => *b,
            None => panic!(
                "invariant violated: resize of 0x{:x} which is not an allocated block of this heap",
                addr
            ),
        };

        if new_size == block.size {
            return Ok(());
        }

        if new_size < block.size {
            let tail = block.size - new_size;
            // Release the tail unless it would become unmergeable dust.
            if tail >= MIN_FRAGMENT || self.free.adjacent_at(addr + block.size).is_some() {
                self.used.get_mut(&addr).unwrap().size = new_size;
                self.free.insert(addr + new_size, tail);
            }
            return Ok(());
        }

        let need = new_size - block.size;
        let span_end = addr + block.size;
        match self.free.adjacent_at(span_end) {
            Some(span_size) if span_size >= need => {
                if span_size - need < MIN_FRAGMENT {
                    self.free.remove(span_end);
                    self.used.get_mut(&addr).unwrap().size = block.size + span_size;
                } else {
                    self.free.take_front(span_end, need);
                    self.used.get_mut(&addr).unwrap().size = new_size;
                }
                Ok(())
            }
            adjacent => Err(HeapError::ResizeUnavailable {
                address: addr,
                requested: new_size,
                available: adjacent.unwrap_or(0),
            }),
        }
    }

    /// Grow or shrink a block by moving its front boundary; the back
    /// boundary stays fixed. Returns the block's (possibly new) address.
    pub fn resize_front(&mut self, addr: Address, new_size: Size) -> HeapResult<Address> {
        let new_size = new_size.max(1);
        let block = match self.used.get(&addr) {
            Some(b) => *b,
            None => panic!(
                "invariant violated: resize of 0x{:x} which is not an allocated block of this heap",
                addr
            ),
        };

        if new_size == block.size {
            return Ok(addr);
        }

        let back = addr + block.size;
        let span_start = block.span_start();

        if new_size < block.size {
            let new_addr = back - new_size;
            let release = new_addr - span_start;
            self.used.remove(&addr);
            if release >= MIN_FRAGMENT || self.free.adjacent_before(span_start).is_some() {
                self.free.insert(span_start, release);
                self.used.insert(
                    new_addr,
                    MemBlock {
                        address: new_addr,
                        size: new_size,
                        pad: 0,
                        child: block.child,
                    },
                );
            } else {
                self.used.insert(
                    new_addr,
                    MemBlock {
                        address: new_addr,
                        size: new_size,
                        pad: release,
                        child: block.child,
                    },
                );
            }
            return Ok(new_addr);
        }

        let need = new_size - block.size;
        if block.pad >= need {
            // The block's own front padding covers the growth.
            let new_addr = addr - need;
            self.used.remove(&addr);
            self.used.insert(
                new_addr,
                MemBlock {
                    address: new_addr,
                    size: new_size,
                    pad: block.pad - need,
                    child: block.child,
                },
            );
            return Ok(new_addr);
        }

        let extra = need - block.pad;
        match self.free.adjacent_before(span_start) {
            Some((pred_addr, pred_size)) if pred_size >= extra => {
                self.free.remove(pred_addr);
                let new_span_start = if pred_size - extra < MIN_FRAGMENT {
                    pred_addr
                } else {
                    self.free.insert(pred_addr, pred_size - extra);
                    pred_addr + (pred_size - extra)
                };
                let new_addr = back - new_size;
                self.used.remove(&addr);
                self.used.insert(
                    new_addr,
                    MemBlock {
                        address: new_addr,
                        size: new_size,
                        pad: new_addr - new_span_start,
                        child: block.child,
                    },
                );
                Ok(new_addr)
            }
            pred => Err(HeapError::ResizeUnavailable {
                address: addr,
                requested: new_size,
                available: block.size + block.pad + pred.map_or(0, |(_, s)| s),
            }),
        }
    }

    /// Drop every used block and rebuild the free list as one span over
    /// the whole region. Disposers are NOT involved at this level.
    ///
    /// # Panics
    /// Panics if any live child heap region is carved from this space.
    pub fn free_all(&mut self) {
        if let Some(block) = self.used.values().find(|b| b.child) {
            panic!(
                "invariant violated: free_all on a heap with a live child heap region at 0x{:x}",
                block.address
            );
        }
        self.used.clear();
        self.free.clear();
        if self.region.len() > 0 {
            self.free.insert(self.region.start, self.region.len());
        }
    }

    /// Shrink the region down to its high-water mark of usage, returning
    /// the number of bytes given back.
    ///
    /// A `FromFront` heap reclaims its trailing free span (the end moves
    /// down); a `FromBack` heap reclaims its leading free span (the start
    /// moves up). Calling twice with no intervening allocation reclaims
    /// zero the second time.
    pub fn adjust(&mut self, direction: Direction) -> Size {
        match direction {
            Direction::FromFront => match self.free.last() {
                Some((addr, size)) if addr + size == self.region.end => {
                    self.free.remove(addr);
                    self.region.end = addr;
                    size
                }
                _ => 0,
            },
            Direction::FromBack => match self.free.first() {
                Some((addr, size)) if addr == self.region.start => {
                    self.free.remove(addr);
                    self.region.start = addr + size;
                    size
                }
                _ => 0,
            },
        }
    }

    pub fn free_size(&self) -> Size {
        self.free.total()
    }

    /// Used bytes including per-block alignment padding.
    pub fn used_size(&self) -> Size {
        self.region.len() - self.free.total()
    }

    pub fn max_allocatable(&self, align: Size) -> Size {
        self.free.max_allocatable(align)
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    pub fn is_include(&self, addr: Address) -> bool {
        self.region.contains(addr)
    }

    pub fn block_size(&self, addr: Address) -> Option<Size> {
        self.used.get(&addr).map(|b| b.size)
    }

    pub fn used_blocks(&self) -> usize {
        self.used.len()
    }

    pub fn stats(&self, name: &str) -> HeapStats {
        HeapStats {
            name: name.to_string(),
            region_start: self.region.start,
            region_size: self.region.len(),
            used_size: self.used_size(),
            free_size: self.free_size(),
            used_blocks: self.used.len(),
            free_blocks: self.free.len(),
            largest_free_span: self.free.max_allocatable(1),
        }
    }

    /// Free-list invariant check used by tests: spans sorted, inside the
    /// region, non-overlapping, never adjacent to each other, and free +
    /// used sizes reconstruct the region.
    pub fn check_invariants(&self) {
        let mut prev_end: Option<Address> = None;
        for (addr, size) in self.free.iter() {
            assert!(size > 0, "zero-size free span");
            assert!(addr >= self.region.start && addr + size <= self.region.end);
            if let Some(end) = prev_end {
                assert!(end < addr, "free spans adjacent or overlapping");
            }
            prev_end = Some(addr + size);
        }
        let used_total: Size = self.used.values().map(|b| b.span_size()).sum();
        assert_eq!(used_total + self.free.total(), self.region.len());
    }
}
