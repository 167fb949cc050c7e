/*!
 * Free List
 * Address-ordered free spans with coalescing, plus used-block metadata
 */

use super::types::AllocPolicy;
use crate::core::types::{align_down, align_up, Address, Size};
use std::collections::BTreeMap;

/// Split remainders smaller than this stay inside the allocated block
/// instead of becoming free-list dust.
pub(super) const MIN_FRAGMENT: Size = 16;

/// One allocated span.
///
/// `address` is the aligned address handed to the caller; `pad` is the
/// alignment padding swallowed at the front, so freeing restores the full
/// original span `[address - pad, address + size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct MemBlock {
    pub address: Address,
    pub size: Size,
    pub pad: Size,
    /// Marks a span carved out as a child heap's region, which must be
    /// released through heap destruction rather than `free`
    pub child: bool,
}

impl MemBlock {
    /// Start of the underlying span including front padding
    pub fn span_start(&self) -> Address {
        self.address - self.pad
    }

    pub fn span_size(&self) -> Size {
        self.pad + self.size
    }
}

/// A candidate free span chosen for an allocation
#[derive(Debug, Clone, Copy)]
pub(super) struct Fit {
    pub address: Address,
    pub size: Size,
    /// Padding needed to reach the requested alignment from `address`
    pub pad: Size,
}

/// Address-ordered free spans.
///
/// Keys are span start addresses, values are span sizes. Insertion merges
/// with the address-predecessor and address-successor, so the map never
/// holds overlapping or adjacent-unmerged spans.
#[derive(Debug, Default)]
pub(super) struct FreeList {
    spans: BTreeMap<Address, Size>,
}

impl FreeList {
    pub fn new() -> Self {
        Self {
            spans: BTreeMap::new(),
        }
    }

    /// Insert a span, coalescing with free neighbors on both sides.
    ///
    /// # Panics
    /// Panics if the span overlaps an existing free span; that means a
    /// double free slipped past the used-block ownership check.
    pub fn insert(&mut self, mut address: Address, mut size: Size) {
        if size == 0 {
            return;
        }

        // Merge with the predecessor if it ends exactly at `address`.
        if let Some((&prev_addr, &prev_size)) = self.spans.range(..address).next_back() {
            assert!(
                prev_addr + prev_size <= address,
                "invariant violated: free span overlaps predecessor (double free?)"
            );
            if prev_addr + prev_size == address {
                self.spans.remove(&prev_addr);
                address = prev_addr;
                size += prev_size;
            }
        }

        // Merge with the successor if it starts exactly at span end.
        if let Some((&next_addr, &next_size)) = self.spans.range(address..).next() {
            assert!(
                address + size <= next_addr,
                "invariant violated: free span overlaps successor (double free?)"
            );
            if address + size == next_addr {
                self.spans.remove(&next_addr);
                size += next_size;
            }
        }

        self.spans.insert(address, size);
    }

    /// Remove an exact span previously returned by a find.
    pub fn remove(&mut self, address: Address) -> Option<Size> {
        self.spans.remove(&address)
    }

    /// Shrink a span in place from its front: `[address, address + take)`
    /// leaves the list, the remainder stays.
    pub fn take_front(&mut self, address: Address, take: Size) {
        let size = self
            .spans
            .remove(&address)
            .expect("take_front on absent span");
        debug_assert!(take <= size);
        if size > take {
            self.spans.insert(address + take, size - take);
        }
    }

    /// Find a span able to hold `size` bytes at `align`, per policy.
    ///
    /// Both policies account for the padding lost to alignment, so a span
    /// only fits if `pad + size` fits.
    pub fn find(&self, policy: AllocPolicy, size: Size, align: Size) -> Option<Fit> {
        let mut best: Option<Fit> = None;
        for (&addr, &span_size) in &self.spans {
            let aligned = align_up(addr, align);
            let pad = aligned - addr;
            if pad + size > span_size {
                continue;
            }
            let fit = Fit {
                address: addr,
                size: span_size,
                pad,
            };
            match policy {
                AllocPolicy::FirstFit => return Some(fit),
                AllocPolicy::BestFit => {
                    // Strict < keeps the lowest address among equal sizes.
                    if best.map_or(true, |b| span_size < b.size) {
                        best = Some(fit);
                    }
                }
            }
        }
        best
    }

    /// Find the highest span able to hold `size` bytes at `align`, for
    /// carving from the back of a region.
    pub fn find_back(&self, size: Size, align: Size) -> Option<Fit> {
        for (&addr, &span_size) in self.spans.iter().rev() {
            let end = addr + span_size;
            if end < size {
                continue;
            }
            let aligned = align_down(end - size, align);
            if aligned < addr {
                continue;
            }
            return Some(Fit {
                address: addr,
                size: span_size,
                pad: aligned - addr,
            });
        }
        None
    }

    /// Free span exactly preceding `address`, if adjacent.
    pub fn adjacent_before(&self, address: Address) -> Option<(Address, Size)> {
        self.spans
            .range(..address)
            .next_back()
            .filter(|(&a, &s)| a + s == address)
            .map(|(&a, &s)| (a, s))
    }

    /// Free span starting exactly at `address`, if any.
    pub fn adjacent_at(&self, address: Address) -> Option<Size> {
        self.spans.get(&address).copied()
    }

    /// Lowest span, if any.
    pub fn first(&self) -> Option<(Address, Size)> {
        self.spans.iter().next().map(|(&a, &s)| (a, s))
    }

    /// Highest span, if any.
    pub fn last(&self) -> Option<(Address, Size)> {
        self.spans.iter().next_back().map(|(&a, &s)| (a, s))
    }

    /// Total free bytes.
    pub fn total(&self) -> Size {
        self.spans.values().sum()
    }

    /// Number of spans.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Largest usable size at `align`, accounting for padding loss.
    pub fn max_allocatable(&self, align: Size) -> Size {
        self.spans
            .iter()
            .map(|(&addr, &size)| {
                let pad = align_up(addr, align) - addr;
                size.saturating_sub(pad)
            })
            .max()
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.spans.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Address, Size)> + '_ {
        self.spans.iter().map(|(&a, &s)| (a, s))
    }
}
