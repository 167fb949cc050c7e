/*!
 * Core Types
 * Common types used across the heap subsystem
 */

/// Address type for memory operations
pub type Address = usize;

/// Size type for memory operations
pub type Size = usize;

/// Unique heap identifier, assigned at creation time
pub type HeapId = u64;

/// Default alignment for allocations and heap regions
pub const DEFAULT_ALIGNMENT: Size = 16;

/// Round `addr` up to the next multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_up(addr: Address, align: Size) -> Address {
    (addr + align - 1) & !(align - 1)
}

/// Round `addr` down to the previous multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_down(addr: Address, align: Size) -> Address {
    addr & !(align - 1)
}
