/*!
 * Core Module
 * Shared types and helpers
 */

pub mod types;

pub use types::{align_down, align_up, Address, HeapId, Size, DEFAULT_ALIGNMENT};
