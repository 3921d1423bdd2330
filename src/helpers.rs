//! Small pure helpers for handle arithmetic

use crate::constants::{FREE_HANDLE_MASK, HANDLE_STRIDE, LOW_LEVEL_ENTRIES};

/// Hash a handle value onto one of the four table locks.
#[inline]
pub(crate) fn lock_index(value: u32) -> usize {
    ((value >> 2) % 4) as usize
}

/// True for handle values naming slot 0 of a low-level page: the reserved
/// sentinel positions, never valid handles.
#[inline]
pub(crate) fn is_sentinel_position(value: u32) -> bool {
    ((value & FREE_HANDLE_MASK) / HANDLE_STRIDE) as usize & (LOW_LEVEL_ENTRIES - 1) == 0
}
