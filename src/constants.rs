//! Constants and layout parameters for the handle table

use crate::types::HandleTableEntry;
use core::mem::size_of;

/// Size of one table page; every level of the index is exactly one page.
pub const PAGE_SIZE: usize = 4096;

/// Handle values advance in units of this stride; the bits below the stride
/// are ignorable tag bits.
pub const HANDLE_STRIDE: u32 = 4;

/// The tag bits callers may set on a handle value; masked out before descent.
pub const TAG_MASK: u32 = HANDLE_STRIDE - 1;

/// Clears the tag bits of a handle value or free-list link.
pub const FREE_HANDLE_MASK: u32 = !TAG_MASK;

/// Entries per low-level page.
pub const LOW_LEVEL_ENTRIES: usize = PAGE_SIZE / size_of::<HandleTableEntry>();

/// Child pointers per mid-level page.
pub const MID_LEVEL_ENTRIES: usize = PAGE_SIZE / size_of::<*mut ()>();

/// Child pointers in the high-level page; running past the last slot is the
/// hard capacity limit of a table.
pub const HIGH_LEVEL_ENTRIES: usize = PAGE_SIZE / size_of::<*mut ()>();

/// Entry slots spanned by one fully populated mid-level subtree.
pub const MAX_MID_INDEX: usize = LOW_LEVEL_ENTRIES * MID_LEVEL_ENTRIES;

/// Handle values spanned by one low-level page.
pub const LOW_LEVEL_SPAN: u32 = LOW_LEVEL_ENTRIES as u32 * HANDLE_STRIDE;

/// Low 2 bits of the table code encode the tree depth (0, 1 or 2 levels of
/// indirection above the entry pages).
pub const TABLE_LEVEL_MASK: usize = 3;

/// Lock bit inside an entry's object word, with inverted sense: the bit is
/// *set* while the entry is unlocked and cleared while a thread holds it.
pub const UNLOCKED_BIT: usize = 1;

/// Free-link value marking the permanent sentinel at slot 0 of every
/// low-level page. Live handles must never store this value in their
/// metadata word.
pub const RESERVED_META: u32 = u32::MAX - 1;
