//! Data structures for the handle table

use crate::constants::{
    FREE_HANDLE_MASK, HANDLE_STRIDE, HIGH_LEVEL_ENTRIES, LOW_LEVEL_ENTRIES, MID_LEVEL_ENTRIES,
    UNLOCKED_BIT,
};
use crate::event::ContentionEvent;
use crate::registry::TableId;
use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use std::mem;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// A low-level page: the entries themselves.
pub(crate) type LowLevel = [HandleTableEntry; LOW_LEVEL_ENTRIES];

/// A mid-level page: pointers to low-level pages, filled front to back.
pub(crate) type MidLevel = [AtomicPtr<LowLevel>; MID_LEVEL_ENTRIES];

/// The high-level page: pointers to mid-level pages, filled front to back.
pub(crate) type HighLevel = [AtomicPtr<MidLevel>; HIGH_LEVEL_ENTRIES];

/// Optional quota accounting hook for the context owning a table.
///
/// Charges are best-effort: a refused charge is logged and the structural
/// operation proceeds uncharged.
pub trait QuotaProcess: Send + Sync {
    /// Charge `bytes` of pool usage; return `false` to refuse the charge.
    fn charge_pool_quota(&self, bytes: usize) -> bool;
    /// Return `bytes` previously charged.
    fn return_pool_quota(&self, bytes: usize);
}

pub(crate) type QuotaRef = Arc<dyn QuotaProcess>;

/// A handle: a small integer naming one entry slot.
///
/// The value advances in units of [`HANDLE_STRIDE`]; the low tag bits are
/// ignored when the handle is used as an index. `Handle(0)` is never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub const NULL: Handle = Handle(0);

    #[inline]
    pub const fn from_raw(value: u32) -> Self {
        Handle(value)
    }

    /// The raw value, tag bits included.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The value with tag bits cleared; this is what the index descends on.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0 & FREE_HANDLE_MASK
    }

    /// The entry slot number this handle names.
    #[inline]
    pub const fn slot(self) -> u32 {
        self.value() / HANDLE_STRIDE
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.value() == 0
    }
}

/// One entry slot.
///
/// The `object` word encodes all three states: zero while free, the caller's
/// object word with [`UNLOCKED_BIT`] set while live and unlocked, and with
/// the bit clear while a thread holds the entry lock. The `meta` word is the
/// free-list link while free and caller metadata while live.
#[repr(C)]
pub struct HandleTableEntry {
    pub(crate) object: AtomicUsize,
    pub(crate) meta: AtomicU32,
}

impl HandleTableEntry {
    /// The object word as stored, lock bit included.
    #[inline]
    pub(crate) fn raw_object(&self) -> usize {
        self.object.load(Ordering::Acquire)
    }

    /// The object word with the lock bit masked off; zero if the entry is
    /// free.
    #[inline]
    pub fn object(&self) -> usize {
        self.raw_object() & !UNLOCKED_BIT
    }

    /// Caller metadata (the free-list link while the entry is free).
    #[inline]
    pub fn meta(&self) -> u32 {
        self.meta.load(Ordering::Acquire)
    }

    /// Store caller metadata. Meaningful only while the entry is held
    /// locked, e.g. from a `change_handle` callback.
    #[inline]
    pub fn set_meta(&self, meta: u32) {
        self.meta.store(meta, Ordering::Release);
    }

    #[inline]
    pub(crate) fn next_free(&self) -> u32 {
        self.meta()
    }

    #[inline]
    pub(crate) fn set_next_free(&self, link: u32) {
        self.meta.store(link, Ordering::Release);
    }
}

/// One handle table.
///
/// `table_code` is a tagged pointer: the page pointer of the top level with
/// the tree depth in its low 2 bits. Pages published through it are only
/// reclaimed in `Drop`, so lock-free readers can descend without an epoch
/// scheme; the depth never decreases and `next_handle_needing_pool` never
/// shrinks.
pub struct HandleTable {
    pub(crate) table_code: AtomicUsize,
    /// Commit boundary, in handle values: every entry below it is backed by
    /// an allocated page. Grows monotonically.
    pub(crate) next_handle_needing_pool: AtomicU32,
    /// Primary free-list head (handle value of the first free entry).
    pub(crate) first_free: CachePadded<AtomicU32>,
    /// Overflow free-list head, taking frees that would contend with an
    /// in-flight pop; drained back into `first_free` under lock 0.
    pub(crate) last_free: CachePadded<AtomicU32>,
    pub(crate) handle_count: AtomicU32,
    /// Lock 0 serializes growth and free-list drains; locks 1..3 (plus 0 in
    /// shared mode) arbitrate free-list pops, selected by a hash of the
    /// handle value.
    pub(crate) locks: [RwLock<()>; 4],
    pub(crate) contention: ContentionEvent,
    pub(crate) quota: Option<QuotaRef>,
    pub(crate) strict_fifo: bool,
    pub(crate) id: TableId,
}

/// A live entry held locked, returned by [`HandleTable::map_handle`].
///
/// Dropping the guard releases the entry lock and wakes any blocked
/// contenders, so lock/unlock pairing holds on every exit path.
pub struct LockedEntry<'a> {
    pub(crate) table: &'a HandleTable,
    pub(crate) entry: &'a HandleTableEntry,
    pub(crate) handle: Handle,
}

impl LockedEntry<'_> {
    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// The object word this handle refers to.
    #[inline]
    pub fn object(&self) -> usize {
        // Held locked, so the raw word is the object with the bit clear.
        self.entry.raw_object()
    }

    #[inline]
    pub fn meta(&self) -> u32 {
        self.entry.meta()
    }

    #[inline]
    pub fn set_meta(&self, meta: u32) {
        self.entry.set_meta(meta);
    }

    /// Destroy the handle without relocking: clears the object word, wakes
    /// waiters and returns the slot to the free list.
    pub fn destroy(self) {
        self.table.destroy_locked(self.handle, self.entry);
        // The entry is already back on the free list; skip the unlock in Drop.
        mem::forget(self);
    }
}

impl Drop for LockedEntry<'_> {
    fn drop(&mut self) {
        self.table.unlock_entry(self.entry);
    }
}
