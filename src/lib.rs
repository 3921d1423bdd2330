//! Generic handle tables: small integer handles mapping to opaque object
//! words through a 1/2/3-level radix index, with lock-free free-list
//! allocation, per-entry single-bit locks arbitrated by a table-wide
//! contention event, whole-table duplication and enumeration.
//!
//! A table starts as a single entry page and grows by adding pages and, when
//! a level fills, by promoting the tree one level. Levels never shrink and
//! the commit boundary only grows, so readers descend the index without any
//! reclamation scheme; the whole tree is torn down when the table drops.

pub mod constants;
pub mod errors;
pub mod helpers;
pub mod registry;
pub mod types;

mod event;
mod pool;

use constants::*;
use log::{debug, info, trace, warn};
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use types::{HighLevel, LowLevel, MidLevel, QuotaRef};

pub use errors::Error;
pub use registry::{for_each_table, table_count, TableId};
pub use types::{Handle, HandleTable, HandleTableEntry, LockedEntry, QuotaProcess};

// ===== Compile-time layout assertions =====
const _: () = assert!(size_of::<HandleTableEntry>() == 2 * size_of::<usize>());
const _: () = assert!(size_of::<LowLevel>() == PAGE_SIZE);
const _: () = assert!(size_of::<MidLevel>() == PAGE_SIZE);
const _: () = assert!(size_of::<HighLevel>() == PAGE_SIZE);
const _: () = assert!(LOW_LEVEL_ENTRIES.is_power_of_two());
const _: () = assert!(HANDLE_STRIDE.is_power_of_two() && HANDLE_STRIDE >= 4);

impl HandleTable {
    // ---- logging bootstrapper ------------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    /// Create an empty table: one committed entry page whose slot 0 is the
    /// permanent sentinel, the rest threaded onto the free list.
    pub fn new(quota: Option<QuotaRef>) -> Result<Arc<Self>, Error> {
        Self::create(quota, false)
    }

    /// Like [`HandleTable::new`], but freed handles are reissued in the
    /// order they were freed.
    pub fn new_strict_fifo(quota: Option<QuotaRef>) -> Result<Arc<Self>, Error> {
        Self::create(quota, true)
    }

    fn create(quota: Option<QuotaRef>, strict_fifo: bool) -> Result<Arc<Self>, Error> {
        let table = Self::allocate_table(quota, strict_fifo, true)?;
        registry::register(&table);
        counter!("exhandle_table_creates_total").increment(1);
        info!("created handle table {}", table.id);
        Ok(table)
    }

    /// Allocate the table struct plus its first entry page. With
    /// `init_free_chain` the page's entries are threaded onto the free
    /// list; without it (the duplication path) every slot will be filled
    /// explicitly by the caller.
    fn allocate_table(
        quota: Option<QuotaRef>,
        strict_fifo: bool,
        init_free_chain: bool,
    ) -> Result<Arc<Self>, Error> {
        Self::ensure_logging();
        let table = HandleTable {
            table_code: Default::default(),
            next_handle_needing_pool: Default::default(),
            first_free: Default::default(),
            last_free: Default::default(),
            handle_count: Default::default(),
            locks: Default::default(),
            contention: event::ContentionEvent::new(),
            quota,
            strict_fifo,
            id: registry::next_table_id(),
        };
        let low = table.alloc_low_level(init_free_chain)?;
        table
            .table_code
            .store(low.as_ptr() as usize, Ordering::Release);
        if init_free_chain {
            table.first_free.store(HANDLE_STRIDE, Ordering::Release);
        }
        table
            .next_handle_needing_pool
            .store(LOW_LEVEL_SPAN, Ordering::Release);
        Ok(Arc::new(table))
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    /// Number of live handles.
    pub fn handle_count(&self) -> u32 {
        self.handle_count.load(Ordering::Acquire)
    }

    /// Commit boundary in handle values; monotonically increasing.
    pub fn commit_boundary(&self) -> u32 {
        self.next_handle_needing_pool.load(Ordering::Acquire)
    }

    /// Emit the live-handle gauge (caller decides cadence).
    pub fn report_handle_metrics(&self) {
        gauge!("exhandle_live_handles").set(self.handle_count() as f64);
    }

    // =====================================================================
    // Multi-level index
    // =====================================================================

    /// Translate a handle to its entry, or `None` when the handle lies past
    /// the commit boundary. The bounds check precedes any descent, so free
    /// or stale (but committed) positions still resolve to their slot.
    pub(crate) fn lookup_entry(&self, handle: Handle) -> Option<&HandleTableEntry> {
        let value = handle.value();
        if value >= self.next_handle_needing_pool.load(Ordering::Acquire) {
            return None;
        }
        let slot = (value / HANDLE_STRIDE) as usize;
        let code = self.table_code.load(Ordering::Acquire);
        let level = code & TABLE_LEVEL_MASK;
        let base = code & !TABLE_LEVEL_MASK;
        // SAFETY: `value` is below the commit boundary, and the boundary is
        // only advanced after the covering page pointers are published, so
        // every pointer on the descent path is non-null and points at a page
        // that stays allocated until Drop.
        unsafe {
            match level {
                0 => {
                    let low = base as *const LowLevel;
                    Some(&(*low)[slot])
                }
                1 => {
                    let mid = base as *const MidLevel;
                    let j = slot / LOW_LEVEL_ENTRIES;
                    let i = slot % LOW_LEVEL_ENTRIES;
                    let low = (*mid)[j].load(Ordering::Acquire);
                    Some(&(*low)[i])
                }
                _ => {
                    let high = base as *const HighLevel;
                    let k = slot / MAX_MID_INDEX;
                    let rem = slot % MAX_MID_INDEX;
                    let j = rem / LOW_LEVEL_ENTRIES;
                    let i = rem % LOW_LEVEL_ENTRIES;
                    let mid = (*high)[k].load(Ordering::Acquire);
                    let low = (*mid)[j].load(Ordering::Acquire);
                    Some(&(*low)[i])
                }
            }
        }
    }

    /// Allocate a new entry page. Slot 0 becomes the reserved sentinel;
    /// with `init_free_chain` slots 1..N-2 are threaded to their successor
    /// and the last slot keeps the zero terminator until spliced.
    fn alloc_low_level(&self, init_free_chain: bool) -> Result<NonNull<LowLevel>, Error> {
        let page = pool::allocate_table_page::<LowLevel>(self.quota.as_ref())?;
        // SAFETY: freshly allocated, zeroed, exclusively ours until linked.
        let entries = unsafe { &*page.as_ptr() };
        entries[0].set_next_free(RESERVED_META);
        if init_free_chain {
            let base = self.next_handle_needing_pool.load(Ordering::Acquire);
            for slot in 1..LOW_LEVEL_ENTRIES - 1 {
                entries[slot].set_next_free(base + (slot as u32 + 1) * HANDLE_STRIDE);
            }
        }
        Ok(page)
    }

    /// Allocate a mid-level page with one fresh entry page in its first
    /// slot.
    fn alloc_mid_level(&self, init_free_chain: bool) -> Result<NonNull<MidLevel>, Error> {
        let mid = pool::allocate_table_page::<MidLevel>(self.quota.as_ref())?;
        let low = match self.alloc_low_level(init_free_chain) {
            Ok(low) => low,
            Err(e) => {
                // SAFETY: just allocated above, not yet published.
                unsafe { pool::free_table_page(mid, self.quota.as_ref()) };
                return Err(e);
            }
        };
        // SAFETY: unpublished page.
        unsafe {
            (*mid.as_ptr())[0].store(low.as_ptr(), Ordering::Relaxed);
        }
        Ok(mid)
    }

    /// Commit one more entry page, promoting the tree a level when the
    /// current top is full. Runs under lock 0 (or on an unpublished table).
    /// The new page pointer is published before the commit boundary moves,
    /// so concurrent lookups never chase a null pointer.
    fn grow_table_slow(&self, init_free_chain: bool) -> Result<(), Error> {
        let code = self.table_code.load(Ordering::Acquire);
        let level = code & TABLE_LEVEL_MASK;
        let base = code & !TABLE_LEVEL_MASK;
        let pool_boundary = self.next_handle_needing_pool.load(Ordering::Acquire);
        let new_low: *mut LowLevel;
        match level {
            0 => {
                // Single entry page is full: promote to two levels, keeping
                // the existing page first so established handles resolve.
                let mid = self.alloc_mid_level(init_free_chain)?;
                // SAFETY: `mid` is unpublished; `base` is the current page.
                unsafe {
                    let mid_ref = &*mid.as_ptr();
                    let fresh = mid_ref[0].load(Ordering::Relaxed);
                    mid_ref[1].store(fresh, Ordering::Relaxed);
                    mid_ref[0].store(base as *mut LowLevel, Ordering::Relaxed);
                    new_low = fresh;
                }
                let published = self
                    .table_code
                    .swap(mid.as_ptr() as usize | 1, Ordering::AcqRel);
                debug_assert_eq!(published, code);
                debug!("table {} promoted to level 1", self.id);
            }
            1 => {
                let mid = base as *mut MidLevel;
                let pages = (pool_boundary / LOW_LEVEL_SPAN) as usize;
                if pages < MID_LEVEL_ENTRIES {
                    let low = self.alloc_low_level(init_free_chain)?;
                    new_low = low.as_ptr();
                    // SAFETY: `mid` is the published mid page; the slot at
                    // `pages` is beyond the commit boundary, hence null.
                    let previous =
                        unsafe { (*mid)[pages].swap(low.as_ptr(), Ordering::AcqRel) };
                    debug_assert!(previous.is_null());
                } else {
                    // Mid level is full: promote to three levels.
                    let high = pool::allocate_table_page::<HighLevel>(self.quota.as_ref())?;
                    let new_mid = match self.alloc_mid_level(init_free_chain) {
                        Ok(new_mid) => new_mid,
                        Err(e) => {
                            // SAFETY: unpublished page.
                            unsafe { pool::free_table_page(high, self.quota.as_ref()) };
                            return Err(e);
                        }
                    };
                    // SAFETY: `high` and `new_mid` are unpublished.
                    unsafe {
                        new_low = (*new_mid.as_ptr())[0].load(Ordering::Relaxed);
                        (*high.as_ptr())[0].store(mid, Ordering::Relaxed);
                        (*high.as_ptr())[1].store(new_mid.as_ptr(), Ordering::Relaxed);
                    }
                    let published = self
                        .table_code
                        .swap(high.as_ptr() as usize | 2, Ordering::AcqRel);
                    debug_assert_eq!(published, code);
                    debug!("table {} promoted to level 2", self.id);
                }
            }
            _ => {
                let high = base as *mut HighLevel;
                let slot = (pool_boundary / HANDLE_STRIDE) as usize;
                let k = slot / MAX_MID_INDEX;
                if k >= HIGH_LEVEL_ENTRIES {
                    warn!("table {} exhausted: all high-level slots in use", self.id);
                    return Err(Error::TableFull);
                }
                // SAFETY: `high` is the published high page.
                let high_slot = unsafe { &(*high)[k] };
                let mid = high_slot.load(Ordering::Acquire);
                if mid.is_null() {
                    let new_mid = self.alloc_mid_level(init_free_chain)?;
                    // SAFETY: unpublished page.
                    new_low = unsafe { (*new_mid.as_ptr())[0].load(Ordering::Relaxed) };
                    let previous = high_slot.swap(new_mid.as_ptr(), Ordering::AcqRel);
                    debug_assert!(previous.is_null());
                } else {
                    let j = (slot - k * MAX_MID_INDEX) / LOW_LEVEL_ENTRIES;
                    let low = self.alloc_low_level(init_free_chain)?;
                    new_low = low.as_ptr();
                    // SAFETY: `mid` is published; slot `j` is beyond the
                    // commit boundary, hence null.
                    let previous = unsafe { (*mid)[j].swap(low.as_ptr(), Ordering::AcqRel) };
                    debug_assert!(previous.is_null());
                }
            }
        }

        let committed = self
            .next_handle_needing_pool
            .fetch_add(LOW_LEVEL_SPAN, Ordering::AcqRel);
        if init_free_chain {
            let first = committed + HANDLE_STRIDE;
            // SAFETY: `new_low` is the page linked above; it stays allocated
            // until Drop.
            let last = unsafe { &(*new_low)[LOW_LEVEL_ENTRIES - 1] };
            // Splice the fresh chain in front of whatever is free now.
            loop {
                let head = self.first_free.load(Ordering::Acquire);
                last.set_next_free(head);
                if self
                    .first_free
                    .compare_exchange(head, first, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
        trace!(
            "table {} grew, commit boundary {} -> {}",
            self.id,
            committed,
            committed + LOW_LEVEL_SPAN
        );
        Ok(())
    }

    // =====================================================================
    // Free list & entry allocator
    // =====================================================================

    /// Drain `last_free` into `first_free`. Runs under lock 0; passes
    /// exclusively over locks 1..3 first so no allocator still trusts a
    /// head value read before the drain.
    fn move_free_handles(&self) -> u32 {
        let last_free = self.last_free.swap(0, Ordering::AcqRel);
        if last_free == 0 {
            return 0;
        }
        for lock in &self.locks[1..] {
            drop(lock.write());
        }
        let head = if self.strict_fifo {
            // Frees pushed LIFO; reverse so the oldest free is reissued
            // first. The chain is private here (lock 0 held, pops drained).
            self.reverse_free_chain(last_free)
        } else {
            last_free
        };
        if self
            .first_free
            .compare_exchange(0, head, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A concurrent free refilled first_free behind our back; splice
            // the drained chain in front of it. The chain is still private,
            // so walking to its tail is race-free.
            let mut tail_value = head;
            loop {
                let entry = self
                    .lookup_entry(Handle::from_raw(tail_value))
                    .expect("free-list link outside the committed range");
                let next = entry.next_free();
                if next == 0 {
                    break;
                }
                tail_value = next;
            }
            let tail = self
                .lookup_entry(Handle::from_raw(tail_value))
                .expect("free-list link outside the committed range");
            loop {
                let old_value = self.first_free.load(Ordering::Acquire);
                tail.set_next_free(old_value);
                if self
                    .first_free
                    .compare_exchange(old_value, head, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
        debug!("table {} drained overflow free list, head {}", self.id, head);
        head
    }

    fn reverse_free_chain(&self, head: u32) -> u32 {
        let mut prev = 0u32;
        let mut link = head;
        while link != 0 {
            let entry = self
                .lookup_entry(Handle::from_raw(link))
                .expect("free-list link outside the committed range");
            let next = entry.next_free();
            entry.set_next_free(prev);
            prev = link;
            link = next;
        }
        prev
    }

    /// Pop a free entry, refilling (drain, then grow) when both lists are
    /// empty. The pop itself is a CAS on `first_free` taken under a
    /// shared-mode lock hashed from the handle value; the lock does not
    /// serialize allocators, it only fences them against a concurrent
    /// drain.
    fn allocate_entry(&self) -> Result<(Handle, &HandleTableEntry), Error> {
        let (handle, entry) = loop {
            let mut old_value = self.first_free.load(Ordering::Acquire);
            while old_value == 0 {
                let growth_guard = self.locks[0].write();

                // Re-check: another thread may have refilled while we
                // waited for the lock.
                old_value = self.first_free.load(Ordering::Acquire);
                if old_value != 0 {
                    drop(growth_guard);
                    break;
                }
                old_value = self.move_free_handles();
                if old_value != 0 {
                    drop(growth_guard);
                    break;
                }

                // First one through: commit new storage.
                let grown = self.grow_table_slow(true);
                drop(growth_guard);
                old_value = self.first_free.load(Ordering::Acquire);
                if let Err(e) = grown {
                    if old_value == 0 {
                        return Err(e);
                    }
                }
            }

            let handle = Handle::from_raw(old_value & FREE_HANDLE_MASK);
            let entry = self
                .lookup_entry(handle)
                .expect("free-list head outside the committed range");

            let lock = &self.locks[helpers::lock_index(old_value & FREE_HANDLE_MASK)];
            let pop_guard = lock.read();
            if old_value != self.first_free.load(Ordering::Acquire) {
                drop(pop_guard);
                continue;
            }
            let next = entry.next_free();
            let popped = self.first_free.compare_exchange(
                old_value,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            drop(pop_guard);
            match popped {
                Ok(_) => {
                    debug_assert!(
                        (next & FREE_HANDLE_MASK)
                            < self.next_handle_needing_pool.load(Ordering::Acquire)
                    );
                    break (handle, entry);
                }
                Err(actual) => {
                    debug_assert_ne!(
                        actual & FREE_HANDLE_MASK,
                        old_value & FREE_HANDLE_MASK,
                        "pop CAS failed without the head moving"
                    );
                }
            }
        };

        self.handle_count.fetch_add(1, Ordering::AcqRel);
        Ok((handle, entry))
    }

    /// Push a cleared entry back onto a free list. Prefers `first_free`
    /// when its hashed lock is quiet; under an in-flight pop (or strict
    /// FIFO) the entry goes to the overflow list instead, which keeps a
    /// popped-and-refreed slot from reappearing under a stale head read.
    fn free_entry(&self, handle: Handle, entry: &HandleTableEntry) {
        debug_assert_eq!(entry.raw_object(), 0, "freeing an entry that still has an object");
        self.handle_count.fetch_sub(1, Ordering::AcqRel);

        let new_value = handle.value();
        let head = if self.strict_fifo {
            &*self.last_free
        } else if self.locks[helpers::lock_index(new_value)].is_locked() {
            &*self.last_free
        } else {
            &*self.first_free
        };

        loop {
            let old_value = head.load(Ordering::Acquire);
            entry.set_next_free(old_value);
            if head
                .compare_exchange(old_value, new_value, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug_assert!(
                    (old_value & FREE_HANDLE_MASK)
                        < self.next_handle_needing_pool.load(Ordering::Acquire)
                );
                break;
            }
        }
    }

    // =====================================================================
    // Entry locking protocol
    // =====================================================================

    /// Lock a live entry, blocking on the contention event while another
    /// thread holds it. Returns `false` if the entry is (or becomes) free.
    pub(crate) fn lock_entry(&self, entry: &HandleTableEntry) -> bool {
        loop {
            let old_value = entry.object.load(Ordering::Acquire);
            if old_value & UNLOCKED_BIT != 0 {
                let new_value = old_value & !UNLOCKED_BIT;
                if entry
                    .object
                    .compare_exchange(old_value, new_value, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
            } else if old_value == 0 {
                return false;
            }
            self.block_on_locked_entry(entry);
        }
    }

    /// Release an entry lock and wake every contender on the table.
    pub(crate) fn unlock_entry(&self, entry: &HandleTableEntry) {
        let old_value = entry.object.fetch_or(UNLOCKED_BIT, Ordering::AcqRel);
        debug_assert_eq!(old_value & UNLOCKED_BIT, 0, "entry was not locked");
        self.contention.wake_all();
    }

    fn block_on_locked_entry(&self, entry: &HandleTableEntry) {
        self.contention.wait_if(|| {
            let value = entry.object.load(Ordering::Acquire);
            value != 0 && value & UNLOCKED_BIT == 0
        });
    }

    // =====================================================================
    // Table-level operations
    // =====================================================================

    /// Create a handle for `object` (a non-null word with the low bit
    /// clear, typically an aligned pointer) with caller metadata `meta`.
    pub fn create_handle(&self, object: usize, meta: u32) -> Result<Handle, Error> {
        if object == 0 || object & UNLOCKED_BIT != 0 {
            return Err(Error::InvalidObject);
        }
        debug_assert_ne!(meta, RESERVED_META, "metadata value is reserved");

        let (handle, entry) = self.allocate_entry()?;
        entry.meta.store(meta, Ordering::Release);
        // Written with the lock bit clear: the entry is born locked, then
        // published by the unlock.
        entry.object.store(object, Ordering::Release);
        self.unlock_entry(entry);

        counter!("exhandle_handle_creates_total").increment(1);
        trace!("table {} created handle {:#x}", self.id, handle.raw());
        Ok(handle)
    }

    /// Destroy a handle: clear its object word, wake contenders and return
    /// the slot to the free list. Returns `false` for invalid, sentinel or
    /// already-destroyed handles.
    pub fn destroy_handle(&self, handle: Handle) -> bool {
        let entry = match self.lookup_entry(handle) {
            Some(entry) => entry,
            None => return false,
        };
        if entry.raw_object() == 0 || entry.meta() == RESERVED_META {
            return false;
        }
        if !self.lock_entry(entry) {
            return false;
        }
        self.destroy_locked(handle, entry);
        true
    }

    /// Destroy path shared with [`LockedEntry::destroy`]; the entry is held
    /// locked on entry and is back on the free list on exit.
    pub(crate) fn destroy_locked(&self, handle: Handle, entry: &HandleTableEntry) {
        let object = entry.object.swap(0, Ordering::AcqRel);
        assert!(object != 0, "destroying a handle whose object was already cleared");
        debug_assert_eq!(object & UNLOCKED_BIT, 0);

        self.contention.wake_all();
        self.free_entry(handle, entry);
        counter!("exhandle_handle_destroys_total").increment(1);
        trace!("table {} destroyed handle {:#x}", self.id, handle.raw());
    }

    /// Look up a handle and lock its entry. Returns `None` for malformed
    /// values (null or sentinel-aligned), uncommitted indices and free
    /// entries. The guard unlocks on drop.
    pub fn map_handle(&self, handle: Handle) -> Option<LockedEntry<'_>> {
        if helpers::is_sentinel_position(handle.raw()) {
            return None;
        }
        let entry = self.lookup_entry(handle)?;
        if !self.lock_entry(entry) {
            return None;
        }
        Some(LockedEntry {
            table: self,
            entry,
            handle,
        })
    }

    /// Apply an atomic update to a handle's entry under its lock. The
    /// callback's return value is passed through; `false` is also returned
    /// when the handle is invalid.
    pub fn change_handle<F>(&self, handle: Handle, change: F) -> bool
    where
        F: FnOnce(&HandleTableEntry) -> bool,
    {
        let entry = match self.lookup_entry(handle) {
            Some(entry) => entry,
            None => return false,
        };
        if entry.raw_object() == 0 || entry.meta() == RESERVED_META {
            return false;
        }
        if !self.lock_entry(entry) {
            return false;
        }
        let result = change(entry);
        self.unlock_entry(entry);
        result
    }

    /// Duplicate this table into a new one with identical handle numbering.
    ///
    /// The destination is pre-grown to the source's commit boundary without
    /// free chains, then filled slot by slot: source entries whose object
    /// word intersects `audit_mask` are locked, copied and offered to
    /// `duplicate_entry(source_table, source_entry, dest_entry)`; on
    /// acceptance the destination entry goes live, otherwise the slot lands
    /// on the destination's free list. `owner` becomes the new table's
    /// quota context.
    pub fn duplicate<F>(
        &self,
        owner: Option<QuotaRef>,
        audit_mask: usize,
        mut duplicate_entry: F,
    ) -> Result<Arc<HandleTable>, Error>
    where
        F: FnMut(&HandleTable, &HandleTableEntry, &HandleTableEntry) -> bool,
    {
        let new_table = Self::allocate_table(owner, self.strict_fifo, false)?;
        while new_table.next_handle_needing_pool.load(Ordering::Acquire)
            < self.next_handle_needing_pool.load(Ordering::Acquire)
        {
            // Dropping the partial table on error frees everything grown so
            // far.
            new_table.grow_table_slow(false)?;
        }
        new_table.handle_count.store(0, Ordering::Release);
        new_table.first_free.store(0, Ordering::Release);

        let mut value = HANDLE_STRIDE;
        while let Some(new_entry) = new_table.lookup_entry(Handle::from_raw(value)) {
            let source_entry = self
                .lookup_entry(Handle::from_raw(value))
                .expect("source and destination tables share the same geometry");

            let mut copied = false;
            if source_entry.raw_object() & audit_mask != 0 && self.lock_entry(source_entry) {
                new_entry
                    .object
                    .store(source_entry.raw_object(), Ordering::Relaxed);
                new_entry.meta.store(source_entry.meta(), Ordering::Relaxed);
                if duplicate_entry(self, source_entry, new_entry) {
                    new_entry.object.fetch_or(UNLOCKED_BIT, Ordering::Release);
                    new_table.handle_count.fetch_add(1, Ordering::Relaxed);
                    copied = true;
                }
                self.unlock_entry(source_entry);
            }
            if !copied {
                // Unused slot: thread it onto the new table's free list.
                new_entry.object.store(0, Ordering::Relaxed);
                new_entry.set_next_free(new_table.first_free.load(Ordering::Relaxed));
                new_table.first_free.store(value, Ordering::Relaxed);
            }

            value += HANDLE_STRIDE;
            if value % LOW_LEVEL_SPAN == 0 {
                // Skip the next page's sentinel slot.
                value += HANDLE_STRIDE;
            }
        }

        registry::register(&new_table);
        counter!("exhandle_table_duplications_total").increment(1);
        info!(
            "duplicated table {} into table {} ({} handles)",
            self.id,
            new_table.id,
            new_table.handle_count()
        );
        Ok(new_table)
    }

    /// Visit every live handle in ascending order, each under its entry
    /// lock, until `predicate` returns `true`; that handle is returned.
    pub fn enumerate<F>(&self, mut predicate: F) -> Option<Handle>
    where
        F: FnMut(&HandleTableEntry, Handle) -> bool,
    {
        let mut value = 0u32;
        while let Some(entry) = self.lookup_entry(Handle::from_raw(value)) {
            if entry.raw_object() != 0 && entry.meta() != RESERVED_META {
                if self.lock_entry(entry) {
                    let handle = Handle::from_raw(value);
                    let matched = predicate(entry, handle);
                    self.unlock_entry(entry);
                    if matched {
                        return Some(handle);
                    }
                }
            }
            value += HANDLE_STRIDE;
        }
        None
    }

    /// Visit every lockable entry up to the commit boundary, each under its
    /// entry lock, with no early exit. Maintenance passes use this to apply
    /// a side effect to all live handles.
    pub fn sweep<F>(&self, mut visitor: F)
    where
        F: FnMut(&HandleTableEntry, Handle),
    {
        let mut value = HANDLE_STRIDE;
        while self.lookup_entry(Handle::from_raw(value)).is_some() {
            loop {
                let entry = self
                    .lookup_entry(Handle::from_raw(value))
                    .expect("inside the committed range");
                if self.lock_entry(entry) {
                    visitor(entry, Handle::from_raw(value));
                    self.unlock_entry(entry);
                }
                value += HANDLE_STRIDE;
                if value % LOW_LEVEL_SPAN == 0 {
                    break;
                }
            }
            // Skip the next page's sentinel slot.
            value += HANDLE_STRIDE;
        }
    }
}

impl Drop for HandleTable {
    /// Tear down the whole index: every committed entry page, then the mid
    /// and high pages, releasing quota for each. The caller must have
    /// quiesced all handle operations; `Drop` holding `&mut self` enforces
    /// that for safe users.
    fn drop(&mut self) {
        registry::unregister(self.id);
        let code = *self.table_code.get_mut();
        let level = code & TABLE_LEVEL_MASK;
        let base = code & !TABLE_LEVEL_MASK;
        if base == 0 {
            // Construction failed before the first page was linked.
            return;
        }
        let quota = self.quota.as_ref();
        // SAFETY: exclusive access; every non-null pointer reachable from
        // the table code was produced by `allocate_table_page` and is freed
        // exactly once here. Pages fill front to back, so the first null
        // child ends each scan.
        unsafe {
            match level {
                0 => {
                    pool::free_table_page(NonNull::new_unchecked(base as *mut LowLevel), quota);
                }
                1 => {
                    let mid = base as *mut MidLevel;
                    for slot in (*mid).iter() {
                        let low = slot.load(Ordering::Relaxed);
                        if low.is_null() {
                            break;
                        }
                        pool::free_table_page(NonNull::new_unchecked(low), quota);
                    }
                    pool::free_table_page(NonNull::new_unchecked(mid), quota);
                }
                _ => {
                    let high = base as *mut HighLevel;
                    for high_slot in (*high).iter() {
                        let mid = high_slot.load(Ordering::Relaxed);
                        if mid.is_null() {
                            break;
                        }
                        for mid_slot in (*mid).iter() {
                            let low = mid_slot.load(Ordering::Relaxed);
                            if low.is_null() {
                                break;
                            }
                            pool::free_table_page(NonNull::new_unchecked(low), quota);
                        }
                        pool::free_table_page(NonNull::new_unchecked(mid), quota);
                    }
                    pool::free_table_page(NonNull::new_unchecked(high), quota);
                }
            }
        }
        debug!("destroyed handle table {}", self.id);
    }
}
