//! Global registry of live handle tables.
//!
//! Every table is registered at creation and unregistered on drop, so
//! system-wide audits can walk all tables without owning them. The registry
//! holds weak references only; table lifetime stays with the creating
//! context.

use crate::types::HandleTable;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type TableId = u64;

static TABLES: OnceCell<DashMap<TableId, Weak<HandleTable>>> = OnceCell::new();
// Id 0 is reserved as never-valid.
static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

fn tables() -> &'static DashMap<TableId, Weak<HandleTable>> {
    TABLES.get_or_init(DashMap::new)
}

pub(crate) fn next_table_id() -> TableId {
    NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn register(table: &Arc<HandleTable>) {
    tables().insert(table.id(), Arc::downgrade(table));
}

pub(crate) fn unregister(id: TableId) {
    tables().remove(&id);
}

/// Visit every live table.
///
/// The live set is snapshotted before the visitor runs, so the visitor may
/// itself create or drop tables without contending on the registry shards.
pub fn for_each_table<F: FnMut(&Arc<HandleTable>)>(mut visit: F) {
    let live: Vec<Arc<HandleTable>> = tables()
        .iter()
        .filter_map(|slot| slot.value().upgrade())
        .collect();
    for table in &live {
        visit(table);
    }
}

/// Number of live tables.
pub fn table_count() -> usize {
    tables()
        .iter()
        .filter(|slot| slot.value().strong_count() > 0)
        .count()
}
