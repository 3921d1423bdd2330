//! Sequential behavior of the handle table: allocation, lookup, reuse
//! order, growth, duplication, enumeration and quota accounting.

use exhandle::constants::{HANDLE_STRIDE, LOW_LEVEL_ENTRIES, LOW_LEVEL_SPAN, PAGE_SIZE};
use exhandle::{Error, Handle, HandleTable, QuotaProcess};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A distinct, valid object word for index `i` (non-null, low bit clear).
fn obj(i: usize) -> usize {
    (i + 1) << 4
}

#[test]
fn create_and_map_roundtrip() {
    let table = HandleTable::new(None).unwrap();
    let handle = table.create_handle(obj(0), 7).unwrap();
    assert!(!handle.is_null());
    assert_eq!(table.handle_count(), 1);

    let guard = table.map_handle(handle).expect("live handle must map");
    assert_eq!(guard.handle(), handle);
    assert_eq!(guard.object(), obj(0));
    assert_eq!(guard.meta(), 7);
}

#[test]
fn tag_bits_are_ignored_on_lookup() {
    let table = HandleTable::new(None).unwrap();
    let handle = table.create_handle(obj(3), 1).unwrap();
    let tagged = Handle::from_raw(handle.raw() | 3);
    let guard = table.map_handle(tagged).expect("tag bits must not matter");
    assert_eq!(guard.object(), obj(3));
}

#[test]
fn null_and_sentinel_handles_are_rejected() {
    let table = HandleTable::new(None).unwrap();
    table.create_handle(obj(0), 0).unwrap();

    assert!(table.map_handle(Handle::NULL).is_none());
    assert!(table.map_handle(Handle::from_raw(LOW_LEVEL_SPAN)).is_none());
    assert!(table.map_handle(Handle::from_raw(u32::MAX & !3)).is_none());
    assert!(!table.destroy_handle(Handle::NULL));
}

#[test]
fn create_rejects_malformed_object_words() {
    let table = HandleTable::new(None).unwrap();
    assert_eq!(table.create_handle(0, 0), Err(Error::InvalidObject));
    assert_eq!(table.create_handle(obj(0) | 1, 0), Err(Error::InvalidObject));
    assert_eq!(table.handle_count(), 0);
}

#[test]
fn destroy_invalidates_the_handle() {
    let table = HandleTable::new(None).unwrap();
    let handle = table.create_handle(obj(1), 2).unwrap();

    assert!(table.destroy_handle(handle));
    assert_eq!(table.handle_count(), 0);
    assert!(table.map_handle(handle).is_none());
    // A second destroy is a no-op.
    assert!(!table.destroy_handle(handle));
}

#[test]
fn destroy_through_a_mapped_guard() {
    let table = HandleTable::new(None).unwrap();
    let handle = table.create_handle(obj(2), 9).unwrap();

    let guard = table.map_handle(handle).unwrap();
    guard.destroy();

    assert_eq!(table.handle_count(), 0);
    assert!(table.map_handle(handle).is_none());
    // The slot is free again.
    let reused = table.create_handle(obj(4), 0).unwrap();
    assert_eq!(reused, handle);
}

#[test]
fn freed_slots_are_reused_most_recent_first() {
    let table = HandleTable::new(None).unwrap();
    let handles: Vec<Handle> = (0..10).map(|i| table.create_handle(obj(i), 0).unwrap()).collect();

    assert!(table.destroy_handle(handles[0]));
    assert!(table.destroy_handle(handles[1]));
    assert!(table.destroy_handle(handles[2]));

    // Default reuse is LIFO.
    assert_eq!(table.create_handle(obj(20), 0).unwrap(), handles[2]);
    assert_eq!(table.create_handle(obj(21), 0).unwrap(), handles[1]);
    assert_eq!(table.create_handle(obj(22), 0).unwrap(), handles[0]);
}

#[test]
fn strict_fifo_reissues_in_free_order() {
    let table = HandleTable::new_strict_fifo(None).unwrap();

    // Drain the initial page's free chain completely so the next
    // allocation has to go through the overflow list.
    let free_per_page = LOW_LEVEL_ENTRIES - 1;
    let handles: Vec<Handle> = (0..free_per_page)
        .map(|i| table.create_handle(obj(i), 0).unwrap())
        .collect();

    assert!(table.destroy_handle(handles[5]));
    assert!(table.destroy_handle(handles[6]));
    assert!(table.destroy_handle(handles[7]));

    assert_eq!(table.create_handle(obj(100), 0).unwrap(), handles[5]);
    assert_eq!(table.create_handle(obj(101), 0).unwrap(), handles[6]);
    assert_eq!(table.create_handle(obj(102), 0).unwrap(), handles[7]);
}

#[test]
fn growth_spans_multiple_pages() {
    let table = HandleTable::new(None).unwrap();
    assert_eq!(table.commit_boundary(), LOW_LEVEL_SPAN);

    let total = LOW_LEVEL_ENTRIES * 3;
    let handles: Vec<Handle> = (0..total).map(|i| table.create_handle(obj(i), i as u32).unwrap()).collect();

    let unique: HashSet<Handle> = handles.iter().copied().collect();
    assert_eq!(unique.len(), total);
    assert_eq!(table.handle_count(), total as u32);
    assert!(table.commit_boundary() > 3 * LOW_LEVEL_SPAN);

    // No handle ever lands on a sentinel position.
    for handle in &handles {
        assert_ne!(handle.value() % LOW_LEVEL_SPAN, 0);
    }
    for (i, handle) in handles.iter().enumerate() {
        let guard = table.map_handle(*handle).unwrap();
        assert_eq!(guard.object(), obj(i));
        assert_eq!(guard.meta(), i as u32);
    }
}

#[test]
fn growth_promotes_through_all_index_levels() {
    let table = HandleTable::new(None).unwrap();

    // Past one full mid-level subtree, forcing the three-level tree.
    let total = crate_mid_capacity() + 1_000;
    let mut samples: Vec<(usize, Handle)> = Vec::new();
    for i in 0..total {
        let handle = table.create_handle(obj(i), 0).unwrap();
        if i % 10_000 == 0 || i == total - 1 {
            samples.push((i, handle));
        }
    }
    assert_eq!(table.handle_count(), total as u32);

    for (i, handle) in samples {
        let guard = table.map_handle(handle).unwrap();
        assert_eq!(guard.object(), obj(i));
    }
}

/// Handles addressable by a fully populated two-level tree.
fn crate_mid_capacity() -> usize {
    let per_page = LOW_LEVEL_ENTRIES - 1;
    let pages = PAGE_SIZE / std::mem::size_of::<*mut ()>();
    per_page * pages
}

#[test]
fn commit_boundary_is_monotonic() {
    let table = HandleTable::new(None).unwrap();
    let mut boundary = table.commit_boundary();
    let mut handles = Vec::new();

    for round in 0..4 {
        for i in 0..LOW_LEVEL_ENTRIES {
            handles.push(table.create_handle(obj(round * 1000 + i), 0).unwrap());
        }
        let now = table.commit_boundary();
        assert!(now >= boundary);
        boundary = now;
        // Destroying everything must not shrink the boundary.
        for handle in handles.drain(..) {
            assert!(table.destroy_handle(handle));
        }
        assert_eq!(table.commit_boundary(), boundary);
    }
}

#[test]
fn change_handle_updates_metadata_under_the_lock() {
    let table = HandleTable::new(None).unwrap();
    let handle = table.create_handle(obj(0), 5).unwrap();

    assert!(table.change_handle(handle, |entry| {
        assert_eq!(entry.meta(), 5);
        entry.set_meta(42);
        true
    }));
    assert_eq!(table.map_handle(handle).unwrap().meta(), 42);

    // The callback's verdict passes through.
    assert!(!table.change_handle(handle, |_| false));

    table.destroy_handle(handle);
    assert!(!table.change_handle(handle, |_| true));
}

#[test]
fn enumerate_walks_in_order_and_stops_at_the_match() {
    let table = HandleTable::new(None).unwrap();
    let handles: Vec<Handle> = (0..5).map(|i| table.create_handle(obj(i), 0).unwrap()).collect();

    let mut seen = Vec::new();
    let found = table.enumerate(|entry, handle| {
        seen.push(handle);
        entry.meta() == 0 && handle == handles[2]
    });
    assert_eq!(found, Some(handles[2]));
    assert_eq!(seen, handles[..3].to_vec());

    // Visited entries were unlocked on the way out.
    for handle in &handles {
        assert!(table.map_handle(*handle).is_some());
    }

    let missed = table.enumerate(|_, _| false);
    assert_eq!(missed, None);
}

#[test]
fn sweep_visits_every_live_handle_and_unlocks() {
    let table = HandleTable::new(None).unwrap();
    let total = LOW_LEVEL_ENTRIES + 40;
    let handles: Vec<Handle> = (0..total).map(|i| table.create_handle(obj(i), 0).unwrap()).collect();
    for handle in handles.iter().step_by(3) {
        assert!(table.destroy_handle(*handle));
    }
    let live: HashSet<Handle> = handles.iter().copied().filter(|h| table.map_handle(*h).is_some()).collect();

    let mut visited = HashSet::new();
    table.sweep(|entry, handle| {
        if entry.object() != 0 {
            visited.insert(handle);
        }
    });
    assert_eq!(visited, live);

    // Nothing stays locked behind the sweep.
    for handle in &live {
        assert!(table.map_handle(*handle).is_some());
    }
    let fresh = table.create_handle(obj(9999), 0).unwrap();
    assert!(table.map_handle(fresh).is_some());
}

#[test]
fn duplicate_preserves_handle_values_and_contents() {
    let table = HandleTable::new(None).unwrap();
    let handles: Vec<Handle> = (0..6).map(|i| table.create_handle(obj(i), i as u32).unwrap()).collect();
    assert!(table.destroy_handle(handles[1]));

    // Reject one live entry from the copy.
    let rejected = handles[4];
    let copy = table
        .duplicate(None, usize::MAX, |_, _, dest| dest.object() != obj(4))
        .unwrap();

    assert_eq!(copy.handle_count(), 4);
    for (i, handle) in handles.iter().enumerate() {
        let expected_live = i != 1 && *handle != rejected;
        match copy.map_handle(*handle) {
            Some(guard) => {
                assert!(expected_live);
                assert_eq!(guard.object(), obj(i));
                assert_eq!(guard.meta(), i as u32);
            }
            None => assert!(!expected_live),
        }
    }

    // The copy is independent: destroying in one does not affect the other.
    assert!(copy.destroy_handle(handles[0]));
    assert!(table.map_handle(handles[0]).is_some());

    // Skipped slots landed on the copy's free list and are allocatable.
    let fresh = copy.create_handle(obj(50), 0).unwrap();
    assert!(copy.map_handle(fresh).is_some());
}

#[test]
fn duplicate_filters_by_audit_mask() {
    let table = HandleTable::new(None).unwrap();
    let kept = table.create_handle(0x12, 0).unwrap(); // bit 1 set
    let dropped = table.create_handle(0x10, 0).unwrap(); // bit 1 clear

    let copy = table.duplicate(None, 0x2, |_, _, _| true).unwrap();
    assert_eq!(copy.handle_count(), 1);
    assert!(copy.map_handle(kept).is_some());
    assert!(copy.map_handle(dropped).is_none());
}

struct CountingQuota {
    balance: AtomicUsize,
    refuse: bool,
}

impl CountingQuota {
    fn new(refuse: bool) -> Arc<Self> {
        Arc::new(CountingQuota {
            balance: AtomicUsize::new(0),
            refuse,
        })
    }
}

impl QuotaProcess for CountingQuota {
    fn charge_pool_quota(&self, bytes: usize) -> bool {
        if self.refuse {
            return false;
        }
        self.balance.fetch_add(bytes, Ordering::AcqRel);
        true
    }

    fn return_pool_quota(&self, bytes: usize) {
        self.balance.fetch_sub(bytes, Ordering::AcqRel);
    }
}

#[test]
fn quota_is_charged_per_page_and_returned_on_drop() {
    let quota = CountingQuota::new(false);
    let table = HandleTable::new(Some(quota.clone())).unwrap();
    assert_eq!(quota.balance.load(Ordering::Acquire), PAGE_SIZE);

    // Force growth past the first page.
    let mut handles = Vec::new();
    for i in 0..LOW_LEVEL_ENTRIES {
        handles.push(table.create_handle(obj(i), 0).unwrap());
    }
    assert!(quota.balance.load(Ordering::Acquire) > PAGE_SIZE);

    drop(table);
    assert_eq!(quota.balance.load(Ordering::Acquire), 0);
}

#[test]
fn refused_quota_does_not_block_allocation() {
    let quota = CountingQuota::new(true);
    let table = HandleTable::new(Some(quota)).unwrap();
    let handle = table.create_handle(obj(0), 0).unwrap();
    assert!(table.map_handle(handle).is_some());
}

#[test]
fn registry_tracks_table_lifetime() {
    let table = HandleTable::new(None).unwrap();
    let id = table.id();

    let mut found = false;
    exhandle::for_each_table(|t| {
        if t.id() == id {
            found = true;
        }
    });
    assert!(found);
    assert!(exhandle::table_count() >= 1);

    drop(table);
    let mut still_there = false;
    exhandle::for_each_table(|t| {
        if t.id() == id {
            still_there = true;
        }
    });
    assert!(!still_there);
}

#[test]
fn table_visitor_may_touch_the_registry() {
    let table = HandleTable::new(None).unwrap();
    let id = table.id();

    // Creating and dropping tables from inside the walk must not block on
    // the registry's own synchronization.
    let mut found = false;
    exhandle::for_each_table(|t| {
        if t.id() == id {
            found = true;
        }
        let transient = HandleTable::new(None).unwrap();
        drop(transient);
    });
    assert!(found);
}

// ---- model check --------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Create(u16, u16),
    Destroy(usize),
    Map(usize),
    SetMeta(usize, u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (any::<u16>(), any::<u16>()).prop_map(|(o, m)| Op::Create(o, m)),
        2 => any::<usize>().prop_map(Op::Destroy),
        2 => any::<usize>().prop_map(Op::Map),
        1 => (any::<usize>(), any::<u16>()).prop_map(|(i, m)| Op::SetMeta(i, m)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Random operation sequences behave exactly like a map of
    /// handle -> (object, meta).
    #[test]
    fn sequential_ops_match_a_map_model(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let table = HandleTable::new(None).unwrap();
        let mut model: HashMap<Handle, (usize, u32)> = HashMap::new();
        let mut live: Vec<Handle> = Vec::new();

        for op in ops {
            match op {
                Op::Create(o, m) => {
                    let object = ((o as usize) + 1) << 4;
                    let handle = table.create_handle(object, m as u32).unwrap();
                    prop_assert!(model.insert(handle, (object, m as u32)).is_none());
                    live.push(handle);
                }
                Op::Destroy(pick) => {
                    if live.is_empty() {
                        continue;
                    }
                    let handle = live.swap_remove(pick % live.len());
                    prop_assert!(table.destroy_handle(handle));
                    model.remove(&handle);
                }
                Op::Map(pick) => {
                    if live.is_empty() {
                        continue;
                    }
                    let handle = live[pick % live.len()];
                    let (object, meta) = model[&handle];
                    let guard = table.map_handle(handle).expect("model says live");
                    prop_assert_eq!(guard.object(), object);
                    prop_assert_eq!(guard.meta(), meta);
                }
                Op::SetMeta(pick, m) => {
                    if live.is_empty() {
                        continue;
                    }
                    let handle = live[pick % live.len()];
                    let changed = table.change_handle(handle, |entry| {
                        entry.set_meta(m as u32);
                        true
                    });
                    prop_assert!(changed);
                    model.get_mut(&handle).expect("model says live").1 = m as u32;
                }
            }
            prop_assert_eq!(table.handle_count() as usize, model.len());
        }

        for (handle, (object, meta)) in &model {
            let guard = table.map_handle(*handle).expect("model says live");
            prop_assert_eq!(guard.object(), *object);
            prop_assert_eq!(guard.meta(), *meta);
        }
    }
}

// HANDLE_STRIDE is part of the public layout contract; keep it anchored.
#[test]
fn handle_values_advance_by_stride() {
    let table = HandleTable::new(None).unwrap();
    let a = table.create_handle(obj(0), 0).unwrap();
    let b = table.create_handle(obj(1), 0).unwrap();
    assert_eq!(a.value() % HANDLE_STRIDE, 0);
    assert_eq!(b.value() % HANDLE_STRIDE, 0);
    assert_ne!(a, b);
}
