//! Table-level page allocator.
//!
//! All index pages (low, mid, high) are fixed-size, zero-initialized blocks.
//! A zeroed entry page is already in a valid state: object null, free link
//! zero, not on any list. Quota accounting against the owning context is
//! best-effort; a refused charge is logged and the allocation proceeds.

use crate::errors::Error;
use crate::types::QuotaRef;
use log::warn;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Allocate one zero-filled page of type `T`, charging quota if an owning
/// context was supplied.
pub(crate) fn allocate_table_page<T>(quota: Option<&QuotaRef>) -> Result<NonNull<T>, Error> {
    let layout = Layout::new::<T>();
    // SAFETY: every page type has a non-zero size; a zeroed T is valid for
    // all page types (atomics at zero, null pointers).
    let raw = unsafe { alloc_zeroed(layout) } as *mut T;
    let ptr = NonNull::new(raw).ok_or(Error::OutOfMemory)?;
    if let Some(quota) = quota {
        if !quota.charge_pool_quota(layout.size()) {
            warn!(
                "pool quota charge of {} bytes refused; continuing uncharged",
                layout.size()
            );
        }
    }
    Ok(ptr)
}

/// Free a page obtained from [`allocate_table_page`] and return its quota.
///
/// # Safety
/// `ptr` must come from `allocate_table_page::<T>` and must not be used
/// afterwards.
pub(crate) unsafe fn free_table_page<T>(ptr: NonNull<T>, quota: Option<&QuotaRef>) {
    let layout = Layout::new::<T>();
    dealloc(ptr.as_ptr() as *mut u8, layout);
    if let Some(quota) = quota {
        quota.return_pool_quota(layout.size());
    }
}
