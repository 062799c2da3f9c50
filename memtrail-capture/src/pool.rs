// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hooks for the host interpreter's internal pooled allocator. The
//! embedder fetches a wrapper table via [`install_pool_hooks`], swaps it
//! into the interpreter's allocator slot, and hands us the previous table
//! to call through to. Pool events are recorded only when the tracker was
//! configured with `trace_pool_allocator`.

use crate::guard::ReentrancyGuard;
use crate::tracker::Tracker;
use memtrail_format::AllocatorKind;
use std::os::raw::c_void;
use std::sync::OnceLock;

/// The host's allocator slot: a context pointer plus the four entry
/// points, mirroring the C ABI the interpreter exposes for allocator
/// swapping.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PoolAllocatorTable {
    pub ctx: *mut c_void,
    pub malloc: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
    pub calloc: unsafe extern "C" fn(*mut c_void, usize, usize) -> *mut c_void,
    pub realloc: unsafe extern "C" fn(*mut c_void, *mut c_void, usize) -> *mut c_void,
    pub free: unsafe extern "C" fn(*mut c_void, *mut c_void),
}

// SAFETY: the table is plain function pointers plus a context pointer the
// host guarantees to be usable from any thread (it is the interpreter's
// own allocator state).
unsafe impl Send for PoolAllocatorTable {}
unsafe impl Sync for PoolAllocatorTable {}

static REAL_POOL: OnceLock<PoolAllocatorTable> = OnceLock::new();

/// Stores the host's real table and returns the wrapper table to install
/// in its place. Fails (returns `None`) if pool hooks were already
/// installed; the swap is once per process.
pub fn install_pool_hooks(real: PoolAllocatorTable) -> Option<PoolAllocatorTable> {
    let ctx = real.ctx;
    REAL_POOL.set(real).ok()?;
    Some(PoolAllocatorTable {
        ctx,
        malloc: pool_malloc,
        calloc: pool_calloc,
        realloc: pool_realloc,
        free: pool_free,
    })
}

fn real() -> Option<&'static PoolAllocatorTable> {
    REAL_POOL.get()
}

fn record_pool_alloc(kind: AllocatorKind, address: u64, size: u64) {
    if !Tracker::is_installed() {
        return;
    }
    let Some(_guard) = ReentrancyGuard::acquire() else {
        return;
    };
    let Some(tracker) = Tracker::current() else {
        return;
    };
    if !tracker.config().trace_pool_allocator() {
        return;
    }
    tracker.record_allocation(kind, address, size);
}

fn record_pool_dealloc(address: u64) {
    if !Tracker::is_installed() {
        return;
    }
    let Some(_guard) = ReentrancyGuard::acquire() else {
        return;
    };
    let Some(tracker) = Tracker::current() else {
        return;
    };
    if !tracker.config().trace_pool_allocator() {
        return;
    }
    tracker.record_deallocation(AllocatorKind::PoolFree, address);
}

unsafe extern "C" fn pool_malloc(ctx: *mut c_void, size: usize) -> *mut c_void {
    let Some(real) = real() else {
        return std::ptr::null_mut();
    };
    let ptr = (real.malloc)(ctx, size);
    if !ptr.is_null() {
        record_pool_alloc(AllocatorKind::PoolMalloc, ptr as u64, size as u64);
    }
    ptr
}

unsafe extern "C" fn pool_calloc(ctx: *mut c_void, count: usize, element_size: usize) -> *mut c_void {
    let Some(real) = real() else {
        return std::ptr::null_mut();
    };
    let ptr = (real.calloc)(ctx, count, element_size);
    if !ptr.is_null() {
        record_pool_alloc(
            AllocatorKind::PoolCalloc,
            ptr as u64,
            (count as u64).saturating_mul(element_size as u64),
        );
    }
    ptr
}

unsafe extern "C" fn pool_realloc(ctx: *mut c_void, ptr: *mut c_void, size: usize) -> *mut c_void {
    let Some(real) = real() else {
        return std::ptr::null_mut();
    };
    let result = (real.realloc)(ctx, ptr, size);
    if !result.is_null() {
        if !ptr.is_null() {
            record_pool_dealloc(ptr as u64);
        }
        record_pool_alloc(AllocatorKind::PoolRealloc, result as u64, size as u64);
    }
    result
}

unsafe extern "C" fn pool_free(ctx: *mut c_void, ptr: *mut c_void) {
    let Some(real) = real() else {
        return;
    };
    (real.free)(ctx, ptr);
    record_pool_dealloc(ptr as u64);
}
