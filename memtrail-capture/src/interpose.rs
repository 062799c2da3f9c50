// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! LD_PRELOAD-style interposition of the allocator ABI. Built only with
//! the `interpose` feature so ordinary test binaries never replace their
//! own heap. While the real symbols are being resolved (dlsym itself
//! allocates), requests are served from the hook layer's bootstrap arena.

use crate::hooks;
use std::os::raw::{c_char, c_int, c_void};

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    if hooks::resolving_in_progress() {
        return hooks::bootstrap_alloc(size);
    }
    hooks::tracked_malloc(size)
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if hooks::is_bootstrap_ptr(ptr) {
        return;
    }
    hooks::tracked_free(ptr)
}

#[no_mangle]
pub unsafe extern "C" fn calloc(count: usize, element_size: usize) -> *mut c_void {
    if hooks::resolving_in_progress() {
        let total = count.saturating_mul(element_size);
        // The arena is zero-initialized and never reused.
        return hooks::bootstrap_alloc(total);
    }
    hooks::tracked_calloc(count, element_size)
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if hooks::is_bootstrap_ptr(ptr) {
        // Grow out of the arena by copying; the old block is abandoned.
        // The original length is unknown, so copy up to the arena end.
        let fresh = hooks::tracked_malloc(size);
        if !fresh.is_null() {
            let len = size.min(hooks::bootstrap_span(ptr));
            std::ptr::copy_nonoverlapping(ptr as *const u8, fresh as *mut u8, len);
        }
        return fresh;
    }
    hooks::tracked_realloc(ptr, size)
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    hooks::tracked_posix_memalign(memptr, alignment, size)
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    hooks::tracked_aligned_alloc(alignment, size)
}

#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    hooks::tracked_memalign(alignment, size)
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    hooks::tracked_valloc(size)
}

#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    hooks::tracked_pvalloc(size)
}

#[no_mangle]
pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    hooks::tracked_mmap(addr, length, prot, flags, fd, offset)
}

#[no_mangle]
pub unsafe extern "C" fn munmap(addr: *mut c_void, length: usize) -> c_int {
    hooks::tracked_munmap(addr, length)
}

#[no_mangle]
pub unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    hooks::tracked_dlopen(filename, flags)
}

#[no_mangle]
pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    hooks::tracked_dlclose(handle)
}
