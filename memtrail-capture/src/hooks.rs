// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interposition of the system allocator ABI. Every wrapper follows the
//! same strictly-ordered steps: call through to the real implementation,
//! bail if no tracker is installed, take the per-thread reentrancy guard,
//! capture stacks and emit the record, release the guard. The guard is
//! what keeps the tracker's own allocations (writer buffers, table
//! growth) from recursing back in here.
//!
//! The real entry points are resolved once with `dlsym(RTLD_NEXT)`; while
//! that resolution is in flight, a small static bump arena serves any
//! allocation `dlsym` itself performs.

use crate::guard::ReentrancyGuard;
use crate::tracker::Tracker;
use memtrail_format::AllocatorKind;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> c_int;
type AlignedAllocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type MmapFn =
    unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, libc::off_t) -> *mut c_void;
type MunmapFn = unsafe extern "C" fn(*mut c_void, usize) -> c_int;
type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
type DlcloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;

pub(crate) struct SystemAllocators {
    pub malloc: MallocFn,
    pub free: FreeFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
    pub posix_memalign: PosixMemalignFn,
    pub aligned_alloc: AlignedAllocFn,
    pub memalign: AlignedAllocFn,
    pub valloc: MallocFn,
    /// glibc-only; emulated via memalign when absent.
    pub pvalloc: Option<MallocFn>,
    pub mmap: MmapFn,
    pub munmap: MunmapFn,
    pub dlopen: DlopenFn,
    pub dlclose: DlcloseFn,
}

static SYSTEM: OnceLock<SystemAllocators> = OnceLock::new();

/// True while dlsym resolution is running; see [`bootstrap_alloc`].
static RESOLVING: AtomicBool = AtomicBool::new(false);

unsafe fn next_symbol(name: &CStr) -> *mut c_void {
    libc::dlsym(libc::RTLD_NEXT, name.as_ptr())
}

macro_rules! resolve {
    ($name:literal, $ty:ty, $fallback:expr) => {{
        let found = unsafe { next_symbol($name) };
        if found.is_null() {
            $fallback
        } else {
            // SAFETY: the symbol was found under this name; its type is
            // fixed by the platform ABI.
            unsafe { std::mem::transmute::<*mut c_void, $ty>(found) }
        }
    }};
}

fn resolve_system() -> SystemAllocators {
    RESOLVING.store(true, Ordering::Release);
    let system = SystemAllocators {
        malloc: resolve!(c"malloc", MallocFn, libc::malloc as MallocFn),
        free: resolve!(c"free", FreeFn, libc::free as FreeFn),
        calloc: resolve!(c"calloc", CallocFn, libc::calloc as CallocFn),
        realloc: resolve!(c"realloc", ReallocFn, libc::realloc as ReallocFn),
        posix_memalign: resolve!(
            c"posix_memalign",
            PosixMemalignFn,
            libc::posix_memalign as PosixMemalignFn
        ),
        aligned_alloc: resolve!(
            c"aligned_alloc",
            AlignedAllocFn,
            fallback_memalign as AlignedAllocFn
        ),
        memalign: resolve!(
            c"memalign",
            AlignedAllocFn,
            fallback_memalign as AlignedAllocFn
        ),
        valloc: resolve!(c"valloc", MallocFn, fallback_valloc as MallocFn),
        pvalloc: {
            let found = unsafe { next_symbol(c"pvalloc") };
            if found.is_null() {
                None
            } else {
                // SAFETY: as in resolve!.
                Some(unsafe { std::mem::transmute::<*mut c_void, MallocFn>(found) })
            }
        },
        mmap: resolve!(c"mmap", MmapFn, libc::mmap as MmapFn),
        munmap: resolve!(c"munmap", MunmapFn, libc::munmap as MunmapFn),
        dlopen: resolve!(c"dlopen", DlopenFn, libc::dlopen as DlopenFn),
        dlclose: resolve!(c"dlclose", DlcloseFn, libc::dlclose as DlcloseFn),
    };
    RESOLVING.store(false, Ordering::Release);
    system
}

// POSIX-only shims for entry points some libcs do not export.

unsafe extern "C" fn fallback_memalign(alignment: usize, size: usize) -> *mut c_void {
    let mut ptr: *mut c_void = std::ptr::null_mut();
    let alignment = alignment.max(std::mem::size_of::<*mut c_void>());
    if libc::posix_memalign(&mut ptr, alignment, size) == 0 {
        ptr
    } else {
        std::ptr::null_mut()
    }
}

unsafe extern "C" fn fallback_valloc(size: usize) -> *mut c_void {
    fallback_memalign(page_size::get(), size)
}

/// The resolved real entry points.
pub(crate) fn system() -> &'static SystemAllocators {
    SYSTEM.get_or_init(resolve_system)
}

/// Resolves the real allocator entry points ahead of the first hook call.
/// Invoked during tracker install; harmless to call more than once.
pub(crate) fn initialize() {
    let _ = system();
}

// A tiny static arena serving allocations made while dlsym resolves the
// real symbols (dlsym itself may calloc). Freed blocks are abandoned; the
// arena is a few hundred bytes in practice.
const BOOTSTRAP_ARENA_SIZE: usize = 16 * 1024;

struct BootstrapArena(std::cell::UnsafeCell<[u8; BOOTSTRAP_ARENA_SIZE]>);

// SAFETY: handed-out ranges never overlap (the bump offset is atomic) and
// the arena itself is never read back by this module.
unsafe impl Sync for BootstrapArena {}

static BOOTSTRAP_ARENA: BootstrapArena =
    BootstrapArena(std::cell::UnsafeCell::new([0; BOOTSTRAP_ARENA_SIZE]));
static BOOTSTRAP_USED: AtomicUsize = AtomicUsize::new(0);

/// True while `dlsym` resolution is running; preload shims divert their
/// allocations to the bootstrap arena for that window.
pub fn resolving_in_progress() -> bool {
    RESOLVING.load(Ordering::Acquire)
}

/// Bump-allocates from the static bootstrap arena.
pub fn bootstrap_alloc(size: usize) -> *mut c_void {
    let size = (size.max(1) + 15) & !15;
    let offset = BOOTSTRAP_USED.fetch_add(size, Ordering::AcqRel);
    if offset + size > BOOTSTRAP_ARENA_SIZE {
        return std::ptr::null_mut();
    }
    // SAFETY: offset..offset+size is exclusively ours, see Sync impl.
    unsafe { (BOOTSTRAP_ARENA.0.get() as *mut u8).add(offset) as *mut c_void }
}

/// Whether `ptr` came from the bootstrap arena (never handed to the real
/// `free`).
pub fn is_bootstrap_ptr(ptr: *mut c_void) -> bool {
    let start = BOOTSTRAP_ARENA.0.get() as usize;
    let addr = ptr as usize;
    addr >= start && addr < start + BOOTSTRAP_ARENA_SIZE
}

/// Bytes between `ptr` and the end of the arena; bounds the copy when a
/// bootstrap block is grown by `realloc`.
pub fn bootstrap_span(ptr: *mut c_void) -> usize {
    let start = BOOTSTRAP_ARENA.0.get() as usize;
    (start + BOOTSTRAP_ARENA_SIZE).saturating_sub(ptr as usize)
}

#[inline]
fn record_alloc(kind: AllocatorKind, address: u64, size: u64) {
    if !Tracker::is_installed() {
        return;
    }
    // Guard before loading the tracker pointer: teardown drains guard
    // holders before freeing the tracker.
    let Some(_guard) = ReentrancyGuard::acquire() else {
        return;
    };
    let Some(tracker) = Tracker::current() else {
        return;
    };
    tracker.record_allocation(kind, address, size);
}

#[inline]
fn record_dealloc(kind: AllocatorKind, address: u64) {
    if !Tracker::is_installed() {
        return;
    }
    let Some(_guard) = ReentrancyGuard::acquire() else {
        return;
    };
    let Some(tracker) = Tracker::current() else {
        return;
    };
    tracker.record_deallocation(kind, address);
}

/// # Safety
/// Same contract as `malloc`.
pub unsafe extern "C" fn tracked_malloc(size: usize) -> *mut c_void {
    let ptr = (system().malloc)(size);
    if !ptr.is_null() {
        record_alloc(AllocatorKind::Malloc, ptr as u64, size as u64);
    }
    ptr
}

/// # Safety
/// Same contract as `free`.
pub unsafe extern "C" fn tracked_free(ptr: *mut c_void) {
    if is_bootstrap_ptr(ptr) {
        return;
    }
    (system().free)(ptr);
    // free(NULL) is recorded too; the aggregators skip it.
    record_dealloc(AllocatorKind::Free, ptr as u64);
}

/// # Safety
/// Same contract as `calloc`.
pub unsafe extern "C" fn tracked_calloc(count: usize, element_size: usize) -> *mut c_void {
    let ptr = (system().calloc)(count, element_size);
    if !ptr.is_null() {
        record_alloc(
            AllocatorKind::Calloc,
            ptr as u64,
            (count as u64).saturating_mul(element_size as u64),
        );
    }
    ptr
}

/// # Safety
/// Same contract as `realloc`.
pub unsafe extern "C" fn tracked_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    let result = (system().realloc)(ptr, size);
    if !result.is_null() {
        if !ptr.is_null() {
            record_dealloc(AllocatorKind::Free, ptr as u64);
        }
        record_alloc(AllocatorKind::Realloc, result as u64, size as u64);
    } else if size == 0 && !ptr.is_null() {
        record_dealloc(AllocatorKind::Free, ptr as u64);
    }
    result
}

/// # Safety
/// Same contract as `posix_memalign`.
pub unsafe extern "C" fn tracked_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    let rc = (system().posix_memalign)(memptr, alignment, size);
    if rc == 0 && !memptr.is_null() && !(*memptr).is_null() {
        record_alloc(AllocatorKind::PosixMemalign, *memptr as u64, size as u64);
    }
    rc
}

/// # Safety
/// Same contract as `aligned_alloc`.
pub unsafe extern "C" fn tracked_aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    let ptr = (system().aligned_alloc)(alignment, size);
    if !ptr.is_null() {
        record_alloc(AllocatorKind::AlignedAlloc, ptr as u64, size as u64);
    }
    ptr
}

/// # Safety
/// Same contract as `memalign`.
pub unsafe extern "C" fn tracked_memalign(alignment: usize, size: usize) -> *mut c_void {
    let ptr = (system().memalign)(alignment, size);
    if !ptr.is_null() {
        record_alloc(AllocatorKind::Memalign, ptr as u64, size as u64);
    }
    ptr
}

/// # Safety
/// Same contract as `valloc`.
pub unsafe extern "C" fn tracked_valloc(size: usize) -> *mut c_void {
    let ptr = (system().valloc)(size);
    if !ptr.is_null() {
        record_alloc(AllocatorKind::Valloc, ptr as u64, size as u64);
    }
    ptr
}

/// # Safety
/// Same contract as glibc `pvalloc`.
pub unsafe extern "C" fn tracked_pvalloc(size: usize) -> *mut c_void {
    let page = page_size::get();
    let rounded = size.div_ceil(page).max(1) * page;
    let ptr = match system().pvalloc {
        Some(pvalloc) => pvalloc(size),
        None => (system().memalign)(page, rounded),
    };
    if !ptr.is_null() {
        record_alloc(AllocatorKind::Pvalloc, ptr as u64, rounded as u64);
    }
    ptr
}

/// # Safety
/// Same contract as `mmap`.
pub unsafe extern "C" fn tracked_mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    let ptr = (system().mmap)(addr, length, prot, flags, fd, offset);
    if ptr != libc::MAP_FAILED {
        record_alloc(AllocatorKind::Mmap, ptr as u64, length as u64);
    }
    ptr
}

/// # Safety
/// Same contract as `munmap`.
pub unsafe extern "C" fn tracked_munmap(addr: *mut c_void, length: usize) -> c_int {
    let rc = (system().munmap)(addr, length);
    if rc == 0 {
        // Unmaps of ranges we never saw are recorded unconditionally and
        // skipped at aggregation time.
        record_dealloc(AllocatorKind::Munmap, addr as u64);
    }
    rc
}

/// # Safety
/// Same contract as `dlopen`.
pub unsafe extern "C" fn tracked_dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    let handle = (system().dlopen)(filename, flags);
    if !handle.is_null() {
        refresh_images_after_image_change();
    }
    handle
}

/// # Safety
/// Same contract as `dlclose`.
pub unsafe extern "C" fn tracked_dlclose(handle: *mut c_void) -> c_int {
    let rc = (system().dlclose)(handle);
    if rc == 0 {
        refresh_images_after_image_change();
    }
    rc
}

fn refresh_images_after_image_change() {
    let Some(_guard) = ReentrancyGuard::acquire() else {
        return;
    };
    let Some(tracker) = Tracker::current() else {
        return;
    };
    tracker.refresh_images();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::tests::TEST_LOCK;

    // The wrappers record into whichever tracker is installed, so these
    // tests take the same lock as the install/teardown tests.

    #[test]
    fn test_tracked_malloc_free_without_tracker() {
        let _lock = TEST_LOCK.lock();
        // With no tracker installed the wrappers are pure pass-throughs.
        let ptr = unsafe { tracked_malloc(128) };
        assert!(!ptr.is_null());
        unsafe {
            std::ptr::write_bytes(ptr as *mut u8, 0xAB, 128);
            tracked_free(ptr);
        }
    }

    #[test]
    fn test_tracked_calloc_zeroes() {
        let _lock = TEST_LOCK.lock();
        let ptr = unsafe { tracked_calloc(16, 8) } as *mut u8;
        assert!(!ptr.is_null());
        let all_zero = (0..128).all(|i| unsafe { *ptr.add(i) } == 0);
        assert!(all_zero);
        unsafe { tracked_free(ptr as *mut c_void) };
    }

    #[test]
    fn test_tracked_realloc_moves_data() {
        let _lock = TEST_LOCK.lock();
        unsafe {
            let ptr = tracked_malloc(8) as *mut u8;
            std::ptr::write_bytes(ptr, 0x5A, 8);
            let bigger = tracked_realloc(ptr as *mut c_void, 4096) as *mut u8;
            assert!(!bigger.is_null());
            assert_eq!(*bigger, 0x5A);
            tracked_free(bigger as *mut c_void);
        }
    }

    #[test]
    fn test_tracked_posix_memalign_alignment() {
        let _lock = TEST_LOCK.lock();
        unsafe {
            let mut ptr: *mut c_void = std::ptr::null_mut();
            let rc = tracked_posix_memalign(&mut ptr, 64, 200);
            assert_eq!(rc, 0);
            assert_eq!(ptr as usize % 64, 0);
            tracked_free(ptr);
        }
    }

    #[test]
    fn test_tracked_mmap_munmap() {
        let _lock = TEST_LOCK.lock();
        unsafe {
            let len = 2 * page_size::get();
            let ptr = tracked_mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(ptr, libc::MAP_FAILED);
            assert_eq!(tracked_munmap(ptr, len), 0);
        }
    }

    #[test]
    fn test_bootstrap_arena() {
        let a = bootstrap_alloc(10);
        let b = bootstrap_alloc(10);
        assert!(!a.is_null());
        assert!(!b.is_null());
        assert_ne!(a, b);
        assert_eq!(a as usize % 16, 0);
        assert!(is_bootstrap_ptr(a));
        assert!(!is_bootstrap_ptr(std::ptr::null_mut()));
    }
}
