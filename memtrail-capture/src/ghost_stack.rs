// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ghost stack: an amortized-O(1) native stack capture. The first
//! capture on a call stack walks the frame-pointer chain, remembers every
//! saved return address in a thread-local shadow stack, and patches the
//! saved slots to point at the trampoline. Later captures only walk the
//! frames pushed since then; everything below is read back from the
//! shadow stack. When a patched function returns, the trampoline asks
//! [`landing`] for the real address and the shadow entry is popped.
//!
//! Requires frame pointers (`-C force-frame-pointers=yes` and the
//! equivalent for C/C++ objects). Whenever the chain cannot be validated
//! the capture reports failure and the tracker falls back to direct
//! unwinding.
//!
//! Safety protocol:
//! - reentrancy: a thread-local flag refuses nested captures;
//! - longjmp: every entry stores the stack pointer its return must
//!   observe; entries whose expected stack pointer lies below the one the
//!   trampoline reports were jumped over and are discarded forward;
//! - epoch: [`reset`] bumps a global epoch after restoring the calling
//!   thread's patched slots, so in-flight trampolines never act on a
//!   recycled entry;
//! - fork: the child-side fork handler calls [`reset`] before any patched
//!   frame can return;
//! - exceptions: a foreign unwinder's cleanup path calls
//!   [`unwind_frames_above`] (exported as `memtrail_ghost_stack_unwind`)
//!   with the landing-pad stack pointer to both restore and forget the
//!   entries of frames being destroyed;
//! - thread exit: the thread-local's destructor restores every still
//!   patched slot.

use crate::trampoline::trampoline_address;
use crate::unwind::IpBuffer;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

/// Bumped on every reset; entries from an older epoch are never trusted
/// by a capture.
static EPOCH: AtomicU64 = AtomicU64::new(1);

/// Upper bound on frames walked or patched in one capture.
const MAX_GHOST_FRAMES: usize = 512;

/// Userspace virtual addresses fit in the low bits; anything above is a
/// pointer-authentication signature or a kernel pointer.
const VA_MASK: usize = 0x0000_FFFF_FFFF_FFFF;

#[derive(Clone, Copy)]
struct ShadowEntry {
    /// The original return address, PAC-stripped.
    real_return_address: usize,
    /// Location of the saved return address that was patched.
    slot: *mut usize,
    /// Stack pointer value the trampoline observes when this frame
    /// returns: one word above the slot on both supported architectures.
    expected_sp: usize,
    epoch: u64,
}

#[derive(Default)]
struct GhostStack {
    /// Outermost frame first.
    entries: Vec<ShadowEntry>,
}

impl GhostStack {
    fn restore_all(&mut self) {
        let trampoline = trampoline_address();
        for entry in self.entries.drain(..) {
            // SAFETY: slot pointed into this thread's stack when the entry
            // was created; a slot that no longer holds the trampoline
            // belongs to a frame that already returned and is left alone.
            unsafe {
                if *entry.slot == trampoline {
                    *entry.slot = entry.real_return_address;
                }
            }
        }
    }
}

impl Drop for GhostStack {
    fn drop(&mut self) {
        self.restore_all();
    }
}

thread_local! {
    static GHOST: RefCell<GhostStack> = RefCell::new(GhostStack::default());
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
}

#[inline]
fn strip_pac(addr: usize) -> usize {
    #[cfg(target_arch = "aarch64")]
    {
        addr & VA_MASK
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        addr
    }
}

// Address plausibility checks for walking a possibly-broken frame chain.

#[inline]
fn is_likely_valid_address(addr: usize) -> bool {
    if addr < 4096 {
        return false;
    }
    if addr % core::mem::size_of::<usize>() != 0 {
        return false;
    }
    // Kernel half of the address space is never a valid frame pointer.
    addr <= VA_MASK
}

#[inline]
fn is_valid_frame_pointer(bp: usize, sp: usize) -> bool {
    const MAX_FRAME_SIZE: usize = 1024 * 1024;
    is_likely_valid_address(bp) && bp >= sp && bp.saturating_sub(sp) <= MAX_FRAME_SIZE
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn current_frame_pointer() -> usize {
    let bp: usize;
    // SAFETY: reading rbp has no side effects.
    unsafe { core::arch::asm!("mov {}, rbp", out(reg) bp, options(nomem, nostack)) };
    bp
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn current_frame_pointer() -> usize {
    let bp: usize;
    // SAFETY: reading the frame pointer has no side effects.
    unsafe { core::arch::asm!("mov {}, x29", out(reg) bp, options(nomem, nostack)) };
    bp
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
fn current_frame_pointer() -> usize {
    0
}

/// A frame discovered by walking the frame-pointer chain. The saved
/// return address lives one word above the frame record.
struct WalkedFrame {
    slot: *mut usize,
    saved: usize,
    next_bp: usize,
}

/// Walks one step of the chain, validating before every dereference.
///
/// # Safety
///
/// `bp`/`sp` must come from the current thread's live frame chain.
unsafe fn read_frame(bp: usize, sp: usize) -> Option<WalkedFrame> {
    if !is_valid_frame_pointer(bp, sp) {
        return None;
    }
    let slot_addr = bp + core::mem::size_of::<usize>();
    if !is_likely_valid_address(slot_addr) {
        return None;
    }
    let slot = slot_addr as *mut usize;
    let saved = *slot;
    if saved == 0 {
        return None;
    }
    let next_bp = *(bp as *const usize);
    if next_bp != 0 && next_bp <= bp {
        return None;
    }
    Some(WalkedFrame {
        slot,
        saved,
        next_bp,
    })
}

/// Captures the current native stack through the shadow-stack cache,
/// innermost frame first. Returns false when the ghost stack cannot serve
/// this capture (no trampoline, reentered, or an unwalkable chain); the
/// caller falls back to direct unwinding.
pub(crate) fn capture(skip: usize, out: &mut IpBuffer) -> bool {
    let trampoline = trampoline_address();
    if trampoline == 0 {
        return false;
    }
    if CAPTURING.with(|c| c.replace(true)) {
        return false;
    }
    let ok = capture_inner(trampoline, skip, out);
    CAPTURING.with(|c| c.set(false));
    ok
}

fn capture_inner(trampoline: usize, skip: usize, out: &mut IpBuffer) -> bool {
    out.clear();
    let epoch = EPOCH.load(Ordering::Acquire);
    GHOST.with(|ghost| {
        let mut ghost = ghost.borrow_mut();
        // Entries surviving from an older epoch were already restored by
        // reset(); a leftover here means reset raced a dying thread, and
        // the only safe move is a fresh start.
        if ghost.entries.last().is_some_and(|e| e.epoch != epoch) {
            ghost.restore_all();
        }

        let mut fresh: Vec<WalkedFrame> = Vec::with_capacity(16);
        let mut bp = current_frame_pointer();
        let mut sp = bp;
        let mut reached_shadow = false;
        while fresh.len() < MAX_GHOST_FRAMES {
            // SAFETY: bp/sp walk this thread's own live chain.
            let Some(frame) = (unsafe { read_frame(bp, sp) }) else {
                break;
            };
            if strip_pac(frame.saved) == trampoline {
                reached_shadow = true;
                break;
            }
            let next_bp = frame.next_bp;
            fresh.push(frame);
            if next_bp == 0 {
                break;
            }
            sp = bp;
            bp = next_bp;
        }

        if fresh.is_empty() && !reached_shadow {
            // Nothing walkable: no frame pointers here.
            return false;
        }

        // Skip the tracker's own frames entirely; they are neither
        // reported nor patched.
        let fresh = &fresh[skip.min(fresh.len())..];

        // Patch the new frames and push them onto the shadow stack,
        // outermost first so the vector stays ordered.
        for frame in fresh.iter().rev() {
            let real = strip_pac(frame.saved);
            // SAFETY: the slot was validated during the walk and belongs
            // to a live frame of this thread.
            unsafe { *frame.slot = trampoline };
            ghost.entries.push(ShadowEntry {
                real_return_address: real,
                slot: frame.slot,
                expected_sp: frame.slot as usize + core::mem::size_of::<usize>(),
                epoch,
            });
        }

        // The full stack is now exactly the shadow, innermost first.
        for entry in ghost.entries.iter().rev() {
            if out.len() >= crate::unwind::MAX_NATIVE_FRAMES {
                break;
            }
            out.push(entry.real_return_address as u64);
        }
        true
    })
}

/// Trampoline callback: a patched frame is returning with stack pointer
/// `sp`. Pops (and discards entries skipped over by `longjmp`) and hands
/// back the real return address.
pub(crate) fn landing(sp: usize) -> usize {
    let popped = GHOST.with(|ghost| {
        let mut ghost = ghost.borrow_mut();
        while let Some(top) = ghost.entries.last().copied() {
            if top.expected_sp == sp {
                ghost.entries.pop();
                return Some(top.real_return_address);
            }
            if top.expected_sp < sp {
                // This entry's frame was abandoned by a longjmp past it;
                // its slot is gone with the frame.
                ghost.entries.pop();
                continue;
            }
            break;
        }
        None
    });
    match popped {
        Some(address) => address,
        // A trampoline return with no matching entry means the shadow
        // stack lost an address we still owe the program. There is no
        // correct place to jump.
        None => std::process::abort(),
    }
}

/// Exception-unwind support: restores and forgets every entry belonging
/// to frames below `sp` (frames being destroyed by the unwinder), so a
/// rethrown exception propagates with the original return addresses in
/// place.
pub(crate) fn unwind_frames_above(sp: usize) {
    let trampoline = trampoline_address();
    GHOST.with(|ghost| {
        let mut ghost = ghost.borrow_mut();
        while let Some(top) = ghost.entries.last().copied() {
            if top.expected_sp > sp {
                break;
            }
            // SAFETY: same contract as restore_all.
            unsafe {
                if *top.slot == trampoline {
                    *top.slot = top.real_return_address;
                }
            }
            ghost.entries.pop();
        }
    });
}

/// Restores the calling thread's patched slots, forgets all entries and
/// starts a new epoch. The next capture on any thread performs a full
/// walk and patches afresh.
pub(crate) fn reset() {
    GHOST.with(|ghost| ghost.borrow_mut().restore_all());
    EPOCH.fetch_add(1, Ordering::AcqRel);
}

/// Number of live shadow entries on the calling thread.
#[cfg(test)]
pub(crate) fn depth() -> usize {
    GHOST.with(|ghost| ghost.borrow().entries.len())
}
