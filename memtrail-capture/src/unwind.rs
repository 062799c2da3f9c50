// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Direct native unwinding. Walks the native stack on every allocation
//! with the platform unwinder behind the `backtrace` crate and hands the
//! instruction pointers to the tracker's interning tree. This is the
//! always-available mode; the ghost stack (see [`crate::ghost_stack`]) is
//! an opt-in accelerator that falls back here whenever its invariants do
//! not hold.

use smallvec::SmallVec;

/// Hard cap on captured native frames. Deeper stacks are truncated at the
/// root end, which keeps the per-event work bounded.
pub const MAX_NATIVE_FRAMES: usize = 512;

/// Frames of the tracker itself sitting between the allocation hook and
/// the unwinder; they are never part of the user's stack.
pub(crate) const TRACKER_FRAMES_TO_SKIP: usize = 3;

pub(crate) type IpBuffer = SmallVec<[u64; 64]>;

/// Captures the current native stack, innermost frame first.
///
/// The caller holds the reentrancy guard, so allocations performed by the
/// unwinder itself (libunwind caches on first use) are not re-entered.
pub(crate) fn capture_ips(skip: usize, out: &mut IpBuffer) {
    out.clear();
    let mut skipped = 0usize;
    // SAFETY: trace_unsynchronized is unsynchronized, not unsound; the
    // tracker serializes nothing here on purpose, every thread walks only
    // its own stack.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if skipped < skip {
                skipped += 1;
                return true;
            }
            let ip = frame.ip() as usize as u64;
            if ip == 0 {
                return false;
            }
            out.push(ip);
            out.len() < MAX_NATIVE_FRAMES
        });
    }
}
