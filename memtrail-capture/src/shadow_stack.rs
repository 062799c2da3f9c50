// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The interpreted-frame shadow stack. Each thread mirrors the host
//! interpreter's frame stack, driven by the profile hook. Pushes and pops
//! are buffered thread-locally and only written out right before that
//! thread's next allocation record, so per-allocation cost stays constant
//! and the reader still reconstructs the exact stack by replaying the
//! stream.
//!
//! A global epoch implements the synthetic profile-off event: teardown
//! bumps it, and every thread forgets its stack (dropping the retained
//! code objects) the next time it touches it.

use memtrail_format::CodeObject;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static STACK_EPOCH: AtomicU64 = AtomicU64::new(0);

pub(crate) struct LocalFrame {
    pub code: Arc<CodeObject>,
    pub offset: u32,
    pub is_entry: bool,
}

#[derive(Default)]
pub(crate) struct ThreadStack {
    pub frames: Vec<LocalFrame>,
    /// Aggregated-mode interned stack ids, one per frame depth; always a
    /// prefix of `frames` in length.
    pub interned: Vec<u32>,
    /// How many of `frames` the writer has already seen.
    pub emitted: usize,
    /// Pops of already-emitted frames not yet written out.
    pub pending_pops: u32,
    epoch: u64,
}

struct ThreadState {
    current: ThreadStack,
    /// Stacks of suspended greenlets, keyed by greenlet id.
    suspended: FxHashMap<u64, Vec<LocalFrame>>,
}

thread_local! {
    static THREAD_STATE: RefCell<ThreadState> = RefCell::new(ThreadState {
        current: ThreadStack::default(),
        suspended: FxHashMap::default(),
    });
}

impl ThreadStack {
    fn reset_if_stale(&mut self) {
        let epoch = STACK_EPOCH.load(Ordering::Acquire);
        if self.epoch != epoch {
            self.frames.clear();
            self.interned.clear();
            self.emitted = 0;
            self.pending_pops = 0;
            self.epoch = epoch;
        }
    }
}

/// Runs `f` against the calling thread's stack. Used by the tracker to
/// flush buffered frame events under the writer lock.
pub(crate) fn with_stack<R>(f: impl FnOnce(&mut ThreadStack) -> R) -> R {
    THREAD_STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.current.reset_if_stale();
        f(&mut state.current)
    })
}

/// Profile-hook `call` event: the host pushed a frame.
pub fn on_frame_entry(code: &Arc<CodeObject>, offset: u32, is_entry: bool) {
    with_stack(|stack| {
        stack.frames.push(LocalFrame {
            code: Arc::clone(code),
            offset,
            is_entry,
        });
    });
}

/// Profile-hook `return` event: the host popped its current frame.
pub fn on_frame_exit() {
    with_stack(|stack| {
        if stack.frames.pop().is_none() {
            // Return for a frame pushed before tracking started.
            return;
        }
        stack.interned.truncate(stack.frames.len());
        if stack.frames.len() < stack.emitted {
            stack.emitted = stack.frames.len();
            stack.pending_pops += 1;
        }
    });
}

/// The host moved execution within the current frame. Only frames the
/// writer has not seen yet can still be retargeted.
pub fn on_offset_update(offset: u32) {
    with_stack(|stack| {
        if stack.frames.len() > stack.emitted {
            if let Some(top) = stack.frames.last_mut() {
                top.offset = offset;
            }
        }
    });
}

/// Cooperative context switch from greenlet `from` to greenlet `to` on
/// the calling thread: the current stack is suspended and `to`'s stack
/// (empty if never seen) becomes current. All frames of the suspended
/// stack are popped from the reader's point of view; the restored stack
/// re-emits from scratch before the next allocation.
pub fn on_context_switch(from: u64, to: u64) {
    THREAD_STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.current.reset_if_stale();
        let restored = state.suspended.remove(&to).unwrap_or_default();
        let ThreadStack {
            frames,
            emitted,
            pending_pops,
            epoch,
            ..
        } = std::mem::take(&mut state.current);
        state.suspended.insert(from, frames);
        state.current = ThreadStack {
            frames: restored,
            interned: Vec::new(),
            emitted: 0,
            pending_pops: pending_pops + emitted as u32,
            epoch,
        };
    });
}

/// Depth of the calling thread's current stack.
pub fn depth() -> usize {
    with_stack(|stack| stack.frames.len())
}

/// The synthetic profile-off event: every thread forgets its stack on
/// next touch, releasing retained code objects.
pub(crate) fn forget_all_threads() {
    STACK_EPOCH.fetch_add(1, Ordering::AcqRel);
}

/// Fork-child reinitialization: keep the (only) surviving thread's live
/// frames but re-emit all of them into the child's fresh capture.
pub(crate) fn mark_all_unemitted() {
    THREAD_STATE.with(|state| {
        let mut state = state.borrow_mut();
        state.current.reset_if_stale();
        state.current.emitted = 0;
        state.current.pending_pops = 0;
        state.current.interned.clear();
    });
}

#[cfg(test)]
pub(crate) fn snapshot_for_tests() -> Vec<(u64, u32, bool)> {
    with_stack(|stack| {
        stack
            .frames
            .iter()
            .map(|f| (f.code.id, f.offset, f.is_entry))
            .collect()
    })
}
