// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fork following. The prepare handler freezes the writer so no record is
//! torn across the fork; the child handler resets every per-thread
//! trampoline, reopens the capture under a pid-derived filename and
//! restarts the sampler (threads do not survive `fork`).

use crate::guard::ReentrancyGuard;
use crate::tracker::Tracker;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};

static FORK_HANDLERS_REGISTERED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Guard held across the fork window by the thread that called fork,
    /// plus the tracker it locked. Teardown cannot free the tracker while
    /// the guard is held, so the raw pointer stays valid until the
    /// parent/child handler releases it; it must not be re-loaded from
    /// the global, which teardown may already have unpublished.
    static FORK_STATE: RefCell<Option<(ReentrancyGuard, *const Tracker)>> =
        const { RefCell::new(None) };
}

/// Registers the atfork handlers once per process. Registered handlers
/// are inert while no tracker is installed.
pub(crate) fn register_fork_handlers() {
    if FORK_HANDLERS_REGISTERED.swap(true, Ordering::AcqRel) {
        return;
    }
    // SAFETY: the handlers only take/release locks owned by the tracker
    // and reinitialize child-local state.
    unsafe {
        libc::pthread_atfork(Some(prepare), Some(parent), Some(child));
    }
}

extern "C" fn prepare() {
    let Some(guard) = ReentrancyGuard::acquire() else {
        // Fork from inside a hook cannot happen; a held guard here means
        // a nested fork, which we let through unlocked.
        return;
    };
    if let Some(tracker) = Tracker::current() {
        tracker.lock_writer_for_fork();
        FORK_STATE.with(|slot| *slot.borrow_mut() = Some((guard, tracker as *const Tracker)));
    }
}

extern "C" fn parent() {
    if let Some((_guard, tracker)) = FORK_STATE.with(|slot| slot.borrow_mut().take()) {
        // SAFETY: the guard kept the tracker alive; this releases the
        // lock taken in prepare on this thread.
        unsafe { (*tracker).force_unlock_writer() };
    }
}

extern "C" fn child() {
    if let Some((_guard, tracker)) = FORK_STATE.with(|slot| slot.borrow_mut().take()) {
        // SAFETY: the child inherits the lock taken in prepare, and the
        // guard (inherited with this thread) keeps the tracker alive.
        unsafe {
            (*tracker).force_unlock_writer();
            (*tracker).reinit_in_child();
        }
    }
}
