// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]
#![cfg(unix)]

//! The capture half of memtrail: allocator interposition, interpreted and
//! native stack capture, and the streaming writer, all running inside the
//! tracked process under reentrancy and fork-safety constraints.
//!
//! The embedder installs a [`Tracker`] with a [`TrackerConfig`] and a
//! [`HostRuntime`], forwards the host interpreter's profile-hook events
//! through [`crate::ffi`] or the `shadow_stack` entry points, and tears
//! the tracker down when the capture ends. System allocator entry points
//! are interposed either via the `interpose` cargo feature (LD_PRELOAD)
//! or by the embedder calling the `tracked_*` wrappers directly.

pub mod config;
pub mod ffi;
mod fork;
mod ghost_stack;
pub mod guard;
pub mod hooks;
pub mod host;
mod images;
#[cfg(feature = "interpose")]
mod interpose;
pub mod pool;
mod sampler;
pub mod shadow_stack;
pub mod tracker;
mod trampoline;
mod unwind;

pub use config::{Destination, TrackerConfig};
pub use host::{HostRuntime, NullHostRuntime, RawCodeDescriptor, RawLineEntry};
pub use pool::{install_pool_hooks, PoolAllocatorTable};
pub use tracker::{InstallError, Tracker};

/// Names the calling thread in the capture, if a tracker is installed.
pub fn set_current_thread_name(name: &str) {
    if !Tracker::is_installed() {
        return;
    }
    let Some(_guard) = guard::ReentrancyGuard::acquire() else {
        return;
    };
    let Some(tracker) = Tracker::current() else {
        return;
    };
    tracker.write_thread_name(name);
}
