// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! C-callable surface: the profile-hook entry points the embedder wires
//! into the host interpreter, and the attach entry point an external
//! debugger invokes after loading this library into a running process.

use crate::config::TrackerConfig;
use crate::host::{code_object_from_raw, NullHostRuntime, RawCodeDescriptor};
use crate::shadow_stack;
use crate::tracker::Tracker;
use memtrail_format::CodeObject;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Arc;

/// Frozen descriptors, keyed by the host's code-object id. Converting a
/// raw descriptor allocates, so each one is converted exactly once.
static CODE_REGISTRY: Mutex<Option<FxHashMap<u64, Arc<CodeObject>>>> = Mutex::new(None);

fn registered_code(raw: &RawCodeDescriptor) -> Arc<CodeObject> {
    let mut registry = CODE_REGISTRY.lock();
    let registry = registry.get_or_insert_with(FxHashMap::default);
    if let Some(code) = registry.get(&raw.id) {
        return Arc::clone(code);
    }
    // SAFETY: the embedder guarantees the descriptor contract (see
    // RawCodeDescriptor).
    let code = Arc::new(unsafe { code_object_from_raw(raw) });
    registry.insert(raw.id, Arc::clone(&code));
    code
}

pub(crate) fn clear_code_registry() {
    *CODE_REGISTRY.lock() = None;
}

/// Profile-hook `call` event.
///
/// # Safety
///
/// `code` must satisfy the [`RawCodeDescriptor`] contract.
#[no_mangle]
pub unsafe extern "C" fn memtrail_profile_call(
    code: *const RawCodeDescriptor,
    offset: u32,
    is_entry: bool,
) {
    let Some(code) = code.as_ref() else {
        return;
    };
    let code = registered_code(code);
    shadow_stack::on_frame_entry(&code, offset, is_entry);
}

/// Profile-hook `return` event.
#[no_mangle]
pub extern "C" fn memtrail_profile_return() {
    shadow_stack::on_frame_exit();
}

/// Bytecode-offset update for the running frame.
#[no_mangle]
pub extern "C" fn memtrail_profile_offset(offset: u32) {
    shadow_stack::on_offset_update(offset);
}

/// Cooperative context switch between greenlets on the calling thread.
#[no_mangle]
pub extern "C" fn memtrail_profile_switch(from: u64, to: u64) {
    shadow_stack::on_context_switch(from, to);
}

/// Names the calling thread in the capture.
///
/// # Safety
///
/// `name` must be a valid NUL-terminated string or null.
#[no_mangle]
pub unsafe extern "C" fn memtrail_set_thread_name(name: *const c_char) {
    if name.is_null() {
        return;
    }
    let name = CStr::from_ptr(name).to_string_lossy();
    crate::set_current_thread_name(&name);
}

/// Exception-unwind support for the ghost stack: the embedder's landing
/// pads call this with their frame's stack pointer before rethrowing.
#[no_mangle]
pub extern "C" fn memtrail_ghost_stack_unwind(sp: usize) {
    crate::ghost_stack::unwind_frames_above(sp);
}

/// Attach entry point: installs a tracker streaming to a live viewer
/// listening on `127.0.0.1:port`. Designed to be invoked by an external
/// debugger that loaded this library into the target. Returns 0 on
/// success, -1 otherwise.
#[no_mangle]
pub extern "C" fn memtrail_start_client(port: u16) -> i32 {
    let config = match TrackerConfig::to_tcp(format!("127.0.0.1:{port}")) {
        Ok(config) => config,
        Err(_) => return -1,
    };
    match Tracker::install(config, Arc::new(NullHostRuntime)) {
        Ok(()) => 0,
        Err(error) => {
            tracing::error!(%error, "attach-mode install failed");
            -1
        }
    }
}
