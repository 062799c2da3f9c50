// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The seam between the tracker and the host interpreter. The tracker
//! never links against a concrete interpreter; the embedder implements
//! [`HostRuntime`] and forwards the interpreter's profile-hook events to
//! [`crate::shadow_stack`], either through the Rust entry points or the
//! C ABI in [`crate::ffi`].

use memtrail_format::{CodeObject, LineTable, LineTableEntry};
use std::ffi::CStr;
use std::os::raw::c_char;

/// C-ABI view of a code object, as handed over by the embedder the first
/// time a callable is observed. Strings are NUL-terminated and the line
/// table is `line_table_len` pairs sorted by offset.
#[repr(C)]
pub struct RawCodeDescriptor {
    pub id: u64,
    pub function_name: *const c_char,
    pub filename: *const c_char,
    pub first_line: u32,
    pub line_table: *const RawLineEntry,
    pub line_table_len: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawLineEntry {
    pub offset: u32,
    pub line: u32,
}

/// Builds the frozen descriptor the capture stream carries.
///
/// # Safety
///
/// `raw.function_name` and `raw.filename` must be valid NUL-terminated
/// strings, and `raw.line_table` must point to `raw.line_table_len`
/// readable entries (or be null with a zero length).
pub unsafe fn code_object_from_raw(raw: &RawCodeDescriptor) -> CodeObject {
    let function_name = cstr_lossy(raw.function_name);
    let filename = cstr_lossy(raw.filename);
    let entries = if raw.line_table.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(raw.line_table, raw.line_table_len)
            .iter()
            .map(|e| LineTableEntry {
                offset: e.offset,
                line: e.line,
            })
            .collect()
    };
    CodeObject {
        id: raw.id,
        function_name,
        filename,
        first_line: raw.first_line,
        line_table: LineTable::new(entries),
    }
}

unsafe fn cstr_lossy(ptr: *const c_char) -> Box<str> {
    if ptr.is_null() {
        return Box::from("");
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned().into()
}

/// What the embedder provides about the host interpreter. Registration of
/// the profile hook is delegated here so teardown can drop it again; once
/// dropped, the host stops delivering frame events and every per-thread
/// stack releases its retained code objects.
pub trait HostRuntime: Send + Sync + 'static {
    /// Arrange for the host to deliver frame-boundary events to the
    /// tracker's profile entry points.
    fn attach_profile_hook(&self);

    /// Stop delivering events. Called exactly once per teardown.
    fn detach_profile_hook(&self);

    /// Name of the host's active internal allocator ("pool",
    /// "pool_debug", "malloc", ...).
    fn pool_allocator_name(&self) -> &str {
        "malloc"
    }

    /// The command line of the tracked process, for the capture header.
    fn command_line(&self) -> Vec<String> {
        std::env::args().collect()
    }
}

/// Runtime stub for captures with no interpreter attached (native-only
/// processes, the attach entry point before the host wires itself up,
/// tests).
pub struct NullHostRuntime;

impl HostRuntime for NullHostRuntime {
    fn attach_profile_hook(&self) {}
    fn detach_profile_hook(&self) {}
}
