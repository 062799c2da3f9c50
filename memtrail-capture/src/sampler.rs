// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The RSS sampler thread. Emits a memory record at a fixed cadence for
//! overview plots. Strictly best-effort: a failed sample is skipped and
//! allocation tracking never depends on it.

use crate::guard::ReentrancyGuard;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use memtrail_format::{epoch_millis, MemoryRecord};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) struct MemorySampler {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl MemorySampler {
    pub fn start(interval_ms: u64) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name("memtrail-sampler".to_string())
            .spawn(move || sampler_loop(stop_rx, interval_ms))
            .ok();
        if thread.is_none() {
            tracing::warn!("could not start the memory sampler thread");
        }
        MemorySampler {
            stop_tx,
            thread,
        }
    }

    /// Signals the thread and joins it.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn sampler_loop(stop_rx: Receiver<()>, interval_ms: u64) {
    let interval = Duration::from_millis(interval_ms);
    loop {
        match stop_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
        // The sampler's own allocations never belong in the capture.
        let Some(_guard) = ReentrancyGuard::acquire() else {
            continue;
        };
        let Some(rss_bytes) = read_resident_set_size() else {
            continue;
        };
        let record = MemoryRecord {
            ms_since_epoch: epoch_millis(),
            rss_bytes,
        };
        if let Some(tracker) = crate::tracker::Tracker::current() {
            tracker.write_memory_record(record);
        } else {
            // Teardown unpublished the tracker; we are done.
            return;
        }
    }
}

/// Current resident set size in bytes.
#[cfg(target_os = "linux")]
pub(crate) fn read_resident_set_size() -> Option<u64> {
    // Second field of /proc/self/statm is resident pages.
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * page_size::get() as u64)
}

/// Current resident set size in bytes.
#[cfg(target_os = "macos")]
pub(crate) fn read_resident_set_size() -> Option<u64> {
    use std::mem::MaybeUninit;
    let mut info = MaybeUninit::<libc::mach_task_basic_info>::uninit();
    let mut count = (std::mem::size_of::<libc::mach_task_basic_info>()
        / std::mem::size_of::<libc::integer_t>()) as libc::mach_msg_type_number_t;
    // SAFETY: task_info fills at most `count` integers of the struct for
    // the current task.
    let result = unsafe {
        libc::task_info(
            libc::mach_task_self(),
            libc::MACH_TASK_BASIC_INFO,
            info.as_mut_ptr() as libc::task_info_t,
            &mut count,
        )
    };
    if result != libc::KERN_SUCCESS {
        return None;
    }
    // SAFETY: task_info succeeded, the struct is initialized.
    Some(unsafe { info.assume_init() }.resident_size)
}
