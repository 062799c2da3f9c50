// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The tracker core: the single-process state machine owning the writer,
//! the sampler thread and all capture-side tables.
//!
//! At most one tracker is installed per process. The installed tracker is
//! published through an atomic pointer; hooks acquire their reentrancy
//! guard first and only then load the pointer, while teardown unpublishes
//! the pointer and spins until every in-flight hook has drained before the
//! tracker is dropped. That ordering is what makes the `&'static` handed
//! out by [`Tracker::current`] sound.

use crate::config::{Destination, TrackerConfig};
use crate::guard;
use crate::host::HostRuntime;
use crate::sampler::MemorySampler;
use crate::shadow_stack;
use crate::unwind::{self, IpBuffer};
use crate::{fork, ghost_stack, hooks};
use memtrail_format::{
    epoch_millis, AggregatedAllocation, AllocatorKind, CaptureHeader, FileFormat, FileSink,
    FramePush, HeaderStats, MemoryRecord, NullSink, PoolAllocatorId, PythonStackIndex,
    RecordWriter, Sink, SinkError, SocketSink, WriteError,
};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use thiserror::Error;

static TRACKER: AtomicPtr<Tracker> = AtomicPtr::new(ptr::null_mut());

/// Serializes install and teardown against each other.
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// The id capture records attribute thread-scoped events to. This must be
/// the kernel's thread id, not Rust's opaque `ThreadId`: the profile hook
/// and the allocator hooks fire on threads we did not create (interpreter
/// threads, extension-module threads), and reports need ids that line up
/// with what `ps`/`/proc` and the host's own threading module show.
///
/// Called on every recorded event, so it must stay a single syscall (or
/// cheaper) and allocation-free.
pub(crate) fn current_thread_id() -> u64 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid has no preconditions and cannot fail for the
        // calling thread.
        (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
    }
    #[cfg(target_os = "macos")]
    {
        // A zero pthread_t asks for the calling thread's id.
        let mut tid: u64 = 0;
        // SAFETY: the out pointer is valid and the thread is ourselves.
        let rc = unsafe { libc::pthread_threadid_np(0, &mut tid) };
        debug_assert_eq!(rc, 0, "pthread_threadid_np failed for current thread");
        tid
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
compile_error!("capture records are keyed by kernel thread ids; no lookup is wired up for this platform");

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("a tracker is already installed in this process")]
    AlreadyInstalled,
    #[error("could not open the capture destination: {0}")]
    Sink(#[from] SinkError),
    #[error("could not start the capture: {0}")]
    Write(#[from] WriteError),
}

pub struct Tracker {
    config: TrackerConfig,
    host: Arc<dyn HostRuntime>,
    writer: Mutex<WriterState>,
    sampler: Mutex<Option<MemorySampler>>,
    /// Original capture path, for deriving the child's file on fork.
    capture_path: Option<PathBuf>,
}

struct WriterState {
    writer: RecordWriter<Box<dyn Sink>>,
    seen_code: FxHashSet<u64>,
    native: NativeFrameTree,
    aggregate: Option<AggregateState>,
    io_error_logged: bool,
}

/// Prefix tree interning native instruction-pointer chains. Index 0 is
/// the empty root; every distinct (parent, ip) pair under the current
/// generation gets the next index and one `NativeFrame` record.
#[derive(Default)]
struct NativeFrameTree {
    nodes: FxHashMap<(u32, u64), u32>,
    next_index: u32,
}

impl NativeFrameTree {
    /// A new image generation invalidates every cached index; the reader
    /// numbers generations by counting segment records in stream order.
    fn start_generation(&mut self) {
        self.nodes.clear();
        self.next_index = 0;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct LocationKey {
    tid: u64,
    kind: AllocatorKind,
    python_stack_id: u32,
    native_frame_index: u32,
}

#[derive(Default, Clone, Copy)]
struct LocationCounters {
    cur_count: u64,
    cur_bytes: u64,
    hwm_count: u64,
    hwm_bytes: u64,
    last_peak_seq: u64,
}

struct LiveAllocation {
    key: LocationKey,
    size: u64,
}

/// Capture-time aggregation for the aggregated file format: per-location
/// high-water-mark and leak counters, with the global peak tracked by a
/// lazily-propagated peak sequence number so no peak ever requires a full
/// table sweep.
#[derive(Default)]
struct AggregateState {
    python_nodes: FxHashMap<(u32, u64, u32, bool), u32>,
    python_next: u32,
    live: FxHashMap<u64, LiveAllocation>,
    locations: FxHashMap<LocationKey, LocationCounters>,
    current_bytes: u64,
    peak_bytes: u64,
    peak_seq: u64,
}

impl AggregateState {
    fn location(&mut self, key: LocationKey) -> &mut LocationCounters {
        let peak_seq = self.peak_seq;
        let counters = self.locations.entry(key).or_default();
        if counters.last_peak_seq < peak_seq {
            // First touch since the last global peak: the current values
            // are exactly the values this location had at that peak.
            counters.hwm_count = counters.cur_count;
            counters.hwm_bytes = counters.cur_bytes;
            counters.last_peak_seq = peak_seq;
        }
        counters
    }

    fn record_allocation(&mut self, key: LocationKey, address: u64, size: u64) {
        let counters = self.location(key);
        counters.cur_count += 1;
        counters.cur_bytes += size;
        self.live.insert(address, LiveAllocation { key, size });
        self.current_bytes += size;
        if self.current_bytes > self.peak_bytes {
            self.peak_bytes = self.current_bytes;
            self.peak_seq += 1;
            let peak_seq = self.peak_seq;
            if let Some(counters) = self.locations.get_mut(&key) {
                counters.hwm_count = counters.cur_count;
                counters.hwm_bytes = counters.cur_bytes;
                counters.last_peak_seq = peak_seq;
            }
        }
    }

    fn record_deallocation(&mut self, address: u64) {
        let Some(live) = self.live.remove(&address) else {
            // Free of an address we never saw; skipped, as everywhere.
            return;
        };
        let counters = self.location(live.key);
        counters.cur_count = counters.cur_count.saturating_sub(1);
        counters.cur_bytes = counters.cur_bytes.saturating_sub(live.size);
        self.current_bytes = self.current_bytes.saturating_sub(live.size);
    }

    fn drain(self) -> Vec<AggregatedAllocation> {
        let peak_seq = self.peak_seq;
        self.locations
            .into_iter()
            .map(|(key, counters)| {
                // Untouched since the last peak means the current values
                // are the values at that peak.
                let (hwm_count, hwm_bytes) = if counters.last_peak_seq == peak_seq {
                    (counters.hwm_count, counters.hwm_bytes)
                } else {
                    (counters.cur_count, counters.cur_bytes)
                };
                AggregatedAllocation {
                    tid: key.tid,
                    kind: key.kind,
                    python_stack_id: key.python_stack_id,
                    native_frame_index: key.native_frame_index,
                    n_allocations_in_high_water_mark: hwm_count,
                    bytes_in_high_water_mark: hwm_bytes,
                    n_allocations_leaked: counters.cur_count,
                    bytes_leaked: counters.cur_bytes,
                }
            })
            .collect()
    }
}

impl WriterState {
    fn log_write_error(&mut self, error: &WriteError) {
        if !self.io_error_logged {
            self.io_error_logged = true;
            tracing::error!(%error, "capture write failed; recording disabled");
        }
    }

    fn apply<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R, WriteError>) -> Option<R> {
        match op(self) {
            Ok(value) => Some(value),
            Err(error) => {
                self.log_write_error(&error);
                None
            }
        }
    }

    /// Interns a native stack (innermost first), emitting records for new
    /// nodes. Returns the leaf index.
    fn intern_native_stack(&mut self, ips: &[u64]) -> Result<u32, WriteError> {
        let mut parent = 0u32;
        for &ip in ips.iter().rev() {
            let next = match self.native.nodes.get(&(parent, ip)).copied() {
                Some(index) => index,
                None => {
                    self.native.next_index += 1;
                    let index = self.native.next_index;
                    self.native.nodes.insert((parent, ip), index);
                    self.writer.write_native_frame(ip, parent)?;
                    index
                }
            };
            parent = next;
        }
        Ok(parent)
    }

    /// Writes out the calling thread's buffered frame pops and pushes so
    /// replay reconstructs its current stack at the next allocation.
    fn flush_python_stack(&mut self, tid: u64) -> Result<(), WriteError> {
        shadow_stack::with_stack(|stack| {
            if stack.pending_pops > 0 {
                self.writer.write_frame_pop(tid, stack.pending_pops)?;
                stack.pending_pops = 0;
            }
            for frame in &stack.frames[stack.emitted..] {
                if self.seen_code.insert(frame.code.id) {
                    self.writer.write_code_object(&frame.code)?;
                }
                self.writer.write_frame_push(
                    tid,
                    FramePush {
                        code_id: frame.code.id,
                        offset: frame.offset,
                        is_entry: frame.is_entry,
                    },
                )?;
            }
            stack.emitted = stack.frames.len();
            Ok(())
        })
    }

    /// Aggregated mode: interns the calling thread's interpreted stack
    /// into the stream's prefix tree and returns the leaf id.
    fn intern_python_stack(&mut self) -> Result<u32, WriteError> {
        shadow_stack::with_stack(|stack| {
            let start = stack.interned.len();
            for depth in start..stack.frames.len() {
                let frame = &stack.frames[depth];
                if self.seen_code.insert(frame.code.id) {
                    self.writer.write_code_object(&frame.code)?;
                }
                let parent = if depth == 0 {
                    0
                } else {
                    stack.interned[depth - 1]
                };
                let key = (parent, frame.code.id, frame.offset, frame.is_entry);
                let existing = self
                    .aggregate
                    .as_ref()
                    .and_then(|a| a.python_nodes.get(&key))
                    .copied();
                let id = match existing {
                    Some(id) => id,
                    None => {
                        let aggregate = self
                            .aggregate
                            .as_mut()
                            .ok_or(WriteError::Sink(SinkError::Closed))?;
                        aggregate.python_next += 1;
                        let id = aggregate.python_next;
                        aggregate.python_nodes.insert(key, id);
                        self.writer.write_python_stack_index(PythonStackIndex {
                            id,
                            parent,
                            code_id: frame.code.id,
                            offset: frame.offset,
                            is_entry: frame.is_entry,
                        })?;
                        id
                    }
                };
                stack.interned.push(id);
            }
            Ok(stack.interned.last().copied().unwrap_or(0))
        })
    }
}

impl Tracker {
    /// Installs a tracker for the whole process.
    ///
    /// Fails with [`InstallError::AlreadyInstalled`] when one is active.
    pub fn install(config: TrackerConfig, host: Arc<dyn HostRuntime>) -> Result<(), InstallError> {
        let _lock = INSTALL_LOCK.lock();
        if !TRACKER.load(Ordering::Acquire).is_null() {
            return Err(InstallError::AlreadyInstalled);
        }

        hooks::initialize();

        let capture_path = match config.destination() {
            Destination::File { path, .. } if !config.destination().is_null_device() => {
                Some(path.clone())
            }
            _ => None,
        };
        let sink = open_sink(&config)?;
        let header = build_header(&config, host.as_ref(), std::process::id() as u64);
        let writer = RecordWriter::new(sink, header)?;

        let tracker = Box::new(Tracker {
            writer: Mutex::new(WriterState {
                writer,
                seen_code: FxHashSet::default(),
                native: NativeFrameTree::default(),
                aggregate: config.aggregate().then(AggregateState::default),
                io_error_logged: false,
            }),
            sampler: Mutex::new(None),
            capture_path,
            host: Arc::clone(&host),
            config,
        });

        if tracker.config.native_traces() {
            let mut state = tracker.writer.lock();
            state.native.start_generation();
            write_current_images(&mut state)?;
        }

        host.attach_profile_hook();
        fork::register_fork_handlers();

        let tracker = Box::into_raw(tracker);
        TRACKER.store(tracker, Ordering::Release);

        // SAFETY: just published; only teardown frees it, under the
        // install lock we still hold.
        let tracker = unsafe { &*tracker };
        *tracker.sampler.lock() = Some(MemorySampler::start(
            tracker.config.memory_interval_ms(),
        ));

        tracing::info!("allocation tracker installed");
        Ok(())
    }

    /// Tears the tracker down, draining in-flight hooks and closing the
    /// capture. Idempotent: a second call is a no-op.
    pub fn teardown() -> Result<(), WriteError> {
        let _lock = INSTALL_LOCK.lock();
        let ptr = TRACKER.swap(ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            return Ok(());
        }
        // SAFETY: we unpublished the pointer; after the spin below no hook
        // holds a reference anymore, so we own the box again.
        let tracker = unsafe { &*ptr };
        while guard::threads_in_tracker() > 0 {
            std::thread::yield_now();
        }

        tracker.host.detach_profile_hook();
        shadow_stack::forget_all_threads();
        crate::ffi::clear_code_registry();
        ghost_stack::reset();

        if let Some(sampler) = tracker.sampler.lock().take() {
            sampler.stop();
        }

        let result = {
            let mut state = tracker.writer.lock();
            let end_time_ms = epoch_millis();
            let finish = (|state: &mut WriterState| -> Result<(), WriteError> {
                if let Some(aggregate) = state.aggregate.take() {
                    for record in aggregate.drain() {
                        state.writer.write_aggregated_allocation(&record)?;
                    }
                }
                state.writer.write_trailer(end_time_ms)?;
                state.writer.finalize(end_time_ms)
            })(&mut state);
            finish
        };

        // SAFETY: see above; all references are gone.
        drop(unsafe { Box::from_raw(ptr) });
        tracing::info!("allocation tracker torn down");
        result
    }

    pub fn is_installed() -> bool {
        !TRACKER.load(Ordering::Acquire).is_null()
    }

    /// The installed tracker, if any. Callers on the hook path must hold
    /// the reentrancy guard *before* calling this; teardown relies on
    /// that ordering to know when the reference is dead.
    pub(crate) fn current() -> Option<&'static Tracker> {
        let ptr = TRACKER.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: teardown waits for in-flight guard holders before
            // freeing, and we only hand this out to guard holders.
            Some(unsafe { &*ptr })
        }
    }

    pub(crate) fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Records one allocation event. The caller holds the reentrancy
    /// guard.
    pub(crate) fn record_allocation(&self, kind: AllocatorKind, address: u64, size: u64) {
        debug_assert!(!kind.is_deallocator());
        let tid = current_thread_id();
        let mut ips = IpBuffer::new();
        let have_native = self.config.native_traces() && {
            if self.config.ghost_stack() {
                ghost_stack::capture(unwind::TRACKER_FRAMES_TO_SKIP, &mut ips)
                    || {
                        unwind::capture_ips(unwind::TRACKER_FRAMES_TO_SKIP, &mut ips);
                        true
                    }
            } else {
                unwind::capture_ips(unwind::TRACKER_FRAMES_TO_SKIP, &mut ips);
                true
            }
        };

        let mut state = self.writer.lock();
        if state.aggregate.is_some() {
            state.apply(|state| {
                let python_stack_id = state.intern_python_stack()?;
                let native_frame_index = if have_native {
                    state.intern_native_stack(&ips)?
                } else {
                    0
                };
                let key = LocationKey {
                    tid,
                    kind,
                    python_stack_id,
                    native_frame_index,
                };
                if let Some(aggregate) = state.aggregate.as_mut() {
                    aggregate.record_allocation(key, address, size);
                }
                Ok(())
            });
        } else {
            state.apply(|state| {
                state.flush_python_stack(tid)?;
                let native_frame_index = if have_native {
                    Some(state.intern_native_stack(&ips)?)
                } else {
                    None
                };
                state
                    .writer
                    .write_allocation(tid, kind, address, size, native_frame_index)
            });
        }
    }

    /// Records one deallocation event. Stack traces are intentionally not
    /// captured for deallocations.
    pub(crate) fn record_deallocation(&self, kind: AllocatorKind, address: u64) {
        debug_assert!(kind.is_deallocator());
        let tid = current_thread_id();
        let mut state = self.writer.lock();
        if state.aggregate.is_some() {
            if let Some(aggregate) = state.aggregate.as_mut() {
                aggregate.record_deallocation(address);
            }
        } else {
            state.apply(|state| state.writer.write_allocation(tid, kind, address, 0, None));
        }
    }

    pub(crate) fn write_memory_record(&self, record: MemoryRecord) {
        let mut state = self.writer.lock();
        state.apply(|state| state.writer.write_memory_record(record));
    }

    pub(crate) fn write_thread_name(&self, name: &str) {
        let tid = current_thread_id();
        let mut state = self.writer.lock();
        state.apply(|state| state.writer.write_thread_name(tid, name));
    }

    /// Re-captures the loaded images under a fresh segment generation.
    /// Called after every successful `dlopen`.
    pub(crate) fn refresh_images(&self) {
        if !self.config.native_traces() {
            return;
        }
        let mut state = self.writer.lock();
        state.native.start_generation();
        state.apply(write_current_images);
    }

    /// Child-side fork handler body. Runs on the only thread that exists
    /// in the child, with the writer lock reacquirable.
    pub(crate) fn reinit_in_child(&self) {
        ghost_stack::reset();
        shadow_stack::mark_all_unemitted();

        let Some(path) = self
            .capture_path
            .as_ref()
            .filter(|_| self.config.follow_fork())
        else {
            // Not following forks (or not a file capture): the child
            // simply stops tracking. The tracker box is leaked in the
            // child; reclaiming it would race the parent's teardown state
            // we inherited.
            TRACKER.store(ptr::null_mut(), Ordering::Release);
            return;
        };

        let pid = std::process::id() as u64;
        let mut child_path = path.clone().into_os_string();
        child_path.push(format!(".{pid}"));

        let mut state = self.writer.lock();
        let sink: Box<dyn Sink> = match FileSink::create(
            &PathBuf::from(child_path),
            true,
            self.config.compress_on_exit(),
        ) {
            Ok(sink) => Box::new(sink),
            Err(error) => {
                tracing::error!(%error, "could not open child capture; tracking stops");
                TRACKER.store(ptr::null_mut(), Ordering::Release);
                return;
            }
        };
        let header = build_header(&self.config, self.host.as_ref(), pid);
        match RecordWriter::new(sink, header) {
            Ok(writer) => {
                state.writer = writer;
                state.seen_code.clear();
                state.native = NativeFrameTree::default();
                state.io_error_logged = false;
                if self.config.aggregate() {
                    state.aggregate = Some(AggregateState::default());
                }
                if self.config.native_traces() {
                    state.native.start_generation();
                    state.apply(write_current_images);
                }
            }
            Err(error) => {
                tracing::error!(%error, "could not write child capture header");
                TRACKER.store(ptr::null_mut(), Ordering::Release);
                return;
            }
        }
        drop(state);

        *self.sampler.lock() = Some(MemorySampler::start(self.config.memory_interval_ms()));
    }

    /// Force-unlocks the writer mutex in fork handlers.
    ///
    /// # Safety
    ///
    /// Only the atfork parent/child handlers may call this, and only to
    /// release the lock taken by the prepare handler.
    pub(crate) unsafe fn force_unlock_writer(&self) {
        self.writer.force_unlock();
    }

    pub(crate) fn lock_writer_for_fork(&self) {
        std::mem::forget(self.writer.lock());
    }
}

fn open_sink(config: &TrackerConfig) -> Result<Box<dyn Sink>, SinkError> {
    Ok(match config.destination() {
        _ if config.destination().is_null_device() => Box::new(NullSink),
        Destination::File { path, overwrite } => Box::new(FileSink::create(
            path,
            *overwrite,
            config.compress_on_exit(),
        )?),
        Destination::Tcp { addr } => Box::new(SocketSink::connect(addr.as_str())?),
    })
}

fn build_header(config: &TrackerConfig, host: &dyn HostRuntime, pid: u64) -> CaptureHeader {
    CaptureHeader {
        file_format: if config.aggregate() {
            FileFormat::AggregatedRecords
        } else {
            FileFormat::AllRecords
        },
        native_traces: config.native_traces(),
        trace_pool_allocator: config.trace_pool_allocator(),
        pool_allocator: PoolAllocatorId::from_name(host.pool_allocator_name()),
        pid,
        main_tid: current_thread_id(),
        skipped_frames_on_main_thread: config.skipped_frames_on_main_thread(),
        stats: HeaderStats {
            start_time_ms: epoch_millis(),
            ..HeaderStats::default()
        },
        command_line: host.command_line().join(" "),
    }
}

fn write_current_images(state: &mut WriterState) -> Result<(), WriteError> {
    let images = crate::images::collect_images();
    state.writer.write_segments_start(images.len() as u64)?;
    for image in &images {
        state.writer.write_image_segments(image)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::guard::ReentrancyGuard;
    use crate::host::NullHostRuntime;
    use memtrail_format::{FileSource, RawRecord, RecordParser};

    /// Install/teardown mutate process-global state; tests sharing it must
    /// not overlap.
    pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn file_config(path: &std::path::Path) -> TrackerConfig {
        let mut config = TrackerConfig::to_file(path, true).unwrap();
        // Compression off so tests can also peek at raw bytes.
        config = TrackerConfig::new(
            config.destination().clone(),
            false,
            false,
            false,
            false,
            1000,
            false,
            false,
            0,
        )
        .unwrap();
        config
    }

    fn parse_all(path: &std::path::Path) -> (CaptureHeader, Vec<RawRecord>) {
        let mut parser = RecordParser::new(FileSource::open(path).unwrap());
        let header = parser.read_header().unwrap();
        let mut records = Vec::new();
        while let Some(record) = parser.next_record().unwrap() {
            records.push(record);
        }
        (header, records)
    }

    #[test]
    fn test_thread_ids_are_stable_and_distinct() {
        // Records from one thread must share an id, and two threads must
        // never collide, or the reader's per-thread replay tables merge.
        let on_main = current_thread_id();
        assert_ne!(on_main, 0);
        assert_eq!(on_main, current_thread_id());
        let on_worker = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(on_main, on_worker);
    }

    #[test]
    fn test_install_teardown_lifecycle() {
        let _lock = TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        Tracker::install(file_config(&path), Arc::new(NullHostRuntime)).unwrap();
        assert!(Tracker::is_installed());

        // Second install while active must fail.
        let second = Tracker::install(file_config(&dir.path().join("other.bin")),
            Arc::new(NullHostRuntime));
        assert!(matches!(second, Err(InstallError::AlreadyInstalled)));

        Tracker::teardown().unwrap();
        assert!(!Tracker::is_installed());
        // Teardown is idempotent.
        Tracker::teardown().unwrap();

        let (header, records) = parse_all(&path);
        assert_eq!(header.pid, std::process::id() as u64);
        assert!(header.stats.end_time_ms >= header.stats.start_time_ms);
        assert!(matches!(records.last(), Some(RawRecord::Trailer(_))));
    }

    #[test]
    fn test_recorded_allocations_roundtrip() {
        let _lock = TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        Tracker::install(file_config(&path), Arc::new(NullHostRuntime)).unwrap();
        {
            let _guard = ReentrancyGuard::acquire().unwrap();
            let tracker = Tracker::current().unwrap();
            tracker.record_allocation(AllocatorKind::Valloc, 0xDEAD000, 1234);
            tracker.record_deallocation(AllocatorKind::Free, 0xDEAD000);
        }
        Tracker::teardown().unwrap();

        let (header, records) = parse_all(&path);
        assert_eq!(header.stats.n_allocations, 2);
        let allocations: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                RawRecord::Allocation { kind, size, .. } => Some((*kind, *size)),
                _ => None,
            })
            .collect();
        assert_eq!(
            allocations,
            vec![
                (AllocatorKind::Valloc, Some(1234)),
                (AllocatorKind::Free, None),
            ]
        );
    }

    #[test]
    fn test_python_stack_flushes_before_allocations() {
        let _lock = TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        Tracker::install(file_config(&path), Arc::new(NullHostRuntime)).unwrap();

        let code = Arc::new(memtrail_format::CodeObject {
            id: 71,
            function_name: "handler".into(),
            filename: "svc.py".into(),
            first_line: 5,
            line_table: memtrail_format::LineTable::default(),
        });
        shadow_stack::forget_all_threads();
        shadow_stack::on_frame_entry(&code, 0, true);
        shadow_stack::on_frame_entry(&code, 8, false);
        {
            let _guard = crate::guard::ReentrancyGuard::acquire().unwrap();
            let tracker = Tracker::current().unwrap();
            tracker.record_allocation(AllocatorKind::Malloc, 0x100, 16);
            // Pop one frame; the pop is buffered until the next event.
            shadow_stack::on_frame_exit();
            tracker.record_allocation(AllocatorKind::Malloc, 0x200, 16);
        }
        shadow_stack::on_frame_exit();
        Tracker::teardown().unwrap();

        let (_, records) = parse_all(&path);
        let shape: Vec<&'static str> = records
            .iter()
            .filter_map(|r| match r {
                RawRecord::CodeObject(_) => Some("code"),
                RawRecord::FramePush(_) => Some("push"),
                RawRecord::FramePop { .. } => Some("pop"),
                RawRecord::Allocation { .. } => Some("alloc"),
                _ => None,
            })
            .collect();
        // The code object is emitted once, both pushes precede the first
        // allocation, and the buffered pop lands before the second.
        assert_eq!(
            shape,
            vec!["code", "push", "push", "alloc", "pop", "alloc"]
        );
    }

    #[test]
    fn test_concurrent_hook_recording() {
        let _lock = TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        Tracker::install(file_config(&path), Arc::new(NullHostRuntime)).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    for _ in 0..50 {
                        // Real allocator traffic through the wrappers.
                        let ptr = unsafe { crate::hooks::tracked_malloc(64) };
                        assert!(!ptr.is_null());
                        unsafe { crate::hooks::tracked_free(ptr) };
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        Tracker::teardown().unwrap();

        let (header, records) = parse_all(&path);
        // 8 threads x 50 mallocs and 50 frees each; nothing else in this
        // process routes through the wrappers.
        assert_eq!(header.stats.n_allocations, 800);
        assert!(matches!(records.last(), Some(RawRecord::Trailer(_))));

        // Conservation: replaying the per-thread address deltas, every
        // malloc has a matching free.
        let mut current_tid = 0u64;
        let mut last_address: FxHashMap<u64, u64> = FxHashMap::default();
        let mut live: FxHashMap<u64, u64> = FxHashMap::default();
        for record in &records {
            match record {
                RawRecord::ContextSwitch { tid } => current_tid = *tid,
                RawRecord::Allocation {
                    kind,
                    address_delta,
                    size,
                    ..
                } => {
                    let last = last_address.entry(current_tid).or_insert(0);
                    let address = last.wrapping_add(*address_delta as u64);
                    *last = address;
                    if kind.is_deallocator() {
                        live.remove(&address);
                    } else {
                        live.insert(address, size.unwrap_or(0));
                    }
                }
                _ => {}
            }
        }
        assert!(live.is_empty(), "leaked records: {live:?}");
    }

    #[test]
    fn test_aggregated_capture_contains_counters() {
        let _lock = TEST_LOCK.lock();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        let config = TrackerConfig::new(
            Destination::File {
                path: path.clone(),
                overwrite: true,
            },
            false,
            false,
            false,
            false,
            1000,
            true,
            false,
            0,
        )
        .unwrap();
        Tracker::install(config, Arc::new(NullHostRuntime)).unwrap();
        {
            let _guard = ReentrancyGuard::acquire().unwrap();
            let tracker = Tracker::current().unwrap();
            // Peak of 300 bytes, 100 of which leak.
            tracker.record_allocation(AllocatorKind::Malloc, 0x1000, 100);
            tracker.record_allocation(AllocatorKind::Malloc, 0x2000, 200);
            tracker.record_deallocation(AllocatorKind::Free, 0x2000);
            // Free of an unseen address is skipped.
            tracker.record_deallocation(AllocatorKind::Free, 0x9999);
        }
        Tracker::teardown().unwrap();

        let (header, records) = parse_all(&path);
        assert_eq!(header.file_format, FileFormat::AggregatedRecords);
        let aggregated: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                RawRecord::AggregatedAllocation(a) => Some(*a),
                _ => None,
            })
            .collect();
        assert_eq!(aggregated.len(), 1);
        let agg = aggregated[0];
        assert_eq!(agg.n_allocations_in_high_water_mark, 2);
        assert_eq!(agg.bytes_in_high_water_mark, 300);
        assert_eq!(agg.n_allocations_leaked, 1);
        assert_eq!(agg.bytes_leaked, 100);
        assert!(matches!(records.last(), Some(RawRecord::Trailer(_))));
    }

    #[test]
    fn test_native_tree_interns_equal_stacks_once() {
        let mut state = WriterState {
            writer: RecordWriter::new(
                Box::new(memtrail_format::VecSink::new()) as Box<dyn Sink>,
                build_header(
                    &TrackerConfig::to_file("/dev/null", true).unwrap(),
                    &NullHostRuntime,
                    1,
                ),
            )
            .unwrap(),
            seen_code: FxHashSet::default(),
            native: NativeFrameTree::default(),
            aggregate: None,
            io_error_logged: false,
        };
        let stack = [0xCCC, 0xBBB, 0xAAA];
        let first = state.intern_native_stack(&stack).unwrap();
        let second = state.intern_native_stack(&stack).unwrap();
        assert_eq!(first, second);
        // A shared prefix reuses the existing nodes.
        let sibling = state.intern_native_stack(&[0xDDD, 0xBBB, 0xAAA]).unwrap();
        assert_ne!(sibling, first);
        assert_eq!(state.native.nodes.len(), 4);
        // Cache invalidation: a new generation re-interns from scratch.
        state.native.start_generation();
        let fresh = state.intern_native_stack(&stack).unwrap();
        assert_eq!(fresh, first);
        assert_eq!(state.native.nodes.len(), 3);
    }

    #[test]
    fn test_aggregate_state_hwm_per_location() {
        // Location A peaks while B is empty; B's later growth stays under
        // the global peak, so A keeps the peak attribution.
        let mut state = AggregateState::default();
        let key_a = LocationKey {
            tid: 1,
            kind: AllocatorKind::Malloc,
            python_stack_id: 1,
            native_frame_index: 0,
        };
        let key_b = LocationKey {
            python_stack_id: 2,
            ..key_a
        };
        state.record_allocation(key_a, 0x1, 1000);
        state.record_deallocation(0x1);
        state.record_allocation(key_b, 0x2, 10);
        let mut drained = state.drain();
        drained.sort_by_key(|a| a.python_stack_id);
        assert_eq!(drained[0].bytes_in_high_water_mark, 1000);
        assert_eq!(drained[0].bytes_leaked, 0);
        assert_eq!(drained[1].bytes_in_high_water_mark, 0);
        assert_eq!(drained[1].bytes_leaked, 10);
    }

    #[test]
    fn test_aggregate_state_new_peak_updates_both() {
        let mut state = AggregateState::default();
        let key_a = LocationKey {
            tid: 1,
            kind: AllocatorKind::Malloc,
            python_stack_id: 1,
            native_frame_index: 0,
        };
        let key_b = LocationKey {
            python_stack_id: 2,
            ..key_a
        };
        state.record_allocation(key_a, 0x1, 100);
        state.record_allocation(key_b, 0x2, 50);
        state.record_deallocation(0x1);
        // New global peak (160 > 150) while A holds 0 bytes.
        state.record_allocation(key_b, 0x3, 110);
        let mut drained = state.drain();
        drained.sort_by_key(|a| a.python_stack_id);
        assert_eq!(drained[0].bytes_in_high_water_mark, 0);
        assert_eq!(drained[1].bytes_in_high_water_mark, 160);
    }
}
