// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background consumption of a live capture stream. A dedicated thread
//! drains the socket and folds allocation events into a snapshot
//! aggregator; callers poll [`LiveReaderHandle::current_snapshot`] at
//! their own cadence. Stopping closes the underlying source, which
//! unblocks the thread.

use crate::aggregators::{AllocationRecord, SnapshotAggregator};
use crate::reader::{CaptureReader, Event};
use memtrail_format::{CaptureHeader, MemoryRecord, SocketShutdown, SocketSource, Source};
use parking_lot::Mutex;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Default)]
struct LiveState {
    snapshot: SnapshotAggregator,
    latest_memory: Option<MemoryRecord>,
    finished: bool,
    error: Option<String>,
}

pub struct LiveReaderHandle {
    state: Arc<Mutex<LiveState>>,
    header: CaptureHeader,
    shutdown: Option<SocketShutdown>,
    thread: Option<JoinHandle<()>>,
}

impl LiveReaderHandle {
    /// Binds `addr`, waits for the tracked process to connect, and starts
    /// draining its stream.
    pub fn accept<A: ToSocketAddrs>(addr: A) -> anyhow::Result<Self> {
        let source = SocketSource::accept(addr)?;
        let shutdown = source.shutdown_handle()?;
        Self::spawn(source, Some(shutdown))
    }

    /// Starts draining an already-connected source.
    pub fn spawn<S: Source + 'static>(
        source: S,
        shutdown: Option<SocketShutdown>,
    ) -> anyhow::Result<Self> {
        let reader = CaptureReader::from_source(source)?;
        let header = reader.header().clone();
        let state = Arc::new(Mutex::new(LiveState::default()));
        let thread_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("memtrail-live-reader".to_string())
            .spawn(move || drain(reader, thread_state))?;
        Ok(LiveReaderHandle {
            state,
            header,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    /// Per-location records of everything currently live in the tracked
    /// process, as of the latest drained record.
    pub fn current_snapshot(&self, merge_threads: bool) -> Vec<AllocationRecord> {
        self.state.lock().snapshot.records(merge_threads)
    }

    pub fn latest_memory_record(&self) -> Option<MemoryRecord> {
        self.state.lock().latest_memory
    }

    /// Whether the stream reached its trailer (or died).
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    /// Closes the source and joins the drain thread.
    pub fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.shutdown();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn drain<S: Source>(mut reader: CaptureReader<S>, state: Arc<Mutex<LiveState>>) {
    loop {
        match reader.next_event() {
            Ok(Event::Allocation(event)) => state.lock().snapshot.process(&event),
            Ok(Event::MemoryRecord(record)) => state.lock().latest_memory = Some(record),
            Ok(Event::AggregatedAllocation(_)) => {
                // The live protocol never carries aggregated captures.
            }
            Ok(Event::Eof) | Ok(Event::Truncated { .. }) => break,
            Err(error) => {
                let mut state = state.lock();
                state.error = Some(error.to_string());
                break;
            }
        }
    }
    state.lock().finished = true;
}
