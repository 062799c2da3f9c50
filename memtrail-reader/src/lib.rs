// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! The post-mortem half of memtrail: a sequential capture decoder with
//! replayed stack reconstruction, lazy native symbolization, and the
//! aggregators reporters are built on (high-water mark, snapshots,
//! temporary allocations, temporal intervals, whole-capture stats). A
//! live-stream consumer thread serves on-demand snapshots of an
//! in-progress capture.

pub mod aggregators;
pub mod live;
pub mod reader;
pub mod stacks;
pub mod symbols;

pub use aggregators::{
    AllocationRecord, HighWaterMarkFinder, Interval, LocationKey, SnapshotAggregator,
    StatsAggregator, TemporalIntervalBuilder, TemporaryAllocationDetector,
};
pub use live::LiveReaderHandle;
pub use reader::{AllocationEvent, CaptureReader, Event, PythonFrame, ReaderError};
pub use symbols::{ResolvedNativeFrame, SymbolResolver};
