// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where the capture stream goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// A capture file. The null device is recognized and degrades to a
    /// discarding sink.
    File { path: PathBuf, overwrite: bool },
    /// A live viewer listening on a TCP endpoint.
    Tcp { addr: String },
}

impl Destination {
    pub fn is_file(&self) -> bool {
        matches!(self, Destination::File { .. })
    }

    pub(crate) fn is_null_device(&self) -> bool {
        match self {
            Destination::File { path, .. } => path.as_path() == std::path::Path::new("/dev/null"),
            Destination::Tcp { .. } => false,
        }
    }
}

/// Validated tracker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    destination: Destination,
    native_traces: bool,
    ghost_stack: bool,
    trace_pool_allocator: bool,
    follow_fork: bool,
    memory_interval_ms: u64,
    aggregate: bool,
    compress_on_exit: bool,
    skipped_frames_on_main_thread: u64,
}

impl TrackerConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        destination: Destination,
        native_traces: bool,
        ghost_stack: bool,
        trace_pool_allocator: bool,
        follow_fork: bool,
        memory_interval_ms: u64,
        aggregate: bool,
        compress_on_exit: bool,
        skipped_frames_on_main_thread: u64,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            memory_interval_ms > 0,
            "memory sample interval must be positive"
        );
        anyhow::ensure!(
            !ghost_stack || native_traces,
            "the ghost stack requires native traces"
        );
        anyhow::ensure!(
            !follow_fork || destination.is_file(),
            "follow-fork is supported only with file destinations"
        );
        anyhow::ensure!(
            !aggregate || destination.is_file(),
            "the aggregated format is supported only with file destinations"
        );
        Ok(TrackerConfig {
            destination,
            native_traces,
            ghost_stack,
            trace_pool_allocator,
            follow_fork,
            memory_interval_ms,
            aggregate,
            compress_on_exit,
            skipped_frames_on_main_thread,
        })
    }

    /// File capture with the defaults the CLI's `run` verb uses.
    pub fn to_file<P: Into<PathBuf>>(path: P, overwrite: bool) -> anyhow::Result<Self> {
        Self::new(
            Destination::File {
                path: path.into(),
                overwrite,
            },
            false,
            false,
            false,
            false,
            10,
            false,
            true,
            0,
        )
    }

    /// Live capture to a viewer listening on `addr`.
    pub fn to_tcp<A: Into<String>>(addr: A) -> anyhow::Result<Self> {
        Self::new(
            Destination::Tcp { addr: addr.into() },
            false,
            false,
            false,
            false,
            10,
            false,
            false,
            0,
        )
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn native_traces(&self) -> bool {
        self.native_traces
    }

    pub fn ghost_stack(&self) -> bool {
        self.ghost_stack
    }

    pub fn trace_pool_allocator(&self) -> bool {
        self.trace_pool_allocator
    }

    pub fn follow_fork(&self) -> bool {
        self.follow_fork
    }

    pub fn memory_interval_ms(&self) -> u64 {
        self.memory_interval_ms
    }

    pub fn aggregate(&self) -> bool {
        self.aggregate
    }

    pub fn compress_on_exit(&self) -> bool {
        self.compress_on_exit
    }

    pub fn skipped_frames_on_main_thread(&self) -> u64 {
        self.skipped_frames_on_main_thread
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::to_file("/tmp/capture.bin", true).unwrap();
        assert!(!config.native_traces());
        assert!(!config.aggregate());
        assert!(config.compress_on_exit());
        assert_eq!(config.memory_interval_ms(), 10);
    }

    #[test]
    fn test_ghost_stack_requires_native_traces() {
        let result = TrackerConfig::new(
            Destination::File {
                path: "/tmp/x".into(),
                overwrite: true,
            },
            false,
            true,
            false,
            false,
            10,
            false,
            false,
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_follow_fork_rejected_for_tcp() {
        let result = TrackerConfig::new(
            Destination::Tcp {
                addr: "127.0.0.1:5000".into(),
            },
            false,
            false,
            false,
            true,
            10,
            false,
            false,
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_aggregate_rejected_for_tcp() {
        let result = TrackerConfig::new(
            Destination::Tcp {
                addr: "127.0.0.1:5000".into(),
            },
            false,
            false,
            false,
            false,
            10,
            true,
            false,
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = TrackerConfig::to_file("/tmp/x", true).unwrap();
        config.memory_interval_ms = 10;
        assert!(TrackerConfig::new(
            config.destination.clone(),
            false,
            false,
            false,
            false,
            0,
            false,
            false,
            0,
        )
        .is_err());
    }

    #[test]
    fn test_null_device_detection() {
        let config = TrackerConfig::to_file("/dev/null", true).unwrap();
        assert!(config.destination().is_null_device());
    }

    #[test]
    fn test_config_serializes() {
        let config = TrackerConfig::to_file("/tmp/capture.bin", true).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: TrackerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
