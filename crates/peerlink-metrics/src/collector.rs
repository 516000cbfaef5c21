// Copyright 2025 peerlink Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::registry::{StatisticsConfig, StatisticsRegistry};
use crate::snapshot::StatisticsSnapshot;
use std::sync::Arc;
use std::time::Instant;

/// Trait for collecting call statistics on a connection.
///
/// The connection runtime only talks to this trait, so tests and embedders
/// can plug in their own sink.
///
/// # Example
///
/// ```rust
/// use peerlink_metrics::{ConnectionStatistics, StatisticsCollector};
/// use std::time::Instant;
///
/// let statistics = ConnectionStatistics::new();
///
/// let start = Instant::now();
/// // ... perform the remote call ...
/// statistics.record_call("Echo.echo(String)", start, true);
///
/// assert_eq!(statistics.snapshot().total_calls, 1);
/// ```
pub trait StatisticsCollector: Send + Sync {
    /// Records a completed call.
    ///
    /// # Arguments
    /// * `method` - Display form of the called method
    /// * `start_time` - When the call started
    /// * `success` - Whether the call returned normally
    fn record_call(&self, method: &str, start_time: Instant, success: bool);

    /// Records an interface name that could not be resolved.
    fn record_inaccessible_interface(&self, interface: &str);

    /// Returns a point-in-time snapshot.
    fn snapshot(&self) -> StatisticsSnapshot;

    /// Renders the current statistics as a human-readable table.
    fn dump_summary(&self) -> String {
        self.snapshot().summary()
    }
}

/// Default [`StatisticsCollector`] backed by a [`StatisticsRegistry`].
///
/// Cloning shares the underlying registry.
#[derive(Debug, Clone)]
pub struct ConnectionStatistics {
    registry: Arc<StatisticsRegistry>,
}

impl ConnectionStatistics {
    /// Creates a collector with default limits.
    pub fn new() -> Self {
        Self::with_config(StatisticsConfig::default())
    }

    /// Creates a collector with custom limits.
    pub fn with_config(config: StatisticsConfig) -> Self {
        Self {
            registry: Arc::new(StatisticsRegistry::with_config(config)),
        }
    }

    /// Returns the underlying registry.
    pub fn registry(&self) -> &Arc<StatisticsRegistry> {
        &self.registry
    }
}

impl Default for ConnectionStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsCollector for ConnectionStatistics {
    fn record_call(&self, method: &str, start_time: Instant, success: bool) {
        let latency_us = start_time.elapsed().as_micros() as u64;
        self.registry.record_method_call(method, latency_us, success);
    }

    fn record_inaccessible_interface(&self, interface: &str) {
        self.registry.record_inaccessible_interface(interface);
    }

    fn snapshot(&self) -> StatisticsSnapshot {
        self.registry.snapshot()
    }
}
