//! peerlink call statistics
//!
//! Per-connection statistics for remote calls: call counts, success and
//! failure counters, and latency percentiles per method. It also remembers
//! interface names a peer announced that this side could not resolve.
//!
//! # Architecture
//!
//! - [`StatisticsRegistry`]: thread-safe storage with lock-free counters
//! - [`StatisticsCollector`]: the trait the connection runtime records through
//! - [`StatisticsSnapshot`]: serializable copy of the current state
//!
//! # Usage Example
//!
//! ```rust
//! use peerlink_metrics::{ConnectionStatistics, StatisticsCollector};
//! use std::time::Instant;
//!
//! let statistics = ConnectionStatistics::new();
//!
//! let start = Instant::now();
//! // ... remote call ...
//! statistics.record_call("Echo.echo(String)", start, true);
//!
//! println!("{}", statistics.dump_summary());
//! ```

mod collector;
mod registry;
mod snapshot;

pub use collector::{ConnectionStatistics, StatisticsCollector};
pub use registry::{StatisticsConfig, StatisticsRegistry};
pub use snapshot::{MethodStatistics, StatisticsSnapshot};
