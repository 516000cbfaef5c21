use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

/// Statistics for a single remote method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodStatistics {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Point-in-time copy of a connection's call statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub uptime_ms: u64,
    pub methods: HashMap<String, MethodStatistics>,
    /// Interface names a peer announced but this side could not resolve,
    /// with how many times each was seen.
    pub inaccessible_interfaces: BTreeMap<String, u64>,
}

impl StatisticsSnapshot {
    /// Serializes the snapshot to a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Renders the snapshot as a human-readable table.
    ///
    /// Methods are listed by descending call count, then by name.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "calls: {} (ok {}, failed {}), uptime {} ms",
            self.total_calls, self.successful_calls, self.failed_calls, self.uptime_ms
        );

        let mut methods: Vec<_> = self.methods.iter().collect();
        methods.sort_by(|a, b| b.1.call_count.cmp(&a.1.call_count).then(a.0.cmp(b.0)));

        if !methods.is_empty() {
            let _ = writeln!(
                out,
                "{:<48} {:>8} {:>8} {:>10} {:>10} {:>10}",
                "method", "calls", "failed", "p50 us", "p95 us", "p99 us"
            );
        }
        for (name, stats) in methods {
            let _ = writeln!(
                out,
                "{:<48} {:>8} {:>8} {:>10} {:>10} {:>10}",
                name,
                stats.call_count,
                stats.failure_count,
                stats.p50_latency_us,
                stats.p95_latency_us,
                stats.p99_latency_us
            );
        }

        if !self.inaccessible_interfaces.is_empty() {
            let _ = writeln!(out, "inaccessible interfaces:");
            for (name, count) in &self.inaccessible_interfaces {
                let _ = writeln!(out, "  {name} ({count})");
            }
        }
        out
    }
}
