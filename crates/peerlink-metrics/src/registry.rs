use crate::snapshot::{MethodStatistics, StatisticsSnapshot};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

const NUM_HISTOGRAM_BINS: usize = 100;

/// Fallback timestamp counter for when the system clock is before the epoch.
static TIMESTAMP_FALLBACK: AtomicU64 = AtomicU64::new(1);

/// Last issued timestamp, used to keep timestamps strictly increasing.
static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Generates a strictly increasing timestamp in milliseconds.
///
/// LRU eviction relies on a total order of access times, so two calls
/// within the same millisecond still get distinct values.
fn get_monotonic_timestamp() -> u64 {
    let system_time = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|_| TIMESTAMP_FALLBACK.fetch_add(1, Ordering::SeqCst));

    loop {
        let last = LAST_TIMESTAMP.load(Ordering::Acquire);
        let new_timestamp = system_time.max(last + 1);

        match LAST_TIMESTAMP.compare_exchange_weak(
            last,
            new_timestamp,
            Ordering::SeqCst,
            Ordering::Acquire,
        ) {
            Ok(_) => return new_timestamp,
            Err(_) => continue,
        }
    }
}

/// Limits for the statistics registry.
///
/// Long-lived connections can call an unbounded set of methods; these
/// settings keep the per-method table from growing without limit.
///
/// # Example
///
/// ```rust
/// use peerlink_metrics::StatisticsConfig;
///
/// let config = StatisticsConfig {
///     max_methods: 200,
///     method_ttl_secs: 600,
///     max_interfaces: 64,
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StatisticsConfig {
    /// Maximum number of distinct methods to track.
    ///
    /// When exceeded, least-recently-used methods are evicted.
    pub max_methods: usize,
    /// Methods not called within this many seconds are eligible for cleanup.
    pub method_ttl_secs: u64,
    /// Maximum number of distinct inaccessible interface names to remember.
    pub max_interfaces: usize,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            max_methods: 1000,
            method_ttl_secs: 3600,
            max_interfaces: 256,
        }
    }
}

/// Logarithmic histogram for percentile estimation.
///
/// 100 bins cover 1us to several seconds. Each power-of-ten decade is
/// split into 10 bins, which gives finer resolution at low latencies.
///
/// Recording is O(1) and lock-free; percentile estimation is a linear scan.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        let bins: [AtomicU64; NUM_HISTOGRAM_BINS] = std::array::from_fn(|_| AtomicU64::new(0));

        Self {
            bins,
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_us: u64) {
        let bin = Self::latency_to_bin(latency_us);
        self.bins[bin].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Maps a latency to its bin: decade times ten plus the leading digit.
    fn latency_to_bin(latency_us: u64) -> usize {
        if latency_us == 0 {
            return 0;
        }

        let decade = latency_us.ilog10() as usize;
        let leading_digit = (latency_us / 10u64.pow(decade as u32)) as usize;
        let bin = decade * 10 + leading_digit.min(9);

        bin.min(NUM_HISTOGRAM_BINS - 1)
    }

    /// Lower bound of a bin's latency range.
    fn bin_to_latency(bin: usize) -> u64 {
        if bin == 0 {
            return 1;
        }

        let decade = (bin / 10) as u32;
        let sub_bin = bin % 10;

        10u64
            .checked_pow(decade)
            .unwrap_or(u64::MAX)
            .saturating_mul(sub_bin.max(1) as u64)
    }

    /// Estimates the latency at `percentile` (0-100), interpolating within a bin.
    fn estimate_percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target_count = ((total * percentile) / 100).max(1);
        let mut cumulative_count = 0;

        for (bin_idx, bin) in self.bins.iter().enumerate() {
            let bin_count = bin.load(Ordering::Relaxed);
            if bin_count > 0 && cumulative_count + bin_count >= target_count {
                let bin_start = Self::bin_to_latency(bin_idx);
                let bin_end = Self::bin_to_latency(bin_idx + 1).max(bin_start + 1);

                let offset_in_bin = target_count - cumulative_count;
                let fraction = offset_in_bin as f64 / bin_count as f64;
                let interpolated = bin_start as f64 + fraction * (bin_end - bin_start) as f64;

                return interpolated as u64;
            }
            cumulative_count += bin_count;
        }

        Self::bin_to_latency(NUM_HISTOGRAM_BINS)
    }

    /// Returns `(avg, p50, p95, p99)` in microseconds, all zero when empty.
    fn calculate_percentiles(&self) -> (u64, u64, u64, u64) {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return (0, 0, 0, 0);
        }

        let avg = self.total_latency.load(Ordering::Relaxed) / total;
        (
            avg,
            self.estimate_percentile(50),
            self.estimate_percentile(95),
            self.estimate_percentile(99),
        )
    }
}

/// Per-method counters.
///
/// Relaxed ordering throughout: counters are independent and snapshots
/// are best-effort.
#[derive(Debug)]
struct MethodStats {
    call_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    latencies: LatencyHistogram,
    last_access_ms: AtomicU64,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
            last_access_ms: AtomicU64::new(get_monotonic_timestamp()),
        }
    }

    fn record(&self, latency_us: u64, success: bool) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        self.latencies.record(latency_us);
        self.last_access_ms
            .store(get_monotonic_timestamp(), Ordering::Relaxed);
    }

    fn snapshot(&self) -> MethodStatistics {
        let (avg_latency_us, p50_latency_us, p95_latency_us, p99_latency_us) =
            self.latencies.calculate_percentiles();

        MethodStatistics {
            call_count: self.call_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            avg_latency_us,
            p50_latency_us,
            p95_latency_us,
            p99_latency_us,
        }
    }
}

/// Thread-safe storage for one connection's call statistics.
///
/// Global counters are lock-free atomics. The per-method table sits behind
/// an `RwLock` that is only held long enough to find or insert an entry;
/// the entry's own counters are updated after the lock is released.
///
/// Every 1000 recorded calls the registry drops methods idle for longer
/// than the configured TTL and evicts least-recently-used entries above
/// `max_methods`.
///
/// # Example
///
/// ```rust
/// use peerlink_metrics::StatisticsRegistry;
///
/// let registry = StatisticsRegistry::new();
/// registry.record_method_call("Calculator.add(int, int)", 150, true);
///
/// let snapshot = registry.snapshot();
/// assert_eq!(snapshot.total_calls, 1);
/// ```
#[derive(Debug)]
pub struct StatisticsRegistry {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    methods: RwLock<HashMap<String, Arc<MethodStats>>>,
    inaccessible_interfaces: RwLock<BTreeMap<String, u64>>,
    start_time: Instant,
    config: StatisticsConfig,
    cleanup_counter: AtomicU64,
}

impl StatisticsRegistry {
    /// Creates a registry with the default [`StatisticsConfig`].
    pub fn new() -> Self {
        Self::with_config(StatisticsConfig::default())
    }

    /// Creates a registry with custom limits.
    pub fn with_config(config: StatisticsConfig) -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            methods: RwLock::new(HashMap::new()),
            inaccessible_interfaces: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
            config,
            cleanup_counter: AtomicU64::new(0),
        }
    }

    /// Records one completed remote call.
    ///
    /// # Arguments
    /// * `method` - Display form of the called method
    /// * `latency_us` - Call duration in microseconds
    /// * `success` - Whether the call returned normally
    pub fn record_method_call(&self, method: &str, latency_us: u64, success: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }

        self.maybe_cleanup();

        let existing = self.methods.read().get(method).cloned();
        let stats = match existing {
            Some(stats) => stats,
            None => self
                .methods
                .write()
                .entry(method.to_string())
                .or_insert_with(|| Arc::new(MethodStats::new()))
                .clone(),
        };

        stats.record(latency_us, success);
    }

    /// Records that an announced interface could not be resolved locally.
    ///
    /// New names beyond `max_interfaces` are dropped; known names keep counting.
    pub fn record_inaccessible_interface(&self, interface: &str) {
        let mut interfaces = self.inaccessible_interfaces.write();
        if let Some(count) = interfaces.get_mut(interface) {
            *count += 1;
        } else if interfaces.len() < self.config.max_interfaces {
            interfaces.insert(interface.to_string(), 1);
        }
    }

    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: u64 = 1000;
        let count = self.cleanup_counter.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_INTERVAL == 0 {
            self.cleanup_stale_entries();
        }
    }

    /// Drops entries past their TTL, then evicts LRU entries above the limit.
    fn cleanup_stale_entries(&self) {
        let now = get_monotonic_timestamp();
        let method_ttl_ms = self.config.method_ttl_secs.saturating_mul(1000);
        let mut methods = self.methods.write();

        methods.retain(|_name, stats| {
            let last_access = stats.last_access_ms.load(Ordering::Relaxed);
            now.saturating_sub(last_access) < method_ttl_ms
        });

        if methods.len() > self.config.max_methods {
            let mut entries: Vec<_> = methods
                .iter()
                .map(|(name, stats)| (name.clone(), stats.last_access_ms.load(Ordering::Relaxed)))
                .collect();

            entries.sort_by_key(|&(_, last_access)| last_access);

            let to_remove = entries.len() - self.config.max_methods;
            for (name, _) in entries.into_iter().take(to_remove) {
                methods.remove(&name);
            }
        }
    }

    /// Milliseconds since the registry was created.
    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Takes a snapshot of all counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let methods = self
            .methods
            .read()
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();

        StatisticsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            methods,
            inaccessible_interfaces: self.inaccessible_interfaces.read().clone(),
        }
    }
}

impl Default for StatisticsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_success_and_failure() {
        let registry = StatisticsRegistry::new();
        registry.record_method_call("Echo.echo(String)", 100, true);
        registry.record_method_call("Echo.echo(String)", 200, false);
        registry.record_method_call("Echo.count()", 50, true);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_calls, 3);
        assert_eq!(snapshot.successful_calls, 2);
        assert_eq!(snapshot.failed_calls, 1);

        let echo = &snapshot.methods["Echo.echo(String)"];
        assert_eq!(echo.call_count, 2);
        assert_eq!(echo.success_count, 1);
        assert_eq!(echo.failure_count, 1);
        assert_eq!(echo.avg_latency_us, 150);
    }

    #[test]
    fn test_histogram_bins() {
        assert_eq!(LatencyHistogram::latency_to_bin(0), 0);
        assert_eq!(LatencyHistogram::latency_to_bin(5), 5);
        assert_eq!(LatencyHistogram::latency_to_bin(10), 11);
        assert_eq!(LatencyHistogram::latency_to_bin(250), 22);
        assert_eq!(LatencyHistogram::latency_to_bin(u64::MAX), NUM_HISTOGRAM_BINS - 1);
    }

    #[test]
    fn test_percentiles_are_ordered() {
        let histogram = LatencyHistogram::new();
        for latency in 1..=1000 {
            histogram.record(latency);
        }

        let (avg, p50, p95, p99) = histogram.calculate_percentiles();
        assert_eq!(avg, 500);
        assert!(p50 > 0);
        assert!(p50 <= p95);
        assert!(p95 <= p99);
    }

    #[test]
    fn test_empty_histogram() {
        let histogram = LatencyHistogram::new();
        assert_eq!(histogram.calculate_percentiles(), (0, 0, 0, 0));
    }

    #[test]
    fn test_lru_eviction() {
        let registry = StatisticsRegistry::with_config(StatisticsConfig {
            max_methods: 2,
            method_ttl_secs: 3600,
            max_interfaces: 4,
        });

        registry.record_method_call("a", 1, true);
        registry.record_method_call("b", 1, true);
        registry.record_method_call("c", 1, true);
        registry.cleanup_stale_entries();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.methods.len(), 2);
        assert!(!snapshot.methods.contains_key("a"));
    }

    #[test]
    fn test_inaccessible_interfaces_are_bounded() {
        let registry = StatisticsRegistry::with_config(StatisticsConfig {
            max_methods: 10,
            method_ttl_secs: 3600,
            max_interfaces: 1,
        });

        registry.record_inaccessible_interface("acme.Hidden");
        registry.record_inaccessible_interface("acme.Hidden");
        registry.record_inaccessible_interface("acme.Other");

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.inaccessible_interfaces.len(), 1);
        assert_eq!(snapshot.inaccessible_interfaces["acme.Hidden"], 2);
    }

    #[test]
    fn test_monotonic_timestamps() {
        let a = get_monotonic_timestamp();
        let b = get_monotonic_timestamp();
        assert!(b > a);
    }
}
