use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::registry::TypeRegistry;
use crate::transfer::TransferProperties;

/// Configuration of one connection.
///
/// # Example
///
/// ```rust
/// use peerlink_connection::ConnectionOptions;
/// use std::time::Duration;
///
/// let options = ConnectionOptions::default()
///     .with_max_stream_count(2)
///     .with_allow_direct_requests(false)
///     .with_gc_sweep_interval(Duration::from_millis(200));
///
/// assert_eq!(options.max_stream_count, 2);
/// ```
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Upper bound on streams per connection.
    pub max_stream_count: usize,
    /// Whether the peer may call static methods and constructors directly.
    pub allow_direct_requests: bool,
    /// Record proxy call statistics.
    pub collect_statistics: bool,
    /// Maximum worker threads executing incoming requests.
    pub worker_threads: usize,
    /// How often unreachable local objects are swept from scope tables.
    pub gc_sweep_interval: Duration,
    /// Resolver for type-loading contexts.
    pub registry: Arc<TypeRegistry>,
    /// Transfer and invocation properties.
    pub transfer_properties: Arc<TransferProperties>,
    /// Runtime to run incoming requests on. A private runtime is created
    /// when unset.
    pub executor: Option<tokio::runtime::Handle>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_stream_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .max(1),
            allow_direct_requests: true,
            collect_statistics: false,
            worker_threads: 64,
            gc_sweep_interval: Duration::from_secs(1),
            registry: Arc::new(TypeRegistry::new()),
            transfer_properties: Arc::new(TransferProperties::new()),
            executor: None,
        }
    }
}

impl ConnectionOptions {
    pub fn with_max_stream_count(mut self, count: usize) -> Self {
        self.max_stream_count = count.max(1);
        self
    }

    pub fn with_allow_direct_requests(mut self, allow: bool) -> Self {
        self.allow_direct_requests = allow;
        self
    }

    pub fn with_collect_statistics(mut self, collect: bool) -> Self {
        self.collect_statistics = collect;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn with_gc_sweep_interval(mut self, interval: Duration) -> Self {
        self.gc_sweep_interval = interval;
        self
    }

    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_transfer_properties(mut self, properties: TransferProperties) -> Self {
        self.transfer_properties = Arc::new(properties);
        self
    }

    pub fn with_executor(mut self, handle: tokio::runtime::Handle) -> Self {
        self.executor = Some(handle);
        self
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("max_stream_count", &self.max_stream_count)
            .field("allow_direct_requests", &self.allow_direct_requests)
            .field("collect_statistics", &self.collect_statistics)
            .field("worker_threads", &self.worker_threads)
            .field("gc_sweep_interval", &self.gc_sweep_interval)
            .field("executor", &self.executor.is_some())
            .finish()
    }
}
