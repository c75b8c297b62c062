//! Registry configuration.

use std::time::Duration;

/// Configuration for a [`Registry`](crate::Registry).
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    /// Upper bound for blocking reads and blocking entity lookups.
    /// `None` (the default) waits forever.
    pub wait_timeout: Option<Duration>,
    /// Number of threads in the notification dispatch pool. `0` (the
    /// default) lets the pool pick one thread per available core.
    pub dispatch_threads: usize,
}

impl CoreConfig {
    /// Create the default configuration: wait forever, default pool size.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every blocking wait by `timeout`; a wait that exceeds it
    /// reports absence instead of suspending indefinitely.
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Fix the dispatch pool size.
    #[must_use]
    pub fn with_dispatch_threads(mut self, threads: usize) -> Self {
        self.dispatch_threads = threads;
        self
    }
}
