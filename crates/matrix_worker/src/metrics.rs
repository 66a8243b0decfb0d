//! Intranet server counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters kept by the intranet server.
///
/// Executor timeouts are business results, not errors; only wire faults and
/// recovered panics increment `errors`.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ServerMetrics::new();
        metrics.inc_connections();
        metrics.inc_requests();
        metrics.inc_requests();
        assert_eq!(metrics.connection_count(), 1);
        assert_eq!(metrics.request_count(), 2);
        assert_eq!(metrics.error_count(), 0);
    }
}
