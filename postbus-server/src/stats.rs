//! Structured server counters, exposed for external monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-server counters. All monotonic except `active_connections`.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
    /// Bytes received on healthy, routed requests.
    pub in_bytes: AtomicU64,
    /// Bytes written back to clients.
    pub out_bytes: AtomicU64,
    /// Requests that failed framing, filtering, handling, or carried no
    /// request id.
    pub bad_requests: AtomicU64,
    /// Requests with a well-formed header but no registered handler.
    pub no_route_requests: AtomicU64,
    /// Correct round-trip returned responses.
    pub completed_requests: AtomicU64,
    /// Requests larger than the admission budget allows.
    pub too_large_requests: AtomicU64,
}

impl ServerStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

impl std::fmt::Display for ServerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stats{{active:{}, total:{}, in:{}, out:{}, completed:{}, bad:{}, no_route:{}, too_large:{}}}",
            Self::get(&self.active_connections),
            Self::get(&self.total_connections),
            Self::get(&self.in_bytes),
            Self::get(&self.out_bytes),
            Self::get(&self.completed_requests),
            Self::get(&self.bad_requests),
            Self::get(&self.no_route_requests),
            Self::get(&self.too_large_requests),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero_and_accumulate() {
        let stats = ServerStats::default();
        assert_eq!(ServerStats::get(&stats.completed_requests), 0);
        ServerStats::bump(&stats.completed_requests);
        ServerStats::add(&stats.in_bytes, 128);
        assert_eq!(ServerStats::get(&stats.completed_requests), 1);
        assert_eq!(ServerStats::get(&stats.in_bytes), 128);
    }
}
