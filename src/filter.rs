//! Filter Policy — immutable per-session configuration plus advisory
//! atomic counters, surfaced to the (external) UI.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::FilterConfig;

#[derive(Debug, Default)]
pub struct FilterCounters {
    pub total_filtered: AtomicU64,
    pub non_local_traffic_filtered: AtomicU64,
    pub http_traffic_filtered: AtomicU64,
    pub duplicates_blocked: AtomicU64,
}

impl FilterCounters {
    pub fn snapshot(&self) -> FilterCounterSnapshot {
        FilterCounterSnapshot {
            total_filtered: self.total_filtered.load(Ordering::Relaxed),
            non_local_traffic_filtered: self.non_local_traffic_filtered.load(Ordering::Relaxed),
            http_traffic_filtered: self.http_traffic_filtered.load(Ordering::Relaxed),
            duplicates_blocked: self.duplicates_blocked.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct FilterCounterSnapshot {
    pub total_filtered: u64,
    pub non_local_traffic_filtered: u64,
    pub http_traffic_filtered: u64,
    pub duplicates_blocked: u64,
}

/// Process-wide classification thresholds plus running counters. Loaded
/// once at startup from [`Config`](crate::config::Config) and immutable
/// for the lifetime of a session; only the counters mutate.
#[derive(Debug, Default)]
pub struct FilterPolicy {
    pub config: FilterConfig,
    pub counters: FilterCounters,
}

pub const HTTP_PORTS: [u16; 4] = [80, 443, 8080, 8443];

impl FilterPolicy {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            counters: FilterCounters::default(),
        }
    }

    pub fn record_non_local_filtered(&self) {
        FilterCounters::bump(&self.counters.non_local_traffic_filtered);
        FilterCounters::bump(&self.counters.total_filtered);
    }

    pub fn record_http_filtered(&self) {
        FilterCounters::bump(&self.counters.http_traffic_filtered);
        FilterCounters::bump(&self.counters.total_filtered);
    }

    pub fn record_duplicate_blocked(&self) {
        FilterCounters::bump(&self.counters.duplicates_blocked);
        FilterCounters::bump(&self.counters.total_filtered);
    }

    pub fn record_utility_filtered(&self) {
        FilterCounters::bump(&self.counters.total_filtered);
    }

    pub fn is_http_port(port: u16) -> bool {
        HTTP_PORTS.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let policy = FilterPolicy::new(FilterConfig::default());
        let snap = policy.counters.snapshot();
        assert_eq!(snap.total_filtered, 0);
    }

    #[test]
    fn recording_increments_both_specific_and_total() {
        let policy = FilterPolicy::new(FilterConfig::default());
        policy.record_http_filtered();
        policy.record_non_local_filtered();
        let snap = policy.counters.snapshot();
        assert_eq!(snap.http_traffic_filtered, 1);
        assert_eq!(snap.non_local_traffic_filtered, 1);
        assert_eq!(snap.total_filtered, 2);
    }

    #[test]
    fn http_port_detection() {
        assert!(FilterPolicy::is_http_port(443));
        assert!(FilterPolicy::is_http_port(8443));
        assert!(!FilterPolicy::is_http_port(22));
    }
}
