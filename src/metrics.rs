use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use crate::error::ErrorClass;

const ERROR_CLASS_SLOTS: usize = 5;

/// Global process metrics. Counters are updated from the hot packet path,
/// so every field is atomic; no field requires a lock.
pub struct Metrics {
    pub start_time: SystemTime,
    pub packets_total: AtomicU64,
    pub conntrack_events_total: AtomicU64,
    pub netlog_events_total: AtomicU64,
    pub sessions_active: AtomicUsize,
    pub sessions_created_total: AtomicU64,
    pub conntrack_entries_active: AtomicUsize,
    pub cert_cache_hits: AtomicU64,
    pub cert_cache_fetches: AtomicU64,
    pub revdns_cache_hits: AtomicU64,
    pub revdns_cache_fetches: AtomicU64,
    pub dict_writes_total: AtomicU64,
    pub events_emitted_total: AtomicU64,
    errors_by_class: [AtomicU64; ERROR_CLASS_SLOTS],
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            packets_total: AtomicU64::new(0),
            conntrack_events_total: AtomicU64::new(0),
            netlog_events_total: AtomicU64::new(0),
            sessions_active: AtomicUsize::new(0),
            sessions_created_total: AtomicU64::new(0),
            conntrack_entries_active: AtomicUsize::new(0),
            cert_cache_hits: AtomicU64::new(0),
            cert_cache_fetches: AtomicU64::new(0),
            revdns_cache_hits: AtomicU64::new(0),
            revdns_cache_fetches: AtomicU64::new(0),
            dict_writes_total: AtomicU64::new(0),
            events_emitted_total: AtomicU64::new(0),
            errors_by_class: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record_packet(&self) {
        self.packets_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conntrack_event(&self) {
        self.conntrack_events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_netlog_event(&self) {
        self.netlog_events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_created(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
        self.sessions_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_destroyed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Process metric counter keyed by error class, per the error-handling
    /// design's "user-visible behaviour" requirement.
    pub fn record_error(&self, class: ErrorClass) {
        self.errors_by_class[class.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self, class: ErrorClass) -> u64 {
        self.errors_by_class[class.index()].load(Ordering::Relaxed)
    }

    pub fn error_snapshot(&self) -> Vec<(ErrorClass, u64)> {
        ErrorClass::ALL.iter().map(|c| (*c, self.error_count(*c))).collect()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_counters_are_independent_per_class() {
        let m = Metrics::new();
        m.record_error(ErrorClass::Malformed);
        m.record_error(ErrorClass::Malformed);
        m.record_error(ErrorClass::Fatal);
        assert_eq!(m.error_count(ErrorClass::Malformed), 2);
        assert_eq!(m.error_count(ErrorClass::Fatal), 1);
        assert_eq!(m.error_count(ErrorClass::TransientExternal), 0);
    }

    #[test]
    fn session_counters_track_create_and_destroy() {
        let m = Metrics::new();
        m.record_session_created();
        m.record_session_created();
        m.record_session_destroyed();
        assert_eq!(m.sessions_active.load(Ordering::Relaxed), 1);
        assert_eq!(m.sessions_created_total.load(Ordering::Relaxed), 2);
    }
}
