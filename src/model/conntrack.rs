use std::time::Instant;

use super::tuple::Tuple;

/// Per-direction byte/packet totals plus the most recently computed
/// per-interval rate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectionCounters {
    pub bytes: u64,
    pub packets: u64,
    pub byte_rate: f64,
    pub packet_rate: f64,
}

/// Per-connection-id long-lived metadata, created on the first NEW
/// conntrack event for an unseen id, mutated by UPDATE, removed on
/// DESTROY.
///
/// Byte counters are monotone within one conntrack id; a non-monotone
/// observation indicates id reuse and triggers [`ConntrackEntry::reset`].
pub struct ConntrackEntry {
    pub conntrack_id: u32,
    pub session_id: Option<u64>,
    pub orig_tuple: Tuple,
    pub reply_tuple: Option<Tuple>,
    pub c2s: DirectionCounters,
    pub s2c: DirectionCounters,
    pub connmark: u32,
    pub tcp_state: Option<u8>,
    pub timeout: u32,
    pub last_activity: Instant,
    pub timestamp_start: Option<u64>,
    pub timestamp_stop: Option<u64>,
    pub family: u8,
}

/// The result of folding one UPDATE observation into an entry: the
/// per-interval deltas actually reported downstream, after id-reuse
/// detection has zeroed any negative delta.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateDelta {
    pub c2s_bytes_delta: u64,
    pub s2c_bytes_delta: u64,
    pub c2s_packets_delta: u64,
    pub s2c_packets_delta: u64,
    pub elapsed: std::time::Duration,
    pub was_reset: bool,
}

impl ConntrackEntry {
    pub fn new(conntrack_id: u32, orig_tuple: Tuple, family: u8) -> Self {
        Self {
            conntrack_id,
            session_id: None,
            orig_tuple,
            reply_tuple: None,
            c2s: DirectionCounters::default(),
            s2c: DirectionCounters::default(),
            connmark: 0,
            tcp_state: None,
            timeout: 0,
            last_activity: Instant::now(),
            timestamp_start: None,
            timestamp_stop: None,
            family,
        }
    }

    /// Folds one UPDATE observation's absolute totals into the entry.
    ///
    /// A negative delta on either direction is treated as a reset: the
    /// entry's counters are reinitialized from the current observation
    /// *and* the reported delta for that direction is zero, never
    /// negative (resolves the open question on reset-vs-return order).
    pub fn apply_update(&mut self, c2s_bytes: u64, c2s_packets: u64, s2c_bytes: u64, s2c_packets: u64) -> UpdateDelta {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_activity);
        self.last_activity = now;

        let reset = c2s_bytes < self.c2s.bytes
            || s2c_bytes < self.s2c.bytes
            || c2s_packets < self.c2s.packets
            || s2c_packets < self.s2c.packets;

        if reset {
            self.c2s = DirectionCounters {
                bytes: c2s_bytes,
                packets: c2s_packets,
                byte_rate: 0.0,
                packet_rate: 0.0,
            };
            self.s2c = DirectionCounters {
                bytes: s2c_bytes,
                packets: s2c_packets,
                byte_rate: 0.0,
                packet_rate: 0.0,
            };
            return UpdateDelta {
                elapsed,
                was_reset: true,
                ..Default::default()
            };
        }

        let c2s_bytes_delta = c2s_bytes - self.c2s.bytes;
        let s2c_bytes_delta = s2c_bytes - self.s2c.bytes;
        let c2s_packets_delta = c2s_packets - self.c2s.packets;
        let s2c_packets_delta = s2c_packets - self.s2c.packets;

        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        self.c2s.bytes = c2s_bytes;
        self.c2s.packets = c2s_packets;
        self.c2s.byte_rate = c2s_bytes_delta as f64 / secs;
        self.c2s.packet_rate = c2s_packets_delta as f64 / secs;
        self.s2c.bytes = s2c_bytes;
        self.s2c.packets = s2c_packets;
        self.s2c.byte_rate = s2c_bytes_delta as f64 / secs;
        self.s2c.packet_rate = s2c_packets_delta as f64 / secs;

        UpdateDelta {
            c2s_bytes_delta,
            s2c_bytes_delta,
            c2s_packets_delta,
            s2c_packets_delta,
            elapsed,
            was_reset: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn entry() -> ConntrackEntry {
        let t = Tuple::new(17, "10.0.0.2".parse::<IpAddr>().unwrap(), 5353, "8.8.8.8".parse::<IpAddr>().unwrap(), 53);
        ConntrackEntry::new(42, t, 4)
    }

    #[test]
    fn monotone_update_reports_positive_delta() {
        let mut e = entry();
        let d1 = e.apply_update(1200, 10, 800, 8);
        assert!(!d1.was_reset);
        assert_eq!(d1.c2s_bytes_delta, 1200);
        let d2 = e.apply_update(1300, 11, 850, 9);
        assert!(!d2.was_reset);
        assert_eq!(d2.c2s_bytes_delta, 100);
        assert_eq!(d2.s2c_bytes_delta, 50);
    }

    #[test]
    fn id_reuse_resets_without_negative_delta() {
        let mut e = entry();
        e.apply_update(1200, 10, 800, 8);
        let reset = e.apply_update(100, 1, 50, 1);
        assert!(reset.was_reset);
        assert_eq!(reset.c2s_bytes_delta, 0);
        assert_eq!(reset.s2c_bytes_delta, 0);
        assert_eq!(e.c2s.bytes, 100);
        assert_eq!(e.s2c.bytes, 50);
    }
}
