//! Periodic per-interface counter collection from `/proc/net/dev`,
//! computing interval deltas/rates and emitting `interface_stats` events.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::warn;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::sinks::events::SharedEventSink;

pub const COLLECTION_INTERVAL: Duration = Duration::from_secs(10);
const PROC_NET_DEV_PATH: &str = "/proc/net/dev";

#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalStats {
    pub rx_byte_rate: f64,
    pub tx_byte_rate: f64,
    pub rx_packet_rate: f64,
    pub tx_packet_rate: f64,
}

/// Parses the whitespace-delimited `/proc/net/dev` table. Each data line
/// is `iface: rx_bytes rx_packets rx_errs rx_drop ... tx_bytes tx_packets
/// ...` — only the byte/packet columns this daemon reports on are kept.
pub fn parse_proc_net_dev(contents: &str) -> HashMap<String, InterfaceCounters> {
    let mut out = HashMap::new();
    for line in contents.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 16 {
            continue;
        }
        let parse = |i: usize| fields.get(i).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);
        out.insert(
            name.trim().to_string(),
            InterfaceCounters {
                rx_bytes: parse(0),
                rx_packets: parse(1),
                tx_bytes: parse(8),
                tx_packets: parse(9),
            },
        );
    }
    out
}

pub struct CounterTracker {
    last: HashMap<String, (InterfaceCounters, Instant)>,
}

impl CounterTracker {
    pub fn new() -> Self {
        Self { last: HashMap::new() }
    }

    /// Folds a fresh snapshot into per-interface interval rates; the first
    /// observation of an interface yields no stats (no prior sample to
    /// diff against).
    pub fn observe(&mut self, snapshot: HashMap<String, InterfaceCounters>) -> HashMap<String, IntervalStats> {
        let now = Instant::now();
        let mut out = HashMap::new();
        for (iface, counters) in &snapshot {
            if let Some((prev, prev_time)) = self.last.get(iface) {
                let secs = now.saturating_duration_since(*prev_time).as_secs_f64().max(f64::EPSILON);
                out.insert(
                    iface.clone(),
                    IntervalStats {
                        rx_byte_rate: counters.rx_bytes.saturating_sub(prev.rx_bytes) as f64 / secs,
                        tx_byte_rate: counters.tx_bytes.saturating_sub(prev.tx_bytes) as f64 / secs,
                        rx_packet_rate: counters.rx_packets.saturating_sub(prev.rx_packets) as f64 / secs,
                        tx_packet_rate: counters.tx_packets.saturating_sub(prev.tx_packets) as f64 / secs,
                    },
                );
            }
        }
        self.last = snapshot.into_iter().map(|(k, v)| (k, (v, now))).collect();
        out
    }
}

impl Default for CounterTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the periodic `/proc/net/dev` poll until shutdown, emitting one
/// `interface_stats` event per interface per interval once a prior sample
/// exists to diff against.
pub async fn run(event_sink: SharedEventSink, shutdown: CancellationToken) {
    let mut tracker = CounterTracker::new();
    let mut ticker = tokio::time::interval(COLLECTION_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let contents = match tokio::fs::read_to_string(PROC_NET_DEV_PATH).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("interface counters: failed to read {PROC_NET_DEV_PATH}: {e}");
                        continue;
                    }
                };
                let snapshot = parse_proc_net_dev(&contents);
                let stats = tracker.observe(snapshot);
                for (iface, s) in stats {
                    let result = event_sink
                        .log_event(
                            "interface_stats",
                            "interfaces",
                            1,
                            &[("interface", Value::from(iface.clone()))],
                            &[
                                ("rx_byte_rate", Value::from(s.rx_byte_rate)),
                                ("tx_byte_rate", Value::from(s.tx_byte_rate)),
                                ("rx_packet_rate", Value::from(s.rx_packet_rate)),
                                ("tx_packet_rate", Value::from(s.tx_packet_rate)),
                            ],
                        )
                        .await;
                    if let Err(e) = result {
                        warn!("interface counters: failed to log event for {iface}: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Inter-|   Receive                                                |  Transmit\n\
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
    lo: 1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0\n\
  eth0: 5000      50    0    0    0     0          0         0     2000      20    0    0    0     0       0          0\n";

    #[test]
    fn parses_known_interfaces() {
        let parsed = parse_proc_net_dev(SAMPLE);
        assert_eq!(parsed["eth0"].rx_bytes, 5000);
        assert_eq!(parsed["eth0"].tx_packets, 20);
        assert_eq!(parsed["lo"].rx_packets, 10);
    }

    #[test]
    fn second_observation_yields_nonzero_rate() {
        let mut tracker = CounterTracker::new();
        let first = parse_proc_net_dev(SAMPLE);
        assert!(tracker.observe(first).is_empty());

        let mut second_text = SAMPLE.replace("5000      50", "6000      60");
        second_text = second_text.replace("2000      20", "2500      25");
        let second = parse_proc_net_dev(&second_text);
        let stats = tracker.observe(second);
        assert!(stats["eth0"].rx_byte_rate > 0.0);
    }
}
