pub mod collector;
pub mod counters;
pub mod pinger;

pub use collector::InterfaceStatsCollector;
pub use counters::{CounterTracker, InterfaceCounters, IntervalStats};
pub use pinger::{ProbeTable, SequenceGenerator};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Registry of per-interface collectors, indexed by interface id.
pub struct IfStatsRegistry {
    collectors: DashMap<u8, Arc<Mutex<InterfaceStatsCollector>>>,
}

impl IfStatsRegistry {
    pub fn new() -> Self {
        Self { collectors: DashMap::new() }
    }

    pub fn collector_for(&self, iface_id: u8) -> Arc<Mutex<InterfaceStatsCollector>> {
        self.collectors
            .entry(iface_id)
            .or_insert_with(|| Arc::new(Mutex::new(InterfaceStatsCollector::new())))
            .clone()
    }

    pub async fn feed(&self, iface_id: u8, sample_ms: f64) {
        let collector = self.collector_for(iface_id);
        collector.lock().await.feed_sample(sample_ms);
    }

    /// A JSON snapshot suitable for writing to the management UI's status
    /// path.
    pub async fn snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for entry in self.collectors.iter() {
            let collector = entry.value().lock().await;
            map.insert(
                entry.key().to_string(),
                serde_json::json!({
                    "ema_1m_ms": collector.ema_1m_ms(),
                    "ema_5m_ms": collector.ema_5m_ms(),
                    "ema_15m_ms": collector.ema_15m_ms(),
                    "stddev_ms": collector.stddev_ms(),
                    "samples_accepted": collector.samples_accepted,
                    "samples_rejected": collector.samples_rejected,
                }),
            );
        }
        serde_json::Value::Object(map)
    }
}

impl Default for IfStatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
