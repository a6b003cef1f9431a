use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::model::{ConntrackEntry, Tuple};

pub type ConntrackRef = Arc<Mutex<ConntrackEntry>>;

const NO_SESSION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Per-connection-id long-lived metadata, keyed by `conntrack_id`.
pub struct ConntrackTable {
    entries: DashMap<u32, ConntrackRef>,
}

impl ConntrackTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, conntrack_id: u32) -> Option<ConntrackRef> {
        self.entries.get(&conntrack_id).map(|r| r.clone())
    }

    pub fn get_or_create(&self, conntrack_id: u32, orig_tuple: Tuple, family: u8) -> (ConntrackRef, bool) {
        if let Some(existing) = self.entries.get(&conntrack_id) {
            return (existing.clone(), false);
        }
        let entry: ConntrackRef = Arc::new(Mutex::new(ConntrackEntry::new(conntrack_id, orig_tuple, family)));
        self.entries.insert(conntrack_id, entry.clone());
        (entry, true)
    }

    pub fn remove(&self, conntrack_id: u32) -> Option<ConntrackRef> {
        self.entries.remove(&conntrack_id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries without a live session older than `NO_SESSION_TIMEOUT`.
    pub async fn sweep_orphans(&self) -> Vec<u32> {
        let mut orphans = Vec::new();
        let ids: Vec<u32> = self.entries.iter().map(|r| *r.key()).collect();
        for id in ids {
            let Some(entry) = self.entries.get(&id).map(|r| r.clone()) else {
                continue;
            };
            let expired = {
                let guard = entry.lock().await;
                guard.session_id.is_none() && guard.last_activity.elapsed() > NO_SESSION_TIMEOUT
            };
            if expired {
                orphans.push(id);
            }
        }
        for id in &orphans {
            self.remove(*id);
        }
        orphans
    }

    pub fn purge_ids(&self, ids: &[u32]) {
        for id in ids {
            self.remove(*id);
        }
    }
}

impl Default for ConntrackTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn tuple() -> Tuple {
        Tuple::new(6, "10.0.0.2".parse::<IpAddr>().unwrap(), 1, "1.2.3.4".parse::<IpAddr>().unwrap(), 443)
    }

    #[tokio::test]
    async fn create_and_remove_round_trips() {
        let table = ConntrackTable::new();
        let (e, created) = table.get_or_create(1, tuple(), 4);
        assert!(created);
        assert_eq!(e.lock().await.conntrack_id, 1);
        table.remove(1);
        assert_eq!(table.len(), 0);
    }
}
