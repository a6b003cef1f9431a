use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::model::{Session, SubscriptionHandle, Tuple};

/// Shared handle to one session's mutable state. The table itself only
/// ever hands out clones of this `Arc`; all field-level mutation happens
/// behind the inner mutex, matching the "map guarded, entry fine-grained
/// locked" discipline.
pub type SessionRef = Arc<Mutex<Session>>;

const DESTROYED_GRACE: Duration = Duration::from_secs(60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Per-flow state keyed by `conntrack_id`.
pub struct SessionTable {
    sessions: DashMap<u32, SessionRef>,
    /// conntrack ids whose owning conntrack entry has been destroyed but
    /// whose session is still draining subscribers; cleanup removes these
    /// after `DESTROYED_GRACE`.
    destroyed_at: DashMap<u32, Instant>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            destroyed_at: DashMap::new(),
        }
    }

    pub fn get(&self, conntrack_id: u32) -> Option<SessionRef> {
        self.sessions.get(&conntrack_id).map(|r| r.clone())
    }

    /// Returns the existing session for `conntrack_id`, or creates one
    /// using `subscriptions` (a snapshot of the dispatcher's `packet_subs`
    /// at this instant) and reports whether it was newly created.
    pub fn get_or_create(
        &self,
        conntrack_id: u32,
        client_side_tuple: Tuple,
        ingress_iface: u32,
        subscriptions: impl FnOnce() -> Vec<SubscriptionHandle>,
    ) -> (SessionRef, bool) {
        if let Some(existing) = self.sessions.get(&conntrack_id) {
            return (existing.clone(), false);
        }
        let session = Session::new(conntrack_id, client_side_tuple, ingress_iface, subscriptions());
        let handle: SessionRef = Arc::new(Mutex::new(session));
        self.sessions.insert(conntrack_id, handle.clone());
        (handle, true)
    }

    pub fn mark_destroyed(&self, conntrack_id: u32) {
        self.destroyed_at.insert(conntrack_id, Instant::now());
    }

    pub fn remove(&self, conntrack_id: u32) -> Option<SessionRef> {
        self.destroyed_at.remove(&conntrack_id);
        self.sessions.remove(&conntrack_id).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A snapshot of every live session handle, for the status endpoint.
    pub fn snapshot_refs(&self) -> Vec<SessionRef> {
        self.sessions.iter().map(|r| r.value().clone()).collect()
    }

    /// Sessions whose last_activity is stale, either because their
    /// conntrack entry was destroyed more than `DESTROYED_GRACE` ago, or
    /// because there has been no activity at all for `IDLE_TIMEOUT`.
    pub async fn sweep_stale(&self) -> Vec<u32> {
        let mut stale = Vec::new();
        let ids: Vec<u32> = self.sessions.iter().map(|r| *r.key()).collect();
        for id in ids {
            let Some(session) = self.sessions.get(&id).map(|r| r.clone()) else {
                continue;
            };
            let idle_expired = {
                let guard = session.lock().await;
                guard.last_activity.elapsed() > IDLE_TIMEOUT
            };
            let destroyed_expired = self
                .destroyed_at
                .get(&id)
                .map(|t| t.elapsed() > DESTROYED_GRACE)
                .unwrap_or(false);
            if idle_expired || destroyed_expired {
                stale.push(id);
            }
        }
        for id in &stale {
            self.remove(*id);
        }
        stale
    }

    /// Invoked by warehouse playback completion: purges every id that
    /// appeared during the run regardless of age.
    pub fn purge_ids(&self, ids: &[u32]) {
        for id in ids {
            self.remove(*id);
        }
    }
}

impl Default for SessionTable {
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
    async fn get_or_create_creates_once() {
        let table = SessionTable::new();
        let (s1, created1) = table.get_or_create(7, tuple(), 0, Vec::new);
        assert!(created1);
        let (s2, created2) = table.get_or_create(7, tuple(), 0, Vec::new);
        assert!(!created2);
        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[tokio::test]
    async fn conntrack_id_uniquely_identifies_live_session() {
        let table = SessionTable::new();
        table.get_or_create(7, tuple(), 0, Vec::new);
        assert_eq!(table.len(), 1);
        table.remove(7);
        assert_eq!(table.len(), 0);
        let (_s, created) = table.get_or_create(7, tuple(), 0, Vec::new);
        assert!(created, "conntrack id 7 may be reused after release");
    }
}
