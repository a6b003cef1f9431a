use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;

use super::holder::Holder;

const TTL: Duration = Duration::from_secs(120);

pub enum FetchOutcome {
    YouFetch(Arc<Holder<Arc<Vec<String>>>>),
    Wait(Arc<Holder<Arc<Vec<String>>>>),
}

struct Entry {
    holder: Arc<Holder<Arc<Vec<String>>>>,
    last_access: Instant,
}

/// Reverse-DNS cache with the same single-fetch discipline as
/// [`super::cert_cache::CertCache`], but keyed on a 120 s TTL measured
/// from last access rather than creation.
pub struct RevDnsTable {
    entries: DashMap<std::net::IpAddr, Entry>,
}

impl RevDnsTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Atomic check-and-insert via `DashMap::entry` (see
    /// `CertCache::get_or_insert` for why a separate get/insert pair is
    /// unsafe here).
    pub fn get_or_insert(&self, addr: std::net::IpAddr) -> FetchOutcome {
        match self.entries.entry(addr) {
            DashEntry::Occupied(mut occupied) => {
                if occupied.get().last_access.elapsed() < TTL {
                    occupied.get_mut().last_access = Instant::now();
                    FetchOutcome::Wait(occupied.get().holder.clone())
                } else {
                    let holder = Holder::pending();
                    occupied.insert(Entry {
                        holder: holder.clone(),
                        last_access: Instant::now(),
                    });
                    FetchOutcome::YouFetch(holder)
                }
            }
            DashEntry::Vacant(vacant) => {
                let holder = Holder::pending();
                vacant.insert(Entry {
                    holder: holder.clone(),
                    last_access: Instant::now(),
                });
                FetchOutcome::YouFetch(holder)
            }
        }
    }

    pub fn evict_expired(&self) {
        self.entries.retain(|_, e| e.last_access.elapsed() < TTL);
    }
}

impl Default for RevDnsTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Two independent tables, one for client addresses and one for server
/// addresses, as spec'd: a packet's client/server role determines which
/// table a lookup goes through.
pub struct RevDnsCache {
    pub client: RevDnsTable,
    pub server: RevDnsTable,
}

impl RevDnsCache {
    pub fn new() -> Self {
        Self {
            client: RevDnsTable::new(),
            server: RevDnsTable::new(),
        }
    }

    pub fn evict_expired(&self) {
        self.client.evict_expired();
        self.server.evict_expired();
    }
}

impl Default for RevDnsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_lookup_within_ttl_shares_holder() {
        let table = RevDnsTable::new();
        let addr: std::net::IpAddr = "8.8.8.8".parse().unwrap();
        let holder = match table.get_or_insert(addr) {
            FetchOutcome::YouFetch(h) => h,
            FetchOutcome::Wait(_) => panic!("expected first fetch"),
        };
        holder.fulfil(Arc::new(vec!["dns.google".to_string()])).await;
        match table.get_or_insert(addr) {
            FetchOutcome::Wait(h) => {
                let names = h.wait_ready().await.unwrap();
                assert_eq!(names[0], "dns.google");
            }
            FetchOutcome::YouFetch(_) => panic!("should reuse cached holder"),
        }
    }
}
