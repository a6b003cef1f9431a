use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;

use crate::model::CertAttachment;

use super::holder::Holder;

const TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Keyed by `server_addr`, single-fetch coordination, 24 h TTL by
/// creation time.
///
/// Callers use [`CertCache::get_or_insert`]: the first caller for a key
/// receives `FetchOutcome::YouFetch`, does the TLS dial, and calls
/// [`Holder::fulfil`]/[`Holder::fail`]; every other concurrent caller
/// receives `FetchOutcome::Wait` and awaits the same holder.
pub struct CertCache {
    entries: DashMap<String, Arc<Holder<Arc<CertAttachment>>>>,
}

pub enum FetchOutcome {
    YouFetch(Arc<Holder<Arc<CertAttachment>>>),
    Wait(Arc<Holder<Arc<CertAttachment>>>),
}

impl CertCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Atomic check-and-insert via `DashMap::entry`: a separate `get()`
    /// followed by `insert()` would let two concurrent callers for the
    /// same unseen key both observe "missing" and both fetch.
    pub fn get_or_insert(&self, server_addr: &str) -> FetchOutcome {
        match self.entries.entry(server_addr.to_string()) {
            DashEntry::Occupied(mut occupied) => {
                if occupied.get().age() < TTL {
                    FetchOutcome::Wait(occupied.get().clone())
                } else {
                    let holder = Holder::pending();
                    occupied.insert(holder.clone());
                    FetchOutcome::YouFetch(holder)
                }
            }
            DashEntry::Vacant(vacant) => {
                let holder = Holder::pending();
                vacant.insert(holder.clone());
                FetchOutcome::YouFetch(holder)
            }
        }
    }

    pub fn evict_expired(&self) {
        self.entries.retain(|_, h| h.age() < TTL);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CertCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_requester_waits_on_first_fetch() {
        let cache = CertCache::new();
        let holder = match cache.get_or_insert("1.2.3.4:443") {
            FetchOutcome::YouFetch(h) => h,
            FetchOutcome::Wait(_) => panic!("expected first caller to fetch"),
        };
        match cache.get_or_insert("1.2.3.4:443") {
            FetchOutcome::Wait(_) => {}
            FetchOutcome::YouFetch(_) => panic!("second caller should not refetch"),
        }
        let der = vec![0u8; 4];
        let cert = Arc::new(CertAttachment {
            der,
            subject_cn: Some("example.com".into()),
            serial: "1".into(),
            subject_country: None,
            subject_org: None,
            subject_ou: None,
            subject_locality: None,
            subject_province: None,
            subject_street: None,
            subject_postal_code: None,
            issuer_cn: None,
            san_dns_names: vec![],
        });
        holder.fulfil(cert.clone()).await;
        let waited = holder.wait_ready().await.unwrap();
        assert_eq!(waited.subject_cn.as_deref(), Some("example.com"));
    }
}
