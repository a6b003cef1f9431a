//! Shared handles every stock plugin is constructed with. Mirrors the
//! teacher's `AppState`-style bundle: one struct of already-wired
//! dependencies passed to each plugin constructor rather than threading
//! each dependency through individually.

use std::sync::Arc;

use crate::config::Config;
use crate::ifstats::IfStatsRegistry;
use crate::metrics::Metrics;
use crate::settings::SettingsStore;
use crate::sinks::dict::SharedDictSink;
use crate::sinks::events::SharedEventSink;
use crate::tables::{CertCache, RevDnsCache};

pub struct PluginContext {
    pub dict: SharedDictSink,
    pub events: SharedEventSink,
    pub cert_cache: Arc<CertCache>,
    pub revdns_cache: Arc<RevDnsCache>,
    pub ifstats: Arc<IfStatsRegistry>,
    pub settings: Arc<SettingsStore>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<Config>,
    pub device_uid: String,
}

/// A fully-wired `PluginContext` backed by throwaway files/in-memory
/// stores, for plugin unit tests that need to drive `on_packet` end to
/// end rather than just the pure parsing helpers.
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::sinks::dict::FileDictSink;
    use crate::sinks::events::SqliteEventSink;
    use crate::tables::{CertCache, RevDnsCache};

    pub async fn test_context() -> PluginContext {
        let tmp = std::env::temp_dir();
        let dict: SharedDictSink = Arc::new(FileDictSink::new(tmp.join("nftrackd-test-write"), tmp.join("nftrackd-test-delete")));
        let events: SharedEventSink = Arc::new(SqliteEventSink::connect(":memory:").await.expect("in-memory sqlite connects"));
        PluginContext {
            dict,
            events,
            cert_cache: Arc::new(CertCache::new()),
            revdns_cache: Arc::new(RevDnsCache::new()),
            ifstats: Arc::new(IfStatsRegistry::new()),
            settings: SettingsStore::load(tmp.join("nftrackd-test-settings-missing.json")).await.expect("missing settings file loads defaults"),
            metrics: Arc::new(Metrics::new()),
            config: Arc::new(Config::default()),
            device_uid: "test-device".to_string(),
        }
    }
}
