use std::sync::Arc;

use crate::model::{Plugin, SubscriptionHandle};

/// Three ordered subscription lists — packet, conntrack, and netlog —
/// each sorted ascending by priority, ties broken by registration order.
///
/// Subscriptions are inserted only at startup (via [`Registry::register`])
/// and never removed globally; per-session release is tracked separately
/// in [`crate::model::Session::subscriptions`].
#[derive(Default)]
pub struct Registry {
    packet_subs: Vec<SubscriptionHandle>,
    conntrack_subs: Vec<SubscriptionHandle>,
    netlog_subs: Vec<SubscriptionHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one plugin into all three registries; a plugin that
    /// never overrides a given callback simply no-ops when invoked
    /// through that registry (the default [`Plugin`] methods are no-ops).
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let handle = SubscriptionHandle::new(plugin);
        self.packet_subs.push(handle.clone());
        self.conntrack_subs.push(handle.clone());
        self.netlog_subs.push(handle);
        self.packet_subs.sort_by_key(|h| h.priority);
        self.conntrack_subs.sort_by_key(|h| h.priority);
        self.netlog_subs.sort_by_key(|h| h.priority);
    }

    pub fn packet_subs(&self) -> &[SubscriptionHandle] {
        &self.packet_subs
    }

    pub fn conntrack_subs(&self) -> &[SubscriptionHandle] {
        &self.conntrack_subs
    }

    pub fn netlog_subs(&self) -> &[SubscriptionHandle] {
        &self.netlog_subs
    }

    /// Snapshot of `packet_subs` handed to a newly created session.
    pub fn snapshot_packet_subs(&self) -> Vec<SubscriptionHandle> {
        self.packet_subs.clone()
    }

    /// Startup is fatal if any registered plugin fails to initialize, or
    /// if the registries ended up empty (a missing registration is fatal
    /// at startup, never per-packet).
    pub async fn startup_all(&self) -> anyhow::Result<()> {
        if self.packet_subs.is_empty() {
            anyhow::bail!("no plugins registered: at least one packet subscriber is required");
        }
        for sub in &self.packet_subs {
            sub.plugin
                .startup()
                .await
                .map_err(|e| anyhow::anyhow!("plugin {} failed to start: {e}", sub.owner))?;
        }
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        for sub in &self.packet_subs {
            sub.plugin.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct P(&'static str, i32);
    #[async_trait]
    impl Plugin for P {
        fn name(&self) -> &'static str {
            self.0
        }
        fn priority(&self) -> i32 {
            self.1
        }
    }

    #[test]
    fn ordering_is_ascending_priority_ties_by_registration() {
        let mut r = Registry::new();
        r.register(Arc::new(P("b", 2)));
        r.register(Arc::new(P("a", 1)));
        r.register(Arc::new(P("c", 1)));
        let names: Vec<_> = r.packet_subs().iter().map(|h| h.owner).collect();
        assert_eq!(names, vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn empty_registry_fails_startup() {
        let r = Registry::new();
        assert!(r.startup_all().await.is_err());
    }
}
