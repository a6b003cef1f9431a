//! The packet, conntrack, and netlog pipelines: per-event fan-out into the
//! priority-ordered subscriber list, with release tracking and the
//! catch-boundary that turns a plugin panic into a forced release.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use log::{error, warn};

use crate::error::ErrorClass;
use crate::metrics::Metrics;
use crate::model::{ConntrackKind, Message, NetlogEvent, NfqueueResult, Tuple};
use crate::tables::{ConntrackTable, SessionTable};

use super::registry::Registry;

/// Bit in the verdict mark that tells the kernel fast-path to skip
/// userspace for further packets of this connection.
pub const BYPASS_BIT: u32 = 1 << 31;

/// The kernel queue's verdict; `ACCEPT` is the only policy this daemon
/// issues (it never forwards or rewrites packets).
#[derive(Debug, Clone, Copy)]
pub struct Verdict {
    pub accept: bool,
    pub mark: u32,
}

/// Packs the interface/policy fields into the 32-bit verdict mark.
///
/// Layout, low to high: `client_iface_id(8) | server_iface_id(8) |
/// priority(8) | server_iface_type(2) | client_iface_type(2) |
/// policy(4)`. The literal external-interface layout names a 6-bit policy
/// field, which together with the other fields does not fit 32 bits;
/// policy is masked to its low 4 bits here (see DESIGN.md).
pub fn pack_mark(client_iface_id: u8, server_iface_id: u8, priority: u8, client_iface_type: u8, server_iface_type: u8, policy: u8) -> u32 {
    (client_iface_id as u32)
        | (server_iface_id as u32) << 8
        | (priority as u32) << 16
        | ((server_iface_type & 0x3) as u32) << 24
        | ((client_iface_type & 0x3) as u32) << 26
        | ((policy & 0xF) as u32) << 28
}

pub struct Dispatcher {
    pub registry: Registry,
    pub sessions: SessionTable,
    pub conntracks: ConntrackTable,
    pub metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(registry: Registry, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            sessions: SessionTable::new(),
            conntracks: ConntrackTable::new(),
            metrics,
        }
    }

    /// The packet pipeline: build the message view, look up/create the
    /// session, fan out in priority order, and fold returned marks/release
    /// decisions into the final verdict.
    ///
    /// `synchronous` forces single-task execution regardless of the
    /// caller's own concurrency; warehouse playback sets this to preserve
    /// exact ordering across a single replayed stream.
    pub async fn dispatch_packet(&self, msg: Message<'_>) -> Verdict {
        let conntrack_id = msg.conntrack_id;
        let (session, new_session) = self.sessions.get_or_create(conntrack_id, msg.tuple, msg.ingress_iface, || {
            self.registry.snapshot_packet_subs()
        });

        let client_to_server;
        let subs = {
            let mut guard = session.lock().await;
            if !new_session {
                guard.packet_count += 1;
            }
            guard.touch();
            client_to_server = msg.tuple.client_addr == guard.client_side_tuple.client_addr;
            guard.subscriptions.clone()
        };

        let mut accumulated_mark = 0u32;
        let mut msg = msg;
        msg.client_to_server = client_to_server;

        for sub in &subs {
            let still_subscribed = {
                let guard = session.lock().await;
                guard.is_subscribed(sub.owner)
            };
            if !still_subscribed {
                continue;
            }

            let result = AssertUnwindSafe(sub.plugin.on_packet(&msg, &session, new_session))
                .catch_unwind()
                .await;

            let outcome = match result {
                Ok(r) => r,
                Err(_) => {
                    error!("plugin {} panicked handling packet on conntrack_id {}", sub.owner, conntrack_id);
                    self.metrics.record_error(ErrorClass::PluginPanic);
                    NfqueueResult::release()
                }
            };

            accumulated_mark |= outcome.packet_mark;
            if outcome.session_release {
                session.lock().await.release(sub.owner);
            }
        }

        let (client_iface_id, server_iface_id, client_iface_type, server_iface_type, bypass) = {
            let guard = session.lock().await;
            (
                guard.client_interface_id,
                guard.server_interface_id,
                guard.client_interface_type,
                guard.server_interface_type,
                !guard.has_subscribers(),
            )
        };

        let iface_mark = pack_mark(client_iface_id, server_iface_id, 0, client_iface_type, server_iface_type, 0);
        let mut mark = accumulated_mark | iface_mark;
        if bypass {
            mark |= BYPASS_BIT;
        }

        Verdict { accept: true, mark }
    }

    /// `kind` drives whether a brand-new entry is created (`New`),
    /// whether an existing one folds a delta (`Update`), or whether the
    /// entry is torn down (`Destroy`).
    pub async fn dispatch_conntrack(&self, kind: ConntrackKind, conntrack_id: u32, orig_tuple: Tuple, reply_tuple: Option<Tuple>, counters: Option<(u64, u64, u64, u64)>, connmark: u32, tcp_state: Option<u8>, timeout: u32, family: u8) {
        match kind {
            ConntrackKind::New => {
                let (entry, _created) = self.conntracks.get_or_create(conntrack_id, orig_tuple, family);
                if let Some(session) = self.sessions.get(conntrack_id) {
                    let mut entry_guard = entry.lock().await;
                    let mut session_guard = session.lock().await;
                    entry_guard.session_id = Some(session_guard.session_id);
                    if let Some(reply) = reply_tuple {
                        session_guard.server_side_tuple = Some(Tuple::from_reply(
                            reply.protocol,
                            reply.client_addr,
                            reply.client_port,
                            reply.server_addr,
                            reply.server_port,
                        ));
                    }
                }
                if let Some(reply) = reply_tuple {
                    entry.lock().await.reply_tuple = Some(reply);
                }
                entry.lock().await.connmark = connmark;
                entry.lock().await.tcp_state = tcp_state;
                entry.lock().await.timeout = timeout;
                self.fan_conntrack(ConntrackKind::New, &entry).await;
            }
            ConntrackKind::Update => {
                let (entry, created) = self.conntracks.get_or_create(conntrack_id, orig_tuple, family);
                if created {
                    warn!("conntrack UPDATE for unseen id {conntrack_id}, synthesizing entry");
                }
                if let Some((c2s_bytes, c2s_packets, s2c_bytes, s2c_packets)) = counters {
                    let mut guard = entry.lock().await;
                    let delta = guard.apply_update(c2s_bytes, c2s_packets, s2c_bytes, s2c_packets);
                    if delta.was_reset {
                        self.metrics.record_error(ErrorClass::TableInvariant);
                    }
                    guard.connmark = connmark;
                    guard.tcp_state = tcp_state;
                    guard.timeout = timeout;
                }
                self.fan_conntrack(ConntrackKind::Update, &entry).await;
            }
            ConntrackKind::Destroy => {
                if let Some(entry) = self.conntracks.get(conntrack_id) {
                    self.fan_conntrack(ConntrackKind::Destroy, &entry).await;
                }
                self.sessions.mark_destroyed(conntrack_id);
                self.conntracks.remove(conntrack_id);
            }
        }
    }

    async fn fan_conntrack(&self, kind: ConntrackKind, entry: &crate::tables::ConntrackRef) {
        for sub in self.registry.conntrack_subs() {
            let result = AssertUnwindSafe(sub.plugin.on_conntrack(kind, entry)).catch_unwind().await;
            if result.is_err() {
                error!("plugin {} panicked handling conntrack event", sub.owner);
                self.metrics.record_error(ErrorClass::PluginPanic);
            }
        }
    }

    pub async fn dispatch_netlog(&self, event: NetlogEvent) {
        for sub in self.registry.netlog_subs() {
            let result = AssertUnwindSafe(sub.plugin.on_netlog(&event)).catch_unwind().await;
            if result.is_err() {
                error!("plugin {} panicked handling netlog event", sub.owner);
                self.metrics.record_error(ErrorClass::PluginPanic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tuple() -> Tuple {
        Tuple::new(6, "10.0.0.2".parse::<IpAddr>().unwrap(), 40001, "1.2.3.4".parse::<IpAddr>().unwrap(), 443)
    }

    fn msg<'a>(conntrack_id: u32, payload: &'a [u8]) -> Message<'a> {
        Message {
            tuple: tuple(),
            conntrack_id,
            family: 4,
            ingress_iface: 0,
            client_to_server: true,
            payload,
            ip_header_len: 0,
            l4_header_len: 0,
            ttl_or_hop_limit: 64,
        }
    }

    struct ReleaseAll(&'static str, i32, Arc<AtomicU32>);
    #[async_trait]
    impl crate::model::Plugin for ReleaseAll {
        fn name(&self) -> &'static str {
            self.0
        }
        fn priority(&self) -> i32 {
            self.1
        }
        async fn on_packet(&self, _msg: &Message<'_>, _session: &crate::tables::SessionRef, _new: bool) -> NfqueueResult {
            self.2.fetch_add(1, Ordering::SeqCst);
            NfqueueResult::release()
        }
    }

    struct Panicky;
    #[async_trait]
    impl crate::model::Plugin for Panicky {
        fn name(&self) -> &'static str {
            "panicky"
        }
        fn priority(&self) -> i32 {
            5
        }
        async fn on_packet(&self, _msg: &Message<'_>, _session: &crate::tables::SessionRef, _new: bool) -> NfqueueResult {
            panic!("boom")
        }
    }

    #[tokio::test]
    async fn empty_subscription_list_sets_bypass_bit() {
        let mut registry = Registry::new();
        let counter = Arc::new(AtomicU32::new(0));
        registry.register(Arc::new(ReleaseAll("reporter", 1, counter.clone())));
        registry.register(Arc::new(ReleaseAll("geoip", 1, counter.clone())));
        let dispatcher = Dispatcher::new(registry, Arc::new(Metrics::new()));
        let verdict = dispatcher.dispatch_packet(msg(7, &[])).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(verdict.mark & BYPASS_BIT, BYPASS_BIT);
        assert_eq!(dispatcher.sessions.get(7).unwrap().lock().await.subscriptions.len(), 0);
    }

    #[tokio::test]
    async fn plugin_panic_is_caught_and_forces_release() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Panicky));
        let dispatcher = Dispatcher::new(registry, Arc::new(Metrics::new()));
        let verdict = dispatcher.dispatch_packet(msg(9, &[])).await;
        assert_eq!(verdict.mark & BYPASS_BIT, BYPASS_BIT);
        assert_eq!(dispatcher.metrics.error_count(ErrorClass::PluginPanic), 1);
    }

    #[test]
    fn pack_mark_places_fields_at_documented_offsets() {
        let mark = pack_mark(1, 2, 3, 0b11, 0b10, 0b1111);
        assert_eq!(mark & 0xFF, 1);
        assert_eq!((mark >> 8) & 0xFF, 2);
        assert_eq!((mark >> 16) & 0xFF, 3);
        assert_eq!((mark >> 24) & 0x3, 0b10);
        assert_eq!((mark >> 26) & 0x3, 0b11);
        assert_eq!((mark >> 28) & 0xF, 0b1111);
    }
}
