use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;

use super::attachment::{Attachments, Value};
use super::tuple::Tuple;

/// Returned by a packet callback. `packet_mark` bits are OR-combined into
/// the verdict mark the dispatcher eventually hands back to the kernel;
/// `session_release` is a one-way opt-out from further packets of this
/// session (see [`crate::dispatcher::pipeline`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct NfqueueResult {
    pub packet_mark: u32,
    pub session_release: bool,
}

impl NfqueueResult {
    pub fn mark(packet_mark: u32) -> Self {
        Self {
            packet_mark,
            session_release: false,
        }
    }

    pub fn release() -> Self {
        Self {
            packet_mark: 0,
            session_release: true,
        }
    }

    pub fn mark_and_release(packet_mark: u32) -> Self {
        Self {
            packet_mark,
            session_release: true,
        }
    }
}

/// Conntrack event kind delivered to `on_conntrack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConntrackKind {
    New,
    Update,
    Destroy,
}

/// A parsed NFLOG record delivered to `on_netlog`.
#[derive(Debug, Clone)]
pub struct NetlogEvent {
    pub protocol: u8,
    pub icmp_type: Option<u8>,
    pub src_iface: u32,
    pub dst_iface: u32,
    pub src_addr: std::net::IpAddr,
    pub dst_addr: std::net::IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub mark: u32,
    pub ctid: Option<u32>,
    pub prefix: String,
}

/// A decoded queued packet, valid only for the duration of one callback
/// fan-out.
pub struct Message<'a> {
    pub tuple: Tuple,
    pub conntrack_id: u32,
    pub family: u8,
    pub ingress_iface: u32,
    pub client_to_server: bool,
    pub payload: &'a [u8],
    pub ip_header_len: usize,
    pub l4_header_len: usize,
    pub ttl_or_hop_limit: u8,
}

impl<'a> Message<'a> {
    pub fn l4_payload(&self) -> &'a [u8] {
        let skip = self.ip_header_len + self.l4_header_len;
        if skip >= self.payload.len() {
            &[]
        } else {
            &self.payload[skip..]
        }
    }
}

/// The capability set a plugin may implement. Any subset of the three
/// per-event callbacks may be present; the registry stores one handle per
/// plugin regardless of which it implements.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn priority(&self) -> i32;

    async fn on_packet(&self, _msg: &Message<'_>, _session: &crate::tables::session_table::SessionRef, _new_session: bool) -> NfqueueResult {
        NfqueueResult::default()
    }

    async fn on_conntrack(&self, _kind: ConntrackKind, _entry: &crate::tables::conntrack_table::ConntrackRef) {}

    async fn on_netlog(&self, _event: &NetlogEvent) {}

    async fn startup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) {}
}

/// A registered plugin reference plus the capability flags used to skip
/// dispatch into callbacks a plugin never overrides.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub owner: &'static str,
    pub priority: i32,
    pub plugin: std::sync::Arc<dyn Plugin>,
}

impl SubscriptionHandle {
    pub fn new(plugin: std::sync::Arc<dyn Plugin>) -> Self {
        Self {
            owner: plugin.name(),
            priority: plugin.priority(),
            plugin,
        }
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-flow state, created on the first queued packet for an unknown
/// connection id and destroyed when the conntrack entry is released or
/// all subscribers have opted out.
pub struct Session {
    pub session_id: u64,
    pub conntrack_id: u32,
    pub client_side_tuple: Tuple,
    pub server_side_tuple: Option<Tuple>,
    pub client_interface_id: u8,
    pub server_interface_id: u8,
    pub client_interface_type: u8,
    pub server_interface_type: u8,
    pub family: u8,
    pub creation_time: Instant,
    pub last_activity: Instant,
    pub packet_count: u64,
    /// Snapshot of `packet_subs` at creation time; shrinks monotonically
    /// as plugins release.
    pub subscriptions: Vec<SubscriptionHandle>,
    pub attachments: Attachments,
}

impl Session {
    pub fn new(conntrack_id: u32, client_side_tuple: Tuple, ingress_iface: u32, subscriptions: Vec<SubscriptionHandle>) -> Self {
        let now = Instant::now();
        Self {
            session_id: next_session_id(),
            conntrack_id,
            family: client_side_tuple.family(),
            client_side_tuple,
            server_side_tuple: None,
            client_interface_id: ingress_iface as u8,
            server_interface_id: 0,
            client_interface_type: 0,
            server_interface_type: 0,
            creation_time: now,
            last_activity: now,
            packet_count: 1,
            subscriptions,
            attachments: Attachments::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.attachments.put(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attachments.get(key)
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.attachments.delete(key)
    }

    /// Permanently removes `owner` from the subscription list. Idempotent.
    pub fn release(&mut self, owner: &str) {
        self.subscriptions.retain(|s| s.owner != owner);
    }

    pub fn is_subscribed(&self, owner: &str) -> bool {
        self.subscriptions.iter().any(|s| s.owner == owner)
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscriptions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn tuple() -> Tuple {
        Tuple::new(6, "10.0.0.2".parse::<IpAddr>().unwrap(), 40001, "1.2.3.4".parse::<IpAddr>().unwrap(), 443)
    }

    #[test]
    fn session_ids_are_unique() {
        let a = Session::new(1, tuple(), 0, vec![]);
        let b = Session::new(2, tuple(), 0, vec![]);
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn release_is_one_way_and_idempotent() {
        struct Noop;
        #[async_trait]
        impl Plugin for Noop {
            fn name(&self) -> &'static str {
                "noop"
            }
            fn priority(&self) -> i32 {
                0
            }
        }
        let handle = SubscriptionHandle::new(std::sync::Arc::new(Noop));
        let mut s = Session::new(7, tuple(), 0, vec![handle]);
        assert!(s.is_subscribed("noop"));
        s.release("noop");
        assert!(!s.is_subscribed("noop"));
        s.release("noop");
        assert!(!s.is_subscribed("noop"));
    }

    #[test]
    fn attachment_round_trips() {
        let mut s = Session::new(1, tuple(), 0, vec![]);
        s.put("ClientSNI", Value::Str("api.example.com".into()));
        match s.get("ClientSNI") {
            Some(Value::Str(v)) => assert_eq!(v, "api.example.com"),
            _ => panic!("missing attachment"),
        }
    }
}
