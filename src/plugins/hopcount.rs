//! Hop-count heuristic: estimates how many router hops a packet has
//! crossed from its TTL/hop-limit, assuming the originator used one of
//! the common default starting values.

use async_trait::async_trait;

use crate::model::{Message, NfqueueResult, Plugin, Value};
use crate::tables::SessionRef;

const DEFAULT_TTLS: [u16; 4] = [32, 64, 128, 255];

fn estimate_hops(observed: u8) -> u32 {
    let default = DEFAULT_TTLS.into_iter().find(|&d| d >= observed as u16).unwrap_or(255);
    (default - observed as u16) as u32
}

pub struct HopCountPlugin;

impl HopCountPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HopCountPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for HopCountPlugin {
    fn name(&self) -> &'static str {
        "hopcount"
    }

    fn priority(&self) -> i32 {
        super::priority::HOPCOUNT_PRIORITY
    }

    async fn on_packet(&self, msg: &Message<'_>, session: &SessionRef, _new_session: bool) -> NfqueueResult {
        let key = if msg.client_to_server { "client_hops" } else { "server_hops" };
        let mut guard = session.lock().await;
        if !guard.attachments.contains(key) {
            let hops = estimate_hops(msg.ttl_or_hop_limit);
            guard.put(key, Value::U32(hops));
        }
        let done = guard.attachments.contains("client_hops") && guard.attachments.contains("server_hops");
        NfqueueResult {
            packet_mark: 0,
            session_release: done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hops_computed_from_nearest_default_ttl_at_or_above_observed() {
        assert_eq!(estimate_hops(60), 4);
        assert_eq!(estimate_hops(64), 0);
        assert_eq!(estimate_hops(118), 10);
        assert_eq!(estimate_hops(250), 5);
    }

    #[tokio::test]
    async fn releases_once_both_directions_are_tagged() {
        use crate::model::{Session, Tuple};
        use std::net::IpAddr;
        use std::sync::Arc;
        use tokio::sync::Mutex;

        let tuple = Tuple::new(6, "10.0.0.2".parse::<IpAddr>().unwrap(), 40001, "1.2.3.4".parse::<IpAddr>().unwrap(), 443);
        let session: SessionRef = Arc::new(Mutex::new(Session::new(1, tuple, 0, vec![])));
        let plugin = HopCountPlugin::new();

        let mut msg = Message {
            tuple,
            conntrack_id: 1,
            family: 4,
            ingress_iface: 0,
            client_to_server: true,
            payload: &[],
            ip_header_len: 0,
            l4_header_len: 0,
            ttl_or_hop_limit: 60,
        };
        let r1 = plugin.on_packet(&msg, &session, true).await;
        assert!(!r1.session_release);

        msg.client_to_server = false;
        msg.ttl_or_hop_limit = 118;
        let r2 = plugin.on_packet(&msg, &session, false).await;
        assert!(r2.session_release);
    }
}
