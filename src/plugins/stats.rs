//! Passive RTT sampling: stamps the first client-to-server packet, clears
//! the stamp on the first server-to-client packet, and feeds the elapsed
//! time to the server interface's stats collector. Runs for the life of
//! the session; never releases.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::model::{Message, NfqueueResult, Plugin, Value};
use crate::tables::SessionRef;

use super::context::PluginContext;

pub struct StatsPlugin {
    ctx: Arc<PluginContext>,
}

impl StatsPlugin {
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Plugin for StatsPlugin {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn priority(&self) -> i32 {
        super::priority::STATS_PRIORITY
    }

    async fn on_packet(&self, msg: &Message<'_>, session: &SessionRef, _new_session: bool) -> NfqueueResult {
        if msg.client_to_server {
            let mut guard = session.lock().await;
            if !guard.attachments.contains("stats_timer") {
                guard.put("stats_timer", Value::Instant(Instant::now()));
            }
            return NfqueueResult::default();
        }

        let (elapsed_ms, server_interface_id) = {
            let mut guard = session.lock().await;
            let stamp = match guard.get("stats_timer") {
                Some(Value::Instant(t)) => Some(*t),
                _ => None,
            };
            let Some(stamp) = stamp else {
                return NfqueueResult::default();
            };
            guard.delete("stats_timer");
            (stamp.elapsed().as_secs_f64() * 1000.0, guard.server_interface_id)
        };

        self.ctx.ifstats.feed(server_interface_id, elapsed_ms).await;

        NfqueueResult::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Session, Tuple};
    use std::net::IpAddr;
    use tokio::sync::Mutex;

    fn tuple() -> Tuple {
        Tuple::new(Tuple::PROTO_TCP, "10.0.0.2".parse::<IpAddr>().unwrap(), 40001, "1.2.3.4".parse::<IpAddr>().unwrap(), 443)
    }

    fn message(client_to_server: bool) -> Message<'static> {
        Message {
            tuple: tuple(),
            conntrack_id: 7,
            family: 4,
            ingress_iface: 0,
            client_to_server,
            payload: &[],
            ip_header_len: 0,
            l4_header_len: 0,
            ttl_or_hop_limit: 64,
        }
    }

    #[tokio::test]
    async fn stamps_on_first_client_packet_and_feeds_on_reply() {
        let ctx = Arc::new(super::super::context::testing::test_context().await);
        let plugin = StatsPlugin::new(ctx.clone());
        let session: SessionRef = Arc::new(Mutex::new(Session::new(7, tuple(), 0, vec![])));

        let out_req = plugin.on_packet(&message(true), &session, true).await;
        assert!(!out_req.session_release);
        {
            let guard = session.lock().await;
            assert!(guard.attachments.contains("stats_timer"));
        }

        let out_resp = plugin.on_packet(&message(false), &session, false).await;
        assert!(!out_resp.session_release);
        {
            let guard = session.lock().await;
            assert!(!guard.attachments.contains("stats_timer"));
        }

        assert_eq!(ctx.ifstats.snapshot().await.as_object().unwrap().len(), 1);
    }
}
