//! Event emission: turns session lifecycle, conntrack, and netlog
//! observations into the append-only records the local reports store
//! consumes.
//!
//! Packet-pipeline release has no bearing on conntrack/netlog delivery —
//! the dispatcher fans those out from the global subscriber registry, not
//! the per-session subscription list (see `dispatcher::pipeline`) — so
//! `on_packet` emits `session_new` and releases immediately, while
//! `on_conntrack`/`on_netlog` keep firing for the session's whole life.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use serde_json::json;

use crate::model::{ConntrackKind, Message, NetlogEvent, NfqueueResult, Plugin};
use crate::tables::{ConntrackRef, SessionRef};

use super::context::PluginContext;

const EVENT_FORMAT_VERSION: u32 = 1;
const IFACE_TYPE_LAN: u8 = 0;

fn parse_prefix(prefix: &str) -> HashMap<&str, &str> {
    prefix
        .split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.trim();
            let value = parts.next()?.trim();
            Some((key, value))
        })
        .collect()
}

pub struct ReporterPlugin {
    ctx: Arc<PluginContext>,
}

impl ReporterPlugin {
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }

    async fn resolve_guid(&self, table: &str, short_id: &str) -> String {
        match self.ctx.settings.get(&["reporter", table, short_id]).await {
            Some(serde_json::Value::String(full)) => full,
            _ => short_id.to_string(),
        }
    }
}

#[async_trait]
impl Plugin for ReporterPlugin {
    fn name(&self) -> &'static str {
        "reporter"
    }

    fn priority(&self) -> i32 {
        super::priority::REPORTER_PRIORITY
    }

    async fn on_packet(&self, _msg: &Message<'_>, session: &SessionRef, new_session: bool) -> NfqueueResult {
        if !new_session {
            return NfqueueResult::release();
        }

        let guard = session.lock().await;
        let tuple = guard.client_side_tuple;
        let (local_addr, remote_addr) = if guard.client_interface_type == IFACE_TYPE_LAN {
            (tuple.client_addr.to_string(), tuple.server_addr.to_string())
        } else {
            (tuple.server_addr.to_string(), tuple.client_addr.to_string())
        };

        let key_columns = [("conntrack_id", json!(guard.conntrack_id))];
        let modified_columns = [
            ("client_addr", json!(tuple.client_addr.to_string())),
            ("client_port", json!(tuple.client_port)),
            ("server_addr", json!(tuple.server_addr.to_string())),
            ("server_port", json!(tuple.server_port)),
            ("protocol", json!(tuple.protocol)),
            ("client_interface_id", json!(guard.client_interface_id)),
            ("server_interface_id", json!(guard.server_interface_id)),
            ("client_interface_type", json!(guard.client_interface_type)),
            ("server_interface_type", json!(guard.server_interface_type)),
            ("local_addr", json!(local_addr)),
            ("remote_addr", json!(remote_addr)),
        ];
        drop(guard);

        if let Err(e) = self.ctx.events.log_event("session_new", "sessions", EVENT_FORMAT_VERSION, &key_columns, &modified_columns).await {
            warn!("reporter failed to log session_new: {e}");
        } else {
            self.ctx.metrics.events_emitted_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        NfqueueResult::release()
    }

    async fn on_conntrack(&self, kind: ConntrackKind, entry: &ConntrackRef) {
        match kind {
            ConntrackKind::New => {
                let guard = entry.lock().await;
                let Some(reply) = guard.reply_tuple else {
                    return;
                };
                let conntrack_id = guard.conntrack_id;
                drop(guard);

                let key_columns = [("conntrack_id", json!(conntrack_id))];
                let modified_columns = [
                    ("server_addr", json!(reply.server_addr.to_string())),
                    ("server_port", json!(reply.server_port)),
                    ("client_addr", json!(reply.client_addr.to_string())),
                    ("client_port", json!(reply.client_port)),
                ];
                if let Err(e) = self.ctx.events.log_event("session_nat", "sessions", EVENT_FORMAT_VERSION, &key_columns, &modified_columns).await {
                    warn!("reporter failed to log session_nat: {e}");
                } else {
                    self.ctx.metrics.events_emitted_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
            ConntrackKind::Update => {
                let guard = entry.lock().await;
                if guard.c2s.byte_rate == 0.0 && guard.s2c.byte_rate == 0.0 && guard.c2s.packet_rate == 0.0 && guard.s2c.packet_rate == 0.0 {
                    return;
                }
                let conntrack_id = guard.conntrack_id;
                let key_columns = [("conntrack_id", json!(conntrack_id))];
                let modified_columns = [
                    ("c2s_byte_rate", json!(guard.c2s.byte_rate)),
                    ("s2c_byte_rate", json!(guard.s2c.byte_rate)),
                    ("c2s_packet_rate", json!(guard.c2s.packet_rate)),
                    ("s2c_packet_rate", json!(guard.s2c.packet_rate)),
                    ("c2s_total_bytes", json!(guard.c2s.bytes)),
                    ("s2c_total_bytes", json!(guard.s2c.bytes)),
                    ("c2s_total_packets", json!(guard.c2s.packets)),
                    ("s2c_total_packets", json!(guard.s2c.packets)),
                ];
                drop(guard);
                if let Err(e) = self.ctx.events.log_event("session_stat", "sessions", EVENT_FORMAT_VERSION, &key_columns, &modified_columns).await {
                    warn!("reporter failed to log session_stat: {e}");
                } else {
                    self.ctx.metrics.events_emitted_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
            ConntrackKind::Destroy => {}
        }
    }

    async fn on_netlog(&self, event: &NetlogEvent) {
        let fields = parse_prefix(&event.prefix);
        if fields.get("type").copied() != Some("rule") || fields.get("table").copied() != Some("wan-routing") {
            return;
        }

        let rule_id = match fields.get("ruleId") {
            Some(id) => self.resolve_guid("rule_table", id).await,
            None => String::new(),
        };
        let policy_id = match fields.get("policy") {
            Some(id) => self.resolve_guid("policy_table", id).await,
            None => String::new(),
        };

        let key_columns = [("ctid", json!(event.ctid))];
        let modified_columns = [
            ("rule_id", json!(rule_id)),
            ("policy_id", json!(policy_id)),
            ("chain", json!(fields.get("chain").copied().unwrap_or(""))),
            ("action", json!(fields.get("action").copied().unwrap_or(""))),
            ("src_addr", json!(event.src_addr.to_string())),
            ("dst_addr", json!(event.dst_addr.to_string())),
            ("src_port", json!(event.src_port)),
            ("dst_port", json!(event.dst_port)),
        ];
        if let Err(e) = self.ctx.events.log_event("reporter_netlogger", "netlog", EVENT_FORMAT_VERSION, &key_columns, &modified_columns).await {
            warn!("reporter failed to log reporter_netlogger: {e}");
        } else {
            self.ctx.metrics.events_emitted_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_key_value_prefix() {
        let fields = parse_prefix("type=rule,table=wan-routing,ruleId=ab12,action=accept");
        assert_eq!(fields.get("type"), Some(&"rule"));
        assert_eq!(fields.get("table"), Some(&"wan-routing"));
        assert_eq!(fields.get("ruleId"), Some(&"ab12"));
        assert_eq!(fields.get("action"), Some(&"accept"));
    }

    #[test]
    fn non_matching_prefix_has_no_type_rule_entry() {
        let fields = parse_prefix("type=flow,table=lan-local");
        assert_ne!(fields.get("table").copied(), Some("wan-routing"));
    }

    #[tokio::test]
    async fn unresolvable_guid_falls_back_to_raw_short_id() {
        let ctx = Arc::new(super::super::context::testing::test_context().await);
        let plugin = ReporterPlugin::new(ctx);
        assert_eq!(plugin.resolve_guid("rule_table", "unknown-short-id").await, "unknown-short-id");
    }
}
