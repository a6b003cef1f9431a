//! DNS query plugin: decodes the first question of an outbound DNS
//! request and attaches it to the session for downstream plugins/tools.

use std::sync::Arc;

use async_trait::async_trait;

use crate::model::{Message, NfqueueResult, Plugin, Value};
use crate::sinks::dict::{DictKey, DictValue};
use crate::tables::SessionRef;

use super::context::PluginContext;

struct Question {
    name: String,
    qtype: u16,
    qclass: u16,
}

fn parse_first_question(payload: &[u8]) -> Option<Question> {
    if payload.len() < 12 {
        return None;
    }
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    if qdcount == 0 {
        return None;
    }
    let mut offset = 12;
    let mut labels = Vec::new();
    loop {
        let len = *payload.get(offset)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        // compression pointers are not expected in the question section of
        // a query; bail rather than mis-parse.
        if len & 0xC0 != 0 {
            return None;
        }
        offset += 1;
        let label = payload.get(offset..offset + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += len;
    }
    let qtype = u16::from_be_bytes([*payload.get(offset)?, *payload.get(offset + 1)?]);
    let qclass = u16::from_be_bytes([*payload.get(offset + 2)?, *payload.get(offset + 3)?]);
    Some(Question {
        name: labels.join("."),
        qtype,
        qclass,
    })
}

pub struct DnsPlugin {
    ctx: Arc<PluginContext>,
}

impl DnsPlugin {
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Plugin for DnsPlugin {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn priority(&self) -> i32 {
        super::priority::DNS_PRIORITY
    }

    async fn on_packet(&self, msg: &Message<'_>, session: &SessionRef, _new_session: bool) -> NfqueueResult {
        if !msg.client_to_server || msg.tuple.protocol != crate::model::Tuple::PROTO_UDP || msg.tuple.server_port != 53 {
            return NfqueueResult::default();
        }
        let Some(question) = parse_first_question(msg.l4_payload()) else {
            return NfqueueResult::release();
        };

        let conntrack_id = {
            let mut guard = session.lock().await;
            guard.put("dns_query_name", Value::Str(question.name.clone()));
            guard.put("dns_query_type", Value::U32(question.qtype as u32));
            guard.put("dns_query_class", Value::U32(question.qclass as u32));
            guard.conntrack_id
        };

        if !self.ctx.config.disable_dict {
            let _ = self
                .ctx
                .dict
                .write("sessions", &DictKey::Int(conntrack_id), "dns_query_name", &DictValue::Str(question.name))
                .await;
            self.ctx.metrics.dict_writes_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        NfqueueResult::release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_query(name: &str, qtype: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf[4..6].copy_from_slice(&1u16.to_be_bytes());
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // IN
        buf
    }

    #[test]
    fn parses_name_type_and_class_of_first_question() {
        let payload = build_query("example.com", 1);
        let q = parse_first_question(&payload).unwrap();
        assert_eq!(q.name, "example.com");
        assert_eq!(q.qtype, 1);
        assert_eq!(q.qclass, 1);
    }

    #[test]
    fn truncated_payload_returns_none() {
        assert_eq!(parse_first_question(&[0u8; 4]).is_none(), true);
    }
}
