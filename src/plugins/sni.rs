//! SNI extraction: pulls the `server_name` extension out of a TLS
//! ClientHello on flows bound for port 443, without reassembling the full
//! handshake (the ClientHello almost always fits in the first segment).

use async_trait::async_trait;

use crate::model::{Message, NfqueueResult, Plugin, Value};
use crate::sinks::dict::{DictKey, DictValue};
use crate::tables::SessionRef;

use super::context::PluginContext;

const MAX_ATTEMPTS: u32 = 5;

/// Walks a TLS record's ClientHello body at the documented byte offsets,
/// returning the `server_name` extension's hostname if present.
fn parse_client_hello_sni(payload: &[u8]) -> Option<String> {
    if payload.len() < 48 || payload[0] != 0x16 {
        return None;
    }
    let mut offset = 5; // record header: content_type(1) version(2) length(2)
    if payload.get(offset).copied() != Some(0x01) {
        return None; // handshake_type must be ClientHello
    }
    offset += 1; // handshake_type
    offset += 3; // handshake length (len24)
    offset += 2; // client_version
    offset += 4; // gmt_unix_time
    offset += 28; // random_bytes (28 after the 4-byte time, 32 total)

    let session_id_len = *payload.get(offset)? as usize;
    offset += 1 + session_id_len;

    let cipher_suites_len = u16::from_be_bytes([*payload.get(offset)?, *payload.get(offset + 1)?]) as usize;
    offset += 2 + cipher_suites_len;

    let compression_len = *payload.get(offset)? as usize;
    offset += 1 + compression_len;

    if offset + 2 > payload.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
    offset += 2;
    let extensions_end = (offset + extensions_len).min(payload.len());

    while offset + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
        let ext_len = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]) as usize;
        let ext_data_start = offset + 4;
        let ext_data_end = ext_data_start + ext_len;
        if ext_data_end > extensions_end {
            break;
        }
        if ext_type == 0x0000 {
            // server_name extension: list length(2) + name type(1) + name length(2) + name
            let inner = &payload[ext_data_start..ext_data_end];
            if inner.len() >= 5 {
                let name_len = u16::from_be_bytes([inner[3], inner[4]]) as usize;
                if inner.len() >= 5 + name_len {
                    return Some(String::from_utf8_lossy(&inner[5..5 + name_len]).into_owned());
                }
            }
        }
        offset = ext_data_end;
    }
    None
}

pub struct SniPlugin {
    ctx: std::sync::Arc<PluginContext>,
}

impl SniPlugin {
    pub fn new(ctx: std::sync::Arc<PluginContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Plugin for SniPlugin {
    fn name(&self) -> &'static str {
        "sni"
    }

    fn priority(&self) -> i32 {
        super::priority::SNI_PRIORITY
    }

    async fn on_packet(&self, msg: &Message<'_>, session: &SessionRef, _new_session: bool) -> NfqueueResult {
        if !msg.client_to_server || msg.tuple.protocol != crate::model::Tuple::PROTO_TCP || msg.tuple.server_port != 443 {
            return NfqueueResult::default();
        }

        let attempts = {
            let guard = session.lock().await;
            if guard.attachments.contains("ClientSNI") {
                return NfqueueResult::release();
            }
            match guard.get("sni_attempts") {
                Some(Value::U32(n)) => *n,
                _ => 0,
            }
        };

        if let Some(name) = parse_client_hello_sni(msg.l4_payload()) {
            let conntrack_id = {
                let mut guard = session.lock().await;
                guard.put("ClientSNI", Value::Str(name.clone()));
                guard.conntrack_id
            };
            if !self.ctx.config.disable_dict {
                let _ = self
                    .ctx
                    .dict
                    .write("sessions", &DictKey::Int(conntrack_id), "ClientSNI", &DictValue::Str(name))
                    .await;
                self.ctx.metrics.dict_writes_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            return NfqueueResult::release();
        }

        let attempts = attempts + 1;
        let mut guard = session.lock().await;
        guard.put("sni_attempts", Value::U32(attempts));
        if attempts >= MAX_ATTEMPTS {
            NfqueueResult::release()
        } else {
            NfqueueResult::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_client_hello(hostname: &str) -> Vec<u8> {
        let mut ext_inner = vec![0u8, 0u8]; // server_name_list length, filled below
        ext_inner.push(0x00); // name_type: host_name
        ext_inner.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
        ext_inner.extend_from_slice(hostname.as_bytes());
        let list_len = (ext_inner.len() - 2) as u16;
        ext_inner[0..2].copy_from_slice(&list_len.to_be_bytes());

        let mut extension = vec![0x00, 0x00]; // server_name extension type
        extension.extend_from_slice(&(ext_inner.len() as u16).to_be_bytes());
        extension.extend_from_slice(&ext_inner);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version
        body.extend_from_slice(&[0u8; 4]); // gmt_unix_time
        body.extend_from_slice(&[0u8; 28]); // random
        body.push(0); // session_id_length
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher_suites_length + one suite
        body.push(1); // compression_length
        body.push(0x00); // compression method
        body.extend_from_slice(&(extension.len() as u16).to_be_bytes());
        body.extend_from_slice(&extension);

        let mut handshake = vec![0x01]; // handshake_type: ClientHello
        let len24 = (body.len() as u32).to_be_bytes();
        handshake.extend_from_slice(&len24[1..4]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x03];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_hostname_from_server_name_extension() {
        let payload = build_client_hello("api.example.com");
        assert_eq!(parse_client_hello_sni(&payload).as_deref(), Some("api.example.com"));
    }

    #[test]
    fn short_payload_returns_none() {
        assert_eq!(parse_client_hello_sni(&[0x16; 10]), None);
    }

    #[test]
    fn non_tls_content_type_returns_none() {
        let mut payload = build_client_hello("api.example.com");
        payload[0] = 0x17;
        assert_eq!(parse_client_hello_sni(&payload), None);
    }
}
