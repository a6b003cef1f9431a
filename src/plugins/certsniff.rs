//! Passive certificate observation: for TCP flows that aren't bound for
//! port 443 but still open a TLS session (an app using a nonstandard
//! port, a proxy, etc.), watches the handshake for a CLIENT_HELLO and
//! then reassembles enough of the server's reply to pull the leaf
//! certificate out of a CERTIFICATE handshake message.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use crate::model::{Message, NfqueueResult, Plugin, Value};
use crate::tables::cert_cache::FetchOutcome;
use crate::tables::SessionRef;

use super::cert_common::{parse_der, project_cert};
use super::context::PluginContext;

const MAX_CLIENT_HELLO_PACKETS: u32 = 5;
const MAX_SERVER_PACKETS: u32 = 20;
const WATCHDOG_LIMIT: u32 = 100;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    SearchClientHello,
    CollectServer,
}

#[derive(Default)]
struct CertsniffState {
    phase_is_search: bool,
    client_hello_packets: u32,
    server_packets_seen: u32,
    server_buffer: Vec<Vec<u8>>,
    done: bool,
}

impl CertsniffState {
    fn new() -> Self {
        Self {
            phase_is_search: true,
            ..Default::default()
        }
    }

    fn phase(&self) -> Phase {
        if self.phase_is_search {
            Phase::SearchClientHello
        } else {
            Phase::CollectServer
        }
    }
}

fn looks_like_client_hello(payload: &[u8]) -> bool {
    payload.len() >= 6 && payload[0] == 0x16 && payload[1] == 0x03 && payload[5] == 0x01
}

fn extract_cert_from_handshake_message(msg: &[u8]) -> Option<Vec<u8>> {
    if msg.len() < 13 || msg[0] != 0x0B {
        return None;
    }
    let cert_len = u32::from_be_bytes([0, msg[7], msg[8], msg[9]]) as usize;
    let start = 10;
    if msg.len() < start + cert_len {
        return None;
    }
    Some(msg[start..start + cert_len].to_vec())
}

fn walk_handshake_messages(payload: &[u8], watchdog: &mut u32) -> Option<Vec<u8>> {
    let mut offset = 0;
    while offset + 4 <= payload.len() {
        *watchdog += 1;
        if *watchdog > WATCHDOG_LIMIT {
            return None;
        }
        let msg_type = payload[offset];
        let msg_len = u32::from_be_bytes([0, payload[offset + 1], payload[offset + 2], payload[offset + 3]]) as usize;
        let msg_end = offset + 4 + msg_len;
        if msg_end > payload.len() {
            break;
        }
        if msg_type == 0x0B {
            if let Some(cert) = extract_cert_from_handshake_message(&payload[offset..msg_end]) {
                return Some(cert);
            }
        }
        offset = msg_end;
    }
    None
}

fn try_extract_certificate(buffers: &[Vec<u8>]) -> Option<Vec<u8>> {
    let concatenated: Vec<u8> = buffers.concat();
    let mut offset = 0;
    let mut watchdog = 0u32;
    while offset + 5 <= concatenated.len() {
        watchdog += 1;
        if watchdog > WATCHDOG_LIMIT {
            break;
        }
        let content_type = concatenated[offset];
        let version_major = concatenated[offset + 1];
        let record_len = u16::from_be_bytes([concatenated[offset + 3], concatenated[offset + 4]]) as usize;
        let record_end = offset + 5 + record_len;
        if record_end > concatenated.len() {
            break;
        }
        if content_type == 0x16 && version_major == 0x03 {
            if let Some(cert) = walk_handshake_messages(&concatenated[offset + 5..record_end], &mut watchdog) {
                return Some(cert);
            }
        }
        offset = record_end;
    }
    None
}

pub struct CertSniffPlugin {
    ctx: Arc<PluginContext>,
}

impl CertSniffPlugin {
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Plugin for CertSniffPlugin {
    fn name(&self) -> &'static str {
        "certsniff"
    }

    fn priority(&self) -> i32 {
        super::priority::CERTSNIFF_PRIORITY
    }

    async fn on_packet(&self, msg: &Message<'_>, session: &SessionRef, _new_session: bool) -> NfqueueResult {
        if msg.tuple.protocol != crate::model::Tuple::PROTO_TCP || msg.tuple.server_port == 443 {
            return NfqueueResult::default();
        }

        let state_arc = {
            let mut guard = session.lock().await;
            match guard.get("certsniff_state") {
                Some(Value::Custom(any)) => match any.clone().downcast::<StdMutex<CertsniffState>>() {
                    Ok(state) => state,
                    Err(_) => return NfqueueResult::release(),
                },
                _ => {
                    let state: Arc<StdMutex<CertsniffState>> = Arc::new(StdMutex::new(CertsniffState::new()));
                    guard.put("certsniff_state", Value::Custom(state.clone()));
                    state
                }
            }
        };

        let cert_der = {
            let mut state = state_arc.lock().unwrap();
            if state.done {
                None
            } else {
                match state.phase() {
                    Phase::SearchClientHello => {
                        if msg.client_to_server {
                            state.client_hello_packets += 1;
                            if looks_like_client_hello(msg.l4_payload()) {
                                state.phase_is_search = false;
                            } else if state.client_hello_packets >= MAX_CLIENT_HELLO_PACKETS {
                                state.done = true;
                            }
                        }
                        None
                    }
                    Phase::CollectServer => {
                        if !msg.client_to_server {
                            state.server_packets_seen += 1;
                            state.server_buffer.push(msg.l4_payload().to_vec());
                            if state.server_buffer.len() > 10 {
                                state.server_buffer.remove(0);
                            }
                            let found = try_extract_certificate(&state.server_buffer);
                            if found.is_some() || state.server_packets_seen >= MAX_SERVER_PACKETS {
                                state.done = true;
                            }
                            found
                        } else {
                            None
                        }
                    }
                }
            }
        };

        let Some(der) = cert_der else {
            let done = state_arc.lock().unwrap().done;
            return if done { NfqueueResult::release() } else { NfqueueResult::default() };
        };

        let Some(cert) = parse_der(der) else {
            return NfqueueResult::release();
        };

        let server_addr = format!("{}:{}", msg.tuple.server_addr, msg.tuple.server_port);
        let holder = match self.ctx.cert_cache.get_or_insert(&server_addr) {
            FetchOutcome::YouFetch(holder) => {
                holder.fulfil(Arc::new(cert)).await;
                holder
            }
            FetchOutcome::Wait(holder) => holder,
        };
        if let Some(cert) = holder.wait_ready().await {
            project_cert(session, &self.ctx.dict, self.ctx.config.disable_dict, msg.conntrack_id, cert).await;
        }

        NfqueueResult::release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_marker_detected_at_fixed_offsets() {
        let mut payload = vec![0u8; 10];
        payload[0] = 0x16;
        payload[1] = 0x03;
        payload[5] = 0x01;
        assert!(looks_like_client_hello(&payload));
    }

    #[test]
    fn certificate_message_extracted_from_synthetic_record() {
        let cert_bytes = vec![0xAA; 16];
        let mut first_cert = (cert_bytes.len() as u32).to_be_bytes()[1..4].to_vec();
        first_cert.extend_from_slice(&cert_bytes);
        let certs_total_len = first_cert.len() as u32;
        let mut handshake_body = certs_total_len.to_be_bytes()[1..4].to_vec();
        handshake_body.extend_from_slice(&first_cert);

        let mut handshake_msg = vec![0x0B];
        handshake_msg.extend_from_slice(&(handshake_body.len() as u32).to_be_bytes()[1..4]);
        handshake_msg.extend_from_slice(&handshake_body);

        let mut record = vec![0x16, 0x03, 0x03];
        record.extend_from_slice(&(handshake_msg.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake_msg);

        let extracted = try_extract_certificate(&[record]);
        assert_eq!(extracted, Some(cert_bytes));
    }
}
