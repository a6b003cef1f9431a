//! Application classification: forwards packets to an external `classd`
//! service over a length-prefixed TCP protocol and projects its verdict
//! (application id/name, protochain, category, productivity, risk,
//! detail, confidence) onto the session. Also maintains a rate-limited
//! cloud summary, periodically POSTed to a configured endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::ErrorClass;
use crate::model::{Message, NfqueueResult, Plugin, Value};
use crate::sinks::dict::{DictKey, DictValue};
use crate::tables::SessionRef;

use super::context::PluginContext;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RESPONSE_LEN: u32 = 64 * 1024;
const SUMMARY_CAP: usize = 100;
const SUMMARY_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Default, Clone)]
struct ClassifyVerdict {
    app_id: u32,
    app_name: String,
    protochain: String,
    category: String,
    productivity: String,
    risk: String,
    detail: String,
    confidence: u32,
}

/// Parses classd's length-prefixed response: a 4-byte big-endian length
/// followed by `app_id:app_name:protochain:category:productivity:risk:detail:confidence`.
fn parse_response(body: &[u8]) -> Option<ClassifyVerdict> {
    let text = std::str::from_utf8(body).ok()?;
    let mut parts = text.splitn(8, ':');
    let app_id = parts.next()?.parse().ok()?;
    let app_name = parts.next()?.to_string();
    let protochain = parts.next()?.to_string();
    let category = parts.next()?.to_string();
    let productivity = parts.next()?.to_string();
    let risk = parts.next()?.to_string();
    let detail = parts.next()?.to_string();
    let confidence = parts.next()?.trim().parse().ok()?;
    Some(ClassifyVerdict {
        app_id,
        app_name,
        protochain,
        category,
        productivity,
        risk,
        detail,
        confidence,
    })
}

async fn query_classd(address: &str, payload: &[u8]) -> anyhow::Result<ClassifyVerdict> {
    let attempt = async {
        let mut stream = TcpStream::connect(address).await?;
        let len = payload.len() as u32;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(payload).await?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let resp_len = u32::from_be_bytes(len_buf);
        if resp_len > MAX_RESPONSE_LEN {
            anyhow::bail!("classd response length {resp_len} exceeds bound");
        }
        let mut body = vec![0u8; resp_len as usize];
        stream.read_exact(&mut body).await?;
        parse_response(&body).ok_or_else(|| anyhow::anyhow!("malformed classd response"))
    };
    tokio::time::timeout(DIAL_TIMEOUT, attempt).await?
}

async fn project_verdict(session: &SessionRef, dict: &crate::sinks::dict::SharedDictSink, disable_dict: bool, conntrack_id: u32, verdict: &ClassifyVerdict) {
    {
        let mut guard = session.lock().await;
        guard.put("app_id", Value::U32(verdict.app_id));
        guard.put("app_name", Value::Str(verdict.app_name.clone()));
        guard.put("protochain", Value::Str(verdict.protochain.clone()));
        guard.put("category", Value::Str(verdict.category.clone()));
    }
    if disable_dict {
        return;
    }
    let key = DictKey::Int(conntrack_id);
    let fields: Vec<(&str, DictValue)> = vec![
        ("app_id", DictValue::Int(verdict.app_id)),
        ("app_name", DictValue::Str(verdict.app_name.clone())),
        ("protochain", DictValue::Str(verdict.protochain.clone())),
        ("category", DictValue::Str(verdict.category.clone())),
        ("productivity", DictValue::Str(verdict.productivity.clone())),
        ("risk", DictValue::Str(verdict.risk.clone())),
        ("detail", DictValue::Str(verdict.detail.clone())),
        ("confidence", DictValue::Int(verdict.confidence)),
    ];
    for (field, value) in fields {
        let _ = dict.write("sessions", &key, field, &value).await;
    }
}

#[derive(Clone, Serialize)]
struct CloudSummaryEntry {
    server: String,
    application: String,
    protochain: String,
    detail: String,
    count: u64,
}

#[derive(Serialize)]
struct CloudSummaryPayload {
    device_uid: String,
    entries: Vec<CloudSummaryEntry>,
}

struct SummaryState {
    entries: HashMap<String, CloudSummaryEntry>,
}

impl SummaryState {
    fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    fn record(&mut self, server: &str, verdict: &ClassifyVerdict) {
        if let Some(existing) = self.entries.get_mut(server) {
            existing.count += 1;
            return;
        }
        if self.entries.len() >= SUMMARY_CAP {
            return;
        }
        self.entries.insert(
            server.to_string(),
            CloudSummaryEntry {
                server: server.to_string(),
                application: verdict.app_name.clone(),
                protochain: verdict.protochain.clone(),
                detail: verdict.detail.clone(),
                count: 1,
            },
        );
    }

    fn drain(&mut self) -> Vec<CloudSummaryEntry> {
        self.entries.drain().map(|(_, v)| v).collect()
    }
}

pub struct ClassifyPlugin {
    ctx: Arc<PluginContext>,
    summary: AsyncMutex<SummaryState>,
}

impl ClassifyPlugin {
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        Self {
            ctx,
            summary: AsyncMutex::new(SummaryState::new()),
        }
    }

    async fn publish_summary(&self) {
        let Some(endpoint) = self.ctx.config.classify.cloud_endpoint.clone() else {
            return;
        };
        let entries = self.summary.lock().await.drain();
        if entries.is_empty() {
            return;
        }
        let payload = CloudSummaryPayload {
            device_uid: self.ctx.device_uid.clone(),
            entries,
        };
        let client = reqwest::Client::new();
        if let Err(e) = client.post(&endpoint).json(&payload).send().await {
            warn!("classify cloud summary post to {endpoint} failed: {e}");
            self.ctx.metrics.record_error(ErrorClass::TransientExternal);
        }
    }
}

#[async_trait]
impl Plugin for ClassifyPlugin {
    fn name(&self) -> &'static str {
        "classify"
    }

    fn priority(&self) -> i32 {
        super::priority::CLASSIFY_PRIORITY
    }

    async fn on_packet(&self, msg: &Message<'_>, session: &SessionRef, _new_session: bool) -> NfqueueResult {
        {
            let mut guard = session.lock().await;
            if guard.attachments.contains("classify_started") {
                return NfqueueResult::default();
            }
            guard.put("classify_started", Value::Bool(true));
        }

        let payload = msg.l4_payload().to_vec();
        let address = self.ctx.config.classd_address.clone();
        match query_classd(&address, &payload).await {
            Ok(verdict) => {
                let conntrack_id = msg.conntrack_id;
                project_verdict(session, &self.ctx.dict, self.ctx.config.disable_dict, conntrack_id, &verdict).await;
                let server = format!("{}:{}", msg.tuple.server_addr, msg.tuple.server_port);
                self.summary.lock().await.record(&server, &verdict);
            }
            Err(e) => {
                debug!("classify query to {address} failed: {e}");
                self.ctx.metrics.record_error(ErrorClass::TransientExternal);
                let mut guard = session.lock().await;
                guard.put("classify_status", Value::Str("unavailable".to_string()));
            }
        }

        NfqueueResult::release()
    }

    async fn startup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Drives the periodic cloud-summary POST. Spawned once from the daemon's
/// startup sequence alongside the other periodic tasks.
pub async fn run_summary_loop(plugin: Arc<ClassifyPlugin>) {
    let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
    loop {
        ticker.tick().await;
        plugin.publish_summary().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_response() {
        let body = b"42:Netflix:tcp/tls:streaming:low:low:video-stream:87";
        let verdict = parse_response(body).expect("should parse");
        assert_eq!(verdict.app_id, 42);
        assert_eq!(verdict.app_name, "Netflix");
        assert_eq!(verdict.protochain, "tcp/tls");
        assert_eq!(verdict.confidence, 87);
    }

    #[test]
    fn truncated_response_returns_none() {
        assert!(parse_response(b"42:Netflix").is_none());
    }

    #[test]
    fn summary_state_caps_at_bound_and_counts_repeats() {
        let mut state = SummaryState::new();
        let verdict = ClassifyVerdict {
            app_name: "App".to_string(),
            protochain: "tcp".to_string(),
            detail: "d".to_string(),
            ..Default::default()
        };
        for i in 0..(SUMMARY_CAP + 10) {
            state.record(&format!("10.0.0.{i}:443"), &verdict);
        }
        assert_eq!(state.entries.len(), SUMMARY_CAP);

        state.record("10.0.0.0:443", &verdict);
        assert_eq!(state.entries.get("10.0.0.0:443").unwrap().count, 2);
    }
}
