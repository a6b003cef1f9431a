//! Record-and-replay mode for the packet/conntrack/netlog event streams.
//!
//! Capture writes every raw kernel event to a framed file: `record type
//! byte, length, payload`, prefixed here with a capture-relative
//! timestamp so playback can reproduce inter-event spacing. Playback
//! reads such a file and injects events at a configurable speed
//! multiplier; packet callbacks run synchronously to preserve ordering,
//! and verdicts are discarded. On completion, every session/conntrack id
//! that appeared during the run is purged.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::dispatcher::Dispatcher;
use crate::model::Message;

/// Holds the currently-active capture writer, if any. Shared by the three
/// kernel source loops and the management API's `/api/warehouse/capture`
/// handler, so capture can be started/stopped without restarting the
/// sources that feed it.
pub type SharedCapture = Arc<Mutex<Option<WarehouseWriter>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Packet = 0,
    Conntrack = 1,
    Netlog = 2,
}

impl RecordKind {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(RecordKind::Packet),
            1 => Some(RecordKind::Conntrack),
            2 => Some(RecordKind::Netlog),
            _ => None,
        }
    }
}

pub struct WarehouseWriter {
    file: tokio::fs::File,
    start: Instant,
}

impl WarehouseWriter {
    pub async fn create(path: &Path) -> anyhow::Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self { file, start: Instant::now() })
    }

    pub async fn record(&mut self, kind: RecordKind, payload: &[u8]) -> anyhow::Result<()> {
        let timestamp_ms = self.start.elapsed().as_millis() as u64;
        let mut frame = Vec::with_capacity(13 + payload.len());
        frame.push(kind as u8);
        frame.extend_from_slice(&timestamp_ms.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        self.file.write_all(&frame).await?;
        Ok(())
    }
}

struct Frame {
    kind: RecordKind,
    timestamp_ms: u64,
    payload: Vec<u8>,
}

async fn read_frame(file: &mut tokio::fs::File) -> anyhow::Result<Option<Frame>> {
    let mut kind_byte = [0u8; 1];
    match file.read_exact(&mut kind_byte).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let kind = RecordKind::from_u8(kind_byte[0]).ok_or_else(|| anyhow::anyhow!("unknown warehouse record type {}", kind_byte[0]))?;
    let mut ts_buf = [0u8; 8];
    file.read_exact(&mut ts_buf).await?;
    let timestamp_ms = u64::from_le_bytes(ts_buf);
    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload).await?;
    Ok(Some(Frame { kind, timestamp_ms, payload }))
}

/// Replays a captured file against `dispatcher`, synchronously (one
/// event at a time, regardless of the live pipeline's own concurrency),
/// scaling inter-event sleeps by `speed_multiplier`. Returns every
/// conntrack id observed, for the caller to purge from the live tables.
pub async fn playback(path: &Path, dispatcher: Arc<Dispatcher>, speed_multiplier: u32) -> anyhow::Result<Vec<u32>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut seen_ids = HashSet::new();
    let mut last_timestamp_ms: Option<u64> = None;
    let speed = speed_multiplier.max(1) as f64;

    while let Some(frame) = read_frame(&mut file).await? {
        if let Some(last) = last_timestamp_ms {
            let gap_ms = frame.timestamp_ms.saturating_sub(last) as f64 / speed;
            if gap_ms > 0.0 {
                tokio::time::sleep(Duration::from_millis(gap_ms as u64)).await;
            }
        }
        last_timestamp_ms = Some(frame.timestamp_ms);

        match frame.kind {
            RecordKind::Packet => {
                // conntrack_id travels as the first 4 bytes of the frame
                // payload ahead of the raw packet, mirroring how the
                // queue source receives it out-of-band from the kernel;
                // captured frames re-embed it for replay.
                if frame.payload.len() >= 4 {
                    let ctid = u32::from_le_bytes(frame.payload[0..4].try_into().unwrap());
                    seen_ids.insert(ctid);
                    let raw = &frame.payload[4..];
                    if let Some(decoded) = crate::sources::queue::decode_packet(ctid, raw) {
                        let message = Message {
                            tuple: decoded.tuple,
                            conntrack_id: ctid,
                            family: decoded.family,
                            ingress_iface: 0,
                            client_to_server: true,
                            payload: raw,
                            ip_header_len: decoded.ip_header_len,
                            l4_header_len: decoded.l4_header_len,
                            ttl_or_hop_limit: decoded.ttl_or_hop_limit,
                        };
                        // verdict discarded in playback mode.
                        let _ = dispatcher.dispatch_packet(message).await;
                    }
                }
            }
            RecordKind::Conntrack => {
                if let Some((header, body)) = crate::sources::netlink_raw::parse_nlmsghdr(&frame.payload) {
                    if let Some(event) = crate::sources::conntrack::decode_event(header.msg_type, header.flags, body) {
                        seen_ids.insert(event.conntrack_id);
                        crate::sources::conntrack::dispatch_decoded(&dispatcher, event).await;
                    }
                }
            }
            RecordKind::Netlog => {
                if let Some((header, body)) = crate::sources::netlink_raw::parse_nlmsghdr(&frame.payload) {
                    if let Some(event) = crate::sources::netlog::decode_event(header.msg_type, body) {
                        if let Some(ctid) = event.ctid {
                            seen_ids.insert(ctid);
                        }
                        dispatcher.dispatch_netlog(event).await;
                    }
                }
            }
        }
    }

    let ids: Vec<u32> = seen_ids.into_iter().collect();
    dispatcher.sessions.purge_ids(&ids);
    dispatcher.conntracks.purge_ids(&ids);
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_then_playback_round_trips_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warehouse.bin");
        {
            let mut writer = WarehouseWriter::create(&path).await.unwrap();
            let mut frame_payload = 7u32.to_le_bytes().to_vec();
            let mut raw = vec![0u8; 28];
            raw[0] = 0x45;
            raw[9] = 17;
            raw[12..16].copy_from_slice(&[10, 0, 0, 2]);
            raw[16..20].copy_from_slice(&[8, 8, 8, 8]);
            raw[20..22].copy_from_slice(&5353u16.to_be_bytes());
            raw[22..24].copy_from_slice(&53u16.to_be_bytes());
            frame_payload.extend_from_slice(&raw);
            writer.record(RecordKind::Packet, &frame_payload).await.unwrap();
        }

        let mut registry = crate::dispatcher::Registry::new();
        struct Noop;
        #[async_trait::async_trait]
        impl crate::model::Plugin for Noop {
            fn name(&self) -> &'static str {
                "noop"
            }
            fn priority(&self) -> i32 {
                0
            }
        }
        registry.register(Arc::new(Noop));
        let dispatcher = Arc::new(Dispatcher::new(registry, Arc::new(crate::metrics::Metrics::new())));

        let ids = playback(&path, dispatcher.clone(), 10).await.unwrap();
        assert_eq!(ids, vec![7]);
        assert_eq!(dispatcher.sessions.len(), 0, "playback completion purges sessions that appeared");
    }
}
