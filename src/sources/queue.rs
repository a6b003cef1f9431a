//! The packet queue source: reads NFQUEUE messages, decodes IPv4/IPv6 +
//! TCP/UDP headers, and hands a [`crate::model::Message`] to the
//! dispatcher. Other L4 protocols are passed through with a default
//! accept verdict, matching "decoding parses IPv4 or IPv6, then TCP or
//! UDP; other L4 protocols are passed through with a default accept
//! verdict."

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use log::{error, warn};
use nfq::{Queue, Verdict};

use crate::dispatcher::Dispatcher;
use crate::model::{Message, Tuple};

use super::warehouse::{RecordKind, SharedCapture};

pub struct DecodedHeader {
    pub tuple: Tuple,
    pub family: u8,
    pub ip_header_len: usize,
    pub l4_header_len: usize,
    pub ttl_or_hop_limit: u8,
}

/// Parses IPv4/IPv6 + TCP/UDP/ICMP headers out of a raw packet. Returns
/// `None` for anything else (truncated packet, unsupported L4 protocol),
/// at which point the caller issues a bare accept verdict without
/// building a `Message`.
pub fn decode_packet(_conntrack_id: u32, raw: &[u8]) -> Option<DecodedHeader> {
    if raw.is_empty() {
        return None;
    }
    let version = raw[0] >> 4;
    match version {
        4 => decode_ipv4(raw),
        6 => decode_ipv6(raw),
        _ => None,
    }
}

fn decode_ipv4(raw: &[u8]) -> Option<DecodedHeader> {
    if raw.len() < 20 {
        return None;
    }
    let ihl = ((raw[0] & 0x0F) as usize) * 4;
    if raw.len() < ihl {
        return None;
    }
    let ttl = raw[8];
    let protocol = raw[9];
    let src = Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]);
    let dst = Ipv4Addr::new(raw[16], raw[17], raw[18], raw[19]);
    let l4 = &raw[ihl..];
    let (l4_header_len, src_port, dst_port) = decode_l4_ports(protocol, l4)?;

    Some(DecodedHeader {
        tuple: Tuple::new(protocol, IpAddr::V4(src), src_port, IpAddr::V4(dst), dst_port),
        family: 4,
        ip_header_len: ihl,
        l4_header_len,
        ttl_or_hop_limit: ttl,
    })
}

fn decode_ipv6(raw: &[u8]) -> Option<DecodedHeader> {
    if raw.len() < 40 {
        return None;
    }
    let hop_limit = raw[7];
    let next_header = raw[6];
    let src = Ipv6Addr::from(<[u8; 16]>::try_from(&raw[8..24]).ok()?);
    let dst = Ipv6Addr::from(<[u8; 16]>::try_from(&raw[24..40]).ok()?);
    let l4 = &raw[40..];
    let (l4_header_len, src_port, dst_port) = decode_l4_ports(next_header, l4)?;

    Some(DecodedHeader {
        tuple: Tuple::new(next_header, IpAddr::V6(src), src_port, IpAddr::V6(dst), dst_port),
        family: 6,
        ip_header_len: 40,
        l4_header_len,
        ttl_or_hop_limit: hop_limit,
    })
}

fn decode_l4_ports(protocol: u8, l4: &[u8]) -> Option<(usize, u16, u16)> {
    match protocol {
        Tuple::PROTO_TCP => {
            if l4.len() < 20 {
                return None;
            }
            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            let data_offset = ((l4[12] >> 4) as usize) * 4;
            Some((data_offset.max(20), src_port, dst_port))
        }
        Tuple::PROTO_UDP => {
            if l4.len() < 8 {
                return None;
            }
            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            Some((8, src_port, dst_port))
        }
        Tuple::PROTO_ICMP | Tuple::PROTO_ICMPV6 => Some((8, 0, 0)),
        _ => None,
    }
}

/// Runs the queue source loop until the shutdown signal fires. Each
/// decode error is logged and the loop continues; a fatal socket error
/// sets the process-wide shutdown flag via `shutdown.cancel()`.
pub async fn run(queue_num: u16, ingress_iface_of: impl Fn(u32) -> u32 + Send + 'static, dispatcher: Arc<Dispatcher>, capture: SharedCapture, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    let mut queue = Queue::open()?;
    queue.bind(queue_num)?;
    // Requests the NFQA_CT attribute (libnetfilter_queue's
    // NFQA_CFG_F_CONNTRACK queue flag) so each message carries the
    // kernel-assigned conntrack id alongside the packet, instead of
    // reusing the unrelated firewall-mark field.
    if let Err(e) = queue.set_recv_conntrack(true) {
        warn!("nfqueue: failed to request conntrack info delivery: {e}");
    }

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let mut msg = match queue.recv() {
            Ok(m) => m,
            Err(e) => {
                error!("nfqueue socket error, shutting down: {e}");
                shutdown.cancel();
                return Err(e.into());
            }
        };

        // `get_nfmark`/`set_nfmark` mirror libnetfilter_queue's
        // nfq_get_nfmark, the packet's firewall mark — not CTA_ID, the
        // kernel-assigned conntrack id spec requires (see netlog.rs's
        // own NFULA_CT/CTA_ID walk for the same id on the logging path).
        let conntrack_id = msg.get_conntrack_id().unwrap_or(0);
        let payload = msg.get_payload().to_vec();
        let ingress_iface = ingress_iface_of(conntrack_id);

        if let Some(writer) = capture.lock().await.as_mut() {
            // The frame payload re-embeds the conntrack id ahead of the
            // raw packet, mirroring the out-of-band way the live queue
            // source receives it; `playback` strips it back off.
            let mut frame_payload = conntrack_id.to_le_bytes().to_vec();
            frame_payload.extend_from_slice(&payload);
            if let Err(e) = writer.record(RecordKind::Packet, &frame_payload).await {
                warn!("nfqueue: failed to record capture frame: {e}");
            }
        }

        let Some(decoded) = decode_packet(conntrack_id, &payload) else {
            warn!("nfqueue: failed to decode packet on ctid {conntrack_id}, accepting unmodified");
            msg.set_verdict(Verdict::Accept);
            let _ = queue.verdict(msg);
            continue;
        };

        let message = Message {
            tuple: decoded.tuple,
            conntrack_id,
            family: decoded.family,
            ingress_iface,
            client_to_server: true,
            payload: &payload,
            ip_header_len: decoded.ip_header_len,
            l4_header_len: decoded.l4_header_len,
            ttl_or_hop_limit: decoded.ttl_or_hop_limit,
        };

        let verdict = dispatcher.dispatch_packet(message).await;
        dispatcher.metrics.record_packet();
        msg.set_verdict(if verdict.accept { Verdict::Accept } else { Verdict::Drop });
        msg.set_nfmark(verdict.mark);
        if let Err(e) = queue.verdict(msg) {
            warn!("nfqueue: failed to deliver verdict: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ipv4_tcp_tuple() {
        let mut raw = vec![0u8; 40];
        raw[0] = 0x45; // version 4, IHL 5
        raw[8] = 64; // ttl
        raw[9] = Tuple::PROTO_TCP;
        raw[12..16].copy_from_slice(&[10, 0, 0, 2]);
        raw[16..20].copy_from_slice(&[1, 2, 3, 4]);
        // TCP header starting at byte 20
        raw[20..22].copy_from_slice(&40001u16.to_be_bytes());
        raw[22..24].copy_from_slice(&443u16.to_be_bytes());
        raw[32] = 5 << 4; // data offset 5 (20 bytes)

        let decoded = decode_packet(7, &raw).unwrap();
        assert_eq!(decoded.family, 4);
        assert_eq!(decoded.tuple.client_port, 40001);
        assert_eq!(decoded.tuple.server_port, 443);
        assert_eq!(decoded.ttl_or_hop_limit, 64);
    }

    #[test]
    fn truncated_packet_is_rejected() {
        assert!(decode_packet(1, &[0x45]).is_none());
    }

    #[test]
    fn unsupported_l4_protocol_is_none() {
        let mut raw = vec![0u8; 24];
        raw[0] = 0x45;
        raw[9] = 47; // GRE, unsupported
        assert!(decode_packet(1, &raw).is_none());
    }
}
