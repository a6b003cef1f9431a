//! The conntrack source: decodes `NETLINK_NETFILTER` ctnetlink multicast
//! events into `{ kind, conntrack_id, orig_tuple, reply_tuple, counters,
//! connmark, tcp_state, timeout, timestamps, family }` and feeds them to
//! the dispatcher's conntrack pipeline.
//!
//! Attribute numbering follows the ctnetlink wire format (`CTA_*`).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use log::{error, warn};

use crate::dispatcher::Dispatcher;
use crate::model::{ConntrackKind, Tuple};

use super::netlink_raw::{be_u16, be_u32, walk_attrs};
use super::warehouse::{RecordKind, SharedCapture};

const NFNL_SUBSYS_CTNETLINK: u8 = 1;
const IPCTNL_MSG_CT_NEW: u8 = 0;
const IPCTNL_MSG_CT_DELETE: u8 = 2;
const NLM_F_CREATE: u16 = 0x400;
const NLM_F_EXCL: u16 = 0x200;

const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_REPLY: u16 = 2;
const CTA_PROTOINFO: u16 = 4;
const CTA_TIMEOUT: u16 = 7;
const CTA_MARK: u16 = 8;
const CTA_COUNTERS_ORIG: u16 = 9;
const CTA_COUNTERS_REPLY: u16 = 10;
const CTA_ID: u16 = 12;

const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;

const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;

const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

const CTA_PROTOINFO_TCP: u16 = 1;
const CTA_PROTOINFO_TCP_STATE: u16 = 1;

const CTA_COUNTERS_PACKETS: u16 = 1;
const CTA_COUNTERS_BYTES: u16 = 2;

#[derive(Default)]
struct RawTuple {
    src: Option<IpAddr>,
    dst: Option<IpAddr>,
    protocol: Option<u8>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
}

fn parse_tuple(buf: &[u8]) -> Option<Tuple> {
    let mut raw = RawTuple::default();
    for attr in walk_attrs(buf) {
        match attr.attr_type {
            CTA_TUPLE_IP => {
                for ip_attr in walk_attrs(attr.value) {
                    match ip_attr.attr_type {
                        CTA_IP_V4_SRC => raw.src = ip_attr.value.get(0..4).map(|b| IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))),
                        CTA_IP_V4_DST => raw.dst = ip_attr.value.get(0..4).map(|b| IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))),
                        CTA_IP_V6_SRC => raw.src = <[u8; 16]>::try_from(ip_attr.value).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
                        CTA_IP_V6_DST => raw.dst = <[u8; 16]>::try_from(ip_attr.value).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
                        _ => {}
                    }
                }
            }
            CTA_TUPLE_PROTO => {
                for proto_attr in walk_attrs(attr.value) {
                    match proto_attr.attr_type {
                        CTA_PROTO_NUM => raw.protocol = proto_attr.value.first().copied(),
                        CTA_PROTO_SRC_PORT => raw.src_port = be_u16(proto_attr.value),
                        CTA_PROTO_DST_PORT => raw.dst_port = be_u16(proto_attr.value),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    Some(Tuple::new(raw.protocol?, raw.src?, raw.src_port.unwrap_or(0), raw.dst?, raw.dst_port.unwrap_or(0)))
}

fn parse_counters(buf: &[u8]) -> (u64, u64) {
    let mut packets = 0u64;
    let mut bytes = 0u64;
    for attr in walk_attrs(buf) {
        match attr.attr_type {
            CTA_COUNTERS_PACKETS => packets = super::netlink_raw::be_u64(attr.value).unwrap_or(0),
            CTA_COUNTERS_BYTES => bytes = super::netlink_raw::be_u64(attr.value).unwrap_or(0),
            _ => {}
        }
    }
    (packets, bytes)
}

pub struct DecodedConntrackEvent {
    pub kind: ConntrackKind,
    pub conntrack_id: u32,
    pub orig_tuple: Tuple,
    pub reply_tuple: Option<Tuple>,
    pub counters: Option<(u64, u64, u64, u64)>,
    pub connmark: u32,
    pub tcp_state: Option<u8>,
    pub timeout: u32,
    pub family: u8,
}

/// Decodes one ctnetlink multicast message. Returns `None` (logged as
/// malformed) for a subsystem/message type this daemon doesn't handle,
/// or a truncated/unparseable body.
pub fn decode_event(msg_type: u16, flags: u16, body: &[u8]) -> Option<DecodedConntrackEvent> {
    let subsys = (msg_type >> 8) as u8;
    if subsys != NFNL_SUBSYS_CTNETLINK {
        return None;
    }
    let ct_msg_type = (msg_type & 0xFF) as u8;
    // the nfgenmsg header (family, version, res_id) precedes the CTA_*
    // attribute stream.
    if body.len() < 4 {
        return None;
    }
    let family_byte = body[0];
    let family = if family_byte == libc::AF_INET6 as u8 { 6 } else { 4 };
    let attrs = walk_attrs(&body[4..]);

    let mut orig_tuple = None;
    let mut reply_tuple = None;
    let mut counters_orig = None;
    let mut counters_reply = None;
    let mut connmark = 0u32;
    let mut tcp_state = None;
    let mut timeout = 0u32;
    let mut conntrack_id = None;

    for attr in &attrs {
        match attr.attr_type {
            CTA_TUPLE_ORIG => orig_tuple = parse_tuple(attr.value),
            CTA_TUPLE_REPLY => reply_tuple = parse_tuple(attr.value),
            CTA_COUNTERS_ORIG => counters_orig = Some(parse_counters(attr.value)),
            CTA_COUNTERS_REPLY => counters_reply = Some(parse_counters(attr.value)),
            CTA_MARK => connmark = be_u32(attr.value).unwrap_or(0),
            CTA_TIMEOUT => timeout = be_u32(attr.value).unwrap_or(0),
            CTA_ID => conntrack_id = be_u32(attr.value),
            CTA_PROTOINFO => {
                for proto_attr in walk_attrs(attr.value) {
                    if proto_attr.attr_type == CTA_PROTOINFO_TCP {
                        for tcp_attr in walk_attrs(proto_attr.value) {
                            if tcp_attr.attr_type == CTA_PROTOINFO_TCP_STATE {
                                tcp_state = tcp_attr.value.first().copied();
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let orig_tuple = orig_tuple?;
    let conntrack_id = conntrack_id.unwrap_or(0);

    let kind = match ct_msg_type {
        IPCTNL_MSG_CT_NEW if flags & NLM_F_CREATE != 0 && flags & NLM_F_EXCL != 0 => ConntrackKind::New,
        IPCTNL_MSG_CT_NEW => ConntrackKind::Update,
        IPCTNL_MSG_CT_DELETE => ConntrackKind::Destroy,
        _ => return None,
    };

    let counters = match (counters_orig, counters_reply) {
        (Some((c2s_packets, c2s_bytes)), Some((s2c_packets, s2c_bytes))) => Some((c2s_bytes, c2s_packets, s2c_bytes, s2c_packets)),
        _ => None,
    };

    Some(DecodedConntrackEvent {
        kind,
        conntrack_id,
        orig_tuple,
        reply_tuple,
        counters,
        connmark,
        tcp_state,
        timeout,
        family,
    })
}

/// Feeds one decoded event into the dispatcher's conntrack pipeline.
pub async fn dispatch_decoded(dispatcher: &Arc<Dispatcher>, event: DecodedConntrackEvent) {
    dispatcher.metrics.record_conntrack_event();
    dispatcher
        .dispatch_conntrack(
            event.kind,
            event.conntrack_id,
            event.orig_tuple,
            event.reply_tuple,
            event.counters,
            event.connmark,
            event.tcp_state,
            event.timeout,
            event.family,
        )
        .await;
}

/// Runs the conntrack netlink multicast reader loop. A decode error on
/// one message is logged and the loop continues; a fatal socket error
/// sets the shutdown flag.
pub async fn run(socket: super::raw_socket::NetlinkSocket, dispatcher: Arc<Dispatcher>, capture: SharedCapture, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let datagram = match socket.recv().await {
            Ok(d) => d,
            Err(e) => {
                error!("conntrack netlink socket error, shutting down: {e}");
                shutdown.cancel();
                return Err(e);
            }
        };
        if let Some(writer) = capture.lock().await.as_mut() {
            if let Err(e) = writer.record(RecordKind::Conntrack, &datagram).await {
                warn!("conntrack: failed to record capture frame: {e}");
            }
        }
        let Some((header, body)) = super::netlink_raw::parse_nlmsghdr(&datagram) else {
            warn!("conntrack: truncated netlink message");
            continue;
        };
        match decode_event(header.msg_type, header.flags, body) {
            Some(event) => dispatch_decoded(&dispatcher, event).await,
            None => warn!("conntrack: unparseable or irrelevant netlink message, msg_type={}", header.msg_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_attr(attr_type: u16, value: &[u8]) -> Vec<u8> {
        let len = (4 + value.len()) as u16;
        let mut out = len.to_ne_bytes().to_vec();
        out.extend_from_slice(&attr_type.to_ne_bytes());
        out.extend_from_slice(value);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn encode_tuple(src: [u8; 4], dst: [u8; 4], proto: u8, src_port: u16, dst_port: u16) -> Vec<u8> {
        let ip = [encode_attr(CTA_IP_V4_SRC, &src), encode_attr(CTA_IP_V4_DST, &dst)].concat();
        let proto_attrs = [
            encode_attr(CTA_PROTO_NUM, &[proto]),
            encode_attr(CTA_PROTO_SRC_PORT, &src_port.to_be_bytes()),
            encode_attr(CTA_PROTO_DST_PORT, &dst_port.to_be_bytes()),
        ]
        .concat();
        [encode_attr(CTA_TUPLE_IP, &ip), encode_attr(CTA_TUPLE_PROTO, &proto_attrs)].concat()
    }

    #[test]
    fn decodes_new_event_with_create_excl_flags() {
        let tuple = encode_tuple([10, 0, 0, 2], [1, 2, 3, 4], Tuple::PROTO_TCP, 40001, 443);
        let mut body = vec![libc::AF_INET as u8, 0, 0, 0];
        body.extend(encode_attr(CTA_TUPLE_ORIG, &tuple));
        body.extend(encode_attr(CTA_ID, &7u32.to_be_bytes()));

        let msg_type = ((NFNL_SUBSYS_CTNETLINK as u16) << 8) | IPCTNL_MSG_CT_NEW as u16;
        let event = decode_event(msg_type, NLM_F_CREATE | NLM_F_EXCL, &body).unwrap();
        assert!(matches!(event.kind, ConntrackKind::New));
        assert_eq!(event.conntrack_id, 7);
        assert_eq!(event.orig_tuple.client_port, 40001);
        assert_eq!(event.orig_tuple.server_port, 443);
    }

    #[test]
    fn decodes_destroy_event() {
        let tuple = encode_tuple([10, 0, 0, 2], [1, 2, 3, 4], Tuple::PROTO_TCP, 1, 2);
        let mut body = vec![libc::AF_INET as u8, 0, 0, 0];
        body.extend(encode_attr(CTA_TUPLE_ORIG, &tuple));
        let msg_type = ((NFNL_SUBSYS_CTNETLINK as u16) << 8) | IPCTNL_MSG_CT_DELETE as u16;
        let event = decode_event(msg_type, 0, &body).unwrap();
        assert!(matches!(event.kind, ConntrackKind::Destroy));
    }
}
