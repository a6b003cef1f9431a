//! The netlog source: decodes NFULNL (`NETLINK_NETFILTER`, ULOG
//! subsystem) packet-logging records into [`crate::model::NetlogEvent`].
//! The prefix string carries small JSON blobs (`{type, table, chain,
//! ruleId, action, policy}`) used by the reporter plugin for rule-hit
//! attribution.

use std::net::IpAddr;
use std::sync::Arc;

use log::{error, warn};

use crate::dispatcher::Dispatcher;
use crate::model::NetlogEvent;

use super::netlink_raw::{be_u32, walk_attrs};
use super::queue::decode_packet;
use super::warehouse::{RecordKind, SharedCapture};

const NFNL_SUBSYS_ULOG: u8 = 4;
const NFULNL_MSG_PACKET: u8 = 0;

const NFULA_MARK: u16 = 2;
const NFULA_IFINDEX_INDEV: u16 = 4;
const NFULA_IFINDEX_OUTDEV: u16 = 5;
const NFULA_PAYLOAD: u16 = 9;
const NFULA_PREFIX: u16 = 10;
const NFULA_CT: u16 = 13;

const CTA_ID: u16 = 12;

/// Decodes one NFULNL packet-logging message body.
pub fn decode_event(msg_type: u16, body: &[u8]) -> Option<NetlogEvent> {
    let subsys = (msg_type >> 8) as u8;
    if subsys != NFNL_SUBSYS_ULOG || (msg_type & 0xFF) as u8 != NFULNL_MSG_PACKET {
        return None;
    }
    if body.len() < 4 {
        return None;
    }
    let attrs = walk_attrs(&body[4..]);

    let mut payload: Option<&[u8]> = None;
    let mut prefix = String::new();
    let mut mark = 0u32;
    let mut src_iface = 0u32;
    let mut dst_iface = 0u32;
    let mut ctid = None;

    for attr in &attrs {
        match attr.attr_type {
            NFULA_PAYLOAD => payload = Some(attr.value),
            NFULA_PREFIX => {
                let end = attr.value.iter().position(|&b| b == 0).unwrap_or(attr.value.len());
                prefix = String::from_utf8_lossy(&attr.value[..end]).into_owned();
            }
            NFULA_MARK => mark = be_u32(attr.value).unwrap_or(0),
            NFULA_IFINDEX_INDEV => src_iface = be_u32(attr.value).unwrap_or(0),
            NFULA_IFINDEX_OUTDEV => dst_iface = be_u32(attr.value).unwrap_or(0),
            NFULA_CT => {
                for ct_attr in walk_attrs(attr.value) {
                    if ct_attr.attr_type == CTA_ID {
                        ctid = be_u32(ct_attr.value);
                    }
                }
            }
            _ => {}
        }
    }

    let payload = payload?;
    let decoded = decode_packet(0, payload);

    let (protocol, src_addr, dst_addr, src_port, dst_port, icmp_type) = match &decoded {
        Some(d) => {
            let icmp_type = if matches!(d.tuple.protocol, 1 | 58) {
                payload.get(d.ip_header_len).copied()
            } else {
                None
            };
            (d.tuple.protocol, d.tuple.client_addr, d.tuple.server_addr, d.tuple.client_port, d.tuple.server_port, icmp_type)
        }
        None => (0, IpAddr::from([0, 0, 0, 0]), IpAddr::from([0, 0, 0, 0]), 0, 0, None),
    };

    Some(NetlogEvent {
        protocol,
        icmp_type,
        src_iface,
        dst_iface,
        src_addr,
        dst_addr,
        src_port,
        dst_port,
        mark,
        ctid,
        prefix,
    })
}

/// Runs the netlog netlink multicast reader loop.
pub async fn run(socket: super::raw_socket::NetlinkSocket, dispatcher: Arc<Dispatcher>, capture: SharedCapture, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let datagram = match socket.recv().await {
            Ok(d) => d,
            Err(e) => {
                error!("netlog netlink socket error, shutting down: {e}");
                shutdown.cancel();
                return Err(e);
            }
        };
        if let Some(writer) = capture.lock().await.as_mut() {
            if let Err(e) = writer.record(RecordKind::Netlog, &datagram).await {
                warn!("netlog: failed to record capture frame: {e}");
            }
        }
        let Some((header, body)) = super::netlink_raw::parse_nlmsghdr(&datagram) else {
            warn!("netlog: truncated netlink message");
            continue;
        };
        match decode_event(header.msg_type, body) {
            Some(event) => {
                dispatcher.metrics.record_netlog_event();
                dispatcher.dispatch_netlog(event).await;
            }
            None => warn!("netlog: unparseable or irrelevant netlink message, msg_type={}", header.msg_type),
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

    #[test]
    fn decodes_prefix_and_payload_tuple() {
        let mut ip = vec![0u8; 28];
        ip[0] = 0x45;
        ip[9] = 17; // UDP
        ip[12..16].copy_from_slice(&[10, 0, 0, 2]);
        ip[16..20].copy_from_slice(&[8, 8, 8, 8]);
        ip[20..22].copy_from_slice(&5353u16.to_be_bytes());
        ip[22..24].copy_from_slice(&53u16.to_be_bytes());

        let mut body = vec![libc::AF_INET as u8, 0, 0, 0];
        body.extend(encode_attr(NFULA_PAYLOAD, &ip));
        let mut prefix = b"type=rule,table=wan-routing".to_vec();
        prefix.push(0);
        body.extend(encode_attr(NFULA_PREFIX, &prefix));

        let msg_type = ((NFNL_SUBSYS_ULOG as u16) << 8) | NFULNL_MSG_PACKET as u16;
        let event = decode_event(msg_type, &body).unwrap();
        assert_eq!(event.prefix, "type=rule,table=wan-routing");
        assert_eq!(event.dst_port, 53);
        assert_eq!(event.protocol, 17);
    }
}
