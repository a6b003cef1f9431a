//! Active ICMP pinger: one raw socket per WAN interface, probing a
//! configured list of hosts every 5 seconds and feeding RTT samples back
//! into that interface's [`super::collector::InterfaceStatsCollector`].

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{IcmpCodes, MutableEchoRequestPacket};
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::Packet;
use pnet::transport::{icmp_packet_iter, transport_channel, TransportChannelType, TransportProtocol};
use pnet::util::checksum;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::collector::InterfaceStatsCollector;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Sequence numbers wrap from `0xFFFF` back to `1`, never `0` (`0` would
/// be indistinguishable from an unset/default field on the wire).
pub struct SequenceGenerator {
    next: AtomicU16,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self { next: AtomicU16::new(1) }
    }

    pub fn next(&self) -> u16 {
        loop {
            let current = self.next.load(Ordering::Relaxed);
            let after = if current == 0xFFFF { 1 } else { current + 1 };
            if self
                .next
                .compare_exchange(current, after, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// An outstanding probe awaiting a reply, keyed by `(identifier,
/// sequence)` to correlate replies on a shared socket.
pub struct OutstandingProbe {
    pub sent_at: Instant,
    pub target: Ipv4Addr,
}

pub struct ProbeTable {
    identifier: u16,
    sequences: SequenceGenerator,
    outstanding: HashMap<u16, OutstandingProbe>,
}

impl ProbeTable {
    /// `identifier` is the process id truncated to 16 bits, per spec.
    pub fn new(identifier: u16) -> Self {
        Self {
            identifier,
            sequences: SequenceGenerator::new(),
            outstanding: HashMap::new(),
        }
    }

    pub fn build_echo_request(&mut self, target: Ipv4Addr) -> ([u8; 16], u16) {
        let seq = self.sequences.next();
        self.outstanding.insert(
            seq,
            OutstandingProbe {
                sent_at: Instant::now(),
                target,
            },
        );
        let mut buf = [0u8; 16];
        {
            let mut packet = MutableEchoRequestPacket::new(&mut buf).expect("buffer sized for echo request");
            packet.set_icmp_type(IcmpTypes::EchoRequest);
            packet.set_icmp_code(IcmpCodes::NoCode);
            packet.set_identifier(self.identifier);
            packet.set_sequence_number(seq);
            let csum = checksum(&IcmpPacket::new(packet.packet()).unwrap(), 1);
            packet.set_checksum(csum);
        }
        (buf, seq)
    }

    /// Correlates a received echo reply buffer to an outstanding probe and
    /// returns its round-trip time, removing it from the outstanding set.
    pub fn correlate_reply(&mut self, buf: &[u8]) -> Option<Duration> {
        let reply = EchoReplyPacket::new(buf)?;
        if reply.get_identifier() != self.identifier {
            return None;
        }
        let probe = self.outstanding.remove(&reply.get_sequence_number())?;
        Some(probe.sent_at.elapsed())
    }

    /// Sweeps probes that never received a reply within `timeout`,
    /// returning their count for per-interface timeout metrics.
    pub fn sweep_timeouts(&mut self, timeout: Duration) -> usize {
        let before = self.outstanding.len();
        self.outstanding.retain(|_, p| p.sent_at.elapsed() < timeout);
        before - self.outstanding.len()
    }
}

/// Runs the active pinger for one WAN interface until shutdown: sends an
/// echo request to every target on each `PROBE_INTERVAL` tick, reads
/// replies on a blocking OS thread (the `pnet` transport iterator has no
/// async variant) relayed back over a channel, and feeds correlated RTTs
/// into `collector`. Unreceived probes are swept and logged as timeouts
/// per spec.md §4.10; this function never returns `Err` for a single
/// missed reply, only for socket setup failure.
pub async fn run(iface_name: String, targets: Vec<IpAddr>, collector: Arc<Mutex<InterfaceStatsCollector>>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let identifier = (std::process::id() & 0xFFFF) as u16;
    let (mut tx, rx) = transport_channel(4096, TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Icmp)))?;

    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::spawn(move || {
        let mut rx = rx;
        let mut iter = icmp_packet_iter(&mut rx);
        loop {
            match iter.next() {
                Ok((packet, _addr)) => {
                    if reply_tx.send(packet.packet().to_vec()).is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    });

    let mut table = ProbeTable::new(identifier);
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                for target in &targets {
                    let IpAddr::V4(v4) = target else { continue };
                    let (buf, _seq) = table.build_echo_request(*v4);
                    let Some(packet) = IcmpPacket::new(&buf) else { continue };
                    if let Err(e) = tx.send_to(packet, *target) {
                        warn!("pinger[{iface_name}]: send to {target} failed: {e}");
                    }
                }
                let timed_out = table.sweep_timeouts(PROBE_TIMEOUT);
                if timed_out > 0 {
                    warn!("pinger[{iface_name}]: {timed_out} probes timed out");
                }
            }
            Some(reply) = reply_rx.recv() => {
                if let Some(rtt) = table.correlate_reply(&reply) {
                    collector.lock().await.feed_sample(rtt.as_secs_f64() * 1000.0);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_wraps_from_0xffff_to_1_never_0() {
        let gen = SequenceGenerator::new();
        for expected in 1..=0xFFFFu16 {
            assert_eq!(gen.next(), expected);
        }
        assert_eq!(gen.next(), 1, "sequence must wrap to 1, never 0");
    }

    #[test]
    fn echo_request_round_trips_through_reply_correlation() {
        let mut table = ProbeTable::new(4242);
        let target: Ipv4Addr = "1.1.1.1".parse().unwrap();
        let (req, seq) = table.build_echo_request(target);

        // Construct a reply as the wire would, keeping offsets identical to
        // the request: type differs, identifier/sequence carried through.
        let mut reply_buf = req;
        reply_buf[0] = 0; // IcmpTypes::EchoReply
        assert_eq!(u16::from_be_bytes([reply_buf[4], reply_buf[5]]), 4242);
        assert_eq!(u16::from_be_bytes([reply_buf[6], reply_buf[7]]), seq);

        let rtt = table.correlate_reply(&reply_buf);
        assert!(rtt.is_some());
    }

    #[test]
    fn timed_out_probes_are_swept() {
        let mut table = ProbeTable::new(1);
        table.build_echo_request("1.1.1.1".parse().unwrap());
        std::thread::sleep(Duration::from_millis(5));
        let swept = table.sweep_timeouts(Duration::from_millis(1));
        assert_eq!(swept, 1);
    }
}
