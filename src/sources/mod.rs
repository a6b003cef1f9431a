//! Kernel event sources: the NFQUEUE packet queue, the ctnetlink
//! conntrack multicast feed, the NFLOG packet-logging feed, and the
//! warehouse capture/playback mode that substitutes for all three in
//! offline testing.

pub mod conntrack;
pub mod netlink_raw;
pub mod netlog;
pub mod queue;
pub mod raw_socket;
pub mod warehouse;
