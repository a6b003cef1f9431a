//! Registration priorities for the stock plugin set. Lower runs earlier.
//! Annotators that other plugins read from (hop count, SNI, certificates)
//! run before the plugins that report or classify on their output; stats
//! and reporter run last so every other annotation for this packet has
//! already landed.

pub const HOPCOUNT_PRIORITY: i32 = 5;
pub const SNI_PRIORITY: i32 = 10;
pub const CERTFETCH_PRIORITY: i32 = 20;
pub const CERTSNIFF_PRIORITY: i32 = 25;
pub const CLASSIFY_PRIORITY: i32 = 30;
pub const GEOIP_PRIORITY: i32 = 40;
pub const DNS_PRIORITY: i32 = 50;
pub const REVDNS_PRIORITY: i32 = 60;
pub const STATS_PRIORITY: i32 = 80;
pub const REPORTER_PRIORITY: i32 = 90;
