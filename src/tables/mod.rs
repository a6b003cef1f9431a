pub mod cert_cache;
pub mod conntrack_table;
pub mod holder;
pub mod revdns_cache;
pub mod session_table;

pub use cert_cache::CertCache;
pub use conntrack_table::{ConntrackRef, ConntrackTable};
pub use holder::Holder;
pub use revdns_cache::RevDnsCache;
pub use session_table::{SessionRef, SessionTable};
