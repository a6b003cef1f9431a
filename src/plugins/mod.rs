//! The stock plugin set: one module per independent annotator, each
//! implementing [`crate::model::Plugin`] and constructed from a shared
//! [`context::PluginContext`].

pub mod cert_common;
pub mod certfetch;
pub mod certsniff;
pub mod classify;
pub mod context;
pub mod dns;
pub mod geoip;
pub mod hopcount;
pub mod priority;
pub mod reporter;
pub mod revdns;
pub mod sni;
pub mod stats;

use std::sync::Arc;

use crate::dispatcher::Registry;

pub use context::PluginContext;

/// Registers every stock plugin into `registry` in one place, so
/// `main` doesn't need to know the concrete plugin types.
pub fn register_all(registry: &mut Registry, ctx: Arc<PluginContext>) {
    registry.register(Arc::new(hopcount::HopCountPlugin::new()));
    registry.register(Arc::new(sni::SniPlugin::new(ctx.clone())));
    registry.register(Arc::new(certfetch::CertFetchPlugin::new(ctx.clone())));
    registry.register(Arc::new(certsniff::CertSniffPlugin::new(ctx.clone())));
    registry.register(Arc::new(classify::ClassifyPlugin::new(ctx.clone())));
    registry.register(Arc::new(geoip::GeoIpPlugin::new(ctx.clone())));
    registry.register(Arc::new(dns::DnsPlugin::new(ctx.clone())));
    registry.register(Arc::new(revdns::RevDnsPlugin::new(ctx.clone())));
    registry.register(Arc::new(stats::StatsPlugin::new(ctx.clone())));
    registry.register(Arc::new(reporter::ReporterPlugin::new(ctx)));
}
