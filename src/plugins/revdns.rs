//! Reverse-DNS annotation: releases a session's subscription immediately
//! on its first packet but keeps resolving client/server PTR records in
//! the background, through the same single-fetch cache discipline used
//! for certificates.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::debug;

use crate::model::{Message, NfqueueResult, Plugin, Value};
use crate::sinks::dict::{DictKey, DictValue};
use crate::tables::revdns_cache::FetchOutcome;
use crate::tables::SessionRef;

use super::context::PluginContext;

#[derive(Clone, Copy)]
enum Side {
    Client,
    Server,
}

impl Side {
    fn attachment_key(self) -> &'static str {
        match self {
            Side::Client => "client_rdns",
            Side::Server => "server_rdns",
        }
    }
}

async fn resolve_and_attach(resolver: Arc<TokioAsyncResolver>, ctx: Arc<PluginContext>, addr: IpAddr, session: SessionRef, side: Side) {
    let table = match side {
        Side::Client => &ctx.revdns_cache.client,
        Side::Server => &ctx.revdns_cache.server,
    };

    let holder = match table.get_or_insert(addr) {
        FetchOutcome::YouFetch(holder) => {
            match resolver.reverse_lookup(addr).await {
                Ok(lookup) => {
                    let names: Vec<String> = lookup.iter().map(|n| n.to_string()).collect();
                    if names.is_empty() {
                        holder.fail().await;
                    } else {
                        holder.fulfil(Arc::new(names)).await;
                    }
                }
                Err(e) => {
                    debug!("reverse dns lookup failed for {addr}: {e}");
                    holder.fail().await;
                }
            }
            holder
        }
        FetchOutcome::Wait(holder) => holder,
    };

    let Some(names) = holder.wait_ready().await else {
        return;
    };
    let joined = names.join("|");
    let key = side.attachment_key();
    let conntrack_id = {
        let mut guard = session.lock().await;
        guard.put(key, Value::Str(joined.clone()));
        guard.conntrack_id
    };
    if !ctx.config.disable_dict {
        let _ = ctx.dict.write("sessions", &DictKey::Int(conntrack_id), key, &DictValue::Str(joined)).await;
        ctx.metrics.dict_writes_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

pub struct RevDnsPlugin {
    ctx: Arc<PluginContext>,
    resolver: Arc<TokioAsyncResolver>,
}

impl RevDnsPlugin {
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        let resolver = Arc::new(TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()));
        Self { ctx, resolver }
    }
}

#[async_trait]
impl Plugin for RevDnsPlugin {
    fn name(&self) -> &'static str {
        "revdns"
    }

    fn priority(&self) -> i32 {
        super::priority::REVDNS_PRIORITY
    }

    async fn on_packet(&self, msg: &Message<'_>, session: &SessionRef, new_session: bool) -> NfqueueResult {
        if !new_session {
            return NfqueueResult::default();
        }

        self.ctx.metrics.revdns_cache_fetches.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        tokio::spawn(resolve_and_attach(self.resolver.clone(), self.ctx.clone(), msg.tuple.client_addr, session.clone(), Side::Client));
        tokio::spawn(resolve_and_attach(self.resolver.clone(), self.ctx.clone(), msg.tuple.server_addr, session.clone(), Side::Server));

        NfqueueResult::release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_keys_are_side_specific() {
        assert_eq!(Side::Client.attachment_key(), "client_rdns");
        assert_eq!(Side::Server.attachment_key(), "server_rdns");
    }
}
