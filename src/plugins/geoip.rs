//! GeoIP annotation: resolves client/server addresses to ISO country
//! codes through a MaxMind-format database, city DB preferred with a
//! country DB fallback.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use maxminddb::{geoip2, Mmap, Reader};

use crate::model::{Message, NfqueueResult, Plugin, Value};
use crate::sinks::dict::{DictKey, DictValue};
use crate::tables::SessionRef;

use super::context::PluginContext;

const NOT_FOUND: &str = "XX";

fn lookup_iso_code(city: Option<&Reader<Mmap>>, country: Option<&Reader<Mmap>>, addr: IpAddr) -> String {
    if let Some(reader) = city {
        if let Ok(Some(city)) = reader.lookup::<geoip2::City>(addr) {
            if let Some(code) = city.country.and_then(|c| c.iso_code) {
                return code.to_string();
            }
        }
    }
    if let Some(reader) = country {
        if let Ok(Some(country)) = reader.lookup::<geoip2::Country>(addr) {
            if let Some(code) = country.country.and_then(|c| c.iso_code) {
                return code.to_string();
            }
        }
    }
    NOT_FOUND.to_string()
}

pub struct GeoIpPlugin {
    ctx: Arc<PluginContext>,
    city: Option<Reader<Mmap>>,
    country: Option<Reader<Mmap>>,
}

impl GeoIpPlugin {
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        let city = Reader::open_readfile(&ctx.config.geoip.city_db_path)
            .map_err(|e| warn!("geoip city db unavailable at {}: {e}", ctx.config.geoip.city_db_path))
            .ok();
        let country = Reader::open_readfile(&ctx.config.geoip.country_db_path)
            .map_err(|e| warn!("geoip country db unavailable at {}: {e}", ctx.config.geoip.country_db_path))
            .ok();
        Self { ctx, city, country }
    }
}

#[async_trait]
impl Plugin for GeoIpPlugin {
    fn name(&self) -> &'static str {
        "geoip"
    }

    fn priority(&self) -> i32 {
        super::priority::GEOIP_PRIORITY
    }

    async fn on_packet(&self, msg: &Message<'_>, session: &SessionRef, new_session: bool) -> NfqueueResult {
        if !new_session {
            return NfqueueResult::release();
        }

        let client_code = lookup_iso_code(self.city.as_ref(), self.country.as_ref(), msg.tuple.client_addr);
        let server_code = lookup_iso_code(self.city.as_ref(), self.country.as_ref(), msg.tuple.server_addr);

        let conntrack_id = {
            let mut guard = session.lock().await;
            guard.put("client_country", Value::Str(client_code.clone()));
            guard.put("server_country", Value::Str(server_code.clone()));
            guard.conntrack_id
        };

        if !self.ctx.config.disable_dict {
            let key = DictKey::Int(conntrack_id);
            let _ = self.ctx.dict.write("sessions", &key, "client_country", &DictValue::Str(client_code)).await;
            let _ = self.ctx.dict.write("sessions", &key, "server_country", &DictValue::Str(server_code)).await;
            self.ctx.metrics.dict_writes_total.fetch_add(2, std::sync::atomic::Ordering::Relaxed);
        }

        NfqueueResult::release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_databases_fall_back_to_not_found() {
        assert_eq!(lookup_iso_code(None, None, "8.8.8.8".parse().unwrap()), NOT_FOUND);
    }
}
