use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use x509_parser::certificate::X509Certificate;

/// A session's opaque, plugin-owned attachment store.
///
/// The ~30 keys every plugin in this crate writes are closed, so they get
/// typed accessors on [`Value`]. Anything else (e.g. a plugin's own
/// per-session scratch state, like `certsniff`'s reassembly buffer) falls
/// back to erased storage via [`Value::Custom`].
#[derive(Clone)]
pub enum Value {
    Str(String),
    List(Vec<String>),
    U32(u32),
    U64(u64),
    Bool(bool),
    Instant(Instant),
    Bytes(Vec<u8>),
    Cert(Arc<CertAttachment>),
    Custom(Arc<dyn Any + Send + Sync>),
}

/// An owned, re-parseable snapshot of a captured certificate; `x509-parser`
/// borrows from its input buffer so we keep the DER bytes alongside the
/// projected fields used by plugins and the dict sink.
pub struct CertAttachment {
    pub der: Vec<u8>,
    pub subject_cn: Option<String>,
    pub serial: String,
    pub subject_country: Option<String>,
    pub subject_org: Option<String>,
    pub subject_ou: Option<String>,
    pub subject_locality: Option<String>,
    pub subject_province: Option<String>,
    pub subject_street: Option<String>,
    pub subject_postal_code: Option<String>,
    pub issuer_cn: Option<String>,
    pub san_dns_names: Vec<String>,
}

impl CertAttachment {
    pub fn from_x509(der: Vec<u8>, cert: &X509Certificate<'_>) -> Self {
        let subject = cert.subject();
        let issuer = cert.issuer();
        let san_dns_names = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|gn| match gn {
                        x509_parser::extensions::GeneralName::DNSName(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        CertAttachment {
            der,
            subject_cn: attr(subject, "CN"),
            serial: cert.raw_serial_as_string(),
            subject_country: attr(subject, "C"),
            subject_org: attr(subject, "O"),
            subject_ou: attr(subject, "OU"),
            subject_locality: attr(subject, "L"),
            subject_province: attr(subject, "ST"),
            subject_street: attr(subject, "STREET"),
            subject_postal_code: attr(subject, "postalCode"),
            issuer_cn: attr(issuer, "CN"),
            san_dns_names,
        }
    }
}

fn attr(name: &x509_parser::x509::X509Name<'_>, short: &str) -> Option<String> {
    name.iter_by_shortname(short)
        .next()
        .and_then(|a| a.as_str().ok())
        .map(|s| s.to_string())
}

/// Joins list fields with `|` and replaces commas with `-`, per the
/// dict line format.
pub fn dict_safe_join(values: &[String]) -> String {
    values
        .iter()
        .map(|v| v.replace(',', "-"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Replaces commas with `-` in a single scalar field, per the dict line
/// format (`table=<t>,key_<ty>=<k>,field=<f>,value_<ty>=<v>` is itself
/// comma-delimited).
pub fn dict_safe_value(value: &str) -> String {
    value.replace(',', "-")
}

#[derive(Default)]
pub struct Attachments {
    map: HashMap<String, Value>,
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.map.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.map.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_returns_same_value() {
        let mut a = Attachments::new();
        a.put("client_hops", Value::U32(3));
        match a.get("client_hops") {
            Some(Value::U32(v)) => assert_eq!(*v, 3),
            other => panic!("unexpected {:?}", other.is_some()),
        }
    }

    #[test]
    fn delete_removes_key() {
        let mut a = Attachments::new();
        a.put("k", Value::Bool(true));
        assert!(a.delete("k").is_some());
        assert!(a.get("k").is_none());
    }

    #[test]
    fn dict_safe_join_escapes_commas() {
        let joined = dict_safe_join(&["US, CA".to_string(), "OR".to_string()]);
        assert_eq!(joined, "US- CA|OR");
    }
}
