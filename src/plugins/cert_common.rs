//! Shared certificate parsing/projection used by both `certfetch` (active
//! TLS dial) and `certsniff` (passive handshake observation).

use std::sync::Arc;

use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::model::attachment::{dict_safe_join, dict_safe_value};
use crate::model::{CertAttachment, Value};
use crate::sinks::dict::{DictKey, DictValue, SharedDictSink};
use crate::tables::SessionRef;

pub fn parse_der(der: Vec<u8>) -> Option<CertAttachment> {
    let (_, cert) = X509Certificate::from_der(&der).ok()?;
    Some(CertAttachment::from_x509(der, &cert))
}

/// Attaches a captured certificate to the session and projects its fields
/// onto the dict sink under the `sessions` table.
pub async fn project_cert(session: &SessionRef, dict: &SharedDictSink, disable_dict: bool, conntrack_id: u32, cert: Arc<CertAttachment>) {
    {
        let mut guard = session.lock().await;
        guard.put("certificate", Value::Cert(cert.clone()));
    }

    if disable_dict {
        return;
    }

    let key = DictKey::Int(conntrack_id);
    let str_field = |s: &Option<String>| DictValue::Str(dict_safe_value(s.as_deref().unwrap_or_default()));
    let fields: Vec<(&str, DictValue)> = vec![
        ("certificate_subject_cn", str_field(&cert.subject_cn)),
        ("certificate_serial", DictValue::Str(dict_safe_value(&cert.serial))),
        ("certificate_subject_country", str_field(&cert.subject_country)),
        ("certificate_subject_org", str_field(&cert.subject_org)),
        ("certificate_subject_ou", str_field(&cert.subject_ou)),
        ("certificate_subject_locality", str_field(&cert.subject_locality)),
        ("certificate_subject_province", str_field(&cert.subject_province)),
        ("certificate_subject_street", str_field(&cert.subject_street)),
        ("certificate_subject_postal_code", str_field(&cert.subject_postal_code)),
        ("certificate_issuer_cn", str_field(&cert.issuer_cn)),
        ("certificate_san_dns_names", DictValue::Str(dict_safe_join(&cert.san_dns_names))),
    ];
    for (field, value) in fields {
        let _ = dict.write("sessions", &key, field, &value).await;
    }
}
