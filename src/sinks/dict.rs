//! The kernel dictionary sink: an opaque key/value table, written and
//! queried through line-oriented proc-like files (spec.md §6).
//!
//! The kernel side of this protocol is out of core scope; `FileDictSink`
//! is the thin, real implementation this daemon talks through — it
//! formats/parses the documented line grammar and does real file I/O, but
//! does not implement the kernel module that backs `/proc/net/...`.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::DictError;

#[derive(Debug, Clone, PartialEq)]
pub enum DictKey {
    Int(u32),
    Str(String),
    Ip(Ipv4Addr),
    Ip6(Ipv6Addr),
    Mac([u8; 6]),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DictValue {
    Str(String),
    Int(u32),
    Int64(u64),
    Bool(bool),
    Ip(Ipv4Addr),
    Ip6(Ipv6Addr),
    Mac([u8; 6]),
}

fn mac_to_string(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

fn mac_from_string(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(out)
}

impl DictKey {
    fn encode(&self) -> (&'static str, String) {
        match self {
            DictKey::Int(v) => ("int", v.to_string()),
            DictKey::Str(v) => ("string", v.clone()),
            DictKey::Ip(v) => ("ip", v.to_string()),
            DictKey::Ip6(v) => ("ip6", v.to_string()),
            DictKey::Mac(v) => ("mac", mac_to_string(v)),
        }
    }

    fn decode(ty: &str, raw: &str) -> Result<Self, DictError> {
        match ty {
            "int" => raw.parse().map(DictKey::Int).map_err(|_| DictError::MalformedLine(raw.to_string())),
            "string" => Ok(DictKey::Str(raw.to_string())),
            "ip" => raw.parse().map(DictKey::Ip).map_err(|_| DictError::MalformedLine(raw.to_string())),
            "ip6" => raw.parse().map(DictKey::Ip6).map_err(|_| DictError::MalformedLine(raw.to_string())),
            "mac" => mac_from_string(raw).map(DictKey::Mac).ok_or_else(|| DictError::MalformedLine(raw.to_string())),
            other => Err(DictError::UnsupportedType(other.to_string())),
        }
    }
}

impl DictValue {
    fn encode(&self) -> (&'static str, String) {
        match self {
            DictValue::Str(v) => ("string", v.clone()),
            DictValue::Int(v) => ("int", v.to_string()),
            DictValue::Int64(v) => ("int64", v.to_string()),
            DictValue::Bool(v) => ("bool", v.to_string()),
            DictValue::Ip(v) => ("ip", v.to_string()),
            DictValue::Ip6(v) => ("ip6", v.to_string()),
            DictValue::Mac(v) => ("mac", mac_to_string(v)),
        }
    }

    fn decode(ty: &str, raw: &str) -> Result<Self, DictError> {
        match ty {
            "string" => Ok(DictValue::Str(raw.to_string())),
            "int" => raw.parse().map(DictValue::Int).map_err(|_| DictError::MalformedLine(raw.to_string())),
            "int64" => raw.parse().map(DictValue::Int64).map_err(|_| DictError::MalformedLine(raw.to_string())),
            "bool" => raw.parse().map(DictValue::Bool).map_err(|_| DictError::MalformedLine(raw.to_string())),
            "ip" => raw.parse().map(DictValue::Ip).map_err(|_| DictError::MalformedLine(raw.to_string())),
            "ip6" => raw.parse().map(DictValue::Ip6).map_err(|_| DictError::MalformedLine(raw.to_string())),
            "mac" => mac_from_string(raw).map(DictValue::Mac).ok_or_else(|| DictError::MalformedLine(raw.to_string())),
            other => Err(DictError::UnsupportedType(other.to_string())),
        }
    }
}

#[async_trait]
pub trait DictSink: Send + Sync {
    async fn write(&self, table: &str, key: &DictKey, field: &str, value: &DictValue) -> Result<(), DictError>;
    async fn delete(&self, table: &str, key: &DictKey) -> Result<(), DictError>;
    async fn query(&self, table: &str, key: Option<&DictKey>) -> Result<Vec<(DictKey, String, DictValue)>, DictError>;
}

pub struct FileDictSink {
    write_file: PathBuf,
    delete_file: PathBuf,
    /// Mirrors what a kernel-backed read-file would answer; guarded by a
    /// mutex since writes and deletes must serialise (spec.md §5: "Dict
    /// and event-store writers serialise internally").
    rows: Mutex<Vec<(String, DictKey, String, DictValue)>>,
}

impl FileDictSink {
    pub fn new(write_file: PathBuf, delete_file: PathBuf) -> Self {
        Self {
            write_file,
            delete_file,
            rows: Mutex::new(Vec::new()),
        }
    }

    fn format_write_line(table: &str, key: &DictKey, field: &str, value: &DictValue) -> String {
        let (kty, kraw) = key.encode();
        let (vty, vraw) = value.encode();
        format!("table={table},key_{kty}={kraw},field={field},value_{vty}={vraw}\n")
    }

    fn format_delete_line(table: &str, key: &DictKey) -> String {
        let (kty, kraw) = key.encode();
        format!("table={table},key_{kty}={kraw}\n")
    }

    async fn append(&self, path: &PathBuf, line: &str) -> Result<(), DictError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl DictSink for FileDictSink {
    async fn write(&self, table: &str, key: &DictKey, field: &str, value: &DictValue) -> Result<(), DictError> {
        let line = Self::format_write_line(table, key, field, value);
        self.append(&self.write_file, &line).await?;
        let mut rows = self.rows.lock().await;
        rows.retain(|(t, k, f, _)| !(t == table && k == key && f == field));
        rows.push((table.to_string(), key.clone(), field.to_string(), value.clone()));
        Ok(())
    }

    async fn delete(&self, table: &str, key: &DictKey) -> Result<(), DictError> {
        let line = Self::format_delete_line(table, key);
        self.append(&self.delete_file, &line).await?;
        let mut rows = self.rows.lock().await;
        rows.retain(|(t, k, _, _)| !(t == table && k == key));
        Ok(())
    }

    async fn query(&self, table: &str, key: Option<&DictKey>) -> Result<Vec<(DictKey, String, DictValue)>, DictError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|(t, k, _, _)| t == table && key.map(|wanted| wanted == k).unwrap_or(true))
            .map(|(_, k, f, v)| (k.clone(), f.clone(), v.clone()))
            .collect())
    }
}

pub type SharedDictSink = Arc<dyn DictSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips_per_value_type() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileDictSink::new(dir.path().join("write"), dir.path().join("delete"));
        let key = DictKey::Int(7);
        sink.write("sessions", &key, "certificate_subject_cn", &DictValue::Str("example.com".into()))
            .await
            .unwrap();
        let rows = sink.query("sessions", Some(&key)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, "certificate_subject_cn");
        assert_eq!(rows[0].2, DictValue::Str("example.com".into()));
    }

    #[tokio::test]
    async fn delete_removes_row_from_query_results() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileDictSink::new(dir.path().join("write"), dir.path().join("delete"));
        let key = DictKey::Str("1.2.3.4".into());
        sink.write("geoip", &key, "client_country", &DictValue::Str("US".into())).await.unwrap();
        sink.delete("geoip", &key).await.unwrap();
        let rows = sink.query("geoip", Some(&key)).await.unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn mac_round_trips_through_string_form() {
        let mac = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
        let s = mac_to_string(&mac);
        assert_eq!(mac_from_string(&s), Some(mac));
    }
}
