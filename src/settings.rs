//! The live, HTTP-editable JSON settings tree (spec.md §6), distinct from
//! the startup [`crate::config::Config`]. Read through a path-addressed
//! accessor; writes persist back to disk.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

pub struct SettingsStore {
    path: PathBuf,
    document: RwLock<Value>,
}

impl SettingsStore {
    pub async fn load(path: PathBuf) -> anyhow::Result<Arc<Self>> {
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Default::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(Arc::new(Self {
            path,
            document: RwLock::new(document),
        }))
    }

    pub async fn get(&self, path: &[&str]) -> Option<Value> {
        let doc = self.document.read().await;
        let mut cursor = &*doc;
        for segment in path {
            cursor = cursor.get(segment)?;
        }
        Some(cursor.clone())
    }

    /// Sets `path` to `value`, creating intermediate objects as needed,
    /// and returns the whole updated document.
    pub async fn set(&self, path: &[&str], value: Value) -> anyhow::Result<Value> {
        let mut doc = self.document.write().await;
        if path.is_empty() {
            *doc = value;
        } else {
            let mut cursor = &mut *doc;
            for segment in &path[..path.len() - 1] {
                if !cursor.is_object() {
                    *cursor = Value::Object(Default::default());
                }
                cursor = cursor
                    .as_object_mut()
                    .unwrap()
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Default::default()));
            }
            if !cursor.is_object() {
                *cursor = Value::Object(Default::default());
            }
            cursor
                .as_object_mut()
                .unwrap()
                .insert(path[path.len() - 1].to_string(), value);
        }
        let snapshot = doc.clone();
        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    async fn persist(&self, document: &Value) -> anyhow::Result<()> {
        let serialised = serde_json::to_string_pretty(document)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(&self.path, serialised).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get_round_trips_into_object_trees() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.json")).await.unwrap();
        store.set(&["reporter", "rule_table"], json!({"guid-1": "allow"})).await.unwrap();
        let value = store.get(&["reporter", "rule_table", "guid-1"]).await;
        assert_eq!(value, Some(json!("allow")));
    }

    #[tokio::test]
    async fn missing_file_starts_with_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("absent.json")).await.unwrap();
        assert_eq!(store.get(&["anything"]).await, None);
    }
}
