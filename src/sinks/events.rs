//! The event sink: structured, append-only records written to the local
//! reports store. The store's query engine is out of core scope; this is
//! the thin `log_event` writer spec.md §6 describes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn log_event(&self, name: &str, table: &str, format_version: u32, key_columns: &[(&str, Value)], modified_columns: &[(&str, Value)]) -> anyhow::Result<()>;
}

pub struct SqliteEventSink {
    pool: SqlitePool,
}

impl SqliteEventSink {
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(options).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                event_table TEXT NOT NULL,
                format_version INTEGER NOT NULL,
                key_columns TEXT NOT NULL,
                modified_columns TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl EventSink for SqliteEventSink {
    async fn log_event(&self, name: &str, table: &str, format_version: u32, key_columns: &[(&str, Value)], modified_columns: &[(&str, Value)]) -> anyhow::Result<()> {
        let key_json = serde_json::to_string(&key_columns.iter().cloned().collect::<std::collections::BTreeMap<_, _>>())?;
        let modified_json = serde_json::to_string(&modified_columns.iter().cloned().collect::<std::collections::BTreeMap<_, _>>())?;
        let recorded_at = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?.as_secs() as i64;
        sqlx::query("INSERT INTO events (name, event_table, format_version, key_columns, modified_columns, recorded_at) VALUES (?, ?, ?, ?, ?, ?)")
            .bind(name)
            .bind(table)
            .bind(format_version as i64)
            .bind(key_json)
            .bind(modified_json)
            .bind(recorded_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub type SharedEventSink = Arc<dyn EventSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_event_persists_a_row() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("events.db");
        let sink = SqliteEventSink::connect(db_path.to_str().unwrap()).await.unwrap();
        sink.log_event(
            "session_new",
            "sessions",
            1,
            &[("conntrack_id", Value::from(7))],
            &[("client_addr", Value::from("10.0.0.2"))],
        )
        .await
        .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events").fetch_one(&sink.pool).await.unwrap();
        assert_eq!(count, 1);
    }
}
