//! SQLite persistence for the engine snapshot.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

use smart_water_engine::SnapshotStore;

#[derive(Debug, Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/smart-water/hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to ":memory:" opens its own database.
        let in_memory = db_url.contains(":memory:");
        let mut pool = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool = pool.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Snapshots
    // ----------------------------

    pub async fn load_snapshot(&self, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT data FROM snapshots WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("load_snapshot failed")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let data: String = row.try_get("data").context("snapshot row has no data")?;
        let value = serde_json::from_str(&data).with_context(|| format!("snapshot '{key}' is not valid JSON"))?;
        Ok(Some(value))
    }

    pub async fn save_snapshot(&self, key: &str, snapshot: &Value) -> Result<()> {
        let data = serde_json::to_string(snapshot).context("failed to encode snapshot")?;
        sqlx::query(
            r#"
            INSERT INTO snapshots (key, data, saved_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              data=excluded.data,
              saved_at=excluded.saved_at
            "#,
        )
        .bind(key)
        .bind(data)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("save_snapshot failed")?;
        Ok(())
    }
}

/// The engine's [`SnapshotStore`], keyed by the controller prefix so several
/// controllers can share one database.
#[derive(Debug, Clone)]
pub struct SqliteSnapshotStore {
    db: Db,
    key: String,
}

impl SqliteSnapshotStore {
    pub fn new(db: Db, key: impl Into<String>) -> Self {
        Self { db, key: key.into() }
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn load(&self) -> Result<Option<Value>> {
        self.db.load_snapshot(&self.key).await
    }

    async fn save(&self, snapshot: &Value) -> Result<()> {
        self.db.save_snapshot(&self.key, snapshot).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn missing_snapshot_is_none() {
        let store = SqliteSnapshotStore::new(memory_db().await, "aa:bb:cc:dd:ee:ff");
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_wholesale() {
        let store = SqliteSnapshotStore::new(memory_db().await, "garden");
        store.save(&json!({"irrigation_manual_duration": 10, "last_rain": null})).await.unwrap();
        store.save(&json!({"irrigation_manual_duration": 15})).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, json!({"irrigation_manual_duration": 15}));
    }

    #[tokio::test]
    async fn controllers_do_not_share_rows() {
        let db = memory_db().await;
        let front = SqliteSnapshotStore::new(db.clone(), "front");
        let back = SqliteSnapshotStore::new(db, "back");

        front.save(&json!({"water_flow_rate": [12.0]})).await.unwrap();
        assert!(back.load().await.unwrap().is_none());
        assert_eq!(front.load().await.unwrap().unwrap()["water_flow_rate"], json!([12.0]));
    }

    #[tokio::test]
    async fn corrupt_row_is_an_error() {
        let db = memory_db().await;
        sqlx::query("INSERT INTO snapshots (key, data, saved_at) VALUES ('garden', '{not json', '')")
            .execute(&db.pool)
            .await
            .unwrap();

        let err = db.load_snapshot("garden").await.unwrap_err();
        assert!(err.to_string().contains("not valid JSON"));
    }
}
