//! SQLite state store (sqlx)

use super::{ProviderStateRow, StateStore};
use crate::error::{EngineError, Result};
use crate::priority::{FallbackBehavior, PriorityEntry};
use crate::registry::PluginVersionRecord;
use crate::types::Version;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (creating if needed) the database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", path.display());
        tracing::debug!(url = %db_url, "Connecting to state database");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&db_url)
            .await?;

        Self::with_pool(pool).await
    }

    /// Use an existing pool; tables are created if missing
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS priority_entries (
                media_type TEXT NOT NULL,
                field TEXT NOT NULL,
                provider TEXT NOT NULL,
                priority INTEGER NOT NULL,
                fallback TEXT NOT NULL,
                user_defined INTEGER NOT NULL DEFAULT 0,
                removed_at TEXT,
                PRIMARY KEY (media_type, field, provider)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plugin_versions (
                provider TEXT NOT NULL,
                version TEXT NOT NULL,
                artifact TEXT NOT NULL,
                checksum_sha256 TEXT NOT NULL,
                installed_at TEXT NOT NULL,
                uninstalled_at TEXT,
                PRIMARY KEY (provider, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS provider_state (
                provider TEXT PRIMARY KEY,
                active_version TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 0,
                settings TEXT NOT NULL DEFAULT '{}',
                successes INTEGER NOT NULL DEFAULT 0,
                failures INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("State tables initialized (priority_entries, plugin_versions, provider_state)");
        Ok(())
    }
}

fn parse_version(text: &str) -> Result<Version> {
    text.parse()
        .map_err(|e: String| EngineError::Store(format!("bad version '{}': {}", text, e)))
}

fn priority_from_row(row: &SqliteRow) -> Result<PriorityEntry> {
    let fallback: String = row.get("fallback");
    let fallback: FallbackBehavior = serde_json::from_str(&fallback)
        .map_err(|e| EngineError::Store(format!("bad fallback '{}': {}", fallback, e)))?;

    Ok(PriorityEntry {
        media_type: row.get("media_type"),
        field: row.get("field"),
        provider: row.get("provider"),
        priority: row.get::<i64, _>("priority") as i32,
        fallback,
        user_defined: row.get::<i64, _>("user_defined") != 0,
        removed_at: row.get::<Option<DateTime<Utc>>, _>("removed_at"),
    })
}

fn version_from_row(row: &SqliteRow) -> Result<PluginVersionRecord> {
    Ok(PluginVersionRecord {
        provider: row.get("provider"),
        version: parse_version(&row.get::<String, _>("version"))?,
        artifact: row.get("artifact"),
        checksum_sha256: row.get("checksum_sha256"),
        installed_at: row.get("installed_at"),
        uninstalled_at: row.get("uninstalled_at"),
    })
}

fn state_from_row(row: &SqliteRow) -> Result<ProviderStateRow> {
    let settings: String = row.get("settings");
    Ok(ProviderStateRow {
        provider: row.get("provider"),
        active_version: parse_version(&row.get::<String, _>("active_version"))?,
        enabled: row.get::<i64, _>("enabled") != 0,
        settings: serde_json::from_str(&settings)
            .map_err(|e| EngineError::Store(format!("bad settings JSON: {}", e)))?,
        successes: row.get::<i64, _>("successes").max(0) as u64,
        failures: row.get::<i64, _>("failures").max(0) as u64,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| EngineError::Store(e.to_string()))
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load_priorities(&self) -> Result<Vec<PriorityEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT media_type, field, provider, priority, fallback, user_defined, removed_at
            FROM priority_entries
            ORDER BY media_type, field, priority, provider
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(priority_from_row).collect()
    }

    async fn save_priority(&self, entry: &PriorityEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO priority_entries
                (media_type, field, provider, priority, fallback, user_defined, removed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(media_type, field, provider) DO UPDATE SET
                priority = excluded.priority,
                fallback = excluded.fallback,
                user_defined = excluded.user_defined,
                removed_at = excluded.removed_at
            "#,
        )
        .bind(&entry.media_type)
        .bind(&entry.field)
        .bind(&entry.provider)
        .bind(entry.priority as i64)
        .bind(to_json(&entry.fallback)?)
        .bind(entry.user_defined as i64)
        .bind(entry.removed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_priority(&self, media_type: &str, field: &str, provider: &str) -> Result<()> {
        sqlx::query("DELETE FROM priority_entries WHERE media_type = ? AND field = ? AND provider = ?")
            .bind(media_type)
            .bind(field)
            .bind(provider)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_versions(&self) -> Result<Vec<PluginVersionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT provider, version, artifact, checksum_sha256, installed_at, uninstalled_at
            FROM plugin_versions
            ORDER BY provider, installed_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(version_from_row).collect()
    }

    async fn save_version(&self, record: &PluginVersionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plugin_versions
                (provider, version, artifact, checksum_sha256, installed_at, uninstalled_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider, version) DO UPDATE SET
                artifact = excluded.artifact,
                checksum_sha256 = excluded.checksum_sha256,
                installed_at = excluded.installed_at,
                uninstalled_at = excluded.uninstalled_at
            "#,
        )
        .bind(&record.provider)
        .bind(record.version.to_string())
        .bind(&record.artifact)
        .bind(&record.checksum_sha256)
        .bind(record.installed_at)
        .bind(record.uninstalled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_version(&self, provider: &str, version: Version) -> Result<()> {
        sqlx::query("DELETE FROM plugin_versions WHERE provider = ? AND version = ?")
            .bind(provider)
            .bind(version.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_provider_states(&self) -> Result<Vec<ProviderStateRow>> {
        let rows = sqlx::query(
            r#"
            SELECT provider, active_version, enabled, settings, successes, failures
            FROM provider_state
            ORDER BY provider
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(state_from_row).collect()
    }

    async fn save_provider_state(&self, row: &ProviderStateRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_state
                (provider, active_version, enabled, settings, successes, failures)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(provider) DO UPDATE SET
                active_version = excluded.active_version,
                enabled = excluded.enabled,
                settings = excluded.settings,
                successes = excluded.successes,
                failures = excluded.failures
            "#,
        )
        .bind(&row.provider)
        .bind(row.active_version.to_string())
        .bind(row.enabled as i64)
        .bind(to_json(&row.settings)?)
        .bind(row.successes as i64)
        .bind(row.failures as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_provider_state(&self, provider: &str) -> Result<()> {
        sqlx::query("DELETE FROM provider_state WHERE provider = ?")
            .bind(provider)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
