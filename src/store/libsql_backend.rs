//! libSQL implementation of `StateStore`.
//!
//! The connection is opened lazily on first use, so a database that is down
//! at startup only fails the calls that need it. A failed open is retried on
//! the next call. Supports local files, in-memory databases, and remote
//! libSQL servers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, params};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::sequencer::SenderKey;
use crate::store::migrations;
use crate::store::traits::{ConversationState, StateStore, UserProfile};

/// Where the database lives.
#[derive(Debug, Clone)]
pub enum DbTarget {
    Local(PathBuf),
    Memory,
    Remote { url: String, token: SecretString },
}

impl std::fmt::Display for DbTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbTarget::Local(path) => write!(f, "{}", path.display()),
            DbTarget::Memory => f.write_str(":memory:"),
            DbTarget::Remote { url, .. } => f.write_str(url),
        }
    }
}

/// libSQL state store.
///
/// Holds a single connection, created on first use and reused afterwards.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStateStore {
    target: DbTarget,
    conn: OnceCell<Connection>,
}

impl LibSqlStateStore {
    /// Store backed by `target`. Nothing is opened until the first call.
    pub fn new(target: DbTarget) -> Self {
        Self {
            target,
            conn: OnceCell::new(),
        }
    }

    pub fn new_local(path: &Path) -> Self {
        Self::new(DbTarget::Local(path.to_path_buf()))
    }

    /// In-memory database (for tests).
    pub fn new_memory() -> Self {
        Self::new(DbTarget::Memory)
    }

    pub fn target(&self) -> &DbTarget {
        &self.target
    }

    /// Get the connection, opening it and running migrations if needed.
    async fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn.get_or_try_init(|| self.open()).await
    }

    async fn open(&self) -> Result<Connection, StoreError> {
        let db = match &self.target {
            DbTarget::Local(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::Unavailable(format!(
                            "Failed to create database directory: {e}"
                        ))
                    })?;
                }
                libsql::Builder::new_local(path).build().await
            }
            DbTarget::Memory => libsql::Builder::new_local(":memory:").build().await,
            DbTarget::Remote { url, token } => {
                libsql::Builder::new_remote(url.clone(), token.expose_secret().to_string())
                    .build()
                    .await
            }
        }
        .map_err(|e| StoreError::Unavailable(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(target = %self.target, "State store opened");
        Ok(conn)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Map a libsql Row to a UserProfile.
///
/// Column order: 0:key, 1:display_name, 2:created_at, 3:updated_at
fn row_to_profile(row: &libsql::Row) -> Result<UserProfile, libsql::Error> {
    let key: String = row.get(0)?;
    let display_name: String = row.get(1)?;
    let created: String = row.get(2)?;
    let updated: String = row.get(3)?;
    Ok(UserProfile {
        key: SenderKey::new(key),
        display_name,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

#[async_trait]
impl StateStore for LibSqlStateStore {
    // ── Profiles ────────────────────────────────────────────────────

    async fn get_profile(&self, key: &SenderKey) -> Result<Option<UserProfile>, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT key, display_name, created_at, updated_at
                 FROM user_profiles WHERE key = ?1",
                params![key.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_profile: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_profile(&row)
                .map(Some)
                .map_err(|e| StoreError::Query(format!("get_profile: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_profile: {e}"))),
        }
    }

    async fn save_profile(
        &self,
        key: &SenderKey,
        name: &str,
    ) -> Result<UserProfile, StoreError> {
        let conn = self.conn().await?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO user_profiles (key, display_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (key) DO UPDATE SET display_name = ?2, updated_at = ?3",
            params![key.as_str(), name, now],
        )
        .await
        .map_err(|e| StoreError::Query(format!("save_profile: {e}")))?;

        debug!(key = %key, "Profile saved");

        self.get_profile(key)
            .await?
            .ok_or_else(|| StoreError::Query(format!("save_profile: {key} vanished after upsert")))
    }

    // ── Conversation state ──────────────────────────────────────────

    async fn get_state(&self, key: &SenderKey) -> Result<ConversationState, StoreError> {
        let conn = self.conn().await?;
        let mut rows = conn
            .query(
                "SELECT state FROM conversation_state WHERE key = ?1",
                params![key.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_state: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("get_state: {e}")))?;
                let value: serde_json::Value = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(ConversationState::from_value(value))
            }
            Ok(None) => Ok(ConversationState::new()),
            Err(e) => Err(StoreError::Query(format!("get_state: {e}"))),
        }
    }

    async fn set_state(
        &self,
        key: &SenderKey,
        state: &ConversationState,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let now = Utc::now().to_rfc3339();
        let raw = serde_json::to_string(state.as_value())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO conversation_state (key, state, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET state = ?2, updated_at = ?3",
            params![key.as_str(), raw, now],
        )
        .await
        .map_err(|e| StoreError::Query(format!("set_state: {e}")))?;

        Ok(())
    }

    async fn clear_state(&self, key: &SenderKey) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let count = conn
            .execute(
                "DELETE FROM conversation_state WHERE key = ?1",
                params![key.as_str()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("clear_state: {e}")))?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SenderKey {
        SenderKey::new(s)
    }

    // ── Profile tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn profile_not_found() {
        let db = LibSqlStateStore::new_memory();
        assert!(db.get_profile(&key("telegram:1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_and_get_profile() {
        let db = LibSqlStateStore::new_memory();
        let saved = db.save_profile(&key("telegram:1"), "Maria").await.unwrap();
        assert_eq!(saved.display_name, "Maria");
        assert_eq!(saved.key, key("telegram:1"));

        let fetched = db.get_profile(&key("telegram:1")).await.unwrap().unwrap();
        assert_eq!(fetched.display_name, "Maria");
    }

    #[tokio::test]
    async fn re_registering_updates_in_place() {
        let db = LibSqlStateStore::new_memory();
        let first = db.save_profile(&key("web:u"), "Maria").await.unwrap();
        let second = db.save_profile(&key("web:u"), "María José").await.unwrap();

        assert_eq!(second.display_name, "María José");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);

        let conn = db.conn().await.unwrap();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM user_profiles", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 1);
    }

    // ── State tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_state_is_empty() {
        let db = LibSqlStateStore::new_memory();
        let state = db.get_state(&key("web:u")).await.unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn set_get_and_clear_state() {
        let db = LibSqlStateStore::new_memory();
        let mut state = ConversationState::new();
        state.set("thread_id", "thread_123");

        db.set_state(&key("web:u"), &state).await.unwrap();
        let loaded = db.get_state(&key("web:u")).await.unwrap();
        assert_eq!(loaded.get_str("thread_id"), Some("thread_123"));

        state.set("thread_id", "thread_456");
        db.set_state(&key("web:u"), &state).await.unwrap();
        let loaded = db.get_state(&key("web:u")).await.unwrap();
        assert_eq!(loaded.get_str("thread_id"), Some("thread_456"));

        assert!(db.clear_state(&key("web:u")).await.unwrap());
        assert!(!db.clear_state(&key("web:u")).await.unwrap());
        assert!(db.get_state(&key("web:u")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn state_is_scoped_per_key() {
        let db = LibSqlStateStore::new_memory();
        let mut state = ConversationState::new();
        state.set("n", 1);
        db.set_state(&key("web:a"), &state).await.unwrap();

        assert!(db.get_state(&key("web:b")).await.unwrap().is_empty());
    }

    // ── Lifecycle tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn local_file_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");

        {
            let db = LibSqlStateStore::new_local(&path);
            db.save_profile(&key("telegram:9"), "Maria").await.unwrap();
        }

        let db = LibSqlStateStore::new_local(&path);
        let profile = db.get_profile(&key("telegram:9")).await.unwrap().unwrap();
        assert_eq!(profile.display_name, "Maria");
    }

    #[tokio::test]
    async fn unreachable_store_fails_calls_not_construction() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A regular file cannot be a parent directory.
        let path = file.path().join("relay.db");
        let db = LibSqlStateStore::new_local(&path);

        let err = db.get_profile(&key("web:u")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        // Still failing (and not panicking) on retry.
        assert!(db.get_state(&key("web:u")).await.is_err());
    }

    #[test]
    fn parse_datetime_formats() {
        let rfc = parse_datetime("2026-01-02T03:04:05+00:00");
        assert_eq!(rfc.to_rfc3339(), "2026-01-02T03:04:05+00:00");
        let sqlite = parse_datetime("2026-01-02 03:04:05");
        assert_eq!(sqlite, rfc);
        assert_eq!(parse_datetime("garbage"), DateTime::<Utc>::MIN_UTC);
    }
}
