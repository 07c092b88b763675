//! libSQL-backed seen set that survives restarts.
//!
//! Keys are stored per scope (see `SessionConfig::scope`) so several
//! mailboxes can share one database file.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use super::SeenStore;
use super::migrations;
use crate::error::DatabaseError;

pub struct LibSqlSeenStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    scope: String,
}

impl LibSqlSeenStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, scope: impl Into<String>) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db, scope.into()).await?;
        info!(path = %path.display(), scope = %store.scope, "Seen-set database opened");
        Ok(store)
    }

    /// Create an in-memory database.
    pub async fn new_memory(scope: impl Into<String>) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, scope.into()).await
    }

    async fn from_database(db: LibSqlDatabase, scope: String) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            scope,
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

#[async_trait]
impl SeenStore for LibSqlSeenStore {
    async fn contains(&self, key: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM seen_messages WHERE scope = ?1 AND dedup_key = ?2 LIMIT 1",
                params![self.scope.as_str(), key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("seen contains: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("seen contains: {e}")))?;
        Ok(row.is_some())
    }

    async fn insert(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO seen_messages (scope, dedup_key, seen_at) VALUES (?1, ?2, ?3)",
                params![self.scope.as_str(), key, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("seen insert: {e}")))?;
        debug!(scope = %self.scope, key, "Recorded seen message");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM seen_messages WHERE scope = ?1 AND dedup_key = ?2",
                params![self.scope.as_str(), key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("seen remove: {e}")))?;
        Ok(changed > 0)
    }

    async fn reset(&self) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "DELETE FROM seen_messages WHERE scope = ?1",
                params![self.scope.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("seen reset: {e}")))?;
        info!(scope = %self.scope, "Seen set reset");
        Ok(())
    }

    async fn len(&self) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM seen_messages WHERE scope = ?1",
                params![self.scope.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("seen len: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("seen len: {e}")))?
        {
            Some(row) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("seen len: {e}")))?;
                Ok(count.max(0) as usize)
            }
            None => Ok(0),
        }
    }
}
