//! Seen set: dedup keys of messages already handed to the consumer.
//!
//! A key present in the set is never delivered again until it is removed or
//! the set is reset. Inserts are awaited before the cycle moves on, so a
//! crash can only cause a duplicate, never a lost message.

pub mod libsql_store;
mod migrations;

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;

pub use libsql_store::LibSqlSeenStore;

#[async_trait]
pub trait SeenStore: Send + Sync {
    async fn contains(&self, key: &str) -> Result<bool, DatabaseError>;

    /// Record a key. Inserting an existing key is a no-op.
    async fn insert(&self, key: &str) -> Result<(), DatabaseError>;

    /// Forget one key so the message can be delivered again.
    async fn remove(&self, key: &str) -> Result<bool, DatabaseError>;

    /// Forget every key.
    async fn reset(&self) -> Result<(), DatabaseError>;

    async fn len(&self) -> Result<usize, DatabaseError>;

    async fn is_empty(&self) -> Result<bool, DatabaseError> {
        Ok(self.len().await? == 0)
    }
}

/// Process-local seen set. Lost on restart.
#[derive(Debug, Default)]
pub struct MemorySeenSet {
    keys: RwLock<HashSet<String>>,
}

impl MemorySeenSet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SeenStore for MemorySeenSet {
    async fn contains(&self, key: &str) -> Result<bool, DatabaseError> {
        Ok(self.keys.read().await.contains(key))
    }

    async fn insert(&self, key: &str) -> Result<(), DatabaseError> {
        self.keys.write().await.insert(key.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, DatabaseError> {
        Ok(self.keys.write().await.remove(key))
    }

    async fn reset(&self) -> Result<(), DatabaseError> {
        self.keys.write().await.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, DatabaseError> {
        Ok(self.keys.read().await.len())
    }
}
