//! Record storage backend.
//!
//! The DHT core only needs the narrow [`Storage`] interface. Durable backends
//! live outside this crate; [`MemoryStorage`] serves tests and the demo binary.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::identity::Identity;
use crate::records::{Key, SignedRecord, UserIdClaim};

/// Persistent key/value store for verified records and user-name claims.
///
/// Implementations receive records that have already been verified.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Store a record, newest-wins per `(key, author)`. Returns whether the
    /// record replaced what was stored.
    async fn store_record(&self, record: SignedRecord) -> Result<bool>;

    async fn record_by_author(&self, key: &Key, author: &Identity) -> Result<Option<SignedRecord>>;

    /// Up to `limit` records under `key` with timestamp greater than `since`,
    /// in ascending timestamp order.
    async fn records_since(&self, key: &Key, since: u64, limit: usize) -> Result<Vec<SignedRecord>>;

    /// Register a user-name claim. Returns `false` when the name is already
    /// held by a different author with an earlier claim.
    async fn set_user_id(&self, claim: UserIdClaim) -> Result<bool>;

    async fn get_user_id(&self, user_hash: &Key) -> Result<Option<UserIdClaim>>;
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<Key, HashMap<Identity, SignedRecord>>,
    users: HashMap<Key, UserIdClaim>,
}

/// In-memory [`Storage`]. Contents are lost when dropped.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held across all keys.
    pub async fn record_count(&self) -> usize {
        self.inner.read().await.records.values().map(HashMap::len).sum()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store_record(&self, record: SignedRecord) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let by_author = inner.records.entry(record.entry.key).or_default();
        match by_author.get(&record.entry.author) {
            Some(existing) if !record.is_newer_than(existing) => Ok(false),
            _ => {
                by_author.insert(record.entry.author, record);
                Ok(true)
            }
        }
    }

    async fn record_by_author(&self, key: &Key, author: &Identity) -> Result<Option<SignedRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .get(key)
            .and_then(|by_author| by_author.get(author))
            .cloned())
    }

    async fn records_since(&self, key: &Key, since: u64, limit: usize) -> Result<Vec<SignedRecord>> {
        let inner = self.inner.read().await;
        let Some(by_author) = inner.records.get(key) else {
            return Ok(Vec::new());
        };
        let mut found: Vec<SignedRecord> = by_author
            .values()
            .filter(|r| r.timestamp() > since)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.timestamp());
        found.truncate(limit);
        Ok(found)
    }

    async fn set_user_id(&self, claim: UserIdClaim) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.users.get(&claim.user_hash) {
            if existing.user_id != claim.user_id {
                return Ok(false);
            }
            if existing.author == claim.author {
                return Ok(true);
            }
            if claim.timestamp >= existing.timestamp {
                return Ok(false);
            }
        }
        inner.users.insert(claim.user_hash, claim);
        Ok(true)
    }

    async fn get_user_id(&self, user_hash: &Key) -> Result<Option<UserIdClaim>> {
        Ok(self.inner.read().await.users.get(user_hash).cloned())
    }
}
