//! Cache backend contract.
//!
//! Backends are the only cross-process channel between runners and the
//! orchestrator: a runner (or its child process) writes the result under
//! the session's cache key, and every reader addresses it the same way.
//! Concrete backends beyond the in-memory reference live outside this
//! crate; anything satisfying [`CacheBackend`] can be registered.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::MemoryCache;

use crate::error::Result;

/// Metadata for one cache-resident record, as returned by `list()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Approximate serialized size in bytes.
    pub size: u64,
}

/// Key→value store with TTL. Absence is `None`; values are opaque JSON.
///
/// Implementations must be safe for concurrent use: runners in other
/// processes read and write the same keys the orchestrator does.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Resolves when the backend is ready to serve.
    async fn init(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Resolves after a durable write. `expires_at = None` stores
    /// indefinitely.
    async fn set(&self, key: &str, value: Value, expires_at: Option<DateTime<Utc>>) -> Result<()>;

    /// Idempotent delete.
    async fn unset(&self, key: &str) -> Result<()>;

    /// Approximate byte size of the stored value, or `None` when absent.
    async fn size(&self, key: &str) -> Result<Option<u64>>;

    async fn list(&self) -> Result<Vec<CacheEntryMeta>>;

    /// Releases resources. Idempotent.
    async fn destroy(&self) -> Result<()>;
}

pub type SharedCache = Arc<dyn CacheBackend>;
