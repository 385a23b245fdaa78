use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::Record;

use crate::error::StoreError;

/// Typed record store keyed by string, one instance per record kind.
///
/// Keys passed in are relative (e.g. `chanA|chat1`); a shared-backend
/// implementation adds its namespace prefix. Patterns use glob syntax.
#[async_trait]
pub trait KvStore<R: Record>: Send + Sync {
    async fn save(&self, key: &str, record: &R, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<R>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Reset the TTL of an existing entry. `false` when absent.
    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn list(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn get_all(&self) -> Result<HashMap<String, R>, StoreError>;

    /// Apply one mutation atomically with respect to every other
    /// `update_field` on the same key, keeping the entry's remaining TTL.
    /// Absent entries are left alone and yield `Ok(false)`.
    async fn update_field(&self, key: &str, update: R::Update) -> Result<bool, StoreError>;
}
