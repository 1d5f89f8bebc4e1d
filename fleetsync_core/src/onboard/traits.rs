use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;

pub use crate::onboard::models::{DocumentWrite, GeoCategory, GeoOp, GeoStatement, GeoTarget};

/// Key/value store (Redis). Holds the device hashes, partition table, credentials and
/// the onboarded-source registry; also carries change notifications over pub/sub.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    /// Values in `fields` order; missing fields are `None`.
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()>;
    /// Returns the number of fields removed.
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;
    /// Remaining time to live in seconds (`-1` no expiry, `-2` missing key).
    async fn ttl(&self, key: &str) -> Result<i64>;
}

/// Document store (MongoDB) holding the installed-device projection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply `writes` in order. The first failing item aborts the rest.
    /// Returns the number of documents upserted, modified or deleted.
    async fn bulk_write(&self, writes: Vec<DocumentWrite>) -> Result<u64>;

    /// Ad hoc query with a JSON filter document.
    async fn find(&self, filter: serde_json::Value) -> Result<Vec<serde_json::Value>>;
}

/// Relational geospatial store (PostGIS).
#[async_trait]
pub trait GeoStore: Send + Sync {
    /// Execute `statements` in order inside one transaction and return affected rows.
    ///
    /// The first error rolls the transaction back. The transaction is committed only
    /// when the affected-row count is positive.
    async fn apply(&self, statements: Vec<GeoStatement>) -> Result<u64>;
}
