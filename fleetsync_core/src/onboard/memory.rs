use crate::onboard::traits::{
    DocumentStore, DocumentWrite, GeoCategory, GeoOp, GeoStatement, GeoStore, KvStore,
};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct KvState {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    published: Vec<(String, String)>,
    failing_hashes: HashSet<String>,
    fail_publish: bool,
}

/// In-memory KvStore for local development and unit tests.
///
/// Hash writes to keys registered with [`MemoryKvStore::fail_hash_writes`] return a
/// backend error, as does `publish` after [`MemoryKvStore::fail_publish`].
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    state: Arc<Mutex<KvState>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_string(&self, key: &str, value: &str) {
        self.state
            .lock()
            .await
            .strings
            .insert(key.to_string(), value.to_string());
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) {
        self.state
            .lock()
            .await
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    pub async fn sadd(&self, key: &str, member: &str) {
        self.state
            .lock()
            .await
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    /// Snapshot of one hash (empty when missing).
    pub async fn hash(&self, key: &str) -> HashMap<String, String> {
        self.state
            .lock()
            .await
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// All (channel, payload) pairs published so far.
    pub async fn published(&self) -> Vec<(String, String)> {
        self.state.lock().await.published.clone()
    }

    pub async fn fail_hash_writes(&self, key: &str) {
        self.state
            .lock()
            .await
            .failing_hashes
            .insert(key.to_string());
    }

    pub async fn fail_publish(&self) {
        self.state.lock().await.fail_publish = true;
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().await.strings.get(key).cloned())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let state = self.state.lock().await;
        Ok(keys.iter().map(|k| state.strings.get(k).cloned()).collect())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let state = self.state.lock().await;
        let hash = state.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f).cloned()))
            .collect())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self
            .state
            .lock()
            .await
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_hashes.contains(key) {
            return Err(Error::BackendMessage(format!("hset to '{key}' rejected")));
        }
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        let mut state = self.state.lock().await;
        if state.failing_hashes.contains(key) {
            return Err(Error::BackendMessage(format!("hdel on '{key}' rejected")));
        }
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(0);
        };
        let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
        Ok(removed as u64)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        if state.fail_publish {
            return Err(Error::BackendMessage("publish rejected".to_string()));
        }
        state
            .published
            .push((channel.to_string(), payload.to_string()));
        Ok(1)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.strings.contains_key(key)
            || state.hashes.contains_key(key)
            || state.sets.contains_key(key))
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        Ok(if self.exists(key).await? { -1 } else { -2 })
    }
}

#[derive(Default)]
struct DocState {
    docs: BTreeMap<String, serde_json::Value>,
    fail: bool,
}

/// In-memory DocumentStore. Upserted documents are kept as their JSON projection.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    state: Arc<Mutex<DocState>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_writes(&self) {
        self.state.lock().await.fail = true;
    }

    pub async fn ids(&self) -> Vec<String> {
        self.state.lock().await.docs.keys().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<serde_json::Value> {
        self.state.lock().await.docs.get(id).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn bulk_write(&self, writes: Vec<DocumentWrite>) -> Result<u64> {
        let mut state = self.state.lock().await;
        if state.fail {
            return Err(Error::BackendMessage("bulk write rejected".to_string()));
        }
        let mut affected = 0u64;
        for write in writes {
            match write {
                DocumentWrite::Upsert(doc) => {
                    let value = serde_json::to_value(&doc)
                        .map_err(|e| Error::backend("serialize document", e))?;
                    state.docs.insert(doc.id.clone(), value);
                    affected += 1;
                }
                DocumentWrite::Delete { id } => {
                    if state.docs.remove(&id).is_some() {
                        affected += 1;
                    }
                }
            }
        }
        Ok(affected)
    }

    async fn find(&self, filter: serde_json::Value) -> Result<Vec<serde_json::Value>> {
        let conditions = filter.as_object().cloned().unwrap_or_default();
        let state = self.state.lock().await;
        Ok(state
            .docs
            .values()
            .filter(|doc| conditions.iter().all(|(k, v)| doc.get(k) == Some(v)))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct GeoState {
    rows: HashMap<(GeoCategory, String), GeoStatement>,
    fail_at: Option<usize>,
    commits: usize,
}

/// In-memory GeoStore with the same all-or-nothing batch semantics as the Postgres store.
#[derive(Clone, Default)]
pub struct MemoryGeoStore {
    state: Arc<Mutex<GeoState>>,
}

impl MemoryGeoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the statement at `index` (0-based, queue order) fail in every later batch.
    pub async fn fail_at(&self, index: usize) {
        self.state.lock().await.fail_at = Some(index);
    }

    pub async fn row(&self, category: GeoCategory, uid: &str) -> Option<GeoStatement> {
        self.state
            .lock()
            .await
            .rows
            .get(&(category, uid.to_string()))
            .cloned()
    }

    pub async fn row_count(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn commits(&self) -> usize {
        self.state.lock().await.commits
    }
}

#[async_trait]
impl GeoStore for MemoryGeoStore {
    async fn apply(&self, statements: Vec<GeoStatement>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut staged = state.rows.clone();
        let mut affected = 0u64;
        for (idx, stmt) in statements.into_iter().enumerate() {
            if state.fail_at == Some(idx) {
                return Err(Error::BackendMessage(format!(
                    "statement {idx} rejected, batch rolled back"
                )));
            }
            let key = (
                stmt.target.category(),
                stmt.target.entity().entity_uid.clone(),
            );
            match stmt.op {
                GeoOp::Upsert => {
                    staged.insert(key, stmt);
                    affected += 1;
                }
                GeoOp::Clear => {
                    if let Some(existing) = staged.get_mut(&key) {
                        *existing = stmt;
                        affected += 1;
                    }
                }
            }
        }
        if affected > 0 {
            state.rows = staged;
            state.commits += 1;
        }
        Ok(affected)
    }
}
