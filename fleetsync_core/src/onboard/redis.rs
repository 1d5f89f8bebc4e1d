use crate::onboard::config::{RedisConfig, RedisMode};
use crate::onboard::traits::KvStore;
use crate::{Error, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;

/// Redis-backed [`KvStore`], generic over a single-node connection manager or a
/// cluster connection. Both are cheap to clone per command.
#[derive(Clone)]
pub struct RedisKvStore<C> {
    conn: C,
}

impl RedisKvStore<ConnectionManager> {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn single(cfg: &RedisConfig) -> Result<Self> {
        let url = cfg
            .nodes()
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidInput("redis endpoint is empty".to_string()))?;
        let client =
            redis::Client::open(url).map_err(|e| Error::backend("redis client open", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::backend("redis connect", e))?;
        Ok(Self { conn })
    }
}

impl RedisKvStore<ClusterConnection> {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn cluster(cfg: &RedisConfig) -> Result<Self> {
        let client = ClusterClientBuilder::new(cfg.nodes())
            .username(cfg.username.clone())
            .password(cfg.password.clone())
            .build()
            .map_err(|e| Error::backend("redis cluster client", e))?;
        let conn = client
            .get_async_connection()
            .await
            .map_err(|e| Error::backend("redis cluster connect", e))?;
        Ok(Self { conn })
    }
}

/// Connect in the configured mode.
pub async fn connect(cfg: &RedisConfig) -> Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match cfg.mode {
        RedisMode::Cluster => Arc::new(RedisKvStore::cluster(cfg).await?),
        RedisMode::Single => Arc::new(RedisKvStore::single(cfg).await?),
    };
    tracing::info!(mode = ?cfg.mode, "redis connected");
    Ok(store)
}

#[async_trait]
impl<C> KvStore for RedisKvStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| Error::backend("redis get", e))
    }

    #[tracing::instrument(level = "debug", skip(self, keys), fields(keys = keys.len()))]
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::backend("redis mget", e))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field)
            .await
            .map_err(|e| Error::backend("redis hget", e))
    }

    #[tracing::instrument(level = "debug", skip(self, fields), fields(fields = fields.len()))]
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::backend("redis hmget", e))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(key)
            .await
            .map_err(|e| Error::backend("redis hgetall", e))
    }

    #[tracing::instrument(level = "debug", skip(self, entries), fields(entries = entries.len()))]
    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(key, entries)
            .await
            .map_err(|e| Error::backend("redis hset", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, fields), fields(fields = fields.len()))]
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let n: i64 = conn
            .hdel(key, fields)
            .await
            .map_err(|e| Error::backend("redis hdel", e))?;
        Ok(n.max(0) as u64)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key)
            .await
            .map_err(|e| Error::backend("redis smembers", e))
    }

    #[tracing::instrument(level = "debug", skip(self, payload))]
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let n: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| Error::backend("redis publish", e))?;
        Ok(n.max(0) as u64)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(key)
            .await
            .map_err(|e| Error::backend("redis exists", e))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.ttl(key)
            .await
            .map_err(|e| Error::backend("redis ttl", e))
    }
}
