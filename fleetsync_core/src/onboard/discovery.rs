use crate::onboard::config::{KeyConfig, SyncConfig};
use crate::onboard::secrets::{CipherScheme, CredentialCipher};
use crate::onboard::traits::KvStore;
use crate::sources::mssql::{MssqlSource, SourceCredential};
use crate::sources::traits::{SourceDb, SourceTask};
use crate::{Error, Result};
use std::sync::Arc;

/// Usable sources found at startup.
#[derive(Debug, Clone)]
pub struct DiscoveredSources {
    /// Ordered by source id.
    pub tasks: Vec<SourceTask>,
    /// Comma-joined `mainpageid` of every usable source, in `tasks` order.
    pub main_page_ids: String,
}

/// Discover onboarded sources and open a SQL Server client for each.
pub async fn discover_sources(
    kv: &dyn KvStore,
    keys: &KeyConfig,
    cipher: &CredentialCipher,
    sync: &SyncConfig,
) -> Result<DiscoveredSources> {
    discover_sources_with(kv, keys, cipher, sync, |id, cred| {
        Ok(Arc::new(MssqlSource::new(id, cred)?) as Arc<dyn SourceDb>)
    })
    .await
}

/// Like [`discover_sources`], building each client with `open`.
///
/// Only ids present in both the onboarded set and the credential hash are considered.
/// Entries that fail to decrypt, decode or open are logged and skipped.
#[tracing::instrument(level = "info", skip_all)]
pub async fn discover_sources_with<F>(
    kv: &dyn KvStore,
    keys: &KeyConfig,
    cipher: &CredentialCipher,
    sync: &SyncConfig,
    open: F,
) -> Result<DiscoveredSources>
where
    F: Fn(&str, &SourceCredential) -> Result<Arc<dyn SourceDb>>,
{
    let mut onboarded = kv.smembers(&keys.onboarded_servers).await?;
    onboarded.sort();
    onboarded.dedup();
    let mut blobs = kv.hget_all(&keys.servers).await?;
    tracing::info!(onboarded = ?onboarded, registered = blobs.len(), "source registry read");

    let mut tasks = Vec::new();
    let mut page_ids = Vec::new();
    for source_id in onboarded {
        let Some(blob) = blobs.remove(&source_id) else {
            tracing::warn!(%source_id, "onboarded source has no credential entry");
            continue;
        };
        let cred = match decode_credential(cipher, &blob) {
            Ok(cred) => cred,
            Err(e) => {
                tracing::error!(%source_id, error = %e, "source credential unreadable");
                continue;
            }
        };
        let db = match open(&source_id, &cred) {
            Ok(db) => db,
            Err(e) => {
                tracing::error!(%source_id, error = %e, "source client init failed");
                continue;
            }
        };
        page_ids.push(cred.mainpageid.clone());
        tasks.push(SourceTask {
            spatial_authority: sync.is_spatial_authority(&source_id),
            source_id,
            db,
        });
    }

    if tasks.is_empty() {
        return Err(Error::InvalidInput(
            "no usable onboarded source".to_string(),
        ));
    }
    tracing::info!(sources = tasks.len(), "sources initialized");
    Ok(DiscoveredSources {
        tasks,
        main_page_ids: page_ids.join(","),
    })
}

/// W1 ciphertext -> hex plaintext -> JSON credential.
fn decode_credential(cipher: &CredentialCipher, blob: &str) -> Result<SourceCredential> {
    let plain_hex = cipher.decrypt(blob, CipherScheme::W1)?;
    let json = hex::decode(plain_hex.trim())
        .map_err(|e| Error::Decode(format!("credential hex: {e}")))?;
    serde_json::from_slice(&json).map_err(|e| Error::Decode(format!("credential json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboard::memory::MemoryKvStore;
    use crate::onboard::secrets::CryptoSecrets;
    use crate::sources::memory::MemorySource;
    use chrono::Utc;

    fn keys() -> KeyConfig {
        KeyConfig {
            servers: "servers".to_string(),
            onboarded_servers: "onboarded".to_string(),
            registered_devices: "devices".to_string(),
            test_devices: "testdevices".to_string(),
            communication_groups: "groups".to_string(),
            crypto_secret: "crypto".to_string(),
            crypto_secret_field: "secret".to_string(),
            device_command_channel: "commands".to_string(),
        }
    }

    fn cipher() -> CredentialCipher {
        CredentialCipher::new(CryptoSecrets {
            encryption_key_w1: "0123456789abcdef".to_string(),
            encryption_iv_w1: "fedcba9876543210".to_string(),
            ..CryptoSecrets::default()
        })
    }

    fn sealed(cipher: &CredentialCipher, host: &str, page: &str) -> String {
        let json = serde_json::json!({
            "hostname": host,
            "dbname": "fleet",
            "username": "sync",
            "password": "pw",
            "mainpageid": page,
        })
        .to_string();
        cipher
            .encrypt(&hex::encode(json), CipherScheme::W1)
            .unwrap()
    }

    fn open_memory(_: &str, _: &SourceCredential) -> Result<Arc<dyn SourceDb>> {
        Ok(Arc::new(MemorySource::new(Utc::now())))
    }

    #[tokio::test]
    async fn keeps_only_onboarded_and_readable_sources() {
        let kv = MemoryKvStore::new();
        let c = cipher();
        kv.hset("servers", "1", &sealed(&c, "db1", "10")).await;
        kv.hset("servers", "27", &sealed(&c, "db27", "11")).await;
        kv.hset("servers", "5", &sealed(&c, "db5", "12")).await;
        kv.hset("servers", "9", "not-hex").await;
        kv.sadd("onboarded", "27").await;
        kv.sadd("onboarded", "1").await;
        kv.sadd("onboarded", "9").await;
        kv.sadd("onboarded", "44").await;

        let found = discover_sources_with(&kv, &keys(), &c, &SyncConfig::default(), open_memory)
            .await
            .unwrap();

        let ids: Vec<&str> = found.tasks.iter().map(|t| t.source_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "27"]);
        assert!(found.tasks[0].spatial_authority);
        assert!(!found.tasks[1].spatial_authority);
        assert_eq!(found.main_page_ids, "10,11");
    }

    #[tokio::test]
    async fn open_failures_are_skipped() {
        let kv = MemoryKvStore::new();
        let c = cipher();
        kv.hset("servers", "1", &sealed(&c, "", "10")).await;
        kv.hset("servers", "2", &sealed(&c, "db2", "20")).await;
        kv.sadd("onboarded", "1").await;
        kv.sadd("onboarded", "2").await;

        let found = discover_sources(&kv, &keys(), &c, &SyncConfig::default())
            .await
            .unwrap();

        assert_eq!(found.tasks.len(), 1);
        assert_eq!(found.tasks[0].source_id, "2");
        assert_eq!(found.main_page_ids, "20");
    }

    #[tokio::test]
    async fn no_usable_source_is_an_error() {
        let kv = MemoryKvStore::new();
        kv.sadd("onboarded", "1").await;
        let err = discover_sources_with(&kv, &keys(), &cipher(), &SyncConfig::default(), open_memory)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
