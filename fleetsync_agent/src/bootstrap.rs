use fleetsync_core::onboard::discovery::discover_sources;
use fleetsync_core::onboard::mongo::MongoDocumentStore;
use fleetsync_core::onboard::postgres::PgGeoStore;
use fleetsync_core::onboard::secrets::CredentialCipher;
use fleetsync_core::{AgentConfig, DocumentStore, GeoStore, Result, SyncEngine};
use std::sync::Arc;

/// Connect every store, discover the sources and assemble the sync engine.
///
/// Any failure here is startup-fatal.
#[tracing::instrument(level = "info", skip_all)]
pub async fn build_engine(cfg: &AgentConfig) -> Result<SyncEngine> {
    let kv = fleetsync_core::onboard::redis::connect(&cfg.redis).await?;
    let cipher = CredentialCipher::load(
        kv.as_ref(),
        &cfg.keys.crypto_secret,
        &cfg.keys.crypto_secret_field,
    )
    .await?;
    let sources = discover_sources(kv.as_ref(), &cfg.keys, &cipher, &cfg.sync).await?;

    let geo: Arc<dyn GeoStore> = Arc::new(PgGeoStore::connect(&cfg.postgres).await?);
    let documents: Arc<dyn DocumentStore> = Arc::new(MongoDocumentStore::connect(&cfg.mongo).await?);

    tracing::info!(
        sources = sources.tasks.len(),
        main_page_ids = %sources.main_page_ids,
        "agent initialized"
    );
    SyncEngine::new(
        sources.tasks,
        sources.main_page_ids,
        kv,
        documents,
        geo,
        cfg.keys.clone(),
        cfg.sync.clone(),
    )
}
