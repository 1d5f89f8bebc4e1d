use crate::models::DeviceDocument;
use crate::onboard::config::MongoConfig;
use crate::onboard::traits::{DocumentStore, DocumentWrite};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::oid::ObjectId;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{ClientOptions, Credential, UpdateOptions};
use mongodb::{Client, Collection};

/// Placeholder `mongoid` epoch for freshly inserted device documents.
const PLACEHOLDER_OID_SECS: u32 = 631_152_000; // 1990-01-01T00:00:00Z

/// MongoDB collection holding the installed-device projection, keyed by device id.
#[derive(Clone)]
pub struct MongoDocumentStore {
    collection: Collection<Document>,
}

impl MongoDocumentStore {
    #[tracing::instrument(level = "debug", skip(cfg), fields(db = %cfg.db_name, collection = %cfg.collection))]
    pub async fn connect(cfg: &MongoConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(format!("mongodb://{}", cfg.endpoint.trim()))
            .await
            .map_err(|e| Error::backend("mongo options", e))?;
        options.credential = Some(
            Credential::builder()
                .username(cfg.username.clone())
                .password(cfg.password.clone())
                .source(cfg.auth_db.clone())
                .build(),
        );
        let client =
            Client::with_options(options).map_err(|e| Error::backend("mongo client", e))?;
        let db = client.database(&cfg.db_name);
        db.run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| Error::backend("mongo ping", e))?;
        tracing::info!("mongo connected");
        Ok(Self {
            collection: db.collection(&cfg.collection),
        })
    }
}

fn placeholder_oid() -> ObjectId {
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&PLACEHOLDER_OID_SECS.to_be_bytes());
    ObjectId::from_bytes(bytes)
}

/// `$set` the projection, `$setOnInsert` the live-telemetry placeholders.
fn upsert_update(document: &DeviceDocument, now: DateTime<Utc>) -> Result<Document> {
    let mut set = bson::to_document(document)
        .map_err(|e| Error::Decode(format!("device document: {e}")))?;
    set.remove("_id");
    let now = bson::DateTime::from_millis(now.timestamp_millis());
    Ok(doc! {
        "$set": set,
        "$setOnInsert": {
            "createdon": now,
            "insertdatetime": now,
            "devicedatetime": now,
            "ignitionstatus": 0,
            "speed": 0,
            "latitude": 0,
            "longitude": 0,
            "recordstatus": 0,
            "mongoid": placeholder_oid(),
        },
    })
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    #[tracing::instrument(level = "debug", skip(self, writes), fields(writes = writes.len()))]
    async fn bulk_write(&self, writes: Vec<DocumentWrite>) -> Result<u64> {
        let now = Utc::now();
        let upsert = UpdateOptions::builder().upsert(true).build();
        let mut affected = 0u64;
        for write in writes {
            match write {
                DocumentWrite::Upsert(document) => {
                    let update = upsert_update(&document, now)?;
                    let res = self
                        .collection
                        .update_one(doc! { "_id": document.id.as_str() }, update, upsert.clone())
                        .await
                        .map_err(|e| Error::backend("mongo upsert", e))?;
                    affected += res.modified_count + u64::from(res.upserted_id.is_some());
                }
                DocumentWrite::Delete { id } => {
                    let res = self
                        .collection
                        .delete_one(doc! { "_id": id }, None)
                        .await
                        .map_err(|e| Error::backend("mongo delete", e))?;
                    affected += res.deleted_count;
                }
            }
        }
        Ok(affected)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn find(&self, filter: serde_json::Value) -> Result<Vec<serde_json::Value>> {
        let filter = bson::to_document(&filter)
            .map_err(|e| Error::InvalidInput(format!("mongo filter: {e}")))?;
        let docs: Vec<Document> = self
            .collection
            .find(filter, None)
            .await
            .map_err(|e| Error::backend("mongo find", e))?
            .try_collect()
            .await
            .map_err(|e| Error::backend("mongo find cursor", e))?;
        Ok(docs
            .into_iter()
            .map(|d| Bson::Document(d).into_relaxed_extjson())
            .collect())
    }
}
