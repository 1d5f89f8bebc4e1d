//! Writes one cycle's deltas to the key/value, document and geospatial sinks.

pub mod plan;
pub mod spatial;

pub use plan::CommitPlan;

use crate::models::{DeviceCommand, SpatialBatch};
use crate::onboard::config::KeyConfig;
use crate::onboard::traits::{DocumentStore, GeoStore, KvStore};
use crate::partition::PartitionTable;
use crate::Result;
use std::sync::Arc;

/// Result of the device half of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCommitOutcome {
    /// False when any hash, document or partition-table write failed.
    pub committed: bool,
    pub upserted: usize,
    pub removed: usize,
    pub notified: usize,
}

pub struct CommitEngine {
    kv: Arc<dyn KvStore>,
    documents: Arc<dyn DocumentStore>,
    geo: Arc<dyn GeoStore>,
    keys: KeyConfig,
}

impl CommitEngine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        documents: Arc<dyn DocumentStore>,
        geo: Arc<dyn GeoStore>,
        keys: KeyConfig,
    ) -> Self {
        Self {
            kv,
            documents,
            geo,
            keys,
        }
    }

    /// Apply `plan` and persist the changed partition-table entries.
    ///
    /// Every step runs even after an earlier one failed; failures only clear `committed`.
    /// A failed notification publish is logged and does not affect the outcome.
    #[tracing::instrument(level = "info", skip_all, fields(
        upserts = plan.primary_upserts.len(),
        removed = plan.removed.len(),
        documents = plan.documents.len(),
    ))]
    pub async fn commit_devices(
        &self,
        plan: CommitPlan,
        table: &mut PartitionTable,
    ) -> DeviceCommitOutcome {
        let mut outcome = DeviceCommitOutcome {
            committed: true,
            upserted: plan.primary_upserts.len(),
            removed: plan.removed.len(),
            notified: 0,
        };
        let keys = &self.keys;

        if !plan.primary_upserts.is_empty() {
            let res = self
                .kv
                .hset_multiple(&keys.registered_devices, &plan.primary_upserts)
                .await;
            outcome.committed &= check(res, "primary device hash write");
        }

        if !plan.documents.is_empty() {
            match self.documents.bulk_write(plan.documents).await {
                Ok(affected) => tracing::info!(affected, "document bulk write done"),
                Err(e) => {
                    tracing::error!(error = %e, "document bulk write failed");
                    outcome.committed = false;
                }
            }
        }

        if !plan.promoted.is_empty() {
            let res = self.kv.hdel(&keys.test_devices, &plan.promoted).await;
            outcome.committed &= check(res, "test pool cleanup of installed devices");
        }

        if !plan.test_upserts.is_empty() {
            let res = self
                .kv
                .hset_multiple(&keys.test_devices, &plan.test_upserts)
                .await;
            outcome.committed &= check(res, "test device hash write");
        }

        if !plan.removed.is_empty() {
            match self.kv.hdel(&keys.registered_devices, &plan.removed).await {
                Ok(0) => tracing::warn!("no device deleted from primary hash"),
                Ok(n) => tracing::info!(deleted = n, "devices removed from primary hash"),
                Err(e) => {
                    tracing::error!(error = %e, "primary device hash delete failed");
                    outcome.committed = false;
                }
            }
            let res = self.kv.hdel(&keys.test_devices, &plan.removed).await;
            outcome.committed &= check(res, "test device hash delete");
        }

        if !plan.notifications.is_empty() {
            outcome.notified = self.publish(&plan.notifications).await;
        }

        if table.has_changes() {
            let entries = table.dirty_entries();
            match self
                .kv
                .hset_multiple(&keys.communication_groups, &entries)
                .await
            {
                Ok(()) => {
                    tracing::info!(partitions = entries.len(), "partition table updated");
                    table.mark_clean();
                }
                Err(e) => {
                    tracing::error!(error = %e, "partition table write failed");
                    outcome.committed = false;
                }
            }
        }

        outcome
    }

    async fn publish(&self, notifications: &[DeviceCommand]) -> usize {
        let payload = match serde_json::to_string(notifications) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "notification serialization failed");
                return 0;
            }
        };
        match self
            .kv
            .publish(&self.keys.device_command_channel, &payload)
            .await
        {
            Ok(receivers) => {
                tracing::info!(
                    receivers,
                    devices = notifications.len(),
                    "device change notifications published"
                );
                notifications.len()
            }
            Err(e) => {
                tracing::error!(error = %e, "device change notification publish failed");
                0
            }
        }
    }

    pub async fn commit_spatial(&self, batch: SpatialBatch) -> bool {
        spatial::commit_spatial(self.geo.as_ref(), batch).await
    }
}

fn check(res: Result<impl Sized>, what: &str) -> bool {
    match res {
        Ok(_) => true,
        Err(e) => {
            tracing::error!(error = %e, "{what} failed");
            false
        }
    }
}
