//! The periodic sync cycle: fetch, reconcile, commit, advance watermarks.

use crate::commit::{CommitEngine, CommitPlan, DeviceCommitOutcome};
use crate::models::{DeviceRecord, Watermark, WatermarkMap};
use crate::onboard::config::{KeyConfig, SyncConfig};
use crate::onboard::traits::{DocumentStore, GeoStore, KvStore};
use crate::partition::PartitionTable;
use crate::reconcile::{assign_groups, load_prior, reconcile};
use crate::sources::{fetch_all, CycleBatch, SourceTask};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Summary of one completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub fetched_devices: usize,
    pub devices: DeviceCommitOutcome,
    pub spatial_committed: bool,
    pub watermark_writes: usize,
    pub watermark_failures: usize,
}

/// Owns the cross-cycle state: the source list and the watermark failure counter.
/// Cycles never overlap.
pub struct SyncEngine {
    tasks: Vec<SourceTask>,
    main_page_ids: String,
    kv: Arc<dyn KvStore>,
    commit: CommitEngine,
    keys: KeyConfig,
    cfg: SyncConfig,
    watermark_failures: u32,
}

impl SyncEngine {
    #[tracing::instrument(level = "debug", skip_all, fields(sources = tasks.len()))]
    pub fn new(
        tasks: Vec<SourceTask>,
        main_page_ids: impl Into<String>,
        kv: Arc<dyn KvStore>,
        documents: Arc<dyn DocumentStore>,
        geo: Arc<dyn GeoStore>,
        keys: KeyConfig,
        cfg: SyncConfig,
    ) -> Result<Self> {
        cfg.validate()?;
        let commit = CommitEngine::new(kv.clone(), documents, geo, keys.clone());
        Ok(Self {
            tasks,
            main_page_ids: main_page_ids.into(),
            kv,
            commit,
            keys,
            cfg,
            watermark_failures: 0,
        })
    }

    pub fn watermark_failures(&self) -> u32 {
        self.watermark_failures
    }

    /// Run cycles until `shutdown` fires or the watermark breaker trips.
    ///
    /// Cancellation is observed between cycles; a running cycle always completes.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_loop(&mut self, shutdown: CancellationToken) -> Result<()> {
        loop {
            if shutdown.is_cancelled() {
                tracing::info!("sync loop stopping");
                return Ok(());
            }
            match self.run_cycle().await {
                Ok(report) => tracing::info!(?report, "sync cycle finished"),
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "sync loop aborted");
                    return Err(e);
                }
                Err(e) => tracing::error!(error = %e, "sync cycle failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.cfg.interval) => {}
            }
        }
    }

    /// One full cycle. Only a tripped watermark breaker or an aggregator failure is
    /// returned as an error; sink failures are logged and gate the watermarks.
    #[tracing::instrument(level = "info", skip(self), fields(cycle_id = %uuid::Uuid::new_v4()))]
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let CycleBatch {
            devices,
            spatial,
            watermarks,
        } = fetch_all(&self.tasks, &self.main_page_ids).await?;

        let mut report = CycleReport {
            fetched_devices: devices.len(),
            ..CycleReport::default()
        };

        report.devices = match self.sync_devices(devices).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "device sync skipped");
                DeviceCommitOutcome::default()
            }
        };
        report.spatial_committed = self.commit.commit_spatial(spatial).await;

        let (writes, failures) = self
            .write_watermarks(watermarks, report.devices.committed, report.spatial_committed)
            .await;
        report.watermark_writes = writes;
        report.watermark_failures = failures;

        if failures > 0 {
            self.watermark_failures = self
                .watermark_failures
                .saturating_add(u32::try_from(failures).unwrap_or(u32::MAX));
            tracing::warn!(
                total = self.watermark_failures,
                threshold = self.cfg.watermark_failure_threshold,
                "watermark write-back failures"
            );
        }
        if self.watermark_failures > self.cfg.watermark_failure_threshold {
            return Err(Error::WatermarkBreakerOpen {
                failures: self.watermark_failures,
                threshold: self.cfg.watermark_failure_threshold,
            });
        }
        Ok(report)
    }

    async fn sync_devices(
        &self,
        devices: Vec<DeviceRecord>,
    ) -> Result<DeviceCommitOutcome> {
        let stored = self.kv.hget_all(&self.keys.communication_groups).await?;
        let mut table = PartitionTable::from_stored(stored);
        tracing::debug!(partitions = table.len(), "partition table loaded");

        let ids: Vec<String> = devices.iter().map(|d| d.device_id.clone()).collect();
        let prior = load_prior(self.kv.as_ref(), &self.keys.registered_devices, &ids).await?;

        let mut reconciled = reconcile(devices, &prior);
        assign_groups(&mut reconciled, &mut table, self.cfg.partition_capacity);
        let plan = CommitPlan::build(&reconciled);
        let outcome = self.commit.commit_devices(plan, &mut table).await;
        Ok(outcome)
    }

    /// Write back each reporting source's fetch timestamps, concurrently.
    ///
    /// The device half is sent only if device data committed, the spatial half only if
    /// spatial data committed. Returns `(writes attempted, writes failed)`.
    #[tracing::instrument(level = "debug", skip(self, watermarks))]
    async fn write_watermarks(
        &self,
        watermarks: WatermarkMap,
        devices_committed: bool,
        spatial_committed: bool,
    ) -> (usize, usize) {
        let by_id: HashMap<&str, &SourceTask> = self
            .tasks
            .iter()
            .map(|t| (t.source_id.as_str(), t))
            .collect();

        let mut writers = JoinSet::new();
        for (source_id, mark) in watermarks {
            let gated = Watermark {
                devices: mark.devices.filter(|_| devices_committed),
                spatial: mark.spatial.filter(|_| spatial_committed),
            };
            if gated.is_empty() {
                tracing::debug!(%source_id, "watermark not advanced");
                continue;
            }
            let Some(task) = by_id.get(source_id.as_str()) else {
                continue;
            };
            let db = task.db.clone();
            writers.spawn(async move {
                let res = db.update_watermark(gated.devices, gated.spatial).await;
                (source_id, res)
            });
        }

        let (mut writes, mut failures) = (0, 0);
        while let Some(joined) = writers.join_next().await {
            writes += 1;
            match joined {
                Ok((source_id, Ok(true))) => {
                    tracing::debug!(%source_id, "watermark advanced");
                }
                Ok((source_id, Ok(false))) => {
                    tracing::warn!(%source_id, "source reported watermark not updated");
                }
                Ok((source_id, Err(e))) => {
                    tracing::error!(%source_id, error = %e, "watermark write failed");
                    failures += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "watermark writer aborted");
                    failures += 1;
                }
            }
        }
        (writes, failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CommandKind, DeviceCommand, DeviceRecord, SpatialBatch, SpatialEntity, INSTALLED_STATUS};
    use crate::onboard::memory::{MemoryDocumentStore, MemoryGeoStore, MemoryKvStore};
    use crate::onboard::traits::{DocumentWrite, GeoCategory};
    use crate::models::DeviceDocument;
    use crate::sources::memory::MemorySource;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct Harness {
        kv: MemoryKvStore,
        docs: MemoryDocumentStore,
        geo: MemoryGeoStore,
        source: MemorySource,
        engine: SyncEngine,
    }

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

    fn harness() -> Harness {
        let kv = MemoryKvStore::new();
        let docs = MemoryDocumentStore::new();
        let geo = MemoryGeoStore::new();
        let source = MemorySource::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let task = SourceTask {
            source_id: "1".to_string(),
            db: Arc::new(source.clone()),
            spatial_authority: true,
        };
        let cfg = SyncConfig {
            interval: Duration::from_millis(10),
            ..SyncConfig::default()
        };
        let engine = SyncEngine::new(
            vec![task],
            "10",
            Arc::new(kv.clone()),
            Arc::new(docs.clone()),
            Arc::new(geo.clone()),
            keys(),
            cfg,
        )
        .unwrap();
        Harness {
            kv,
            docs,
            geo,
            source,
            engine,
        }
    }

    fn installed(id: &str) -> DeviceRecord {
        DeviceRecord {
            active: 1,
            install_status: INSTALLED_STATUS,
            ..DeviceRecord::new(id)
        }
    }

    fn notifications(published: &[(String, String)]) -> Vec<DeviceCommand> {
        published
            .iter()
            .flat_map(|(_, payload)| serde_json::from_str::<Vec<DeviceCommand>>(payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn unknown_device_is_allocated_and_stored_without_notification() {
        let mut h = harness();
        h.kv.hset("groups", "0", "1000").await;
        h.kv.hset("groups", "1", "4").await;
        h.source.set_devices(vec![installed("D1")]).await;

        let report = h.engine.run_cycle().await.unwrap();

        assert!(report.devices.committed);
        let stored: DeviceRecord =
            serde_json::from_str(&h.kv.hash("devices").await["D1"]).unwrap();
        assert_eq!(stored.group_id, 1);
        assert_eq!(h.kv.hash("groups").await["1"], "5");
        assert_eq!(h.docs.ids().await, vec!["D1".to_string()]);
        assert!(h.kv.published().await.is_empty());
    }

    #[tokio::test]
    async fn deactivated_device_is_removed_released_and_disconnected() {
        let mut h = harness();
        let prior = DeviceRecord {
            group_id: 3,
            ..installed("D2")
        };
        h.kv.hset("devices", "D2", &serde_json::to_string(&prior).unwrap()).await;
        h.kv.hset("testdevices", "D2", "{}").await;
        h.kv.hset("groups", "3", "7").await;
        h.docs
            .bulk_write(vec![DocumentWrite::Upsert(DeviceDocument::from(&prior))])
            .await
            .unwrap();
        h.source
            .set_devices(vec![DeviceRecord {
                active: 0,
                ..installed("D2")
            }])
            .await;

        let report = h.engine.run_cycle().await.unwrap();

        assert!(report.devices.committed);
        assert!(!h.kv.hash("devices").await.contains_key("D2"));
        assert!(!h.kv.hash("testdevices").await.contains_key("D2"));
        assert!(h.docs.ids().await.is_empty());
        assert_eq!(h.kv.hash("groups").await["3"], "6");
        let sent = notifications(&h.kv.published().await);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].device_id, "D2");
        assert_eq!(sent[0].command, CommandKind::Disconnect);
    }

    #[tokio::test]
    async fn rerun_with_same_input_changes_nothing() {
        let mut h = harness();
        h.source.set_devices(vec![installed("D1"), installed("D3")]).await;

        h.engine.run_cycle().await.unwrap();
        let groups = h.kv.hash("groups").await;
        let devices = h.kv.hash("devices").await;

        let report = h.engine.run_cycle().await.unwrap();

        assert!(report.devices.committed);
        assert_eq!(report.devices.notified, 0);
        assert_eq!(h.kv.hash("groups").await, groups);
        assert_eq!(h.kv.hash("devices").await, devices);
        assert!(h.kv.published().await.is_empty());
    }

    #[tokio::test]
    async fn document_failure_holds_back_device_watermark() {
        let mut h = harness();
        h.docs.fail_writes().await;
        h.source.set_devices(vec![installed("D1")]).await;

        let report = h.engine.run_cycle().await.unwrap();

        assert!(!report.devices.committed);
        assert!(h.kv.hash("devices").await.contains_key("D1"));
        let writes = h.source.watermarks().await;
        assert_eq!(writes.len(), 1);
        assert!(writes[0].devices.is_none());
        assert!(writes[0].spatial.is_some());
    }

    #[tokio::test]
    async fn committed_cycle_advances_both_watermarks() {
        let mut h = harness();
        let fetched_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut spatial = SpatialBatch::empty(fetched_at);
        spatial.zones.push(SpatialEntity {
            tenant_uid: "t".to_string(),
            tenant_group_uid: "g".to_string(),
            entity_uid: "z1".to_string(),
            active: 1,
            last_modified: fetched_at,
            geometry: Some("POINT(1 2)".to_string()),
        });
        h.source.set_spatial(spatial).await;
        h.source.set_devices(vec![installed("D1")]).await;

        let report = h.engine.run_cycle().await.unwrap();

        assert!(report.spatial_committed);
        assert!(h.geo.row(GeoCategory::Zone, "z1").await.is_some());
        let writes = h.source.watermarks().await;
        assert_eq!(writes[0].devices, Some(fetched_at));
        assert_eq!(writes[0].spatial, Some(fetched_at));
    }

    #[tokio::test]
    async fn breaker_trips_on_eleventh_failure_not_tenth() {
        let mut h = harness();
        h.source.fail_watermark(true).await;

        for _ in 0..10 {
            h.engine.run_cycle().await.unwrap();
        }
        assert_eq!(h.engine.watermark_failures(), 10);

        let err = h.engine.run_cycle().await.unwrap_err();
        assert!(matches!(
            err,
            Error::WatermarkBreakerOpen {
                failures: 11,
                threshold: 10
            }
        ));
    }

    #[tokio::test]
    async fn partition_table_is_reloaded_every_cycle() {
        let mut h = harness();
        h.source.set_devices(vec![installed("D1")]).await;
        h.engine.run_cycle().await.unwrap();
        assert_eq!(h.kv.hash("groups").await["0"], "1");

        h.kv.hset("groups", "0", "1000").await;
        h.source.set_devices(vec![installed("D1"), installed("D4")]).await;
        h.engine.run_cycle().await.unwrap();

        let stored: DeviceRecord =
            serde_json::from_str(&h.kv.hash("devices").await["D4"]).unwrap();
        assert_eq!(stored.group_id, 1);
        let groups = h.kv.hash("groups").await;
        assert_eq!(groups["0"], "1000");
        assert_eq!(groups["1"], "1");
    }

    #[tokio::test]
    async fn run_loop_stops_when_cancelled() {
        let mut h = harness();
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        h.engine.run_loop(shutdown).await.unwrap();
        assert!(h.source.device_fetches().await >= 1);
    }

    #[tokio::test]
    async fn run_loop_returns_breaker_error() {
        let mut h = harness();
        h.source.fail_watermark(true).await;

        let err = h.engine.run_loop(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(h.source.device_fetches().await, 11);
    }
}
