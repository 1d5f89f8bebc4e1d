use crate::models::{DeviceFetch, DeviceRecord, SpatialBatch, Watermark, WatermarkMap};
use crate::sources::traits::SourceTask;
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// What one source produced this cycle. A failed sub-fetch is `None`.
#[derive(Debug)]
struct SourceReport {
    source_id: String,
    devices: Option<DeviceFetch>,
    spatial: Option<SpatialBatch>,
}

/// Consolidated fetch result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleBatch {
    pub devices: Vec<DeviceRecord>,
    pub spatial: SpatialBatch,
    /// Only sources with at least one successful sub-fetch appear here.
    pub watermarks: WatermarkMap,
}

impl CycleBatch {
    fn new() -> Self {
        Self {
            devices: Vec::new(),
            spatial: SpatialBatch::empty(Utc::now()),
            watermarks: WatermarkMap::new(),
        }
    }

    fn absorb(&mut self, report: SourceReport) {
        let mut mark = Watermark::default();
        if let Some(fetch) = report.devices {
            mark.devices = Some(fetch.fetched_at);
            self.devices.extend(fetch.devices);
        }
        if let Some(spatial) = report.spatial {
            mark.spatial = Some(spatial.fetched_at);
            self.spatial.extend(spatial);
        }
        if mark.is_empty() {
            tracing::warn!(source_id = %report.source_id, "source contributed nothing this cycle");
        } else {
            self.watermarks.insert(report.source_id, mark);
        }
    }
}

/// Fetch from every source concurrently and aggregate the results.
///
/// Each source runs its device and spatial sub-fetches together and reports once both
/// finish. Reports go through a channel drained by a single aggregator, which returns
/// when the last sender is dropped.
#[tracing::instrument(level = "info", skip_all, fields(sources = tasks.len()))]
pub async fn fetch_all(tasks: &[SourceTask], main_page_ids: &str) -> Result<CycleBatch> {
    let (tx, mut rx) = mpsc::channel::<SourceReport>(tasks.len().max(1));

    let aggregator = tokio::spawn(async move {
        let mut batch = CycleBatch::new();
        while let Some(report) = rx.recv().await {
            batch.absorb(report);
        }
        batch
    });

    let main_page_ids: Arc<str> = Arc::from(main_page_ids);
    let mut workers = JoinSet::new();
    for task in tasks.iter().cloned() {
        let tx = tx.clone();
        let main_page_ids = main_page_ids.clone();
        workers.spawn(async move {
            let report = run_source(task, &main_page_ids).await;
            if tx.send(report).await.is_err() {
                tracing::error!("aggregator closed before source report was sent");
            }
        });
    }
    drop(tx);

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "source worker aborted");
        }
    }

    let mut batch = aggregator
        .await
        .map_err(|e| Error::backend("fetch aggregator join", e))?;
    batch
        .devices
        .sort_by(|a, b| a.device_id.cmp(&b.device_id));
    tracing::info!(
        devices = batch.devices.len(),
        spatial = batch.spatial.len(),
        reporting = batch.watermarks.len(),
        "fetch complete"
    );
    Ok(batch)
}

#[tracing::instrument(level = "debug", skip_all, fields(source_id = %task.source_id))]
async fn run_source(task: SourceTask, main_page_ids: &str) -> SourceReport {
    let spatial = async {
        if task.spatial_authority {
            task.db.fetch_spatial().await
        } else {
            Ok(SpatialBatch::empty(Utc::now()))
        }
    };
    let (devices, spatial) = tokio::join!(task.db.fetch_devices(main_page_ids), spatial);

    let devices = devices
        .map_err(|e| tracing::error!(source_id = %task.source_id, error = %e, "device fetch failed"))
        .ok();
    let spatial = spatial
        .map_err(|e| tracing::error!(source_id = %task.source_id, error = %e, "spatial fetch failed"))
        .ok();

    SourceReport {
        source_id: task.source_id,
        devices,
        spatial,
    }
}
