use crate::models::{DeviceFetch, DeviceRecord, SpatialBatch};
use crate::sources::traits::SourceDb;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A recorded watermark write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkWrite {
    pub devices: Option<DateTime<Utc>>,
    pub spatial: Option<DateTime<Utc>>,
}

struct SourceState {
    devices: Vec<DeviceRecord>,
    spatial: SpatialBatch,
    fetched_at: DateTime<Utc>,
    fail_devices: bool,
    fail_spatial: bool,
    fail_watermark: bool,
    device_fetches: usize,
    spatial_fetches: usize,
    last_main_page_ids: Option<String>,
    watermarks: Vec<WatermarkWrite>,
}

/// In-memory SourceDb serving canned records, with failure injection per operation.
#[derive(Clone)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState {
                devices: Vec::new(),
                spatial: SpatialBatch::empty(fetched_at),
                fetched_at,
                fail_devices: false,
                fail_spatial: false,
                fail_watermark: false,
                device_fetches: 0,
                spatial_fetches: 0,
                last_main_page_ids: None,
                watermarks: Vec::new(),
            })),
        }
    }

    pub async fn set_devices(&self, devices: Vec<DeviceRecord>) {
        self.state.lock().await.devices = devices;
    }

    pub async fn set_spatial(&self, spatial: SpatialBatch) {
        self.state.lock().await.spatial = spatial;
    }

    pub async fn fail_devices(&self, fail: bool) {
        self.state.lock().await.fail_devices = fail;
    }

    pub async fn fail_spatial(&self, fail: bool) {
        self.state.lock().await.fail_spatial = fail;
    }

    pub async fn fail_watermark(&self, fail: bool) {
        self.state.lock().await.fail_watermark = fail;
    }

    pub async fn watermarks(&self) -> Vec<WatermarkWrite> {
        self.state.lock().await.watermarks.clone()
    }

    pub async fn spatial_fetches(&self) -> usize {
        self.state.lock().await.spatial_fetches
    }

    pub async fn device_fetches(&self) -> usize {
        self.state.lock().await.device_fetches
    }

    pub async fn last_main_page_ids(&self) -> Option<String> {
        self.state.lock().await.last_main_page_ids.clone()
    }
}

#[async_trait]
impl SourceDb for MemorySource {
    async fn fetch_devices(&self, main_page_ids: &str) -> Result<DeviceFetch> {
        let mut state = self.state.lock().await;
        state.device_fetches += 1;
        state.last_main_page_ids = Some(main_page_ids.to_string());
        if state.fail_devices {
            return Err(Error::BackendMessage("device fetch unavailable".to_string()));
        }
        Ok(DeviceFetch {
            devices: state.devices.clone(),
            fetched_at: state.fetched_at,
        })
    }

    async fn fetch_spatial(&self) -> Result<SpatialBatch> {
        let mut state = self.state.lock().await;
        state.spatial_fetches += 1;
        if state.fail_spatial {
            return Err(Error::BackendMessage("spatial fetch unavailable".to_string()));
        }
        Ok(state.spatial.clone())
    }

    async fn update_watermark(
        &self,
        devices: Option<DateTime<Utc>>,
        spatial: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.fail_watermark {
            return Err(Error::BackendMessage("watermark write rejected".to_string()));
        }
        state.watermarks.push(WatermarkWrite { devices, spatial });
        Ok(true)
    }
}
