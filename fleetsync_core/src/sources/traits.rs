use crate::models::{DeviceFetch, SpatialBatch};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One upstream SQL database holding device registrations and geometry.
#[async_trait]
pub trait SourceDb: Send + Sync {
    /// Device changes since the stored watermark. `main_page_ids` is the comma-joined
    /// application scope filter of every onboarded source.
    async fn fetch_devices(&self, main_page_ids: &str) -> Result<DeviceFetch>;

    /// Geometry changes since the stored watermark.
    async fn fetch_spatial(&self) -> Result<SpatialBatch>;

    /// Persist the fetch timestamps. A `None` half is left untouched.
    /// Returns the status flag reported by the source.
    async fn update_watermark(
        &self,
        devices: Option<DateTime<Utc>>,
        spatial: Option<DateTime<Utc>>,
    ) -> Result<bool>;
}

/// A source the agent polls, fixed for the process lifetime.
#[derive(Clone)]
pub struct SourceTask {
    pub source_id: String,
    pub db: Arc<dyn SourceDb>,
    /// Non-authoritative sources skip the spatial fetch.
    pub spatial_authority: bool,
}

impl std::fmt::Debug for SourceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceTask")
            .field("source_id", &self.source_id)
            .field("spatial_authority", &self.spatial_authority)
            .finish()
    }
}
