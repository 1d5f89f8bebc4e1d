//! fleetsync core library: source polling, partition allocation, reconciliation and
//! multi-sink commit for the fleet data sync agent.

pub mod commit;
pub mod error;
pub mod models;
pub mod o11y;
pub mod onboard;
pub mod partition;
pub mod reconcile;
pub mod sources;
pub mod sync;

pub use commit::{CommitEngine, CommitPlan, DeviceCommitOutcome};
pub use error::{Error, Result};
pub use models::{
    CommandKind, DeviceCommand, DeviceDocument, DeviceRecord, DiversionRecord, GeofenceRecord,
    SpatialBatch, SpatialEntity, Watermark, WatermarkMap,
};
pub use onboard::config::{AgentConfig, KeyConfig, SyncConfig};
pub use onboard::traits::{DocumentStore, GeoStore, KvStore};
pub use partition::PartitionTable;
pub use sources::{SourceDb, SourceTask};
pub use sync::{CycleReport, SyncEngine};
