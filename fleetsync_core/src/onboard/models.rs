use crate::models::{DeviceDocument, GeofenceRecord, SpatialEntity};
use serde::{Deserialize, Serialize};

/// One item of an ordered document-store bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentWrite {
    /// Update-or-insert by `_id`. Inserted documents also receive the placeholder fields.
    Upsert(DeviceDocument),
    Delete { id: String },
}

impl DocumentWrite {
    pub fn id(&self) -> &str {
        match self {
            Self::Upsert(doc) => &doc.id,
            Self::Delete { id } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoCategory {
    Geofence,
    Area,
    Zone,
    NoGoArea,
}

impl GeoCategory {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Geofence => "tblmstgeofence",
            Self::Area => "tblmstarea",
            Self::Zone => "tblmstzone",
            Self::NoGoArea => "tblmstvehiclenogoarea",
        }
    }

    pub fn uid_column(&self) -> &'static str {
        match self {
            Self::Geofence => "geofenceuid",
            Self::Area => "areauid",
            Self::Zone => "zoneuid",
            Self::NoGoArea => "nogoareageofenceuid",
        }
    }
}

/// Whether a statement writes the geometry or clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoOp {
    Upsert,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoTarget {
    Geofence(GeofenceRecord),
    Area(SpatialEntity),
    Zone(SpatialEntity),
    NoGoArea(SpatialEntity),
}

impl GeoTarget {
    pub fn category(&self) -> GeoCategory {
        match self {
            Self::Geofence(_) => GeoCategory::Geofence,
            Self::Area(_) => GeoCategory::Area,
            Self::Zone(_) => GeoCategory::Zone,
            Self::NoGoArea(_) => GeoCategory::NoGoArea,
        }
    }

    pub fn entity(&self) -> &SpatialEntity {
        match self {
            Self::Geofence(g) => &g.entity,
            Self::Area(e) | Self::Zone(e) | Self::NoGoArea(e) => e,
        }
    }
}

/// One queued statement of the geospatial batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoStatement {
    pub op: GeoOp,
    pub target: GeoTarget,
}

impl GeoStatement {
    /// Upsert when the entity carries a non-blank geometry, clear otherwise.
    pub fn for_target(target: GeoTarget) -> Self {
        let op = if target.entity().has_geometry() {
            GeoOp::Upsert
        } else {
            GeoOp::Clear
        };
        Self { op, target }
    }
}
