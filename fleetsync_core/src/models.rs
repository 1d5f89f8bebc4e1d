use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Group id carried by records that hold no communication group.
pub const UNASSIGNED_GROUP: i32 = -1;

/// `devicemasterstatusuno` value of a device installed on a vehicle.
pub const INSTALLED_STATUS: i32 = 5;

fn unassigned() -> i32 {
    UNASSIGNED_GROUP
}

/// Stored records written by older agents carry `null` for empty lists.
fn nullable_vec<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Tenant-specific override of a device's partition/active state.
///
/// Unique by (`tenant_group_uid`, `tenant_uid`) within its parent device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiversionRecord {
    #[serde(rename = "tenantgroupuid", default)]
    pub tenant_group_uid: String,
    #[serde(rename = "tenantuid", default)]
    pub tenant_uid: String,
    #[serde(rename = "communicationgroupid", default = "unassigned")]
    pub group_id: i32,
    #[serde(rename = "providertenantuids", default)]
    pub provider_tenant_uids: String,
    #[serde(default)]
    pub active: i32,
}

impl DiversionRecord {
    pub fn is_active(&self) -> bool {
        self.active == 1
    }

    pub fn same_key(&self, other: &DiversionRecord) -> bool {
        self.tenant_group_uid == other.tenant_group_uid && self.tenant_uid == other.tenant_uid
    }
}

/// One registered IoT device, as fetched from a source and as stored in the device hashes.
///
/// Field names on the wire are the storage contract shared with the routing tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "deviceid")]
    pub device_id: String,
    #[serde(rename = "vehicleid", default)]
    pub vehicle_id: String,
    #[serde(rename = "communicationgroupid", default = "unassigned")]
    pub group_id: i32,
    #[serde(rename = "batchprocessgroupid", default)]
    pub batch_process_group_id: i32,
    #[serde(rename = "tenantgroupuid", default)]
    pub tenant_group_uid: String,
    #[serde(rename = "tenantuid", default)]
    pub tenant_uid: String,
    #[serde(rename = "providertenantuids", default)]
    pub provider_tenant_uids: String,
    #[serde(rename = "parserid", default)]
    pub parser_id: i32,
    #[serde(rename = "devicemasterstatusuno", default)]
    pub install_status: i32,
    #[serde(rename = "devicetypeid", default)]
    pub device_type_id: i32,
    #[serde(rename = "tenantname", default)]
    pub tenant_name: String,
    #[serde(default)]
    pub active: i32,
    #[serde(rename = "diversiondetails", default, deserialize_with = "nullable_vec")]
    pub diversions: Vec<DiversionRecord>,
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            vehicle_id: String::new(),
            group_id: UNASSIGNED_GROUP,
            batch_process_group_id: 0,
            tenant_group_uid: String::new(),
            tenant_uid: String::new(),
            provider_tenant_uids: String::new(),
            parser_id: 0,
            install_status: 0,
            device_type_id: 0,
            tenant_name: String::new(),
            active: 0,
            diversions: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active == 1
    }

    pub fn is_installed(&self) -> bool {
        self.install_status == INSTALLED_STATUS
    }

    pub fn has_group(&self) -> bool {
        self.group_id >= 0
    }
}

/// Reduced projection of an installed device kept in the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "providertenantuids")]
    pub provider_tenant_uids: String,
    #[serde(rename = "tenantuid")]
    pub tenant_uid: String,
    #[serde(rename = "tenantgroupuid")]
    pub tenant_group_uid: String,
    #[serde(rename = "devicetypeid")]
    pub device_type_id: i32,
    #[serde(rename = "communicationgroupid")]
    pub group_id: i32,
    #[serde(rename = "tenantname")]
    pub tenant_name: String,
    #[serde(rename = "vehicleid")]
    pub vehicle_id: String,
    #[serde(rename = "diversiondetails")]
    pub diversions: Vec<DiversionRecord>,
}

impl From<&DeviceRecord> for DeviceDocument {
    fn from(d: &DeviceRecord) -> Self {
        Self {
            id: d.device_id.clone(),
            provider_tenant_uids: d.provider_tenant_uids.clone(),
            tenant_uid: d.tenant_uid.clone(),
            tenant_group_uid: d.tenant_group_uid.clone(),
            device_type_id: d.device_type_id,
            group_id: d.group_id,
            tenant_name: d.tenant_name.clone(),
            vehicle_id: d.vehicle_id.clone(),
            diversions: d.diversions.clone(),
        }
    }
}

/// Listener command type understood by the routing tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum CommandKind {
    DeviceCommand,
    Disconnect,
    DataUpdate,
}

impl From<CommandKind> for i32 {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::DeviceCommand => 1,
            CommandKind::Disconnect => 2,
            CommandKind::DataUpdate => 3,
        }
    }
}

impl TryFrom<i32> for CommandKind {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::DeviceCommand),
            2 => Ok(Self::Disconnect),
            3 => Ok(Self::DataUpdate),
            other => Err(format!("unknown listener command type {other}")),
        }
    }
}

/// Change notification published to the routing tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    #[serde(rename = "deviceid")]
    pub device_id: String,
    #[serde(rename = "listenerdevicecommandtype")]
    pub command: CommandKind,
}

/// Columns shared by every geometry category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialEntity {
    pub tenant_uid: String,
    pub tenant_group_uid: String,
    pub entity_uid: String,
    pub active: i32,
    pub last_modified: DateTime<Utc>,
    /// Geometry as WKT. Empty or absent clears the stored geometry.
    pub geometry: Option<String>,
}

impl SpatialEntity {
    pub fn has_geometry(&self) -> bool {
        self.geometry
            .as_deref()
            .map(|g| !g.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeofenceRecord {
    pub entity: SpatialEntity,
    pub name_en: String,
    pub name_ol: String,
    pub type_id: i32,
    pub is_approved: i32,
}

/// Geometry change records produced by one spatial fetch (or many, once aggregated).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialBatch {
    pub geofences: Vec<GeofenceRecord>,
    pub areas: Vec<SpatialEntity>,
    pub zones: Vec<SpatialEntity>,
    pub no_go_areas: Vec<SpatialEntity>,
    pub fetched_at: DateTime<Utc>,
}

impl SpatialBatch {
    pub fn empty(fetched_at: DateTime<Utc>) -> Self {
        Self {
            geofences: Vec::new(),
            areas: Vec::new(),
            zones: Vec::new(),
            no_go_areas: Vec::new(),
            fetched_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.geofences.is_empty()
            && self.areas.is_empty()
            && self.zones.is_empty()
            && self.no_go_areas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.geofences.len() + self.areas.len() + self.zones.len() + self.no_go_areas.len()
    }

    pub fn extend(&mut self, other: SpatialBatch) {
        self.geofences.extend(other.geofences);
        self.areas.extend(other.areas);
        self.zones.extend(other.zones);
        self.no_go_areas.extend(other.no_go_areas);
    }
}

/// Output of one device fetch against a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFetch {
    pub devices: Vec<DeviceRecord>,
    pub fetched_at: DateTime<Utc>,
}

/// Per-source fetch timestamps to write back once the cycle commits.
///
/// A half is `None` when its sub-fetch failed; that half is never advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Watermark {
    pub devices: Option<DateTime<Utc>>,
    pub spatial: Option<DateTime<Utc>>,
}

impl Watermark {
    pub fn is_empty(&self) -> bool {
        self.devices.is_none() && self.spatial.is_none()
    }
}

pub type WatermarkMap = HashMap<String, Watermark>;
