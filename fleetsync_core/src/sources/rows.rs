use crate::models::{DeviceRecord, DiversionRecord, GeofenceRecord, SpatialEntity, UNASSIGNED_GROUP};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tiberius::{ColumnData, FromSql};

/// Named cell access over a result row.
pub trait Cells {
    /// Case-insensitive column lookup.
    fn cell(&self, name: &str) -> Option<&ColumnData<'static>>;
}

impl Cells for tiberius::Row {
    fn cell(&self, name: &str) -> Option<&ColumnData<'static>> {
        self.cells()
            .find(|(col, _)| col.name().eq_ignore_ascii_case(name))
            .map(|(_, data)| data)
    }
}

#[cfg(test)]
impl Cells for Vec<(&'static str, ColumnData<'static>)> {
    fn cell(&self, name: &str) -> Option<&ColumnData<'static>> {
        self.iter()
            .find(|(col, _)| col.eq_ignore_ascii_case(name))
            .map(|(_, data)| data)
    }
}

/// Truncates toward zero; NaN and values outside `i64` are rejected.
fn float_to_int(f: f64) -> Option<i64> {
    let f = f.trunc();
    if f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn int_value(data: &ColumnData<'static>) -> Option<i64> {
    match data {
        ColumnData::U8(v) => v.map(i64::from),
        ColumnData::I16(v) => v.map(i64::from),
        ColumnData::I32(v) => v.map(i64::from),
        ColumnData::I64(v) => *v,
        ColumnData::Bit(v) => v.map(i64::from),
        ColumnData::F32(v) => v.and_then(|f| float_to_int(f64::from(f))),
        ColumnData::F64(v) => v.and_then(float_to_int),
        ColumnData::Numeric(v) => v.as_ref().and_then(|n| i64::try_from(n.int_part()).ok()),
        ColumnData::String(v) => v.as_deref().and_then(|s| s.trim().parse().ok()),
        _ => None,
    }
}

pub fn int(row: &impl Cells, name: &str, default: i32) -> i32 {
    row.cell(name)
        .and_then(int_value)
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(default)
}

pub fn text(row: &impl Cells, name: &str) -> Option<String> {
    match row.cell(name)? {
        ColumnData::String(v) => v.as_deref().map(str::to_string),
        ColumnData::Guid(v) => v.as_ref().map(|g| g.to_string()),
        other => int_value(other).map(|v| v.to_string()),
    }
}

pub fn text_or_empty(row: &impl Cells, name: &str) -> String {
    text(row, name).unwrap_or_default()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub fn timestamp(row: &impl Cells, name: &str) -> Option<DateTime<Utc>> {
    let data = row.cell(name)?;
    if let ColumnData::String(Some(s)) = data {
        return parse_timestamp(s);
    }
    if let Ok(Some(naive)) = NaiveDateTime::from_sql(data) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    DateTime::<Utc>::from_sql(data).ok().flatten()
}

/// Parse the `diversiondetails` JSON column. Blank or malformed input yields no diversions.
pub fn diversions(raw: Option<&str>) -> Vec<DiversionRecord> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str::<Option<Vec<DiversionRecord>>>(raw) {
        Ok(list) => list.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "unparsable diversion details");
            Vec::new()
        }
    }
}

/// Decode one device row. Rows without a device id are skipped.
pub fn device(row: &impl Cells) -> Option<DeviceRecord> {
    let device_id = text(row, "deviceid").filter(|id| !id.trim().is_empty())?;
    Some(DeviceRecord {
        device_id,
        vehicle_id: text_or_empty(row, "vehicleid"),
        group_id: int(row, "communicationgroupid", UNASSIGNED_GROUP),
        batch_process_group_id: int(row, "batchprocessgroupid", 0),
        tenant_group_uid: text_or_empty(row, "tenantgroupuid"),
        tenant_uid: text_or_empty(row, "tenantuid"),
        provider_tenant_uids: text_or_empty(row, "providertenantuids"),
        parser_id: int(row, "parserid", 0),
        install_status: int(row, "devicemasterstatusuno", 0),
        device_type_id: int(row, "devicetypeid", 0),
        tenant_name: text_or_empty(row, "tenantname"),
        active: int(row, "active", 0),
        diversions: diversions(text(row, "diversiondetails").as_deref()),
    })
}

/// Decode the shared spatial columns using `uid_column` as the entity id.
pub fn spatial_entity(row: &impl Cells, uid_column: &str, fetched_at: DateTime<Utc>) -> Option<SpatialEntity> {
    let entity_uid = text(row, uid_column).filter(|id| !id.trim().is_empty())?;
    Some(SpatialEntity {
        tenant_uid: text_or_empty(row, "tenantuid"),
        tenant_group_uid: text_or_empty(row, "tenantgroupuid"),
        entity_uid,
        active: int(row, "active", 0),
        last_modified: timestamp(row, "lastmodifieddate").unwrap_or(fetched_at),
        geometry: text(row, "ogrgeometry"),
    })
}

pub fn geofence(row: &impl Cells, fetched_at: DateTime<Utc>) -> Option<GeofenceRecord> {
    let entity = spatial_entity(row, "geofenceuid", fetched_at)?;
    Some(GeofenceRecord {
        entity,
        name_en: text_or_empty(row, "geofencenameen"),
        name_ol: text_or_empty(row, "geofencenameol"),
        type_id: int(row, "geofencetypeid", 0),
        is_approved: int(row, "isapproved", 0),
    })
}
