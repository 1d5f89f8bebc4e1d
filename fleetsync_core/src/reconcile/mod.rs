//! Merges freshly fetched device records with the previously synced snapshot and
//! applies the partition allocation rules.

use crate::models::{DeviceRecord, DiversionRecord, UNASSIGNED_GROUP};
use crate::onboard::traits::KvStore;
use crate::partition::PartitionTable;
use crate::Result;
use std::collections::HashMap;

/// A fetched device after merging with the prior snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledDevice {
    pub record: DeviceRecord,
    /// Stored record from the previous cycle, if any.
    pub prior: Option<DeviceRecord>,
}

impl ReconciledDevice {
    /// True when the routing tier already knows the device (it held a group before this cycle).
    pub fn was_known(&self) -> bool {
        self.prior.as_ref().map(|p| p.has_group()).unwrap_or(false)
    }
}

/// Bulk-read prior records for `ids` from the canonical device hash.
///
/// Missing ids and undecodable values are left out of the returned map.
#[tracing::instrument(level = "debug", skip(kv, ids), fields(ids = ids.len()))]
pub async fn load_prior(
    kv: &dyn KvStore,
    hash_key: &str,
    ids: &[String],
) -> Result<HashMap<String, DeviceRecord>> {
    let mut out = HashMap::new();
    if ids.is_empty() {
        return Ok(out);
    }
    let values = kv.hmget(hash_key, ids).await?;
    for (id, value) in ids.iter().zip(values) {
        let Some(raw) = value else {
            continue;
        };
        match serde_json::from_str::<DeviceRecord>(&raw) {
            Ok(record) => {
                out.insert(id.clone(), record);
            }
            Err(e) => {
                tracing::warn!(device_id = %id, error = %e, "skipping undecodable stored device");
            }
        }
    }
    Ok(out)
}

/// Merge `fresh` against `prior`, ordered by device id.
///
/// When several sources report the same device id, the last record fetched wins.
///
/// Group ids are carried forward from the prior record or reset to unassigned. Every
/// fetched diversion is active; matching ones (by tenant group and tenant) keep their
/// prior group. Prior diversions missing from the fetch are appended inactive so their
/// groups get released.
pub fn reconcile(
    mut fresh: Vec<DeviceRecord>,
    prior: &HashMap<String, DeviceRecord>,
) -> Vec<ReconciledDevice> {
    fresh.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    let mut unique: Vec<DeviceRecord> = Vec::with_capacity(fresh.len());
    for record in fresh {
        match unique.last_mut() {
            Some(last) if last.device_id == record.device_id => {
                tracing::warn!(device_id = %record.device_id, "device reported by more than one source");
                *last = record;
            }
            _ => unique.push(record),
        }
    }
    unique
        .into_iter()
        .map(|mut record| {
            let prior = prior.get(&record.device_id).cloned();
            record.group_id = prior
                .as_ref()
                .map(|p| p.group_id)
                .unwrap_or(UNASSIGNED_GROUP);
            let prior_diversions = prior.as_ref().map(|p| p.diversions.as_slice()).unwrap_or(&[]);
            record.diversions = merge_diversions(record.diversions, prior_diversions);
            ReconciledDevice { record, prior }
        })
        .collect()
}

fn merge_diversions(
    fresh: Vec<DiversionRecord>,
    prior: &[DiversionRecord],
) -> Vec<DiversionRecord> {
    let mut merged: Vec<DiversionRecord> = fresh
        .into_iter()
        .map(|mut d| {
            d.active = 1;
            d.group_id = prior
                .iter()
                .find(|p| p.same_key(&d))
                .map(|p| p.group_id)
                .unwrap_or(UNASSIGNED_GROUP);
            d
        })
        .collect();

    let removed: Vec<DiversionRecord> = prior
        .iter()
        .filter(|p| !merged.iter().any(|d| d.same_key(p)))
        .map(|p| DiversionRecord {
            active: 0,
            ..p.clone()
        })
        .collect();
    merged.extend(removed);
    merged
}

/// Apply allocation rules to every reconciled device, in order.
///
/// Active devices and diversions without a group get one. Inactive diversions, and all
/// diversions of an inactive device, release their group and are dropped from the
/// record. An inactive device releases its group but keeps the id on the record so
/// the commit step can tell it was known.
pub fn assign_groups(devices: &mut [ReconciledDevice], table: &mut PartitionTable, capacity: u32) {
    for device in devices.iter_mut() {
        let record = &mut device.record;
        let device_active = record.is_active();

        let diversions = std::mem::take(&mut record.diversions);
        for mut diversion in diversions {
            if diversion.is_active() && device_active {
                if diversion.group_id < 0 {
                    diversion.group_id = table.allocate(capacity);
                }
                record.diversions.push(diversion);
            } else if diversion.group_id >= 0 {
                table.release(diversion.group_id);
            }
        }

        if device_active {
            if record.group_id < 0 {
                record.group_id = table.allocate(capacity);
            }
        } else if record.has_group() {
            table.release(record.group_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onboard::memory::MemoryKvStore;

    fn device(id: &str, active: i32) -> DeviceRecord {
        DeviceRecord {
            active,
            ..DeviceRecord::new(id)
        }
    }

    fn diversion(group_uid: &str, tenant: &str, group_id: i32, active: i32) -> DiversionRecord {
        DiversionRecord {
            tenant_group_uid: group_uid.to_string(),
            tenant_uid: tenant.to_string(),
            group_id,
            provider_tenant_uids: String::new(),
            active,
        }
    }

    #[test]
    fn copies_prior_group_and_resets_unknown() {
        let mut known = device("A", 1);
        known.group_id = 7;
        let prior = HashMap::from([("A".to_string(), known)]);

        let mut fresh_b = device("B", 1);
        fresh_b.group_id = 42;
        let out = reconcile(vec![fresh_b, device("A", 1)], &prior);

        assert_eq!(out[0].record.device_id, "A");
        assert_eq!(out[0].record.group_id, 7);
        assert!(out[0].was_known());
        assert_eq!(out[1].record.group_id, UNASSIGNED_GROUP);
        assert!(!out[1].was_known());
    }

    #[test]
    fn diversions_match_by_tenant_pair() {
        let mut stored = device("A", 1);
        stored.group_id = 1;
        stored.diversions = vec![diversion("g1", "t1", 4, 1), diversion("g2", "t2", 5, 1)];
        let prior = HashMap::from([("A".to_string(), stored)]);

        let mut fresh = device("A", 1);
        fresh.diversions = vec![diversion("g1", "t1", -1, 0), diversion("g3", "t3", 9, 0)];
        let out = reconcile(vec![fresh], &prior);
        let d = &out[0].record.diversions;

        assert_eq!(d.len(), 3);
        assert_eq!(d[0], diversion("g1", "t1", 4, 1));
        assert_eq!(d[1], diversion("g3", "t3", -1, 1));
        assert_eq!(d[2], diversion("g2", "t2", 5, 0));
    }

    #[test]
    fn removed_diversion_releases_its_group() {
        let mut stored = device("A", 1);
        stored.group_id = 0;
        stored.diversions = vec![diversion("g1", "t1", 1, 1)];
        let prior = HashMap::from([("A".to_string(), stored)]);

        let mut table = PartitionTable::from_stored(HashMap::from([
            ("0".to_string(), "1".to_string()),
            ("1".to_string(), "1".to_string()),
        ]));
        let mut out = reconcile(vec![device("A", 1)], &prior);
        assign_groups(&mut out, &mut table, 10);

        assert!(out[0].record.diversions.is_empty());
        assert_eq!(table.count(1), Some(0));
        assert_eq!(table.count(0), Some(1));
    }

    #[test]
    fn inactive_device_releases_device_and_diversion_groups() {
        let mut stored = device("A", 1);
        stored.group_id = 0;
        stored.diversions = vec![diversion("g1", "t1", 1, 1)];
        let prior = HashMap::from([("A".to_string(), stored)]);

        let mut fresh = device("A", 0);
        fresh.diversions = vec![diversion("g1", "t1", -1, 1)];
        let mut table = PartitionTable::from_stored(HashMap::from([
            ("0".to_string(), "3".to_string()),
            ("1".to_string(), "3".to_string()),
        ]));
        let mut out = reconcile(vec![fresh], &prior);
        assign_groups(&mut out, &mut table, 10);

        assert_eq!(out[0].record.group_id, 0);
        assert!(out[0].record.diversions.is_empty());
        assert_eq!(table.count(0), Some(2));
        assert_eq!(table.count(1), Some(2));
    }

    #[test]
    fn new_devices_allocate_in_device_id_order() {
        let mut table = PartitionTable::new();
        let mut out = reconcile(
            vec![device("C", 1), device("A", 1), device("B", 1)],
            &HashMap::new(),
        );
        assign_groups(&mut out, &mut table, 2);

        let groups: Vec<(String, i32)> = out
            .iter()
            .map(|d| (d.record.device_id.clone(), d.record.group_id))
            .collect();
        assert_eq!(
            groups,
            vec![
                ("A".to_string(), 0),
                ("B".to_string(), 0),
                ("C".to_string(), 1)
            ]
        );
    }

    #[test]
    fn new_diversion_allocates_before_its_device() {
        let mut fresh = device("A", 1);
        fresh.diversions = vec![diversion("g1", "t1", -1, 1)];
        let mut table = PartitionTable::new();
        let mut out = reconcile(vec![fresh], &HashMap::new());
        assign_groups(&mut out, &mut table, 1);

        assert_eq!(out[0].record.diversions[0].group_id, 0);
        assert_eq!(out[0].record.group_id, 1);
        assert_eq!(table.count(0), Some(1));
        assert_eq!(table.count(1), Some(1));
    }

    #[test]
    fn matched_diversion_keeps_group_without_allocating() {
        let mut stored = device("A", 1);
        stored.group_id = 0;
        stored.diversions = vec![diversion("g1", "t1", 1, 1)];
        let prior = HashMap::from([("A".to_string(), stored)]);

        let mut fresh = device("A", 1);
        fresh.diversions = vec![diversion("g1", "t1", -1, 1)];
        let mut table = PartitionTable::from_stored(HashMap::from([
            ("0".to_string(), "1".to_string()),
            ("1".to_string(), "1".to_string()),
        ]));
        let mut out = reconcile(vec![fresh], &prior);
        assign_groups(&mut out, &mut table, 1);

        assert_eq!(out[0].record.diversions[0].group_id, 1);
        assert_eq!(out[0].record.group_id, 0);
        assert!(!table.has_changes());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn duplicate_device_keeps_last_fetched_record() {
        let mut first = device("A", 1);
        first.vehicle_id = "V-old".to_string();
        let mut second = device("A", 1);
        second.vehicle_id = "V-new".to_string();

        let mut table = PartitionTable::new();
        let mut out = reconcile(vec![first, device("B", 1), second], &HashMap::new());
        assign_groups(&mut out, &mut table, 10);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].record.vehicle_id, "V-new");
        assert_eq!(table.count(0), Some(2));
    }

    #[test]
    fn sticky_groups_touch_nothing() {
        let mut stored = device("A", 1);
        stored.group_id = 3;
        let prior = HashMap::from([("A".to_string(), stored)]);
        let mut table = PartitionTable::from_stored(HashMap::from([(
            "3".to_string(),
            "1".to_string(),
        )]));
        let mut out = reconcile(vec![device("A", 1)], &prior);
        assign_groups(&mut out, &mut table, 1);

        assert_eq!(out[0].record.group_id, 3);
        assert!(!table.has_changes());
    }

    #[tokio::test]
    async fn load_prior_skips_missing_and_corrupt_entries() {
        let kv = MemoryKvStore::new();
        let mut a = device("A", 1);
        a.group_id = 2;
        kv.hset("devices", "A", &serde_json::to_string(&a).unwrap())
            .await;
        kv.hset("devices", "B", "{not json").await;
        kv.hset(
            "devices",
            "C",
            r#"{"deviceid":"C","communicationgroupid":5,"active":1,"diversiondetails":null}"#,
        )
        .await;

        let ids = vec!["A".to_string(), "B".to_string(), "C".to_string(), "D".to_string()];
        let prior = load_prior(&kv, "devices", &ids).await.unwrap();

        assert_eq!(prior.len(), 2);
        assert_eq!(prior["A"], a);
        assert_eq!(prior["C"].group_id, 5);
        assert!(prior["C"].diversions.is_empty());
    }
}
