use crate::models::{CommandKind, DeviceCommand, DeviceDocument};
use crate::onboard::traits::DocumentWrite;
use crate::reconcile::ReconciledDevice;

/// Per-sink deltas derived from one cycle's reconciled devices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitPlan {
    /// Every active device, keyed by device id, as stored JSON.
    pub primary_upserts: Vec<(String, String)>,
    /// Active devices not yet installed on a vehicle.
    pub test_upserts: Vec<(String, String)>,
    /// Installed devices to upsert, followed by deactivated devices to delete.
    pub documents: Vec<DocumentWrite>,
    /// Deactivated devices, removed from both hashes.
    pub removed: Vec<String>,
    /// Installed devices whose test-pool entry is cleaned up.
    pub promoted: Vec<String>,
    pub notifications: Vec<DeviceCommand>,
}

impl CommitPlan {
    /// Build the plan from devices that already went through group assignment.
    pub fn build(devices: &[ReconciledDevice]) -> Self {
        let mut plan = Self::default();
        let mut deletes = Vec::new();

        for device in devices {
            let record = &device.record;

            if device.was_known() {
                if !record.is_active() {
                    plan.notify(&record.device_id, CommandKind::Disconnect);
                } else if device.prior.as_ref() != Some(record) {
                    plan.notify(&record.device_id, CommandKind::DataUpdate);
                }
            }

            if record.is_active() {
                let json = match serde_json::to_string(record) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(device_id = %record.device_id, error = %e, "device serialization failed");
                        continue;
                    }
                };
                plan.primary_upserts
                    .push((record.device_id.clone(), json.clone()));
                if record.is_installed() {
                    plan.documents
                        .push(DocumentWrite::Upsert(DeviceDocument::from(record)));
                    plan.promoted.push(record.device_id.clone());
                } else {
                    plan.test_upserts.push((record.device_id.clone(), json));
                }
            } else if record.has_group() {
                plan.removed.push(record.device_id.clone());
                deletes.push(DocumentWrite::Delete {
                    id: record.device_id.clone(),
                });
            }
        }

        plan.documents.extend(deletes);
        plan
    }

    fn notify(&mut self, device_id: &str, command: CommandKind) {
        self.notifications.push(DeviceCommand {
            device_id: device_id.to_string(),
            command,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.primary_upserts.is_empty()
            && self.test_upserts.is_empty()
            && self.documents.is_empty()
            && self.removed.is_empty()
            && self.notifications.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceRecord, INSTALLED_STATUS};

    fn reconciled(record: DeviceRecord, prior: Option<DeviceRecord>) -> ReconciledDevice {
        ReconciledDevice { record, prior }
    }

    fn active(id: &str, group_id: i32, installed: bool) -> DeviceRecord {
        DeviceRecord {
            active: 1,
            group_id,
            install_status: if installed { INSTALLED_STATUS } else { 1 },
            ..DeviceRecord::new(id)
        }
    }

    #[test]
    fn installed_device_goes_to_primary_and_documents() {
        let plan = CommitPlan::build(&[reconciled(active("D1", 0, true), None)]);

        assert_eq!(plan.primary_upserts.len(), 1);
        assert_eq!(plan.primary_upserts[0].0, "D1");
        assert!(plan.test_upserts.is_empty());
        assert_eq!(plan.promoted, vec!["D1".to_string()]);
        assert!(matches!(&plan.documents[0], DocumentWrite::Upsert(d) if d.id == "D1"));
        assert!(plan.notifications.is_empty());
    }

    #[test]
    fn uninstalled_device_goes_to_primary_and_test_pool() {
        let plan = CommitPlan::build(&[reconciled(active("T1", 2, false), None)]);

        assert_eq!(plan.primary_upserts.len(), 1);
        assert_eq!(plan.test_upserts.len(), 1);
        assert!(plan.documents.is_empty());
        assert!(plan.promoted.is_empty());
    }

    #[test]
    fn deactivated_known_device_is_removed_and_disconnected() {
        let prior = active("D2", 3, true);
        let mut record = prior.clone();
        record.active = 0;
        let plan = CommitPlan::build(&[reconciled(record, Some(prior))]);

        assert!(plan.primary_upserts.is_empty());
        assert_eq!(plan.removed, vec!["D2".to_string()]);
        assert_eq!(
            plan.documents,
            vec![DocumentWrite::Delete {
                id: "D2".to_string()
            }]
        );
        assert_eq!(
            plan.notifications,
            vec![DeviceCommand {
                device_id: "D2".to_string(),
                command: CommandKind::Disconnect
            }]
        );
    }

    #[test]
    fn inactive_unknown_device_produces_nothing() {
        let mut record = DeviceRecord::new("X");
        record.active = 0;
        let plan = CommitPlan::build(&[reconciled(record, None)]);
        assert!(plan.is_empty());
    }

    #[test]
    fn changed_known_device_gets_update_and_unchanged_does_not() {
        let prior = active("A", 1, true);
        let mut changed = prior.clone();
        changed.vehicle_id = "V-9".to_string();
        let plan = CommitPlan::build(&[
            reconciled(changed, Some(prior.clone())),
            reconciled(active("B", 1, true), Some(active("B", 1, true))),
        ]);

        assert_eq!(
            plan.notifications,
            vec![DeviceCommand {
                device_id: "A".to_string(),
                command: CommandKind::DataUpdate
            }]
        );
        assert_eq!(plan.primary_upserts.len(), 2);
    }

    #[test]
    fn document_deletes_follow_upserts() {
        let prior = active("A", 0, true);
        let mut gone = prior.clone();
        gone.active = 0;
        let plan = CommitPlan::build(&[
            reconciled(gone, Some(prior)),
            reconciled(active("B", 0, true), None),
        ]);

        assert_eq!(plan.documents.len(), 2);
        assert_eq!(plan.documents[0].id(), "B");
        assert!(matches!(plan.documents[1], DocumentWrite::Delete { .. }));
    }

    #[test]
    fn stored_json_uses_storage_field_names() {
        let plan = CommitPlan::build(&[reconciled(active("D1", 4, false), None)]);
        let value: serde_json::Value = serde_json::from_str(&plan.primary_upserts[0].1).unwrap();
        assert_eq!(value["deviceid"], "D1");
        assert_eq!(value["communicationgroupid"], 4);
        assert_eq!(value["devicemasterstatusuno"], 1);
        assert!(value["diversiondetails"].as_array().unwrap().is_empty());
    }
}
