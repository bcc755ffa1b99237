//! Change-sets
//!
//! The diff phase produces a [`ChangeSet`]: an ordered list of typed
//! changes, each of which knows the request body it sends. Apply executes
//! the changes in list order.

use serde::Serialize;
use serde_json::{json, Map, Value};

use snapcg_core::{ReserveFullPolicy, RollbackPriority};

/// Settings sent on group creation or update; `None` fields are unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_threshold_pct: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_snapshots: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_priority: Option<RollbackPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_policy: Option<ReserveFullPolicy>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.alert_threshold_pct.is_none()
            && self.maximum_snapshots.is_none()
            && self.rollback_priority.is_none()
            && self.full_policy.is_none()
    }

    /// `consistency-groups` request body
    pub fn body(&self, name: &str) -> Value {
        let mut body = Map::new();
        body.insert("name".to_string(), json!(name));
        if let Some(pct) = self.alert_threshold_pct {
            body.insert("fullWarnThresholdPercent".to_string(), json!(pct));
        }
        if let Some(max) = self.maximum_snapshots {
            body.insert("autoDeleteThreshold".to_string(), json!(max));
        }
        if let Some(policy) = self.full_policy {
            body.insert("repositoryFullPolicy".to_string(), json!(policy.wire()));
        }
        if let Some(priority) = self.rollback_priority {
            body.insert("rollbackPriority".to_string(), json!(priority.as_str()));
        }
        Value::Object(body)
    }
}

/// Base volume joining the group with its first reserve member
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberAddition {
    pub volume: String,
    pub volume_id: String,
    pub pool: String,
    pub percent: u32,
    pub capacity: u64,
    #[serde(skip)]
    pub candidate: Value,
}

/// Snapshot volume of a view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotVolumeRequest {
    pub volume: String,
    pub pit_id: String,
    pub writable: bool,
    pub validate: bool,
    #[serde(skip)]
    pub candidate: Value,
}

impl SnapshotVolumeRequest {
    fn body(&self) -> Value {
        json!({
            "pitId": self.pit_id,
            "candidate": self.candidate,
            "accessMode": if self.writable { "readWrite" } else { "readOnly" },
            "scanMedia": self.validate,
            "validateParity": self.validate,
        })
    }
}

/// One array mutation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Change {
    CreateGroup {
        settings: SettingsUpdate,
    },
    UpdateGroup {
        settings: SettingsUpdate,
    },
    RemoveGroup {
        /// Names whose metadata records go with the group
        pit_names: Vec<String>,
    },
    RemoveMember {
        volume: String,
        volume_id: String,
    },
    TrimReserve {
        volume: String,
        concat_id: String,
        trim_count: usize,
    },
    ExpandReserve {
        volume: String,
        concat_id: String,
        percent: u32,
        bytes: u64,
        #[serde(skip)]
        candidate: Value,
    },
    AddMembers {
        members: Vec<MemberAddition>,
    },
    CreatePit {
        name: Option<String>,
        description: String,
    },
    RemovePits {
        /// Oldest first
        sequence_numbers: Vec<u64>,
        pit_names: Vec<String>,
    },
    CreateView {
        name: String,
        pit_sequence_number: u64,
        volumes: Vec<SnapshotVolumeRequest>,
    },
    RemoveView {
        name: String,
        view_id: String,
    },
    Rollback {
        backup: bool,
        priority: RollbackPriority,
        pit_sequence_number: u64,
        image_ids: Vec<String>,
    },
}

impl Change {
    /// Short human-readable step description
    pub fn describe(&self) -> String {
        match self {
            Change::CreateGroup { .. } => "create group".to_string(),
            Change::UpdateGroup { .. } => "update group settings".to_string(),
            Change::RemoveGroup { .. } => "remove group".to_string(),
            Change::RemoveMember { volume, .. } => format!("remove member {}", volume),
            Change::TrimReserve {
                volume, trim_count, ..
            } => format!("trim {} reserve member(s) of {}", trim_count, volume),
            Change::ExpandReserve { volume, percent, .. } => {
                format!("expand reserve of {} by {}%", volume, percent)
            }
            Change::AddMembers { members } => format!(
                "add members {}",
                members
                    .iter()
                    .map(|m| m.volume.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            Change::CreatePit { name, .. } => match name {
                Some(name) => format!("create snapshot images {}", name),
                None => "create snapshot images".to_string(),
            },
            Change::RemovePits {
                sequence_numbers, ..
            } => format!("remove snapshot images {:?}", sequence_numbers),
            Change::CreateView { name, .. } => format!("create view {}", name),
            Change::RemoveView { name, .. } => format!("remove view {}", name),
            Change::Rollback {
                pit_sequence_number,
                ..
            } => format!("rollback to snapshot images {}", pit_sequence_number),
        }
    }
}

/// Member batch body
pub fn member_batch_body(members: &[MemberAddition]) -> Value {
    let candidates: Map<String, Value> = members
        .iter()
        .map(|m| (m.volume_id.clone(), m.candidate.clone()))
        .collect();
    json!({ "volumeToCandidates": candidates })
}

/// Reserve expansion body
pub fn expand_body(concat_id: &str, candidate: &Value) -> Value {
    json!({
        "repositoryRef": concat_id,
        "expansionCandidate": candidate,
    })
}

/// Reserve trim body
pub fn trim_body(concat_id: &str, trim_count: usize) -> Value {
    json!({
        "concatVol": concat_id,
        "trimCount": trim_count,
        "retainRepositoryMembers": false,
    })
}

/// View batch body
pub fn view_body(name: &str, pit_sequence_number: u64, volumes: &[SnapshotVolumeRequest]) -> Value {
    json!({
        "name": name,
        "pitSequenceNumber": pit_sequence_number.to_string(),
        "requests": volumes.iter().map(SnapshotVolumeRequest::body).collect::<Vec<_>>(),
    })
}

/// Rollback body
pub fn rollback_body(image_ids: &[String]) -> Value {
    json!({ "pitRef": image_ids })
}

/// Ordered changes for one group
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub group: String,
    /// Array id of the group when it already exists
    pub group_id: Option<String>,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new(group: impl Into<String>, group_id: Option<String>) -> Self {
        Self {
            group: group.into(),
            group_id,
            changes: Vec::new(),
        }
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Step descriptions in apply order
    pub fn steps(&self) -> Vec<String> {
        self.changes.iter().map(Change::describe).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_body_only_changed_fields() {
        let update = SettingsUpdate {
            alert_threshold_pct: Some(80),
            full_policy: Some(ReserveFullPolicy::Reject),
            ..Default::default()
        };
        assert_eq!(
            update.body("g1"),
            json!({
                "name": "g1",
                "fullWarnThresholdPercent": 80,
                "repositoryFullPolicy": "failbasewrites",
            })
        );
        assert!(SettingsUpdate::default().is_empty());
    }

    #[test]
    fn test_view_body_access_modes() {
        let volumes = vec![
            SnapshotVolumeRequest {
                volume: "vol1".into(),
                pit_id: "p1".into(),
                writable: true,
                validate: false,
                candidate: json!({"c": 1}),
            },
            SnapshotVolumeRequest {
                volume: "vol2".into(),
                pit_id: "p2".into(),
                writable: false,
                validate: true,
                candidate: json!({"c": 2}),
            },
        ];
        let body = view_body("view1", 4, &volumes);
        assert_eq!(body["pitSequenceNumber"], "4");
        assert_eq!(body["requests"][0]["accessMode"], "readWrite");
        assert_eq!(body["requests"][1]["accessMode"], "readOnly");
        assert_eq!(body["requests"][1]["scanMedia"], true);
        assert_eq!(body["requests"][1]["validateParity"], true);
    }

    #[test]
    fn test_changeset_serializes_tagged_changes() {
        let mut changes = ChangeSet::new("g1", Some("cg1".to_string()));
        changes.push(Change::TrimReserve {
            volume: "vol1".into(),
            concat_id: "c1".into(),
            trim_count: 2,
        });
        let value = serde_json::to_value(&changes).unwrap();
        assert_eq!(value["changes"][0]["action"], "trim_reserve");
        assert_eq!(changes.steps(), vec!["trim 2 reserve member(s) of vol1"]);
    }

    #[test]
    fn test_trim_and_member_bodies() {
        assert_eq!(
            trim_body("c1", 1),
            json!({"concatVol": "c1", "trimCount": 1, "retainRepositoryMembers": false})
        );
        let members = vec![MemberAddition {
            volume: "vol1".into(),
            volume_id: "V1".into(),
            pool: "pool1".into(),
            percent: 20,
            capacity: 1,
            candidate: json!({"k": "v"}),
        }];
        assert_eq!(
            member_batch_body(&members),
            json!({"volumeToCandidates": {"V1": {"k": "v"}}})
        );
    }
}
