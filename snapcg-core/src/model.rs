//! Typed records for the array's management REST API
//!
//! Field names follow the array firmware verbatim (camelCase on the wire).
//! Numeric fields that the firmware reports as decimal strings accept both
//! strings and JSON numbers.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SnapError;

/// Decode a u64 that may be sent as a JSON number or a decimal string
pub fn de_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Num(u64),
        Str(String),
    }

    match Wire::deserialize(deserializer)? {
        Wire::Num(n) => Ok(n),
        Wire::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn de_u64_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Item(#[serde(deserialize_with = "de_u64")] u64);

    let items: Vec<Item> = Vec::deserialize(deserializer)?;
    Ok(items.into_iter().map(|i| i.0).collect())
}

// =============================================================================
// INVENTORY
// =============================================================================

/// Thick or thin volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub name: String,
    #[serde(deserialize_with = "de_u64")]
    pub total_size_in_bytes: u64,
    /// Storage pool / volume group holding the volume
    pub volume_group_ref: String,
}

/// Storage pool or volume group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    pub id: String,
    pub name: String,
    #[serde(deserialize_with = "de_u64")]
    pub free_space: u64,
}

/// Concatenated reserve-capacity (repository) volume
///
/// `member_refs` is ordered head first; the head member can never be trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcatVolume {
    pub id: String,
    #[serde(default)]
    pub member_refs: Vec<String>,
}

impl ConcatVolume {
    /// Head (initial) member of the chain
    pub fn head(&self) -> Option<&str> {
        self.member_refs.first().map(String::as_str)
    }

    /// Members that may be trimmed, ordered tail first
    pub fn trimmable_from_tail(&self) -> impl Iterator<Item = &str> {
        self.member_refs.iter().skip(1).rev().map(String::as_str)
    }
}

// =============================================================================
// CONSISTENCY GROUPS
// =============================================================================

/// Consistency group as reported by `consistency-groups`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyGroupRecord {
    pub id: String,
    #[serde(default)]
    pub cg_ref: Option<String>,
    pub label: String,
    pub full_warn_threshold: u32,
    pub auto_delete_limit: u32,
    pub rollback_priority: RollbackPriority,
    pub rep_full_policy: String,
    #[serde(default, deserialize_with = "de_u64_vec")]
    pub unique_sequence_number: Vec<u64>,
}

impl ConsistencyGroupRecord {
    /// Reference used in group-scoped endpoint paths
    pub fn reference(&self) -> &str {
        self.cg_ref.as_deref().unwrap_or(&self.id)
    }

    /// Full-reserve policy decoded from the wire value
    pub fn full_policy(&self) -> Option<ReserveFullPolicy> {
        ReserveFullPolicy::from_wire(&self.rep_full_policy)
    }
}

/// Base volume membership as reported by `consistency-groups/{id}/member-volumes`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberVolumeRecord {
    pub volume_id: String,
    #[serde(deserialize_with = "de_u64")]
    pub total_repository_capacity: u64,
    /// Concat volume id of the reserve chain
    pub repository_volume: String,
}

/// Snapshot (PIT) image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotImage {
    pub id: String,
    /// Unix seconds
    #[serde(deserialize_with = "de_u64")]
    pub pit_timestamp: u64,
    #[serde(deserialize_with = "de_u64")]
    pub pit_sequence_number: u64,
    pub base_vol: String,
}

/// Consistency group view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewRecord {
    pub id: String,
    pub name: String,
}

/// Entry of the array's generic key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Reserve-capacity candidate proposed by `repositories/concat/single`
///
/// `candidate` is opaque and is handed back to the array unchanged apart
/// from member-volume label renumbering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveCandidate {
    pub volume_group_id: String,
    #[serde(deserialize_with = "de_u64")]
    pub capacity: u64,
    #[serde(default)]
    pub base_mappable_object_id: Option<String>,
    pub candidate: serde_json::Value,
}

impl ReserveCandidate {
    /// Auto-generated label of the member volume the candidate would create
    pub fn member_label(&self) -> Option<&str> {
        self.candidate
            .get("newVolCandidate")
            .and_then(|c| c.get("memberVolumeLabel"))
            .and_then(|l| l.as_str())
    }

    /// Replace the auto-generated member-volume label
    pub fn set_member_label(&mut self, label: &str) {
        if let Some(slot) = self
            .candidate
            .get_mut("newVolCandidate")
            .and_then(|c| c.get_mut("memberVolumeLabel"))
        {
            *slot = serde_json::Value::String(label.to_string());
        }
    }
}

// =============================================================================
// GROUP SETTINGS
// =============================================================================

/// Storage system priority given to a rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPriority {
    Highest,
    High,
    Medium,
    Low,
    Lowest,
}

impl RollbackPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackPriority::Highest => "highest",
            RollbackPriority::High => "high",
            RollbackPriority::Medium => "medium",
            RollbackPriority::Low => "low",
            RollbackPriority::Lowest => "lowest",
        }
    }
}

impl Default for RollbackPriority {
    fn default() -> Self {
        RollbackPriority::Medium
    }
}

impl fmt::Display for RollbackPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollbackPriority {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "highest" => Ok(RollbackPriority::Highest),
            "high" => Ok(RollbackPriority::High),
            "medium" => Ok(RollbackPriority::Medium),
            "low" => Ok(RollbackPriority::Low),
            "lowest" => Ok(RollbackPriority::Lowest),
            other => Err(SnapError::Validation(format!(
                "Invalid rollback priority [{}]; expected highest, high, medium, low or lowest",
                other
            ))),
        }
    }
}

/// Policy applied when a group's reserve capacity is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReserveFullPolicy {
    /// Delete the oldest snapshot image
    Purge,
    /// Reject writes to the base volume
    Reject,
}

impl ReserveFullPolicy {
    /// Firmware value of the policy
    pub fn wire(&self) -> &'static str {
        match self {
            ReserveFullPolicy::Purge => "purgepit",
            ReserveFullPolicy::Reject => "failbasewrites",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "purgepit" => Some(ReserveFullPolicy::Purge),
            "failbasewrites" => Some(ReserveFullPolicy::Reject),
            _ => None,
        }
    }
}

impl Default for ReserveFullPolicy {
    fn default() -> Self {
        ReserveFullPolicy::Purge
    }
}
