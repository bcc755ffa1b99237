//! Typed operation requests
//!
//! A desired configuration is validated once into an [`Operation`]; every
//! handler downstream can rely on the invariants checked here, and no
//! invalid request ever reaches the array.

use serde::Serialize;
use std::collections::HashSet;

use snapcg_core::{
    PitTimestamp, ReserveFullPolicy, Result, RollbackPriority, SnapError,
    DEFAULT_ALERT_THRESHOLD_PCT, DEFAULT_MAXIMUM_SNAPSHOTS, DEFAULT_RESERVE_CAPACITY_PCT,
};

/// Declared base volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeSpec {
    pub name: String,
    pub reserve_capacity_pct: u32,
    /// Storage pool for reserve capacity; defaults to the base volume's pool
    pub preferred_pool: Option<String>,
    /// Snapshot volumes created for views are read/write
    pub writable: bool,
    /// Snapshot volumes created for views scan media and validate parity
    pub validate: bool,
}

impl VolumeSpec {
    /// Volume with default reserve and view settings
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reserve_capacity_pct: DEFAULT_RESERVE_CAPACITY_PCT,
            preferred_pool: None,
            writable: true,
            validate: false,
        }
    }

    pub fn with_reserve(mut self, pct: u32) -> Self {
        self.reserve_capacity_pct = pct;
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.preferred_pool = Some(pool.into());
        self
    }
}

/// Group-level settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupSettings {
    pub alert_threshold_pct: u32,
    pub maximum_snapshots: u32,
    pub rollback_priority: RollbackPriority,
    pub full_policy: ReserveFullPolicy,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            alert_threshold_pct: DEFAULT_ALERT_THRESHOLD_PCT,
            maximum_snapshots: DEFAULT_MAXIMUM_SNAPSHOTS,
            rollback_priority: RollbackPriority::default(),
            full_policy: ReserveFullPolicy::default(),
        }
    }
}

/// How a PIT event is selected
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PitSelector {
    Name(String),
    Timestamp(PitTimestamp),
    /// Name and timestamp must identify the same event
    Both { name: String, timestamp: PitTimestamp },
}

impl PitSelector {
    /// Build a selector from optional name and raw timestamp
    pub fn from_parts(name: Option<&str>, timestamp: Option<&str>) -> Result<Option<Self>> {
        let name = name.filter(|n| !n.is_empty());
        let timestamp = timestamp
            .filter(|t| !t.trim().is_empty())
            .map(str::parse::<PitTimestamp>)
            .transpose()?;

        Ok(match (name, timestamp) {
            (Some(name), Some(timestamp)) => Some(PitSelector::Both {
                name: name.to_string(),
                timestamp,
            }),
            (Some(name), None) => Some(PitSelector::Name(name.to_string())),
            (None, Some(timestamp)) => Some(PitSelector::Timestamp(timestamp)),
            (None, None) => None,
        })
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            PitSelector::Name(name) | PitSelector::Both { name, .. } => Some(name),
            PitSelector::Timestamp(_) => None,
        }
    }
}

/// One reconciliation request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    /// Group exists with these settings and members
    EnsureGroup {
        group: String,
        settings: GroupSettings,
        volumes: Vec<VolumeSpec>,
    },
    RemoveGroup {
        group: String,
    },
    /// Take a new PIT event; always a change
    CreatePit {
        group: String,
        name: Option<String>,
        description: String,
    },
    /// Delete the selected PIT event and every older one
    RemovePit {
        group: String,
        selector: PitSelector,
    },
    EnsureView {
        group: String,
        view: String,
        selector: PitSelector,
        /// Empty means every group member
        volumes: Vec<VolumeSpec>,
    },
    RemoveView {
        group: String,
        view: String,
    },
    Rollback {
        group: String,
        selector: PitSelector,
        /// Empty means every image of the event
        volumes: Vec<VolumeSpec>,
        priority: RollbackPriority,
        /// Take an unnamed PIT before rolling back
        backup: bool,
    },
}

impl Operation {
    pub fn group(&self) -> &str {
        match self {
            Operation::EnsureGroup { group, .. }
            | Operation::RemoveGroup { group }
            | Operation::CreatePit { group, .. }
            | Operation::RemovePit { group, .. }
            | Operation::EnsureView { group, .. }
            | Operation::RemoveView { group, .. }
            | Operation::Rollback { group, .. } => group,
        }
    }

    /// Short label used in logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::EnsureGroup { .. } => "ensure_group",
            Operation::RemoveGroup { .. } => "remove_group",
            Operation::CreatePit { .. } => "create_pit",
            Operation::RemovePit { .. } => "remove_pit",
            Operation::EnsureView { .. } => "ensure_view",
            Operation::RemoveView { .. } => "remove_view",
            Operation::Rollback { .. } => "rollback",
        }
    }

    /// Check request invariants
    pub fn validate(&self) -> Result<()> {
        if self.group().trim().is_empty() {
            return Err(SnapError::Validation("group_name must not be empty".to_string()));
        }

        match self {
            Operation::EnsureGroup {
                group,
                settings,
                volumes,
            } => {
                if volumes.is_empty() {
                    return Err(SnapError::Validation(format!(
                        "Volumes must be defined to create a snapshot consistency group. Group [{}]",
                        group
                    )));
                }
                if settings.alert_threshold_pct > 100 {
                    return Err(SnapError::Validation(format!(
                        "alert_threshold_pct must be between 0 and 100, got {}",
                        settings.alert_threshold_pct
                    )));
                }
                if settings.maximum_snapshots == 0 {
                    return Err(SnapError::Validation(
                        "maximum_snapshots must be at least 1".to_string(),
                    ));
                }
                validate_volumes(volumes)
            }
            Operation::EnsureView { view, .. } | Operation::RemoveView { view, .. }
                if view.trim().is_empty() =>
            {
                Err(SnapError::Validation("view_name must not be empty".to_string()))
            }
            Operation::CreatePit { name: Some(name), .. } if name.contains('/') => {
                Err(SnapError::Validation(format!(
                    "pit_name must not contain '/'. Name [{}]",
                    name
                )))
            }
            Operation::EnsureView { volumes, .. } | Operation::Rollback { volumes, .. } => {
                validate_volumes(volumes)
            }
            _ => Ok(()),
        }
    }
}

fn validate_volumes(volumes: &[VolumeSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for volume in volumes {
        if volume.name.is_empty() {
            return Err(SnapError::Validation("volume name must not be empty".to_string()));
        }
        if !seen.insert(volume.name.as_str()) {
            return Err(SnapError::Validation(format!(
                "Volume [{}] is declared more than once",
                volume.name
            )));
        }
        if volume.reserve_capacity_pct == 0 {
            return Err(SnapError::Validation(format!(
                "reserve_capacity_pct must be greater than 0. Volume [{}]",
                volume.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_from_parts() {
        assert_eq!(PitSelector::from_parts(None, None).unwrap(), None);
        assert_eq!(
            PitSelector::from_parts(Some("nightly"), None).unwrap(),
            Some(PitSelector::Name("nightly".to_string()))
        );
        assert_eq!(
            PitSelector::from_parts(None, Some("newest")).unwrap(),
            Some(PitSelector::Timestamp(PitTimestamp::Newest))
        );
        let both = PitSelector::from_parts(Some("nightly"), Some("2024-03-01")).unwrap().unwrap();
        assert_eq!(both.name(), Some("nightly"));
    }

    #[test]
    fn test_selector_rejects_bad_timestamp() {
        let err = PitSelector::from_parts(None, Some("03/01/2024")).unwrap_err();
        assert!(matches!(err, SnapError::Validation(_)));
    }

    #[test]
    fn test_group_requires_volumes() {
        let op = Operation::EnsureGroup {
            group: "g1".to_string(),
            settings: GroupSettings::default(),
            volumes: vec![],
        };
        assert!(matches!(op.validate(), Err(SnapError::Validation(_))));
    }

    #[test]
    fn test_duplicate_volumes_rejected() {
        let op = Operation::EnsureGroup {
            group: "g1".to_string(),
            settings: GroupSettings::default(),
            volumes: vec![VolumeSpec::named("vol1"), VolumeSpec::named("vol1")],
        };
        assert!(op.validate().unwrap_err().to_string().contains("more than once"));
    }

    #[test]
    fn test_settings_bounds() {
        let settings = GroupSettings {
            alert_threshold_pct: 101,
            ..Default::default()
        };
        let op = Operation::EnsureGroup {
            group: "g1".to_string(),
            settings,
            volumes: vec![VolumeSpec::named("vol1")],
        };
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_view_name_required() {
        let op = Operation::RemoveView {
            group: "g1".to_string(),
            view: String::new(),
        };
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_volume_spec_defaults() {
        let spec = VolumeSpec::named("vol1");
        assert_eq!(spec.reserve_capacity_pct, 40);
        assert!(spec.writable);
        assert!(!spec.validate);
    }
}
