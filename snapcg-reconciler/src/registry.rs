//! PIT image registry
//!
//! Groups a consistency group's snapshot images into PIT events keyed by
//! sequence number, with secondary indices by image timestamp and by the
//! name recorded in the key-value store. Sequence numbers are the only
//! reliable ordering; timestamps may collide across events.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use snapcg_array::PitMetadata;
use snapcg_core::{image_time, PitTimestamp, Result, SnapError, SnapshotImage, TimestampSpec};

use crate::request::PitSelector;

/// All images of one PIT event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PitEvent {
    pub sequence_number: u64,
    /// Earliest `pitTimestamp` among the event's images
    pub timestamp: u64,
    pub images: Vec<SnapshotImage>,
    pub name: Option<String>,
    pub description: Option<String>,
}

impl PitEvent {
    /// Image of `base_volume_id`, if the event has one
    pub fn image_for(&self, base_volume_id: &str) -> Option<&SnapshotImage> {
        self.images.iter().find(|i| i.base_vol == base_volume_id)
    }

    fn all_match(&self, spec: &TimestampSpec) -> bool {
        self.images
            .iter()
            .all(|i| image_time(i.pit_timestamp).is_some_and(|t| spec.matches(&t)))
    }
}

/// Metadata records that belong to `group`
///
/// Keys are `"<group>_<name>"`, so a group whose label extends this one
/// (`g1` and `g1_db`) shares the prefix. A record stays when it names one of
/// `images`, or when no such longer label claims its key.
pub fn owned_records(
    group: &str,
    other_groups: &[String],
    images: &[SnapshotImage],
    records: Vec<PitMetadata>,
) -> Vec<PitMetadata> {
    let prefix = format!("{}_", group);
    let shadowing: Vec<String> = other_groups
        .iter()
        .filter(|label| label.starts_with(&prefix))
        .map(|label| format!("{}_", label))
        .collect();

    records
        .into_iter()
        .filter(|record| {
            if images.iter().any(|i| i.id == record.image_id) {
                return true;
            }
            let key = PitMetadata::key(group, &record.name);
            match shadowing.iter().find(|p| key.starts_with(p.as_str())) {
                Some(owner) => {
                    debug!(key = %key, owner = %owner.trim_end_matches('_'), "PIT metadata belongs to another group");
                    false
                }
                None => true,
            }
        })
        .collect()
}

/// Indexed view of a group's PIT events
#[derive(Debug, Default)]
pub struct PitRegistry {
    events: BTreeMap<u64, PitEvent>,
    by_timestamp: BTreeMap<u64, BTreeSet<u64>>,
    by_name: HashMap<String, u64>,
    /// Every recorded name, linked or not
    recorded: BTreeSet<String>,
    /// Group's `uniqueSequenceNumber`, oldest first
    sequence_numbers: Vec<u64>,
}

impl PitRegistry {
    /// Build the registry from the group's images and metadata records
    pub fn build(
        sequence_numbers: &[u64],
        images: Vec<SnapshotImage>,
        metadata: Vec<PitMetadata>,
    ) -> Self {
        let mut registry = Self {
            sequence_numbers: sequence_numbers.to_vec(),
            ..Default::default()
        };

        for image in images {
            registry
                .by_timestamp
                .entry(image.pit_timestamp)
                .or_default()
                .insert(image.pit_sequence_number);

            let event = registry
                .events
                .entry(image.pit_sequence_number)
                .or_insert_with(|| PitEvent {
                    sequence_number: image.pit_sequence_number,
                    timestamp: image.pit_timestamp,
                    images: Vec::new(),
                    name: None,
                    description: None,
                });
            event.timestamp = event.timestamp.min(image.pit_timestamp);
            event.images.push(image);
        }

        for record in metadata {
            registry.recorded.insert(record.name.clone());
            match registry.link(&record) {
                Some(sequence) => {
                    if let Some(event) = registry.events.get_mut(&sequence) {
                        event.name = Some(record.name.clone());
                        event.description = Some(record.description.clone());
                    }
                    registry.by_name.insert(record.name, sequence);
                }
                None => {
                    debug!(name = %record.name, "PIT metadata has no matching images");
                }
            }
        }

        registry
    }

    /// Sequence number of the event a metadata record describes
    fn link(&self, record: &PitMetadata) -> Option<u64> {
        if let Some(event) = self
            .events
            .values()
            .find(|e| e.images.iter().any(|i| i.id == record.image_id))
        {
            return Some(event.sequence_number);
        }

        let sequences = self.by_timestamp.get(&record.timestamp)?;
        if sequences.len() > 1 {
            warn!(
                name = %record.name,
                timestamp = record.timestamp,
                "PIT metadata timestamp matches several events; ignoring"
            );
            return None;
        }
        sequences.iter().next().copied()
    }

    /// Names with a metadata record in this group
    pub fn recorded_names(&self) -> impl Iterator<Item = &str> {
        self.recorded.iter().map(String::as_str)
    }

    pub fn is_name_recorded(&self, name: &str) -> bool {
        self.recorded.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Events ordered by sequence number
    pub fn events(&self) -> impl Iterator<Item = &PitEvent> {
        self.events.values()
    }

    pub fn get(&self, sequence_number: u64) -> Option<&PitEvent> {
        self.events.get(&sequence_number)
    }

    pub fn by_name(&self, name: &str) -> Option<&PitEvent> {
        self.by_name.get(name).and_then(|seq| self.events.get(seq))
    }

    /// Whether any image references `base_volume_id`
    pub fn has_images_for(&self, base_volume_id: &str) -> bool {
        self.events
            .values()
            .any(|e| e.image_for(base_volume_id).is_some())
    }

    /// `sequence_number` and every older event, oldest first
    pub fn up_to(&self, sequence_number: u64) -> Vec<&PitEvent> {
        self.events.range(..=sequence_number).map(|(_, e)| e).collect()
    }

    /// Resolve a selector to exactly one event
    pub fn resolve(&self, selector: &PitSelector) -> Result<&PitEvent> {
        match selector {
            PitSelector::Name(name) => self
                .by_name(name)
                .ok_or_else(|| SnapError::NotFound(format!("snapshot image named [{}]", name))),
            PitSelector::Timestamp(timestamp) => self.resolve_timestamp(timestamp),
            PitSelector::Both { name, timestamp } => {
                let event = self
                    .by_name(name)
                    .ok_or_else(|| SnapError::NotFound(format!("snapshot image named [{}]", name)))?;
                let agrees = match timestamp {
                    PitTimestamp::At(spec) => event.all_match(spec),
                    sentinel => self
                        .resolve_timestamp(sentinel)
                        .map(|e| e.sequence_number == event.sequence_number)
                        .unwrap_or(false),
                };
                if !agrees {
                    return Err(SnapError::AmbiguousResolution(format!(
                        "snapshot image [{}] does not match timestamp [{}]",
                        name, timestamp
                    )));
                }
                Ok(event)
            }
        }
    }

    fn resolve_timestamp(&self, timestamp: &PitTimestamp) -> Result<&PitEvent> {
        let sentinel = |sequence: Option<u64>| {
            sequence
                .and_then(|seq| self.events.get(&seq))
                .ok_or_else(|| SnapError::NotFound(format!("{} snapshot image", timestamp)))
        };

        match timestamp {
            PitTimestamp::Newest => sentinel(
                self.sequence_numbers
                    .last()
                    .copied()
                    .or_else(|| self.events.keys().next_back().copied()),
            ),
            PitTimestamp::Oldest => sentinel(
                self.sequence_numbers
                    .first()
                    .copied()
                    .or_else(|| self.events.keys().next().copied()),
            ),
            PitTimestamp::At(spec) => {
                let matched: BTreeSet<u64> = self
                    .by_timestamp
                    .iter()
                    .filter(|(ts, _)| image_time(**ts).is_some_and(|t| spec.matches(&t)))
                    .flat_map(|(_, sequences)| sequences.iter().copied())
                    .collect();

                match matched.len() {
                    0 => Err(SnapError::NotFound(format!(
                        "snapshot image matching timestamp [{}]",
                        timestamp
                    ))),
                    1 => sentinel(matched.into_iter().next()),
                    _ => Err(SnapError::AmbiguousResolution(format!(
                        "timestamp [{}] matches snapshot images with sequence numbers {:?}",
                        timestamp, matched
                    ))),
                }
            }
        }
    }
}
