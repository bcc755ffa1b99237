//! PIT metadata records
//!
//! Snapshot images carry no name or description, so they are kept in the
//! array's generic key-value store:
//!
//! `"<group>_<name>" -> "<timestamp>|<image-id>|<description>"`
//!
//! This mapping is the only source of name resolution and is removed together
//! with its PIT event.

use serde::Serialize;
use serde_json::Value;
use snapcg_core::{KeyValue, SnapError};
use tracing::{debug, warn};

use crate::endpoints;
use crate::transport::{ArrayClient, Result};

/// Name and description of one PIT event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PitMetadata {
    pub name: String,
    /// `pitTimestamp` of the event's images (unix seconds)
    pub timestamp: u64,
    /// Id of one image of the event
    pub image_id: String,
    pub description: String,
}

impl PitMetadata {
    /// Key-value key for `name` in `group`
    pub fn key(group: &str, name: &str) -> String {
        format!("{}_{}", group, name)
    }

    /// Encoded key-value value
    pub fn encode(&self) -> String {
        format!("{}|{}|{}", self.timestamp, self.image_id, self.description)
    }

    /// Decode an entry belonging to `group`; entries of other groups or with
    /// a malformed value yield `None`
    pub fn decode(group: &str, entry: &KeyValue) -> Option<Self> {
        let prefix = format!("{}_", group);
        let name = entry.key.strip_prefix(&prefix)?;
        if name.is_empty() {
            return None;
        }

        let mut parts = entry.value.splitn(3, '|');
        let timestamp = parts.next()?.trim().parse().ok()?;
        let image_id = parts.next()?.to_string();
        let description = parts.next()?.to_string();

        Some(Self {
            name: name.to_string(),
            timestamp,
            image_id,
            description,
        })
    }
}

/// Key-value backed metadata store
pub struct MetadataStore {
    client: ArrayClient,
}

impl MetadataStore {
    pub fn new(client: ArrayClient) -> Self {
        Self { client }
    }

    /// All metadata records of `group`
    pub async fn list(&self, group: &str) -> std::result::Result<Vec<PitMetadata>, SnapError> {
        let entries: Vec<KeyValue> = self
            .client
            .get(endpoints::KEY_VALUES)
            .await
            .map_err(|e| SnapError::lookup(endpoints::KEY_VALUES, e))?;

        let prefix = format!("{}_", group);
        let mut records = Vec::new();
        for entry in &entries {
            match PitMetadata::decode(group, entry) {
                Some(record) => records.push(record),
                None if entry.key.starts_with(&prefix) => {
                    warn!(key = %entry.key, "Ignoring malformed PIT metadata record");
                }
                None => {}
            }
        }

        debug!(group = %group, count = records.len(), "Loaded PIT metadata");
        Ok(records)
    }

    /// Store the record for `group`
    pub async fn write(&self, group: &str, record: &PitMetadata) -> Result<()> {
        let key = PitMetadata::key(group, &record.name);
        self.client
            .post_unit(&endpoints::key_value(&key), Some(Value::String(record.encode())))
            .await
    }

    /// Remove the record named `name` from `group`
    pub async fn delete(&self, group: &str, name: &str) -> Result<()> {
        let key = PitMetadata::key(group, name);
        self.client.delete(&endpoints::key_value(&key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedArray;
    use std::sync::Arc;

    fn kv(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_encode_decode() {
        let record = PitMetadata {
            name: "pit1".into(),
            timestamp: 1_709_262_000,
            image_id: "3400000060080E50".into(),
            description: "before upgrade | keep".into(),
        };
        let entry = kv(&PitMetadata::key("g1", "pit1"), &record.encode());
        assert_eq!(entry.key, "g1_pit1");
        assert_eq!(PitMetadata::decode("g1", &entry), Some(record));
    }

    #[test]
    fn test_decode_filters_other_groups_and_garbage() {
        assert!(PitMetadata::decode("g1", &kv("g2_pit1", "1|a|b")).is_none());
        assert!(PitMetadata::decode("g1", &kv("g1_pit1", "not-a-number|a|b")).is_none());
        assert!(PitMetadata::decode("g1", &kv("g1_pit1", "1|a")).is_none());
        assert!(PitMetadata::decode("g1", &kv("g1_", "1|a|b")).is_none());
    }

    #[tokio::test]
    async fn test_store_round_trip_through_array() {
        let array = Arc::new(SimulatedArray::new());
        array.put_key_value("other", "x");
        let store = MetadataStore::new(ArrayClient::new(array.clone()));

        let record = PitMetadata {
            name: "nightly".into(),
            timestamp: 42,
            image_id: "img-1".into(),
            description: "".into(),
        };
        store.write("g1", &record).await.unwrap();
        assert_eq!(array.key_value("g1_nightly").as_deref(), Some("42|img-1|"));
        assert_eq!(store.list("g1").await.unwrap(), vec![record]);

        store.delete("g1", "nightly").await.unwrap();
        assert!(store.list("g1").await.unwrap().is_empty());
    }
}
