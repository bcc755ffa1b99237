//! Endpoint paths, relative to the storage-system-scoped base path

pub const VOLUMES: &str = "volumes";
pub const THIN_VOLUMES: &str = "thin-volumes";
pub const STORAGE_POOLS: &str = "storage-pools";
pub const CONCAT_VOLUMES: &str = "repositories/concat";
pub const CONCAT_CANDIDATES: &str = "repositories/concat/single";
pub const CONSISTENCY_GROUPS: &str = "consistency-groups";
pub const TRIM_CONCAT: &str = "symbol/trimConcatVolume";
pub const START_ROLLBACK: &str = "symbol/startPITRollback";
pub const KEY_VALUES: &str = "key-values";

pub fn concat_expand(concat_id: &str) -> String {
    format!("repositories/concat/{}/expand", concat_id)
}

pub fn group(group_id: &str) -> String {
    format!("consistency-groups/{}", group_id)
}

pub fn member_volumes(group_id: &str) -> String {
    format!("consistency-groups/{}/member-volumes", group_id)
}

pub fn member_volumes_batch(group_id: &str) -> String {
    format!("consistency-groups/{}/member-volumes/batch", group_id)
}

pub fn member_volume(group_id: &str, volume_id: &str) -> String {
    format!("consistency-groups/{}/member-volumes/{}", group_id, volume_id)
}

pub fn snapshots(group_id: &str) -> String {
    format!("consistency-groups/{}/snapshots", group_id)
}

pub fn snapshot(group_id: &str, sequence_number: u64) -> String {
    format!("consistency-groups/{}/snapshots/{}", group_id, sequence_number)
}

pub fn views(group_id: &str) -> String {
    format!("consistency-groups/{}/views", group_id)
}

pub fn views_batch(group_id: &str) -> String {
    format!("consistency-groups/{}/views/batch", group_id)
}

pub fn view(group_id: &str, view_id: &str) -> String {
    format!("consistency-groups/{}/views/{}", group_id, view_id)
}

/// Key-value record path; the key is percent-encoded as one segment
pub fn key_value(key: &str) -> String {
    format!("key-values/{}", urlencoding::encode(key))
}
