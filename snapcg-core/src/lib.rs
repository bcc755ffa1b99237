//! Snapshot consistency-group core library
//!
//! Core abstractions shared by the array client and the reconciler:
//! - Unified error type
//! - Typed records for the array's management REST API
//! - Partial PIT timestamp parsing and matching
//! - Reserve-capacity percentage arithmetic

pub mod capacity;
pub mod error;
pub mod model;
pub mod timestamp;

pub use capacity::{bytes_for_percent, percent_of};
pub use error::{Result, SnapError};
pub use model::{
    ConcatVolume, ConsistencyGroupRecord, KeyValue, MemberVolumeRecord, ReserveCandidate,
    ReserveFullPolicy, RollbackPriority, SnapshotImage, StoragePool, ViewRecord, Volume,
};
pub use timestamp::{image_time, PitTimestamp, TimestampSpec};

/// Reserve capacity given to a base volume when none is declared
pub const DEFAULT_RESERVE_CAPACITY_PCT: u32 = 40;

/// Default number of snapshot images a group retains
pub const DEFAULT_MAXIMUM_SNAPSHOTS: u32 = 32;

/// Default reserve fill percentage that raises an alert
pub const DEFAULT_ALERT_THRESHOLD_PCT: u32 = 75;
