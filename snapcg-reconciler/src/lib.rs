//! Snapshot consistency-group reconciler
//!
//! Brings a consistency group on the array to a declared state:
//! - Desired configuration parsing and validation
//! - PIT event registry built from images and stored metadata
//! - Reserve candidate resolution with label renumbering and capacity checks
//! - Reserve-capacity sizing (expand, trim, head-member protection)
//! - Typed change-sets and a sequential apply executor

pub mod apply;
pub mod candidates;
pub mod changeset;
pub mod config;
pub mod reconciler;
pub mod registry;
pub mod request;
pub mod sizing;

// Re-export main types
pub use apply::Executor;
pub use candidates::{CandidateRequest, ResolvedCandidate};
pub use changeset::{Change, ChangeSet, MemberAddition, SettingsUpdate, SnapshotVolumeRequest};
pub use config::{ArraySettings, ConfigError, DesiredConfig, DesiredState, SnapcgConfig, TargetKind};
pub use reconciler::{GroupState, MemberState, ReconcileReport, Reconciler, RunContext};
pub use registry::{PitEvent, PitRegistry};
pub use request::{GroupSettings, Operation, PitSelector, VolumeSpec};
pub use sizing::{plan_resize, ChainMember, Resize, SizingInput};
