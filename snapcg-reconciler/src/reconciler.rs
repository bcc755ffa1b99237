//! Consistency-group reconciler
//!
//! Diffs one [`Operation`] against the array's current state and produces a
//! [`ChangeSet`], then applies it unless running in dry-run mode. All state
//! read during a run lives in a [`RunContext`] that is dropped with the run.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use snapcg_array::{endpoints, ArrayClient, InventoryCache, MetadataStore, PitMetadata};
use snapcg_core::{
    percent_of, ConsistencyGroupRecord, MemberVolumeRecord, Result, SnapError, SnapshotImage,
    ViewRecord,
};

use crate::apply::Executor;
use crate::candidates::{self, CandidateRequest, ResolvedCandidate};
use crate::changeset::{Change, ChangeSet, MemberAddition, SettingsUpdate, SnapshotVolumeRequest};
use crate::registry::{owned_records, PitRegistry};
use crate::request::{GroupSettings, Operation, PitSelector, VolumeSpec};
use crate::sizing::{plan_resize, ChainMember, Resize, SizingInput};

/// Base volume currently in the group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberState {
    pub name: String,
    pub volume_id: String,
    pub base_bytes: u64,
    pub reserve_bytes: u64,
    pub reserve_pct: u32,
    /// Concat volume holding the reserve chain
    pub concat_id: String,
}

/// Group as found on the array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupState {
    pub record: ConsistencyGroupRecord,
    pub members: Vec<MemberState>,
}

impl GroupState {
    pub fn id(&self) -> &str {
        self.record.reference()
    }

    pub fn member(&self, name: &str) -> Option<&MemberState> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Settings fields that differ from `desired`
    pub fn settings_diff(&self, desired: &GroupSettings) -> SettingsUpdate {
        let record = &self.record;
        SettingsUpdate {
            alert_threshold_pct: (record.full_warn_threshold != desired.alert_threshold_pct)
                .then_some(desired.alert_threshold_pct),
            maximum_snapshots: (record.auto_delete_limit != desired.maximum_snapshots)
                .then_some(desired.maximum_snapshots),
            rollback_priority: (record.rollback_priority != desired.rollback_priority)
                .then_some(desired.rollback_priority),
            full_policy: (record.full_policy() != Some(desired.full_policy))
                .then_some(desired.full_policy),
        }
    }
}

/// State read during one reconciliation run
pub struct RunContext {
    pub inventory: InventoryCache,
    metadata: MetadataStore,
    group: Option<Option<GroupState>>,
    /// Labels of every other group on the array
    other_groups: Vec<String>,
    registry: Option<PitRegistry>,
}

impl RunContext {
    pub fn new(client: ArrayClient) -> Self {
        Self {
            metadata: MetadataStore::new(client.clone()),
            inventory: InventoryCache::new(client),
            group: None,
            other_groups: Vec::new(),
            registry: None,
        }
    }

    fn client(&self) -> &ArrayClient {
        self.inventory.client()
    }

    /// The group named `name`, if it exists
    pub async fn group(&mut self, name: &str) -> Result<Option<GroupState>> {
        if let Some(group) = &self.group {
            return Ok(group.clone());
        }

        let groups: Vec<ConsistencyGroupRecord> = self
            .client()
            .get(endpoints::CONSISTENCY_GROUPS)
            .await
            .map_err(|e| SnapError::lookup(endpoints::CONSISTENCY_GROUPS, e))?;

        self.other_groups = groups
            .iter()
            .filter(|g| g.label != name)
            .map(|g| g.label.clone())
            .collect();
        let state = match groups.into_iter().find(|g| g.label == name) {
            Some(record) => Some(self.load_members(record).await?),
            None => None,
        };

        debug!(group = %name, exists = state.is_some(), "Loaded consistency group");
        self.group = Some(state.clone());
        Ok(state)
    }

    async fn load_members(&mut self, record: ConsistencyGroupRecord) -> Result<GroupState> {
        let path = endpoints::member_volumes(record.reference());
        let records: Vec<MemberVolumeRecord> = self
            .client()
            .get(&path)
            .await
            .map_err(|e| SnapError::lookup(path.as_str(), e))?;

        let volumes = self.inventory.volumes().await?;
        let mut members = Vec::with_capacity(records.len());
        for member in records {
            let volume = volumes.by_id(&member.volume_id).ok_or_else(|| {
                SnapError::NotFound(format!(
                    "base volume [{}] of group [{}]",
                    member.volume_id, record.label
                ))
            })?;
            members.push(MemberState {
                name: volume.name.clone(),
                volume_id: volume.id.clone(),
                base_bytes: volume.total_size_in_bytes,
                reserve_bytes: member.total_repository_capacity,
                reserve_pct: percent_of(member.total_repository_capacity, volume.total_size_in_bytes),
                concat_id: member.repository_volume,
            });
        }

        Ok(GroupState { record, members })
    }

    /// PIT events of `group`
    pub async fn registry(&mut self, group: &GroupState) -> Result<&PitRegistry> {
        if self.registry.is_none() {
            let path = endpoints::snapshots(group.id());
            let images: Vec<SnapshotImage> = self
                .client()
                .get(&path)
                .await
                .map_err(|e| SnapError::lookup(path.as_str(), e))?;
            let label = &group.record.label;
            let metadata = owned_records(
                label,
                &self.other_groups,
                &images,
                self.metadata.list(label).await?,
            );

            debug!(
                group = %group.record.label,
                images = images.len(),
                records = metadata.len(),
                "Loaded snapshot images"
            );
            self.registry = Some(PitRegistry::build(
                &group.record.unique_sequence_number,
                images,
                metadata,
            ));
        }
        Ok(self.registry.get_or_insert_with(PitRegistry::default))
    }

    async fn views(&self, group: &GroupState) -> Result<Vec<ViewRecord>> {
        let path = endpoints::views(group.id());
        self.client()
            .get(&path)
            .await
            .map_err(|e| SnapError::lookup(path.as_str(), e))
    }

    /// Head member size and the trimmable members of `member`'s reserve
    /// chain, tail first
    async fn chain(&mut self, member: &MemberState) -> Result<(u64, Vec<ChainMember>)> {
        let concat = self
            .inventory
            .reserve_chain(&member.concat_id)
            .await?
            .cloned()
            .ok_or_else(|| {
                SnapError::NotFound(format!(
                    "reserve capacity volume [{}] of [{}]",
                    member.concat_id, member.name
                ))
            })?;

        let volumes = self.inventory.volumes().await?;
        let size_of = |id: &str| {
            volumes
                .by_id(id)
                .map(|v| v.total_size_in_bytes)
                .ok_or_else(|| SnapError::NotFound(format!("reserve capacity member [{}]", id)))
        };

        let head_bytes = match concat.head() {
            Some(id) => size_of(id)?,
            None => 0,
        };
        let trimmable = concat
            .trimmable_from_tail()
            .map(|id| {
                size_of(id).map(|size| ChainMember {
                    id: id.to_string(),
                    size,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((head_bytes, trimmable))
    }
}

/// Outcome of one reconciliation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub operation: &'static str,
    pub changed: bool,
    pub dry_run: bool,
    pub change_set: ChangeSet,
    /// Steps executed against the array
    pub applied: Vec<String>,
}

/// Stateless reconciliation engine
#[derive(Clone)]
pub struct Reconciler {
    client: ArrayClient,
}

impl Reconciler {
    pub fn new(client: ArrayClient) -> Self {
        Self { client }
    }

    /// Compute the change-set for `operation` without applying it
    #[instrument(skip(self, operation), fields(group = %operation.group(), operation = operation.kind()))]
    pub async fn plan(&self, operation: &Operation) -> Result<ChangeSet> {
        operation.validate()?;

        let mut ctx = RunContext::new(self.client.clone());
        let group = ctx.group(operation.group()).await?;

        match operation {
            Operation::EnsureGroup {
                group: name,
                settings,
                volumes,
            } => match group {
                None => plan_create_group(&mut ctx, name, settings, volumes).await,
                Some(group) => plan_update_group(&mut ctx, &group, settings, volumes).await,
            },
            Operation::RemoveGroup { group: name } => match group {
                None => Ok(ChangeSet::new(name.as_str(), None)),
                Some(group) => {
                    let pit_names = ctx
                        .registry(&group)
                        .await?
                        .recorded_names()
                        .map(str::to_string)
                        .collect();
                    let mut changes = ChangeSet::new(name.as_str(), Some(group.id().to_string()));
                    changes.push(Change::RemoveGroup { pit_names });
                    Ok(changes)
                }
            },
            Operation::CreatePit {
                group: name,
                name: pit_name,
                description,
            } => {
                let group = require(group, name)?;
                if let Some(pit_name) = pit_name {
                    if ctx.registry(&group).await?.is_name_recorded(pit_name) {
                        return Err(SnapError::Validation(format!(
                            "Snapshot images named [{}] already exist. Group [{}]",
                            pit_name, name
                        )));
                    }
                    // Key taken by a group whose label extends this one
                    if ctx.metadata.list(name).await?.iter().any(|r| &r.name == pit_name) {
                        return Err(SnapError::Validation(format!(
                            "Snapshot image name [{}] collides with metadata key [{}] of another group. Group [{}]",
                            pit_name,
                            PitMetadata::key(name, pit_name),
                            name
                        )));
                    }
                }
                let mut changes = ChangeSet::new(name.as_str(), Some(group.id().to_string()));
                changes.push(Change::CreatePit {
                    name: pit_name.clone(),
                    description: description.clone(),
                });
                Ok(changes)
            }
            Operation::RemovePit {
                group: name,
                selector,
            } => match group {
                None => Ok(ChangeSet::new(name.as_str(), None)),
                Some(group) => plan_remove_pit(&mut ctx, &group, selector).await,
            },
            Operation::EnsureView {
                group: name,
                view,
                selector,
                volumes,
            } => {
                let group = require(group, name)?;
                plan_create_view(&mut ctx, &group, view, selector, volumes).await
            }
            Operation::RemoveView { group: name, view } => {
                let mut changes = ChangeSet::new(name.as_str(), None);
                if let Some(group) = group {
                    changes.group_id = Some(group.id().to_string());
                    if let Some(existing) = ctx.views(&group).await?.into_iter().find(|v| &v.name == view) {
                        changes.push(Change::RemoveView {
                            name: existing.name,
                            view_id: existing.id,
                        });
                    }
                }
                Ok(changes)
            }
            Operation::Rollback {
                group: name,
                selector,
                volumes,
                priority,
                backup,
            } => {
                let group = require(group, name)?;
                let registry = ctx.registry(&group).await?;
                let event = registry.resolve(selector)?.clone();

                let image_ids = if volumes.is_empty() {
                    event.images.iter().map(|i| i.id.clone()).collect()
                } else {
                    let index = ctx.inventory.volumes().await?;
                    let mut ids = Vec::with_capacity(volumes.len());
                    for spec in volumes {
                        let volume = index
                            .by_name(&spec.name)
                            .ok_or_else(|| SnapError::NotFound(format!("volume [{}]", spec.name)))?;
                        let image = event.image_for(&volume.id).ok_or_else(|| {
                            SnapError::NotFound(format!(
                                "snapshot image of volume [{}] in sequence number {}",
                                spec.name, event.sequence_number
                            ))
                        })?;
                        ids.push(image.id.clone());
                    }
                    ids
                };

                let mut changes = ChangeSet::new(name.as_str(), Some(group.id().to_string()));
                changes.push(Change::Rollback {
                    backup: *backup,
                    priority: *priority,
                    pit_sequence_number: event.sequence_number,
                    image_ids,
                });
                Ok(changes)
            }
        }
    }

    /// Plan and, unless `dry_run`, apply `operation`
    #[instrument(skip(self, operation), fields(group = %operation.group(), operation = operation.kind()))]
    pub async fn reconcile(&self, operation: &Operation, dry_run: bool) -> Result<ReconcileReport> {
        let change_set = self.plan(operation).await?;
        let changed = !change_set.is_empty();

        let applied = if changed && !dry_run {
            Executor::new(self.client.clone()).apply(&change_set).await?
        } else {
            Vec::new()
        };

        info!(
            changed,
            dry_run,
            changes = change_set.len(),
            applied = applied.len(),
            "Reconciliation complete"
        );

        Ok(ReconcileReport {
            operation: operation.kind(),
            changed,
            dry_run,
            change_set,
            applied,
        })
    }
}

fn require(group: Option<GroupState>, name: &str) -> Result<GroupState> {
    group.ok_or_else(|| SnapError::NotFound(format!("consistency group [{}]", name)))
}

fn candidate_request(spec: &VolumeSpec, percent: u32) -> CandidateRequest {
    CandidateRequest {
        volume: spec.name.clone(),
        percent,
        preferred_pool: spec.preferred_pool.clone(),
    }
}

fn addition(candidate: ResolvedCandidate) -> MemberAddition {
    MemberAddition {
        volume: candidate.volume.clone(),
        volume_id: candidate.volume_id.clone(),
        pool: candidate.pool_name.clone(),
        percent: candidate.percent,
        capacity: candidate.capacity,
        candidate: candidate.body().clone(),
    }
}

async fn plan_create_group(
    ctx: &mut RunContext,
    name: &str,
    settings: &GroupSettings,
    volumes: &[VolumeSpec],
) -> Result<ChangeSet> {
    let requests: Vec<CandidateRequest> = volumes
        .iter()
        .map(|spec| candidate_request(spec, spec.reserve_capacity_pct))
        .collect();
    let resolved = candidates::resolve(&mut ctx.inventory, &requests).await?;

    let mut changes = ChangeSet::new(name, None);
    changes.push(Change::CreateGroup {
        settings: SettingsUpdate {
            alert_threshold_pct: Some(settings.alert_threshold_pct),
            maximum_snapshots: Some(settings.maximum_snapshots),
            rollback_priority: Some(settings.rollback_priority),
            full_policy: Some(settings.full_policy),
        },
    });
    changes.push(Change::AddMembers {
        members: resolved.into_iter().map(addition).collect(),
    });
    Ok(changes)
}

async fn plan_update_group(
    ctx: &mut RunContext,
    group: &GroupState,
    settings: &GroupSettings,
    volumes: &[VolumeSpec],
) -> Result<ChangeSet> {
    let mut trims = Vec::new();
    // (base volume, concat id) per expansion, in request order
    let mut expansions: Vec<(String, String)> = Vec::new();
    let mut requests = Vec::new();
    let mut additions = Vec::new();

    for spec in volumes {
        let Some(member) = group.member(&spec.name) else {
            additions.push(candidate_request(spec, spec.reserve_capacity_pct));
            continue;
        };

        let ((head_bytes, trimmable), has_images) = if spec.reserve_capacity_pct < member.reserve_pct {
            let registry = ctx.registry(group).await?;
            let has_images = registry.has_images_for(&member.volume_id);
            (ctx.chain(member).await?, has_images)
        } else {
            ((member.reserve_bytes, Vec::new()), false)
        };

        let resize = plan_resize(&SizingInput {
            volume: &member.name,
            base_bytes: member.base_bytes,
            current_pct: member.reserve_pct,
            declared_pct: spec.reserve_capacity_pct,
            head_bytes,
            trimmable: &trimmable,
            has_images,
        })?;
        debug!(volume = %member.name, ?resize, "Planned reserve resize");

        let expand_pct = match resize {
            Resize::Unchanged => 0,
            Resize::Expand { percent, .. } => percent,
            Resize::Trim {
                trim_count,
                compensate_pct,
                ..
            } => {
                trims.push(Change::TrimReserve {
                    volume: member.name.clone(),
                    concat_id: member.concat_id.clone(),
                    trim_count,
                });
                compensate_pct
            }
        };
        if expand_pct > 0 {
            expansions.push((member.name.clone(), member.concat_id.clone()));
            requests.push(candidate_request(spec, expand_pct));
        }
    }

    let expansion_count = requests.len();
    requests.extend(additions);
    // One batch so labels and pool demand are checked across both
    let mut resolved = candidates::resolve(&mut ctx.inventory, &requests).await?;
    let added = resolved.split_off(expansion_count);

    let declared: HashMap<&str, &VolumeSpec> = volumes.iter().map(|v| (v.name.as_str(), v)).collect();

    let mut changes = ChangeSet::new(group.record.label.as_str(), Some(group.id().to_string()));
    let update = group.settings_diff(settings);
    if !update.is_empty() {
        changes.push(Change::UpdateGroup { settings: update });
    }
    for member in group.members.iter().filter(|m| !declared.contains_key(m.name.as_str())) {
        changes.push(Change::RemoveMember {
            volume: member.name.clone(),
            volume_id: member.volume_id.clone(),
        });
    }
    for trim in trims {
        changes.push(trim);
    }
    for ((volume, concat_id), candidate) in expansions.into_iter().zip(resolved) {
        changes.push(Change::ExpandReserve {
            volume,
            concat_id,
            percent: candidate.percent,
            bytes: candidate.capacity,
            candidate: candidate.body().clone(),
        });
    }
    if !added.is_empty() {
        changes.push(Change::AddMembers {
            members: added.into_iter().map(addition).collect(),
        });
    }

    Ok(changes)
}

async fn plan_remove_pit(
    ctx: &mut RunContext,
    group: &GroupState,
    selector: &PitSelector,
) -> Result<ChangeSet> {
    let mut changes = ChangeSet::new(group.record.label.as_str(), Some(group.id().to_string()));
    let registry = ctx.registry(group).await?;

    let target = match registry.resolve(selector) {
        Ok(event) => event.sequence_number,
        Err(SnapError::NotFound(what)) => {
            debug!(%what, "No snapshot images to remove");
            return Ok(changes);
        }
        Err(e) => return Err(e),
    };

    let removed = registry.up_to(target);
    changes.push(Change::RemovePits {
        sequence_numbers: removed.iter().map(|e| e.sequence_number).collect(),
        pit_names: removed.iter().filter_map(|e| e.name.clone()).collect(),
    });
    Ok(changes)
}

async fn plan_create_view(
    ctx: &mut RunContext,
    group: &GroupState,
    view: &str,
    selector: &PitSelector,
    volumes: &[VolumeSpec],
) -> Result<ChangeSet> {
    let mut changes = ChangeSet::new(group.record.label.as_str(), Some(group.id().to_string()));
    if ctx.views(group).await?.iter().any(|v| v.name == view) {
        return Ok(changes);
    }

    let event = ctx.registry(group).await?.resolve(selector)?.clone();

    let specs: Vec<VolumeSpec> = if volumes.is_empty() {
        group.members.iter().map(|m| VolumeSpec::named(m.name.as_str())).collect()
    } else {
        volumes.to_vec()
    };
    let requests: Vec<CandidateRequest> = specs
        .iter()
        .map(|spec| candidate_request(spec, spec.reserve_capacity_pct))
        .collect();
    let resolved = candidates::resolve(&mut ctx.inventory, &requests).await?;

    let mut snapshot_volumes = Vec::with_capacity(resolved.len());
    for (spec, candidate) in specs.iter().zip(resolved) {
        let image = event.image_for(&candidate.volume_id).ok_or_else(|| {
            SnapError::NotFound(format!(
                "snapshot image of volume [{}] in sequence number {}",
                spec.name, event.sequence_number
            ))
        })?;
        snapshot_volumes.push(SnapshotVolumeRequest {
            volume: spec.name.clone(),
            pit_id: image.id.clone(),
            writable: spec.writable,
            validate: spec.validate,
            candidate: candidate.body().clone(),
        });
    }

    changes.push(Change::CreateView {
        name: view.to_string(),
        pit_sequence_number: event.sequence_number,
        volumes: snapshot_volumes,
    });
    Ok(changes)
}
