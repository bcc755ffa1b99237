//! Change-set executor
//!
//! Applies a [`ChangeSet`] one change at a time, awaiting every request
//! before issuing the next. The first failing change aborts the run; the
//! error lists the steps that had already completed. Nothing is retried or
//! rolled back.

use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};

use snapcg_array::{endpoints, ArrayClient, MetadataStore, PitMetadata, TransportError};
use snapcg_core::{ConsistencyGroupRecord, Result, SnapError, SnapshotImage};

use crate::changeset::{
    expand_body, member_batch_body, rollback_body, trim_body, view_body, Change, ChangeSet,
};

/// Failure of a single step
#[derive(Error, Debug)]
enum StepError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("consistency group id is not known")]
    UnknownGroup,

    #[error("array returned no snapshot images")]
    NoImages,
}

/// Executes change-sets against the array
pub struct Executor {
    client: ArrayClient,
    metadata: MetadataStore,
}

impl Executor {
    pub fn new(client: ArrayClient) -> Self {
        Self {
            metadata: MetadataStore::new(client.clone()),
            client,
        }
    }

    /// Apply every change in order, returning the completed steps
    #[instrument(skip(self, changes), fields(group = %changes.group, count = changes.len()))]
    pub async fn apply(&self, changes: &ChangeSet) -> Result<Vec<String>> {
        let mut completed: Vec<String> = Vec::with_capacity(changes.len());
        let mut group_id = changes.group_id.clone();

        for change in &changes.changes {
            let step = change.describe();
            info!(step = %step, "Applying change");

            if let Err(e) = self.apply_one(&changes.group, &mut group_id, change).await {
                warn!(step = %step, completed = completed.len(), error = %e, "Change failed");
                return Err(SnapError::MutationFailure {
                    step,
                    completed,
                    message: e.to_string(),
                });
            }
            completed.push(step);
        }

        Ok(completed)
    }

    async fn apply_one(
        &self,
        group: &str,
        group_id: &mut Option<String>,
        change: &Change,
    ) -> std::result::Result<(), StepError> {
        if let Change::CreateGroup { settings } = change {
            let record: ConsistencyGroupRecord = self
                .client
                .post(endpoints::CONSISTENCY_GROUPS, Some(settings.body(group)))
                .await?;
            *group_id = Some(record.reference().to_string());
            return Ok(());
        }

        let id = group_id.as_deref().ok_or(StepError::UnknownGroup)?;
        match change {
            Change::CreateGroup { .. } => {}
            Change::UpdateGroup { settings } => {
                self.client
                    .post_unit(&endpoints::group(id), Some(settings.body(group)))
                    .await?;
            }
            Change::RemoveGroup { pit_names } => {
                self.client.delete(&endpoints::group(id)).await?;
                for name in pit_names {
                    self.metadata.delete(group, name).await?;
                }
            }
            Change::RemoveMember { volume_id, .. } => {
                self.client
                    .delete(&endpoints::member_volume(id, volume_id))
                    .await?;
            }
            Change::TrimReserve {
                concat_id,
                trim_count,
                ..
            } => {
                self.client
                    .post_unit(endpoints::TRIM_CONCAT, Some(trim_body(concat_id, *trim_count)))
                    .await?;
            }
            Change::ExpandReserve {
                concat_id,
                candidate,
                ..
            } => {
                self.client
                    .post_unit(
                        &endpoints::concat_expand(concat_id),
                        Some(expand_body(concat_id, candidate)),
                    )
                    .await?;
            }
            Change::AddMembers { members } => {
                self.client
                    .post_unit(
                        &endpoints::member_volumes_batch(id),
                        Some(member_batch_body(members)),
                    )
                    .await?;
            }
            Change::CreatePit { name, description } => {
                let images: Vec<SnapshotImage> =
                    self.client.post(&endpoints::snapshots(id), None).await?;
                if let Some(name) = name {
                    let first = images.first().ok_or(StepError::NoImages)?;
                    let record = PitMetadata {
                        name: name.clone(),
                        timestamp: first.pit_timestamp,
                        image_id: first.id.clone(),
                        description: description.clone(),
                    };
                    self.metadata.write(group, &record).await?;
                }
            }
            Change::RemovePits {
                sequence_numbers,
                pit_names,
            } => {
                for sequence in sequence_numbers {
                    self.client.delete(&endpoints::snapshot(id, *sequence)).await?;
                }
                for name in pit_names {
                    self.metadata.delete(group, name).await?;
                }
            }
            Change::CreateView {
                name,
                pit_sequence_number,
                volumes,
            } => {
                self.client
                    .post_unit(
                        &endpoints::views_batch(id),
                        Some(view_body(name, *pit_sequence_number, volumes)),
                    )
                    .await?;
            }
            Change::RemoveView { view_id, .. } => {
                self.client.delete(&endpoints::view(id, view_id)).await?;
            }
            Change::Rollback {
                backup,
                priority,
                image_ids,
                ..
            } => {
                if *backup {
                    self.client.post_unit(&endpoints::snapshots(id), None).await?;
                }
                self.client
                    .post_unit(
                        &endpoints::group(id),
                        Some(json!({ "rollbackPriority": priority.as_str() })),
                    )
                    .await?;
                self.client
                    .post_unit(endpoints::START_ROLLBACK, Some(rollback_body(image_ids)))
                    .await?;
            }
        }
        Ok(())
    }
}
