//! Reserve-capacity candidate resolution
//!
//! Asks the array for one reserve-capacity candidate per base volume in the
//! volume's preferred storage pool, renumbers the auto-generated member
//! labels so a batch never reuses one, and checks the batch's total demand
//! against each pool's free space before anything is created.

use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, instrument};

use snapcg_array::{endpoints, InventoryCache, VolumeIndex};
use snapcg_core::{ReserveCandidate, Result, SnapError};

/// Reserve capacity wanted for one base volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRequest {
    /// Base volume name
    pub volume: String,
    /// Percentage of the base volume's size
    pub percent: u32,
    /// Storage pool name; defaults to the base volume's pool
    pub preferred_pool: Option<String>,
}

/// Candidate selected for one base volume
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedCandidate {
    pub volume: String,
    pub volume_id: String,
    pub pool_id: String,
    pub pool_name: String,
    pub percent: u32,
    /// Bytes the candidate allocates
    pub capacity: u64,
    #[serde(skip)]
    pub candidate: ReserveCandidate,
}

impl ResolvedCandidate {
    /// Opaque candidate body handed back to the array
    pub fn body(&self) -> &serde_json::Value {
        &self.candidate.candidate
    }

    pub fn label(&self) -> Option<&str> {
        self.candidate.member_label()
    }
}

/// Resolve candidates for a batch of requests
#[instrument(skip(inventory, requests), fields(count = requests.len()))]
pub async fn resolve(
    inventory: &mut InventoryCache,
    requests: &[CandidateRequest],
) -> Result<Vec<ResolvedCandidate>> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }

    let volumes = inventory.volumes().await?.clone();
    let pools = inventory.storage_pools().await?.clone();
    let client = inventory.client().clone();

    let mut resolved = Vec::with_capacity(requests.len());
    let mut labels: HashSet<String> = HashSet::new();
    let mut demand: BTreeMap<String, u64> = BTreeMap::new();

    for (index, request) in requests.iter().enumerate() {
        let volume = volumes
            .by_name(&request.volume)
            .ok_or_else(|| SnapError::NotFound(format!("volume [{}]", request.volume)))?;

        let pool_id = match &request.preferred_pool {
            Some(name) => pools
                .by_name(name)
                .map(|p| p.id.clone())
                .ok_or_else(|| {
                    SnapError::Validation(format!(
                        "Preferred reserve storage pool [{}] does not exist. Volume [{}]",
                        name, request.volume
                    ))
                })?,
            None => volume.volume_group_ref.clone(),
        };

        let body = json!({
            "candidateRequest": {
                "baseVolumeRef": volume.id,
                "percentCapacity": request.percent,
                "concatVolumeType": "snapshot",
            }
        });
        let offered: Vec<ReserveCandidate> = client
            .post(endpoints::CONCAT_CANDIDATES, Some(body))
            .await
            .map_err(|e| SnapError::lookup(endpoints::CONCAT_CANDIDATES, e))?;

        let mut candidate = offered
            .into_iter()
            .find(|c| c.volume_group_id == pool_id)
            .ok_or_else(|| SnapError::NoCandidate {
                volume: request.volume.clone(),
                pool: pools.name_of(&pool_id).to_string(),
            })?;

        if let Some(label) = candidate.member_label().map(str::to_string) {
            let unique = unique_label(&label, index as u64, &labels, &volumes);
            candidate.set_member_label(&unique);
            labels.insert(unique);
        }

        *demand.entry(pool_id.clone()).or_default() += candidate.capacity;

        debug!(
            volume = %request.volume,
            pool = %pools.name_of(&pool_id),
            percent = request.percent,
            capacity = candidate.capacity,
            "Selected reserve capacity candidate"
        );

        resolved.push(ResolvedCandidate {
            volume: request.volume.clone(),
            volume_id: volume.id.clone(),
            pool_id: pool_id.clone(),
            pool_name: pools.name_of(&pool_id).to_string(),
            percent: request.percent,
            capacity: candidate.capacity,
            candidate,
        });
    }

    let insufficient: Vec<String> = demand
        .iter()
        .filter(|(pool_id, bytes)| pools.by_id(pool_id).map_or(true, |p| **bytes > p.free_space))
        .map(|(pool_id, _)| pools.name_of(pool_id).to_string())
        .collect();
    if !insufficient.is_empty() {
        return Err(SnapError::CapacityInsufficient {
            pools: insufficient,
        });
    }

    Ok(resolved)
}

/// Location and value of the first run of ASCII digits
fn digit_run(label: &str) -> Option<(usize, usize, u64)> {
    let start = label.find(|c: char| c.is_ascii_digit())?;
    let len = label[start..]
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(label.len() - start);
    let value = label[start..start + len].parse().ok()?;
    Some((start, len, value))
}

/// Replace the first digit run with `number`, keeping its zero padding
fn with_number(label: &str, number: u64) -> String {
    match digit_run(label) {
        Some((start, len, _)) => format!(
            "{}{:0width$}{}",
            &label[..start],
            number,
            &label[start + len..],
            width = len
        ),
        None => format!("{}{}", label, number),
    }
}

/// Offset the label's number by the candidate's batch position and bump it
/// past anything already taken
fn unique_label(label: &str, offset: u64, taken: &HashSet<String>, volumes: &VolumeIndex) -> String {
    let base = digit_run(label).map(|(_, _, n)| n);
    let mut number = base.unwrap_or(0) + offset;
    let mut candidate = match base {
        None if offset == 0 => label.to_string(),
        _ => with_number(label, number),
    };

    while taken.contains(&candidate) || volumes.by_name(&candidate).is_some() {
        number += 1;
        candidate = with_number(label, number);
    }
    candidate
}
