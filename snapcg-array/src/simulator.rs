//! In-memory array simulator
//!
//! Used for testing and development. Implements [`ArrayTransport`] over an
//! in-memory model of volumes, storage pools, reserve-capacity chains,
//! consistency groups, snapshot images, views and the key-value store.
//!
//! Candidate requests mirror the firmware's sequential auto-naming: the next
//! member-volume label is only consumed when a volume is actually created,
//! so a batch of candidates shares one label unless the caller renumbers.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

use crate::transport::{ArrayResponse, ArrayTransport, Method, Result};
use snapcg_core::{ConsistencyGroupRecord, SnapshotImage};

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const TIB: u64 = 1024 * GIB;

/// One request as received by the simulator
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub path: String,
    pub body: Option<Value>,
}

impl RecordedRequest {
    /// Whether the request changes array state
    pub fn is_mutation(&self) -> bool {
        self.method != "GET" && self.path != "repositories/concat/single"
    }
}

#[derive(Debug, Clone)]
struct SimVolume {
    id: String,
    name: String,
    size: u64,
    pool: String,
}

#[derive(Debug, Clone)]
struct SimPool {
    id: String,
    name: String,
    free: u64,
}

#[derive(Debug, Clone)]
struct SimGroup {
    id: String,
    label: String,
    full_warn: u64,
    auto_delete: u64,
    rollback_priority: String,
    rep_full_policy: String,
    sequence_numbers: Vec<u64>,
    next_sequence: u64,
    /// (base volume id, concat id)
    members: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct SimImage {
    id: String,
    group: String,
    sequence: u64,
    timestamp: u64,
    base: String,
}

#[derive(Debug, Clone)]
struct SimView {
    id: String,
    group: String,
    name: String,
}

#[derive(Debug, Default)]
struct State {
    volumes: Vec<SimVolume>,
    pools: Vec<SimPool>,
    concat: HashMap<String, Vec<String>>,
    groups: Vec<SimGroup>,
    images: Vec<SimImage>,
    views: Vec<SimView>,
    key_values: BTreeMap<String, String>,
    rollbacks: Vec<Vec<String>>,
    requests: Vec<RecordedRequest>,
    failures: Vec<(&'static str, String)>,
    next_id: u64,
    next_label: u64,
    clock: u64,
}

type Reply = std::result::Result<Value, (u16, String)>;

fn reject(status: u16, message: impl Into<String>) -> (u16, String) {
    (status, message.into())
}

fn decode_key(segment: &str) -> std::result::Result<String, (u16, String)> {
    urlencoding::decode(segment)
        .map(|key| key.into_owned())
        .map_err(|_| reject(400, format!("malformed key {}", segment)))
}

impl State {
    fn new_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:08}", prefix, self.next_id)
    }

    fn volume(&self, id: &str) -> Option<&SimVolume> {
        self.volumes.iter().find(|v| v.id == id)
    }

    fn group_index(&self, id: &str) -> std::result::Result<usize, (u16, String)> {
        self.groups
            .iter()
            .position(|g| g.id == id)
            .ok_or_else(|| reject(404, format!("consistency group {} not found", id)))
    }

    fn group_json(&self, group: &SimGroup) -> Value {
        json!({
            "id": group.id,
            "cgRef": group.id,
            "label": group.label,
            "fullWarnThreshold": group.full_warn,
            "autoDeleteLimit": group.auto_delete,
            "rollbackPriority": group.rollback_priority,
            "repFullPolicy": group.rep_full_policy,
            "uniqueSequenceNumber": group.sequence_numbers,
        })
    }

    fn chain_bytes(&self, concat_id: &str) -> u64 {
        self.concat
            .get(concat_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|m| self.volume(m))
                    .map(|v| v.size)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn free_volume(&mut self, volume_id: &str) {
        if let Some(pos) = self.volumes.iter().position(|v| v.id == volume_id) {
            let volume = self.volumes.remove(pos);
            if let Some(pool) = self.pools.iter_mut().find(|p| p.id == volume.pool) {
                pool.free += volume.size;
            }
        }
    }

    fn drop_concat(&mut self, concat_id: &str) {
        if let Some(members) = self.concat.remove(concat_id) {
            for member in members {
                self.free_volume(&member);
            }
        }
    }

    /// Validate a candidate and return (label, pool, capacity)
    fn check_candidate(&self, candidate: &Value) -> std::result::Result<(String, String, u64), (u16, String)> {
        let new_vol = candidate
            .get("newVolCandidate")
            .ok_or_else(|| reject(422, "candidate has no newVolCandidate"))?;
        let label = new_vol
            .get("memberVolumeLabel")
            .and_then(Value::as_str)
            .ok_or_else(|| reject(422, "candidate has no memberVolumeLabel"))?
            .to_string();
        let pool = new_vol
            .get("volumeGroupId")
            .and_then(Value::as_str)
            .ok_or_else(|| reject(422, "candidate has no volumeGroupId"))?
            .to_string();
        let capacity = new_vol
            .get("capacity")
            .and_then(|c| c.as_str().and_then(|s| s.parse().ok()).or_else(|| c.as_u64()))
            .ok_or_else(|| reject(422, "candidate has no capacity"))?;

        if self.volumes.iter().any(|v| v.name == label) {
            return Err(reject(422, format!("volume label {} already in use", label)));
        }
        let free = self
            .pools
            .iter()
            .find(|p| p.id == pool)
            .map(|p| p.free)
            .ok_or_else(|| reject(422, format!("storage pool {} not found", pool)))?;
        if capacity > free {
            return Err(reject(422, format!("insufficient space in storage pool {}", pool)));
        }
        Ok((label, pool, capacity))
    }

    fn allocate(&mut self, candidate: &Value) -> std::result::Result<String, (u16, String)> {
        let (label, pool, capacity) = self.check_candidate(candidate)?;
        let id = self.new_id("RV");

        if let Some(pool) = self.pools.iter_mut().find(|p| p.id == pool) {
            pool.free -= capacity;
        }
        let number: u64 = label
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .unwrap_or(self.next_label);
        self.next_label = self.next_label.max(number) + 1;

        self.volumes.push(SimVolume {
            id: id.clone(),
            name: label,
            size: capacity,
            pool,
        });
        Ok(id)
    }

    fn candidates(&self, body: &Value) -> Reply {
        let request = body
            .get("candidateRequest")
            .ok_or_else(|| reject(422, "missing candidateRequest"))?;
        let base_ref = request
            .get("baseVolumeRef")
            .and_then(Value::as_str)
            .ok_or_else(|| reject(422, "missing baseVolumeRef"))?;
        let pct = request
            .get("percentCapacity")
            .and_then(Value::as_u64)
            .ok_or_else(|| reject(422, "missing percentCapacity"))?;
        let base = self
            .volume(base_ref)
            .ok_or_else(|| reject(404, format!("volume {} not found", base_ref)))?;

        let capacity = base.size * pct / 100;
        let label = format!("repos_{:04}", self.next_label);
        let candidates: Vec<Value> = self
            .pools
            .iter()
            .filter(|p| p.free >= capacity)
            .map(|p| {
                json!({
                    "volumeGroupId": p.id,
                    "capacity": capacity.to_string(),
                    "baseMappableObjectId": base.id,
                    "candidate": {
                        "candidateType": "newVol",
                        "newVolCandidate": {
                            "memberVolumeLabel": label,
                            "volumeGroupId": p.id,
                            "capacity": capacity.to_string(),
                        }
                    }
                })
            })
            .collect();
        Ok(Value::Array(candidates))
    }

    fn route(&mut self, method: Method, path: &str, body: Option<&Value>) -> Reply {
        let segments: Vec<&str> = path.split('/').collect();
        let empty = Value::Null;
        let body = body.unwrap_or(&empty);

        match (method, segments.as_slice()) {
            (Method::Get, ["volumes"]) => Ok(Value::Array(
                self.volumes
                    .iter()
                    .map(|v| {
                        json!({
                            "id": v.id,
                            "name": v.name,
                            "totalSizeInBytes": v.size.to_string(),
                            "volumeGroupRef": v.pool,
                        })
                    })
                    .collect(),
            )),
            (Method::Get, ["thin-volumes"]) => Ok(json!([])),
            (Method::Get, ["storage-pools"]) => Ok(Value::Array(
                self.pools
                    .iter()
                    .map(|p| json!({"id": p.id, "name": p.name, "freeSpace": p.free.to_string()}))
                    .collect(),
            )),
            (Method::Get, ["repositories", "concat"]) => Ok(Value::Array(
                self.concat
                    .iter()
                    .map(|(id, members)| json!({"id": id, "memberRefs": members}))
                    .collect(),
            )),
            (Method::Post, ["repositories", "concat", "single"]) => self.candidates(body),
            (Method::Post, ["repositories", "concat", concat_id, "expand"]) => {
                let concat_id = concat_id.to_string();
                if !self.concat.contains_key(&concat_id) {
                    return Err(reject(404, format!("repository {} not found", concat_id)));
                }
                let candidate = body
                    .get("expansionCandidate")
                    .ok_or_else(|| reject(422, "missing expansionCandidate"))?
                    .clone();
                let member = self.allocate(&candidate)?;
                if let Some(members) = self.concat.get_mut(&concat_id) {
                    members.push(member);
                }
                Ok(json!({"id": concat_id}))
            }
            (Method::Post, ["symbol", "trimConcatVolume"]) => {
                let concat_id = body
                    .get("concatVol")
                    .and_then(Value::as_str)
                    .ok_or_else(|| reject(422, "missing concatVol"))?
                    .to_string();
                let count = body
                    .get("trimCount")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| reject(422, "missing trimCount"))? as usize;
                let members = self
                    .concat
                    .get(&concat_id)
                    .cloned()
                    .ok_or_else(|| reject(404, format!("repository {} not found", concat_id)))?;
                if count == 0 || count >= members.len() {
                    return Err(reject(422, "trim would remove the initial repository member"));
                }
                let keep = members.len() - count;
                for member in &members[keep..] {
                    self.free_volume(member);
                }
                if let Some(chain) = self.concat.get_mut(&concat_id) {
                    chain.truncate(keep);
                }
                Ok(json!("ok"))
            }
            (Method::Post, ["symbol", "startPITRollback"]) => {
                let refs: Vec<String> = body
                    .get("pitRef")
                    .and_then(Value::as_array)
                    .ok_or_else(|| reject(422, "missing pitRef"))?
                    .iter()
                    .filter_map(|r| r.as_str().map(str::to_string))
                    .collect();
                if refs.is_empty() || refs.iter().any(|r| !self.images.iter().any(|i| &i.id == r)) {
                    return Err(reject(422, "unknown snapshot image reference"));
                }
                self.rollbacks.push(refs);
                Ok(json!("ok"))
            }
            (Method::Get, ["consistency-groups"]) => Ok(Value::Array(
                self.groups.iter().map(|g| self.group_json(g)).collect(),
            )),
            (Method::Post, ["consistency-groups"]) => {
                let name = body
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| reject(422, "missing name"))?
                    .to_string();
                if self.groups.iter().any(|g| g.label == name) {
                    return Err(reject(422, format!("consistency group {} already exists", name)));
                }
                let id = self.new_id("CG");
                let group = SimGroup {
                    id,
                    label: name,
                    full_warn: body.get("fullWarnThresholdPercent").and_then(Value::as_u64).unwrap_or(75),
                    auto_delete: body.get("autoDeleteThreshold").and_then(Value::as_u64).unwrap_or(32),
                    rollback_priority: body
                        .get("rollbackPriority")
                        .and_then(Value::as_str)
                        .unwrap_or("medium")
                        .to_string(),
                    rep_full_policy: body
                        .get("repositoryFullPolicy")
                        .and_then(Value::as_str)
                        .unwrap_or("purgepit")
                        .to_string(),
                    sequence_numbers: Vec::new(),
                    next_sequence: 1,
                    members: Vec::new(),
                };
                let reply = self.group_json(&group);
                self.groups.push(group);
                Ok(reply)
            }
            (Method::Post, ["consistency-groups", group_id]) => {
                let idx = self.group_index(group_id)?;
                let group = &mut self.groups[idx];
                if let Some(v) = body.get("fullWarnThresholdPercent").and_then(Value::as_u64) {
                    group.full_warn = v;
                }
                if let Some(v) = body.get("autoDeleteThreshold").and_then(Value::as_u64) {
                    group.auto_delete = v;
                }
                if let Some(v) = body.get("rollbackPriority").and_then(Value::as_str) {
                    group.rollback_priority = v.to_string();
                }
                if let Some(v) = body.get("repositoryFullPolicy").and_then(Value::as_str) {
                    group.rep_full_policy = v.to_string();
                }
                let group = self.groups[idx].clone();
                Ok(self.group_json(&group))
            }
            (Method::Delete, ["consistency-groups", group_id]) => {
                let idx = self.group_index(group_id)?;
                let group = self.groups.remove(idx);
                for (_, concat_id) in &group.members {
                    self.drop_concat(concat_id);
                }
                self.images.retain(|i| i.group != group.id);
                self.views.retain(|v| v.group != group.id);
                Ok(Value::Null)
            }
            (Method::Get, ["consistency-groups", group_id, "member-volumes"]) => {
                let idx = self.group_index(group_id)?;
                Ok(Value::Array(
                    self.groups[idx]
                        .members
                        .iter()
                        .map(|(volume, concat_id)| {
                            json!({
                                "volumeId": volume,
                                "totalRepositoryCapacity": self.chain_bytes(concat_id).to_string(),
                                "repositoryVolume": concat_id,
                            })
                        })
                        .collect(),
                ))
            }
            (Method::Post, ["consistency-groups", group_id, "member-volumes", "batch"]) => {
                let idx = self.group_index(group_id)?;
                let requests = body
                    .get("volumeToCandidates")
                    .and_then(Value::as_object)
                    .ok_or_else(|| reject(422, "missing volumeToCandidates"))?
                    .clone();

                let mut labels = Vec::new();
                for (volume, candidate) in &requests {
                    if self.volume(volume).is_none() {
                        return Err(reject(404, format!("volume {} not found", volume)));
                    }
                    if self.groups[idx].members.iter().any(|(v, _)| v == volume) {
                        return Err(reject(422, format!("volume {} is already a member", volume)));
                    }
                    let (label, _, _) = self.check_candidate(candidate)?;
                    if labels.contains(&label) {
                        return Err(reject(422, format!("duplicate member volume label {}", label)));
                    }
                    labels.push(label);
                }

                for (volume, candidate) in &requests {
                    let member = self.allocate(candidate)?;
                    let concat_id = self.new_id("CV");
                    self.concat.insert(concat_id.clone(), vec![member]);
                    self.groups[idx].members.push((volume.clone(), concat_id));
                }
                Ok(json!([]))
            }
            (Method::Delete, ["consistency-groups", group_id, "member-volumes", volume_id]) => {
                let idx = self.group_index(group_id)?;
                let volume_id = volume_id.to_string();
                let pos = self.groups[idx]
                    .members
                    .iter()
                    .position(|(v, _)| *v == volume_id)
                    .ok_or_else(|| reject(404, format!("volume {} is not a member", volume_id)))?;
                let (_, concat_id) = self.groups[idx].members.remove(pos);
                self.drop_concat(&concat_id);
                let group = self.groups[idx].id.clone();
                self.images.retain(|i| !(i.group == group && i.base == volume_id));
                Ok(Value::Null)
            }
            (Method::Get, ["consistency-groups", group_id, "snapshots"]) => {
                self.group_index(group_id)?;
                Ok(Value::Array(
                    self.images
                        .iter()
                        .filter(|i| i.group == *group_id)
                        .map(|i| {
                            json!({
                                "id": i.id,
                                "pitTimestamp": i.timestamp.to_string(),
                                "pitSequenceNumber": i.sequence.to_string(),
                                "baseVol": i.base,
                                "consistencyGroupId": i.group,
                            })
                        })
                        .collect(),
                ))
            }
            (Method::Post, ["consistency-groups", group_id, "snapshots"]) => {
                let idx = self.group_index(group_id)?;
                if self.groups[idx].members.is_empty() {
                    return Err(reject(422, "consistency group has no member volumes"));
                }
                let sequence = self.groups[idx].next_sequence;
                self.groups[idx].next_sequence += 1;
                self.groups[idx].sequence_numbers.push(sequence);

                let timestamp = self.clock;
                self.clock += 60;
                let bases: Vec<String> = self.groups[idx].members.iter().map(|(v, _)| v.clone()).collect();
                let group = self.groups[idx].id.clone();
                let mut created = Vec::new();
                for base in bases {
                    let id = self.new_id("PIT");
                    created.push(json!({
                        "id": id,
                        "pitTimestamp": timestamp.to_string(),
                        "pitSequenceNumber": sequence.to_string(),
                        "baseVol": base,
                        "consistencyGroupId": group,
                    }));
                    self.images.push(SimImage {
                        id,
                        group: group.clone(),
                        sequence,
                        timestamp,
                        base,
                    });
                }
                Ok(Value::Array(created))
            }
            (Method::Delete, ["consistency-groups", group_id, "snapshots", sequence]) => {
                let idx = self.group_index(group_id)?;
                let sequence: u64 = sequence
                    .parse()
                    .map_err(|_| reject(422, format!("invalid sequence number {}", sequence)))?;
                let group = self.groups[idx].id.clone();
                let before = self.images.len();
                self.images.retain(|i| !(i.group == group && i.sequence == sequence));
                if self.images.len() == before {
                    return Err(reject(404, format!("no images with sequence number {}", sequence)));
                }
                self.groups[idx].sequence_numbers.retain(|s| *s != sequence);
                Ok(Value::Null)
            }
            (Method::Get, ["consistency-groups", group_id, "views"]) => {
                self.group_index(group_id)?;
                Ok(Value::Array(
                    self.views
                        .iter()
                        .filter(|v| v.group == *group_id)
                        .map(|v| json!({"id": v.id, "name": v.name}))
                        .collect(),
                ))
            }
            (Method::Post, ["consistency-groups", group_id, "views", "batch"]) => {
                let idx = self.group_index(group_id)?;
                let group = self.groups[idx].id.clone();
                let name = body
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| reject(422, "missing name"))?
                    .to_string();
                if self.views.iter().any(|v| v.group == group && v.name == name) {
                    return Err(reject(422, format!("view {} already exists", name)));
                }
                let requests = body
                    .get("requests")
                    .and_then(Value::as_array)
                    .ok_or_else(|| reject(422, "missing requests"))?;
                for request in requests {
                    let pit = request.get("pitId").and_then(Value::as_str).unwrap_or_default();
                    if !self.images.iter().any(|i| i.id == pit) {
                        return Err(reject(422, format!("snapshot image {} not found", pit)));
                    }
                }
                let id = self.new_id("VW");
                self.views.push(SimView {
                    id: id.clone(),
                    group,
                    name: name.clone(),
                });
                Ok(json!({"id": id, "name": name}))
            }
            (Method::Delete, ["consistency-groups", group_id, "views", view_id]) => {
                self.group_index(group_id)?;
                let before = self.views.len();
                self.views.retain(|v| v.id != *view_id);
                if self.views.len() == before {
                    return Err(reject(404, format!("view {} not found", view_id)));
                }
                Ok(Value::Null)
            }
            (Method::Get, ["key-values"]) => Ok(Value::Array(
                self.key_values
                    .iter()
                    .map(|(k, v)| json!({"key": k, "value": v}))
                    .collect(),
            )),
            (Method::Get, ["key-values", key]) => {
                let key = decode_key(key)?;
                self.key_values
                    .get(&key)
                    .map(|v| json!({"key": key, "value": v}))
                    .ok_or_else(|| reject(404, format!("key {} not found", key)))
            }
            (Method::Post, ["key-values", key]) => {
                let key = decode_key(key)?;
                let value = match body {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                self.key_values.insert(key.clone(), value.clone());
                Ok(json!({"key": key, "value": value}))
            }
            (Method::Delete, ["key-values", key]) => {
                let key = decode_key(key)?;
                self.key_values
                    .remove(&key)
                    .map(|_| Value::Null)
                    .ok_or_else(|| reject(404, format!("key {} not found", key)))
            }
            _ => Err(reject(404, format!("no route for {} {}", method, path))),
        }
    }
}

/// In-memory storage array
#[derive(Default)]
pub struct SimulatedArray {
    state: Mutex<State>,
}

impl SimulatedArray {
    /// Create an empty array; the clock starts at 2024-03-01T00:00:00Z
    pub fn new() -> Self {
        let array = Self::default();
        {
            let mut state = array.state.lock();
            state.clock = 1_709_251_200;
            state.next_label = 1;
        }
        array
    }

    pub fn add_pool(&self, name: &str, free: u64) -> String {
        let mut state = self.state.lock();
        let id = state.new_id("SP");
        state.pools.push(SimPool {
            id: id.clone(),
            name: name.to_string(),
            free,
        });
        id
    }

    pub fn add_volume(&self, name: &str, size: u64, pool_id: &str) -> String {
        let mut state = self.state.lock();
        let id = state.new_id("V");
        state.volumes.push(SimVolume {
            id: id.clone(),
            name: name.to_string(),
            size,
            pool: pool_id.to_string(),
        });
        id
    }

    /// Create a group with default settings
    pub fn create_group(&self, name: &str) -> String {
        let mut state = self.state.lock();
        let id = state.new_id("CG");
        state.groups.push(SimGroup {
            id: id.clone(),
            label: name.to_string(),
            full_warn: 75,
            auto_delete: 32,
            rollback_priority: "medium".to_string(),
            rep_full_policy: "purgepit".to_string(),
            sequence_numbers: Vec::new(),
            next_sequence: 1,
            members: Vec::new(),
        });
        id
    }

    /// Add `volume` to `group` with a reserve chain of the given member sizes
    /// (head first), allocated from `pool_id`
    pub fn add_member(&self, group: &str, volume: &str, chain: &[u64], pool_id: &str) -> String {
        let mut state = self.state.lock();
        let volume_id = state
            .volumes
            .iter()
            .find(|v| v.name == volume)
            .map(|v| v.id.clone())
            .unwrap_or_default();

        let mut members = Vec::new();
        for size in chain {
            let id = state.new_id("RV");
            let label = format!("repos_{:04}", state.next_label);
            state.next_label += 1;
            if let Some(pool) = state.pools.iter_mut().find(|p| p.id == pool_id) {
                pool.free = pool.free.saturating_sub(*size);
            }
            state.volumes.push(SimVolume {
                id: id.clone(),
                name: label,
                size: *size,
                pool: pool_id.to_string(),
            });
            members.push(id);
        }

        let concat_id = state.new_id("CV");
        state.concat.insert(concat_id.clone(), members);
        if let Some(g) = state.groups.iter_mut().find(|g| g.label == group) {
            g.members.push((volume_id, concat_id.clone()));
        }
        concat_id
    }

    /// Insert an image directly, bypassing sequence allocation
    pub fn inject_image(&self, group: &str, volume: &str, timestamp: u64, sequence: u64) -> String {
        let mut state = self.state.lock();
        let id = state.new_id("PIT");
        let base = state
            .volumes
            .iter()
            .find(|v| v.name == volume)
            .map(|v| v.id.clone())
            .unwrap_or_default();
        let group_id = match state.groups.iter_mut().find(|g| g.label == group) {
            Some(g) => {
                if !g.sequence_numbers.contains(&sequence) {
                    g.sequence_numbers.push(sequence);
                    g.sequence_numbers.sort_unstable();
                }
                g.next_sequence = g.next_sequence.max(sequence + 1);
                g.id.clone()
            }
            None => String::new(),
        };
        state.images.push(SimImage {
            id: id.clone(),
            group: group_id,
            sequence,
            timestamp,
            base,
        });
        id
    }

    pub fn set_clock(&self, unix_secs: u64) {
        self.state.lock().clock = unix_secs;
    }

    /// Make every `method path` request fail with status 500
    pub fn fail_on(&self, method: &'static str, path: &str) {
        self.state.lock().failures.push((method, path.to_string()));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn put_key_value(&self, key: &str, value: &str) {
        self.state.lock().key_values.insert(key.to_string(), value.to_string());
    }

    pub fn key_value(&self, key: &str) -> Option<String> {
        self.state.lock().key_values.get(key).cloned()
    }

    pub fn key_values(&self) -> BTreeMap<String, String> {
        self.state.lock().key_values.clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    pub fn request_count(&self, method: &str, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    /// Requests that changed (or tried to change) array state
    pub fn mutations(&self) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.is_mutation())
            .cloned()
            .collect()
    }

    pub fn group(&self, name: &str) -> Option<ConsistencyGroupRecord> {
        let state = self.state.lock();
        let group = state.groups.iter().find(|g| g.label == name)?;
        serde_json::from_value(state.group_json(group)).ok()
    }

    /// Names of the base volumes in `group`
    pub fn members(&self, group: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .groups
            .iter()
            .find(|g| g.label == group)
            .map(|g| {
                g.members
                    .iter()
                    .filter_map(|(v, _)| state.volume(v).map(|v| v.name.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Member sizes of the reserve chain of `volume` in `group`, head first
    pub fn chain(&self, group: &str, volume: &str) -> Vec<u64> {
        let state = self.state.lock();
        let Some(g) = state.groups.iter().find(|g| g.label == group) else {
            return Vec::new();
        };
        g.members
            .iter()
            .find(|(v, _)| state.volume(v).map(|v| v.name.as_str()) == Some(volume))
            .and_then(|(_, concat)| state.concat.get(concat))
            .map(|members| {
                members
                    .iter()
                    .filter_map(|m| state.volume(m))
                    .map(|v| v.size)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pool_free(&self, pool_id: &str) -> u64 {
        self.state
            .lock()
            .pools
            .iter()
            .find(|p| p.id == pool_id)
            .map(|p| p.free)
            .unwrap_or(0)
    }

    pub fn images(&self, group: &str) -> Vec<SnapshotImage> {
        let state = self.state.lock();
        let Some(g) = state.groups.iter().find(|g| g.label == group) else {
            return Vec::new();
        };
        state
            .images
            .iter()
            .filter(|i| i.group == g.id)
            .map(|i| SnapshotImage {
                id: i.id.clone(),
                pit_timestamp: i.timestamp,
                pit_sequence_number: i.sequence,
                base_vol: i.base.clone(),
            })
            .collect()
    }

    pub fn views(&self, group: &str) -> Vec<String> {
        let state = self.state.lock();
        let Some(g) = state.groups.iter().find(|g| g.label == group) else {
            return Vec::new();
        };
        state
            .views
            .iter()
            .filter(|v| v.group == g.id)
            .map(|v| v.name.clone())
            .collect()
    }

    pub fn rollbacks(&self) -> Vec<Vec<String>> {
        self.state.lock().rollbacks.clone()
    }
}

#[async_trait::async_trait]
impl ArrayTransport for SimulatedArray {
    async fn request(&self, path: &str, method: Method, data: Option<Value>) -> Result<ArrayResponse> {
        let path = path.trim_start_matches('/');
        let path = path.split('?').next().unwrap_or(path).to_string();
        let mut state = self.state.lock();

        state.requests.push(RecordedRequest {
            method: method.as_str(),
            path: path.clone(),
            body: data.clone(),
        });

        if state
            .failures
            .iter()
            .any(|(m, p)| *m == method.as_str() && *p == path)
        {
            return Ok(ArrayResponse::new(
                500,
                Some(json!({"errorMessage": "injected failure"})),
            ));
        }

        Ok(match state.route(method, &path, data.as_ref()) {
            Ok(Value::Null) => ArrayResponse::new(204, None),
            Ok(body) => ArrayResponse::new(200, Some(body)),
            Err((status, message)) => {
                ArrayResponse::new(status, Some(json!({ "errorMessage": message })))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_candidate_labels_collide_until_used() {
        let array = SimulatedArray::new();
        let pool = array.add_pool("pool1", TIB);
        let v1 = array.add_volume("vol1", 100 * GIB, &pool);
        let v2 = array.add_volume("vol2", 100 * GIB, &pool);

        let mut labels = Vec::new();
        for volume in [&v1, &v2] {
            let body = json!({"candidateRequest": {"baseVolumeRef": volume, "percentCapacity": 10, "concatVolumeType": "snapshot"}});
            let response = array
                .request("repositories/concat/single", Method::Post, Some(body))
                .await
                .unwrap();
            let label = response.body.unwrap()[0]["candidate"]["newVolCandidate"]["memberVolumeLabel"].clone();
            labels.push(label);
        }
        assert_eq!(labels[0], labels[1]);
    }

    #[tokio::test]
    async fn test_trim_refuses_head_member() {
        let array = SimulatedArray::new();
        let pool = array.add_pool("pool1", TIB);
        array.add_volume("vol1", 100 * GIB, &pool);
        array.create_group("g1");
        let concat = array.add_member("g1", "vol1", &[10 * GIB, 5 * GIB], &pool);

        let body = json!({"concatVol": concat, "trimCount": 2, "retainRepositoryMembers": false});
        let response = array
            .request("symbol/trimConcatVolume", Method::Post, Some(body))
            .await
            .unwrap();
        assert_eq!(response.status, 422);
        assert_eq!(array.chain("g1", "vol1"), vec![10 * GIB, 5 * GIB]);
    }

    #[tokio::test]
    async fn test_snapshot_sequence_numbers_increase() {
        let array = SimulatedArray::new();
        let pool = array.add_pool("pool1", TIB);
        array.add_volume("vol1", 100 * GIB, &pool);
        let group = array.create_group("g1");
        array.add_member("g1", "vol1", &[20 * GIB], &pool);

        let path = format!("consistency-groups/{}/snapshots", group);
        array.request(&path, Method::Post, None).await.unwrap();
        array.request(&path, Method::Post, None).await.unwrap();

        let sequences: Vec<u64> = array.images("g1").iter().map(|i| i.pit_sequence_number).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(array.group("g1").unwrap().unique_sequence_number, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let array = SimulatedArray::new();
        array.fail_on("GET", "volumes");
        let response = array.request("volumes", Method::Get, None).await.unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(array.request_count("GET", "volumes"), 1);
    }
}
