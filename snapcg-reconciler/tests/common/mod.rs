//! Shared fixtures for reconciler integration tests

#![allow(dead_code)]

use std::sync::Arc;

use snapcg_array::{ArrayClient, SimulatedArray, GIB, TIB};
use snapcg_reconciler::{GroupSettings, Operation, PitSelector, ReconcileReport, Reconciler, VolumeSpec};

/// 2024-03-01T03:00:00Z
pub const MAR1_0300: u64 = 1_709_262_000;
/// 2024-03-01T14:00:00Z
pub const MAR1_1400: u64 = 1_709_301_600;

pub struct Fixture {
    pub array: Arc<SimulatedArray>,
    pub pool: String,
    pub reconciler: Reconciler,
}

impl Fixture {
    /// Array with `pool1` (1 TiB free) and 100 GiB volumes `vol1` and `vol2`
    pub fn new() -> Self {
        let array = Arc::new(SimulatedArray::new());
        let pool = array.add_pool("pool1", TIB);
        array.add_volume("vol1", 100 * GIB, &pool);
        array.add_volume("vol2", 100 * GIB, &pool);
        let reconciler = Reconciler::new(ArrayClient::new(array.clone()));
        Self {
            array,
            pool,
            reconciler,
        }
    }

    /// Group `g1` with both volumes as members, each with a 20 GiB reserve
    pub fn with_group() -> (Self, String) {
        let fixture = Self::new();
        let group = fixture.array.create_group("g1");
        fixture.array.add_member("g1", "vol1", &[20 * GIB], &fixture.pool);
        fixture.array.add_member("g1", "vol2", &[20 * GIB], &fixture.pool);
        (fixture, group)
    }

    pub async fn run(&self, operation: &Operation) -> snapcg_core::Result<ReconcileReport> {
        self.reconciler.reconcile(operation, false).await
    }

    pub async fn run_ok(&self, operation: &Operation) -> ReconcileReport {
        self.run(operation).await.expect("reconciliation failed")
    }

    /// Take a PIT event, optionally named
    pub async fn take_pit(&self, name: Option<&str>) {
        self.run_ok(&Operation::CreatePit {
            group: "g1".to_string(),
            name: name.map(str::to_string),
            description: String::new(),
        })
        .await;
    }

    /// Paths of every mutating request, in order
    pub fn mutation_paths(&self) -> Vec<String> {
        self.array
            .mutations()
            .into_iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }
}

pub fn ensure_group(volumes: Vec<VolumeSpec>) -> Operation {
    Operation::EnsureGroup {
        group: "g1".to_string(),
        settings: GroupSettings::default(),
        volumes,
    }
}

pub fn selector(name: Option<&str>, timestamp: Option<&str>) -> PitSelector {
    PitSelector::from_parts(name, timestamp)
        .expect("invalid selector")
        .expect("empty selector")
}
