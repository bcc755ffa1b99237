//! Consistency-group reconciliation against the simulated array
//!
//! Run with: cargo test --test group_test -p snapcg-reconciler

mod common;

use common::{ensure_group, Fixture};
use serde_json::json;
use snapcg_array::{endpoints, GIB};
use snapcg_core::{ReserveFullPolicy, RollbackPriority, SnapError};
use snapcg_reconciler::{GroupSettings, Operation, VolumeSpec};

// ============================================================================
// Creation and Idempotence
// ============================================================================

#[tokio::test]
async fn test_create_group_with_single_candidate() {
    let fixture = Fixture::new();
    let op = ensure_group(vec![VolumeSpec::named("vol1").with_reserve(20)]);

    let report = fixture.run_ok(&op).await;
    assert!(report.changed);
    assert_eq!(report.applied, vec!["create group", "add members vol1"]);

    let candidate_requests: Vec<_> = fixture
        .array
        .requests()
        .into_iter()
        .filter(|r| r.path == endpoints::CONCAT_CANDIDATES)
        .collect();
    assert_eq!(candidate_requests.len(), 1);
    let body = candidate_requests[0].body.as_ref().expect("candidate request body");
    assert_eq!(body["candidateRequest"]["percentCapacity"], 20);

    assert!(fixture.array.group("g1").is_some());
    assert_eq!(fixture.array.members("g1"), vec!["vol1"]);
    assert_eq!(fixture.array.chain("g1", "vol1"), vec![20 * GIB]);

    // Same request again
    fixture.array.clear_requests();
    let report = fixture.run_ok(&op).await;
    assert!(!report.changed);
    assert!(report.change_set.is_empty());
    assert!(fixture.array.mutations().is_empty());
    assert_eq!(fixture.array.request_count("POST", endpoints::CONCAT_CANDIDATES), 0);
}

#[tokio::test]
async fn test_create_group_sends_all_settings() {
    let fixture = Fixture::new();
    let op = Operation::EnsureGroup {
        group: "g1".to_string(),
        settings: GroupSettings {
            alert_threshold_pct: 60,
            maximum_snapshots: 8,
            rollback_priority: RollbackPriority::High,
            full_policy: ReserveFullPolicy::Reject,
        },
        volumes: vec![VolumeSpec::named("vol1")],
    };

    fixture.run_ok(&op).await;

    let create = &fixture.array.mutations()[0];
    assert_eq!(create.path, endpoints::CONSISTENCY_GROUPS);
    assert_eq!(
        create.body,
        Some(json!({
            "name": "g1",
            "fullWarnThresholdPercent": 60,
            "autoDeleteThreshold": 8,
            "repositoryFullPolicy": "failbasewrites",
            "rollbackPriority": "high",
        }))
    );

    let group = fixture.array.group("g1").expect("group created");
    assert_eq!(group.full_warn_threshold, 60);
    assert_eq!(group.auto_delete_limit, 8);
    assert_eq!(fixture.array.chain("g1", "vol1"), vec![40 * GIB]);

    assert!(!fixture.run_ok(&op).await.changed);
}

#[tokio::test]
async fn test_batch_member_labels_are_unique() {
    let fixture = Fixture::new();
    let op = ensure_group(vec![
        VolumeSpec::named("vol1").with_reserve(20),
        VolumeSpec::named("vol2").with_reserve(30),
    ]);

    let report = fixture.run_ok(&op).await;
    assert_eq!(report.applied, vec!["create group", "add members vol1, vol2"]);

    let batch = fixture
        .array
        .mutations()
        .into_iter()
        .find(|r| r.path.ends_with("member-volumes/batch"))
        .expect("member batch request");
    let candidates = batch.body.expect("batch body")["volumeToCandidates"].clone();
    let mut labels: Vec<String> = candidates
        .as_object()
        .expect("candidate map")
        .values()
        .map(|c| c["newVolCandidate"]["memberVolumeLabel"].as_str().unwrap_or_default().to_string())
        .collect();
    labels.sort();
    assert_eq!(labels, vec!["repos_0001", "repos_0002"]);

    assert_eq!(fixture.array.chain("g1", "vol1"), vec![20 * GIB]);
    assert_eq!(fixture.array.chain("g1", "vol2"), vec![30 * GIB]);
    assert!(!fixture.run_ok(&op).await.changed);
}

#[tokio::test]
async fn test_dry_run_makes_no_mutations() {
    let fixture = Fixture::new();
    let op = ensure_group(vec![VolumeSpec::named("vol1").with_reserve(20)]);

    let report = fixture.reconciler.reconcile(&op, true).await.unwrap();
    assert!(report.changed);
    assert!(report.dry_run);
    assert!(report.applied.is_empty());
    assert_eq!(report.change_set.steps(), vec!["create group", "add members vol1"]);
    assert!(fixture.array.mutations().is_empty());
    assert!(fixture.array.group("g1").is_none());

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["operation"], "ensure_group");
    assert_eq!(value["change_set"]["changes"][0]["action"], "create_group");
}

// ============================================================================
// Settings and Membership
// ============================================================================

#[tokio::test]
async fn test_update_sends_only_changed_settings() {
    let (fixture, group_id) = Fixture::with_group();
    let op = Operation::EnsureGroup {
        group: "g1".to_string(),
        settings: GroupSettings {
            alert_threshold_pct: 80,
            ..Default::default()
        },
        volumes: vec![
            VolumeSpec::named("vol1").with_reserve(20),
            VolumeSpec::named("vol2").with_reserve(20),
        ],
    };

    let report = fixture.run_ok(&op).await;
    assert_eq!(report.applied, vec!["update group settings"]);

    let mutations = fixture.array.mutations();
    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].path, endpoints::group(&group_id));
    assert_eq!(
        mutations[0].body,
        Some(json!({"name": "g1", "fullWarnThresholdPercent": 80}))
    );
    assert_eq!(fixture.array.group("g1").unwrap().full_warn_threshold, 80);
}

#[tokio::test]
async fn test_undeclared_member_is_removed() {
    let (fixture, _) = Fixture::with_group();
    let op = ensure_group(vec![VolumeSpec::named("vol1").with_reserve(20)]);

    let report = fixture.run_ok(&op).await;
    assert_eq!(report.applied, vec!["remove member vol2"]);
    assert_eq!(fixture.array.members("g1"), vec!["vol1"]);
    assert!(!fixture.run_ok(&op).await.changed);
}

#[tokio::test]
async fn test_new_member_is_added() {
    let fixture = Fixture::new();
    fixture.array.create_group("g1");
    fixture.array.add_member("g1", "vol1", &[20 * GIB], &fixture.pool);

    let op = ensure_group(vec![
        VolumeSpec::named("vol1").with_reserve(20),
        VolumeSpec::named("vol2").with_reserve(10),
    ]);
    let report = fixture.run_ok(&op).await;
    assert_eq!(report.applied, vec!["add members vol2"]);
    assert_eq!(fixture.array.chain("g1", "vol2"), vec![10 * GIB]);
}

// ============================================================================
// Reserve Sizing
// ============================================================================

#[tokio::test]
async fn test_expand_reserve_by_difference() {
    let (fixture, _) = Fixture::with_group();
    let op = ensure_group(vec![
        VolumeSpec::named("vol1").with_reserve(35),
        VolumeSpec::named("vol2").with_reserve(20),
    ]);

    let report = fixture.run_ok(&op).await;
    assert_eq!(report.applied, vec!["expand reserve of vol1 by 15%"]);
    assert_eq!(fixture.array.chain("g1", "vol1"), vec![20 * GIB, 15 * GIB]);
    assert!(!fixture.run_ok(&op).await.changed);
}

#[tokio::test]
async fn test_trim_removes_tail_members() {
    let fixture = Fixture::new();
    fixture.array.create_group("g1");
    fixture
        .array
        .add_member("g1", "vol1", &[20 * GIB, 10 * GIB, 5 * GIB], &fixture.pool);

    let op = ensure_group(vec![VolumeSpec::named("vol1").with_reserve(20)]);
    let report = fixture.run_ok(&op).await;
    assert_eq!(report.applied, vec!["trim 2 reserve member(s) of vol1"]);
    assert_eq!(fixture.array.chain("g1", "vol1"), vec![20 * GIB]);

    let trim = fixture
        .array
        .mutations()
        .into_iter()
        .find(|r| r.path == endpoints::TRIM_CONCAT)
        .expect("trim request");
    assert_eq!(trim.body.unwrap()["trimCount"], 2);
}

#[tokio::test]
async fn test_trim_overshoot_is_expanded_back() {
    let fixture = Fixture::new();
    fixture.array.create_group("g1");
    fixture
        .array
        .add_member("g1", "vol1", &[20 * GIB, 10 * GIB], &fixture.pool);

    let op = ensure_group(vec![VolumeSpec::named("vol1").with_reserve(25)]);
    let report = fixture.run_ok(&op).await;
    assert_eq!(
        report.applied,
        vec!["trim 1 reserve member(s) of vol1", "expand reserve of vol1 by 5%"]
    );
    assert_eq!(fixture.array.chain("g1", "vol1"), vec![20 * GIB, 5 * GIB]);
    assert!(!fixture.run_ok(&op).await.changed);
}

#[tokio::test]
async fn test_trim_compensation_with_fractional_members() {
    let fixture = Fixture::new();
    fixture.array.add_volume("vol3", 1000 * GIB, &fixture.pool);
    fixture.array.create_group("g1");
    // 10.4% each, reported as 21% in total
    fixture
        .array
        .add_member("g1", "vol3", &[104 * GIB, 104 * GIB], &fixture.pool);

    let op = ensure_group(vec![VolumeSpec::named("vol3").with_reserve(11)]);
    let report = fixture.run_ok(&op).await;
    assert_eq!(
        report.applied,
        vec!["trim 1 reserve member(s) of vol3", "expand reserve of vol3 by 1%"]
    );
    assert_eq!(fixture.array.chain("g1", "vol3"), vec![104 * GIB, 10 * GIB]);
    assert!(!fixture.run_ok(&op).await.changed);
}

#[tokio::test]
async fn test_trim_blocked_by_images() {
    let fixture = Fixture::new();
    fixture.array.create_group("g1");
    fixture
        .array
        .add_member("g1", "vol1", &[20 * GIB, 10 * GIB], &fixture.pool);
    fixture.array.inject_image("g1", "vol1", common::MAR1_0300, 1);
    fixture.array.clear_requests();

    let op = ensure_group(vec![VolumeSpec::named("vol1").with_reserve(20)]);
    let err = fixture.run(&op).await.unwrap_err();
    assert_eq!(
        err,
        SnapError::TrimBlockedByImages {
            volume: "vol1".to_string()
        }
    );
    assert!(fixture.array.mutations().is_empty());
    assert_eq!(fixture.array.chain("g1", "vol1"), vec![20 * GIB, 10 * GIB]);
}

#[tokio::test]
async fn test_head_member_is_protected() {
    let fixture = Fixture::new();
    fixture.array.create_group("g1");
    fixture
        .array
        .add_member("g1", "vol1", &[20 * GIB, 10 * GIB], &fixture.pool);

    let op = ensure_group(vec![VolumeSpec::named("vol1").with_reserve(10)]);
    let err = fixture.run(&op).await.unwrap_err();
    assert_eq!(
        err,
        SnapError::HeadMemberProtected {
            volume: "vol1".to_string(),
            minimum_pct: 20,
        }
    );
    assert!(fixture.array.mutations().is_empty());
    assert_eq!(fixture.array.chain("g1", "vol1"), vec![20 * GIB, 10 * GIB]);
}

// ============================================================================
// Capacity Pre-flight
// ============================================================================

#[tokio::test]
async fn test_update_applies_every_kind_in_order() {
    let fixture = Fixture::new();
    fixture.array.add_volume("vol3", 100 * GIB, &fixture.pool);
    fixture.array.create_group("g1");
    fixture
        .array
        .add_member("g1", "vol1", &[20 * GIB, 10 * GIB], &fixture.pool);
    fixture.array.add_member("g1", "vol2", &[20 * GIB], &fixture.pool);
    fixture.array.clear_requests();

    let op = Operation::EnsureGroup {
        group: "g1".to_string(),
        settings: GroupSettings {
            alert_threshold_pct: 80,
            ..Default::default()
        },
        volumes: vec![
            VolumeSpec::named("vol1").with_reserve(25),
            VolumeSpec::named("vol3").with_reserve(20),
        ],
    };
    let report = fixture.run_ok(&op).await;
    assert_eq!(
        report.applied,
        vec![
            "update group settings",
            "remove member vol2",
            "trim 1 reserve member(s) of vol1",
            "expand reserve of vol1 by 5%",
            "add members vol3",
        ]
    );

    // Expansion and addition come from one candidate batch
    let candidate_requests = fixture
        .array
        .requests()
        .into_iter()
        .filter(|r| r.path == endpoints::CONCAT_CANDIDATES)
        .count();
    assert_eq!(candidate_requests, 2);

    let mutations = fixture.array.mutations();
    let expand = mutations
        .iter()
        .find(|r| r.path.ends_with("/expand"))
        .and_then(|r| r.body.clone())
        .expect("expand body");
    let batch = mutations
        .iter()
        .find(|r| r.path.ends_with("member-volumes/batch"))
        .and_then(|r| r.body.clone())
        .expect("member batch body");
    let expand_label = expand["expansionCandidate"]["newVolCandidate"]["memberVolumeLabel"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let added_labels: Vec<String> = batch["volumeToCandidates"]
        .as_object()
        .expect("candidate map")
        .values()
        .map(|c| c["newVolCandidate"]["memberVolumeLabel"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(added_labels.len(), 1);
    assert!(!expand_label.is_empty());
    assert_ne!(expand_label, added_labels[0]);

    assert_eq!(fixture.array.members("g1"), vec!["vol1", "vol3"]);
    assert_eq!(fixture.array.chain("g1", "vol1"), vec![20 * GIB, 5 * GIB]);
    assert_eq!(fixture.array.chain("g1", "vol3"), vec![20 * GIB]);
    assert!(!fixture.run_ok(&op).await.changed);
}

#[tokio::test]
async fn test_combined_demand_exceeds_pool() {
    let fixture = Fixture::new();
    fixture.array.add_pool("small", 50 * GIB);

    let op = ensure_group(vec![
        VolumeSpec::named("vol1").with_reserve(30).with_pool("small"),
        VolumeSpec::named("vol2").with_reserve(30).with_pool("small"),
    ]);
    let err = fixture.run(&op).await.unwrap_err();
    assert_eq!(
        err,
        SnapError::CapacityInsufficient {
            pools: vec!["small".to_string()]
        }
    );
    assert!(fixture.array.mutations().is_empty());
    assert!(fixture.array.group("g1").is_none());
}

#[tokio::test]
async fn test_no_candidate_in_preferred_pool() {
    let fixture = Fixture::new();
    fixture.array.add_pool("small", 50 * GIB);

    let op = ensure_group(vec![VolumeSpec::named("vol1").with_reserve(60).with_pool("small")]);
    let err = fixture.run(&op).await.unwrap_err();
    assert_eq!(
        err,
        SnapError::NoCandidate {
            volume: "vol1".to_string(),
            pool: "small".to_string(),
        }
    );
    assert!(fixture.array.mutations().is_empty());
}

#[tokio::test]
async fn test_unknown_preferred_pool() {
    let fixture = Fixture::new();
    let op = ensure_group(vec![VolumeSpec::named("vol1").with_pool("missing")]);
    assert!(matches!(
        fixture.run(&op).await.unwrap_err(),
        SnapError::Validation(_)
    ));
}

#[tokio::test]
async fn test_unknown_volume() {
    let fixture = Fixture::new();
    let op = ensure_group(vec![VolumeSpec::named("vol9")]);
    assert!(matches!(
        fixture.run(&op).await.unwrap_err(),
        SnapError::NotFound(_)
    ));
    assert!(fixture.array.mutations().is_empty());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_mutation_failure_reports_completed_steps() {
    let fixture = Fixture::new();
    let group_id = fixture.array.create_group("g1");
    fixture.array.add_member("g1", "vol1", &[40 * GIB], &fixture.pool);
    fixture
        .array
        .fail_on("POST", &endpoints::member_volumes_batch(&group_id));

    let op = Operation::EnsureGroup {
        group: "g1".to_string(),
        settings: GroupSettings {
            alert_threshold_pct: 80,
            ..Default::default()
        },
        volumes: vec![VolumeSpec::named("vol1"), VolumeSpec::named("vol2")],
    };

    let err = fixture.run(&op).await.unwrap_err();
    assert!(!err.is_pre_mutation());
    match err {
        SnapError::MutationFailure {
            step,
            completed,
            message,
        } => {
            assert_eq!(step, "add members vol2");
            assert_eq!(completed, vec!["update group settings"]);
            assert!(message.contains("500"));
        }
        other => panic!("unexpected error {other:?}"),
    }

    // The settings change stays applied
    assert_eq!(fixture.array.group("g1").unwrap().full_warn_threshold, 80);
    assert_eq!(fixture.array.members("g1"), vec!["vol1"]);

    fixture.array.clear_failures();
    let report = fixture.run_ok(&op).await;
    assert_eq!(report.applied, vec!["add members vol2"]);
}

#[tokio::test]
async fn test_inventory_failure_is_lookup_failure() {
    let fixture = Fixture::new();
    fixture.array.fail_on("GET", endpoints::VOLUMES);

    let op = ensure_group(vec![VolumeSpec::named("vol1")]);
    match fixture.run(&op).await.unwrap_err() {
        SnapError::LookupFailure { endpoint, .. } => assert_eq!(endpoint, endpoints::VOLUMES),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(fixture.array.mutations().is_empty());
}

#[tokio::test]
async fn test_validation_precedes_network() {
    let fixture = Fixture::new();
    let op = ensure_group(Vec::new());
    let err = fixture.run(&op).await.unwrap_err();
    assert!(err.is_pre_mutation());
    assert!(matches!(err, SnapError::Validation(_)));
    assert!(fixture.array.requests().is_empty());
}

// ============================================================================
// Removal
// ============================================================================

#[tokio::test]
async fn test_remove_group_cleans_metadata() {
    let (fixture, _) = Fixture::with_group();
    fixture.take_pit(Some("nightly")).await;
    fixture.array.put_key_value("other_nightly", "1|x|");
    assert!(fixture.array.key_value("g1_nightly").is_some());

    let op = Operation::RemoveGroup {
        group: "g1".to_string(),
    };
    let report = fixture.run_ok(&op).await;
    assert_eq!(report.applied, vec!["remove group"]);
    assert!(fixture.array.group("g1").is_none());
    assert!(fixture.array.key_value("g1_nightly").is_none());
    assert!(fixture.array.key_value("other_nightly").is_some());

    assert!(!fixture.run_ok(&op).await.changed);
}
