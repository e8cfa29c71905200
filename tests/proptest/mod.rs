// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for the reconciliation decisions
//!
//! These tests use proptest to generate random observed states and verify that:
//! 1. The action selector is deterministic and never panics
//! 2. Unobserved expectations always gate every other rule
//! 3. Scale down never removes the current or target primary
//! 4. New instances never reuse a serial
//! 5. Failover and switchover only ever pick a reachable replica

use proptest::prelude::*;

use pg_cluster_operator::controller::action_selector::{
    InstanceRef, ReconcileAction, SelectorInput, WaitReason, select_action,
};
use pg_cluster_operator::controller::topology::{
    TopologyDecision, elect_target_primary, switchover_target,
};
use pg_cluster_operator::crd::ClusterStatus;
use pg_cluster_operator::instance::{InstanceStatus, InstanceStatusList, Lsn};

// =============================================================================
// Strategies
// =============================================================================

fn instance_name(serial: i32) -> String {
    format!("db-{}", serial)
}

/// A plausible observed state: pods with distinct serials, a primary among
/// them (or none when empty), and counters consistent with the pods.
fn selector_input() -> impl Strategy<Value = SelectorInput> {
    (
        proptest::collection::btree_set(1i32..20, 0..6),
        1i32..7,
        any::<bool>(),
        0i32..3,
        proptest::collection::vec(20i32..30, 0..3),
        any::<bool>(),
        any::<bool>(),
        0i32..25,
        any::<prop::sample::Index>(),
        any::<prop::sample::Index>(),
    )
        .prop_map(
            |(
                serials,
                spec_instances,
                satisfied,
                running_jobs,
                dangling,
                in_progress,
                reuse_pvc,
                latest,
                ready_idx,
                primary_idx,
            )| {
                let pods: Vec<InstanceRef> = serials
                    .iter()
                    .map(|&serial| InstanceRef {
                        name: instance_name(serial),
                        serial,
                    })
                    .collect();
                let instances = pods.len() as i32;
                let ready = if pods.is_empty() {
                    0
                } else {
                    ready_idx.index(pods.len() + 1) as i32
                };
                let primary = if pods.is_empty() {
                    String::new()
                } else {
                    primary_idx.get(&pods).name.clone()
                };
                let highest = serials
                    .iter()
                    .copied()
                    .chain(dangling.iter().copied())
                    .max()
                    .unwrap_or(0);

                SelectorInput {
                    expectations_satisfied: satisfied,
                    spec_instances,
                    instances,
                    ready_instances: ready,
                    current_primary: primary.clone(),
                    target_primary: primary,
                    running_jobs,
                    dangling_pvcs: dangling.iter().map(|&s| instance_name(s)).collect(),
                    maintenance_in_progress: in_progress,
                    maintenance_reuse_pvc: in_progress && reuse_pvc,
                    latest_generated_node: latest,
                    pods,
                    highest_serial: highest,
                }
            },
        )
}

fn instance_report() -> impl Strategy<Value = (bool, bool, bool, Option<u64>)> {
    (
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
        proptest::option::of(0u64..1_000),
    )
}

fn reports() -> impl Strategy<Value = InstanceStatusList> {
    proptest::collection::vec(instance_report(), 0..6).prop_map(|items| {
        InstanceStatusList::new(
            items
                .into_iter()
                .enumerate()
                .map(|(i, (reachable, pod_ready, is_primary, replay))| {
                    let serial = i as i32 + 1;
                    InstanceStatus {
                        pod_name: instance_name(serial),
                        serial,
                        reachable,
                        pod_ready,
                        is_primary: reachable && is_primary,
                        replay_lsn: replay.map(Lsn),
                        ..Default::default()
                    }
                })
                .collect(),
        )
    })
}

// =============================================================================
// Action selector
// =============================================================================

proptest! {
    #[test]
    fn selection_is_deterministic(input in selector_input()) {
        prop_assert_eq!(select_action(&input), select_action(&input));
    }

    #[test]
    fn unobserved_expectations_always_wait(mut input in selector_input()) {
        input.expectations_satisfied = false;
        prop_assert_eq!(
            select_action(&input),
            ReconcileAction::Wait(WaitReason::ExpectationsPending)
        );
    }

    #[test]
    fn empty_cluster_creates_primary(mut input in selector_input()) {
        input.expectations_satisfied = true;
        input.running_jobs = 0;
        input.dangling_pvcs.clear();
        input.pods.clear();
        input.instances = 0;
        input.ready_instances = 0;
        input.current_primary.clear();
        input.target_primary.clear();

        prop_assert_eq!(
            select_action(&input),
            ReconcileAction::CreatePrimary { serial: input.next_serial() }
        );
    }

    #[test]
    fn dangling_pvcs_recreated_when_instances_ready(mut input in selector_input()) {
        input.expectations_satisfied = true;
        input.running_jobs = 0;
        input.ready_instances = input.instances;
        prop_assume!(!input.dangling_pvcs.is_empty());

        prop_assert_eq!(
            select_action(&input),
            ReconcileAction::RecreateInstances { pvcs: input.dangling_pvcs.clone() }
        );
    }

    #[test]
    fn scale_down_never_removes_primary(input in selector_input()) {
        if let ReconcileAction::ScaleDown { instance } = select_action(&input) {
            prop_assert_ne!(&instance, &input.current_primary);
            prop_assert_ne!(&instance, &input.target_primary);
            prop_assert!(input.pods.iter().any(|p| p.name == instance));
        }
    }

    #[test]
    fn new_instances_never_reuse_a_serial(input in selector_input()) {
        let serial = match select_action(&input) {
            ReconcileAction::CreatePrimary { serial } | ReconcileAction::JoinReplica { serial } => serial,
            _ => return Ok(()),
        };
        prop_assert!(serial > input.latest_generated_node);
        prop_assert!(serial > input.highest_serial);
        prop_assert!(input.pods.iter().all(|p| p.serial != serial));
    }
}

// =============================================================================
// Topology
// =============================================================================

proptest! {
    #[test]
    fn switchover_target_is_a_reachable_replica(
        reports in reports(),
        exclude in 1i32..7,
    ) {
        let exclude = instance_name(exclude);
        if let Some(target) = switchover_target(&reports, &exclude) {
            let report = reports.get(&target).unwrap();
            prop_assert!(report.reachable);
            prop_assert!(!report.is_primary);
            prop_assert_ne!(&target, &exclude);

            // Nobody eligible is further ahead
            for other in reports.iter().filter(|r| r.reachable && !r.is_primary && r.pod_name != exclude) {
                prop_assert!(other.replay_lsn <= report.replay_lsn);
            }
        }
    }

    #[test]
    fn failover_never_targets_lost_primary(
        reports in reports(),
        primary in 1i32..7,
    ) {
        let status = ClusterStatus {
            current_primary: instance_name(primary),
            target_primary: instance_name(primary),
            ..Default::default()
        };

        match elect_target_primary(&status, &reports) {
            TopologyDecision::Failover { from, to } => {
                prop_assert_eq!(&from, &status.target_primary);
                prop_assert_ne!(&to, &from);
                prop_assert!(reports.primaries().next().is_none());
                let report = reports.get(&to).unwrap();
                prop_assert!(report.reachable);
            }
            TopologyDecision::Adopt { .. } => {
                prop_assert!(false, "a recorded target is never re-adopted");
            }
            TopologyDecision::Unchanged => {}
        }
    }
}
