//! Snapshot -> status -> action, the way a reconciliation chains them

use pg_cluster_operator::controller::action_selector::{
    ReconcileAction, SelectorInput, WaitReason, select_action,
};
use pg_cluster_operator::controller::expectations::{ExpectationTracker, OwnerKey, ResourceKind};
use pg_cluster_operator::controller::managed_resources::ManagedResources;
use pg_cluster_operator::controller::status::{project_status, status_update_body};
use pg_cluster_operator::crd::{Cluster, ClusterPhase, ClusterStatus};
use pg_cluster_operator::instance::InstanceStatusList;

use crate::common::*;

fn snapshot(
    cluster: &Cluster,
    pods: Vec<k8s_openapi::api::core::v1::Pod>,
    jobs: Vec<k8s_openapi::api::batch::v1::Job>,
    pvcs: Vec<k8s_openapi::api::core::v1::PersistentVolumeClaim>,
) -> ManagedResources {
    ManagedResources::from_lists(&OwnerKey::for_cluster(cluster), pods, jobs, pvcs)
}

/// Run the pure half of a reconciliation
fn decide(
    cluster: &Cluster,
    resources: &ManagedResources,
    reports: &InstanceStatusList,
    tracker: &ExpectationTracker,
) -> (ClusterStatus, ReconcileAction) {
    let status = project_status(cluster, resources, reports);
    let satisfied = tracker.satisfied_expectations(&OwnerKey::for_cluster(cluster));
    let input = SelectorInput::new(cluster, &status, resources, satisfied);
    (status, select_action(&input))
}

mod creation {
    use super::*;

    #[test]
    fn test_empty_cluster_creates_primary() {
        let cluster = create_test_cluster("db", 3);
        let resources = ManagedResources::default();

        let (status, action) = decide(
            &cluster,
            &resources,
            &InstanceStatusList::default(),
            &ExpectationTracker::new(),
        );

        assert_eq!(status.instances, 0);
        assert_eq!(action, ReconcileAction::CreatePrimary { serial: 1 });
        assert_eq!(action.phase(), Some(ClusterPhase::SettingUpPrimary));
    }

    #[test]
    fn test_running_initdb_job_waits() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(3)
            .with_status(ClusterStatus {
                latest_generated_node: 1,
                target_primary: "db-1".to_string(),
                ..Default::default()
            })
            .build();
        let resources = snapshot(
            &cluster,
            vec![],
            vec![initdb_job(&cluster, 1, true)],
            vec![pvc(&cluster, 1)],
        );

        let (status, action) = decide(
            &cluster,
            &resources,
            &InstanceStatusList::default(),
            &ExpectationTracker::new(),
        );

        // The PVC is being written by the job, so it is not dangling
        assert!(status.dangling_pvc.is_empty());
        assert_eq!(action, ReconcileAction::Wait(WaitReason::JobsRunning));
    }

    #[test]
    fn test_scale_up_joins_next_serial() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(3)
            .with_status(status(1, 1, "db-1"))
            .build();
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1)],
            vec![initdb_job(&cluster, 1, false)],
            vec![pvc(&cluster, 1)],
        );
        let reports = reports(vec![primary_report("db-1", 1)]);

        let (status, action) = decide(&cluster, &resources, &reports, &ExpectationTracker::new());

        assert_eq!(status.instances, 1);
        assert_eq!(status.ready_instances, 1);
        assert_eq!(status.current_primary, "db-1");
        assert_eq!(action, ReconcileAction::JoinReplica { serial: 2 });
    }

    #[test]
    fn test_serial_skips_orphaned_pvc() {
        // A terminating PVC still holds serial 4
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(3)
            .with_status(status(2, 2, "db-1"))
            .build();
        let mut orphan = pvc(&cluster, 4);
        orphan.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1), ready_pod(&cluster, 2)],
            vec![],
            vec![pvc(&cluster, 1), pvc(&cluster, 2), orphan],
        );
        let reports = reports(vec![
            primary_report("db-1", 1),
            replica_report("db-2", 2, 100),
        ]);

        let (_, action) = decide(&cluster, &resources, &reports, &ExpectationTracker::new());
        assert_eq!(action, ReconcileAction::JoinReplica { serial: 5 });
    }

    #[test]
    fn test_pending_expectations_block_second_create() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(3)
            .with_status(status(1, 1, "db-1"))
            .build();
        let key = OwnerKey::for_cluster(&cluster);
        let tracker = ExpectationTracker::new();
        tracker.expect_creations(&key, ResourceKind::Pod, 1);

        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1)],
            vec![],
            vec![pvc(&cluster, 1)],
        );
        let reports = reports(vec![primary_report("db-1", 1)]);

        let (_, action) = decide(&cluster, &resources, &reports, &tracker);
        assert_eq!(action, ReconcileAction::Wait(WaitReason::ExpectationsPending));

        tracker.observe_creation(&key, ResourceKind::Pod);
        let (_, action) = decide(&cluster, &resources, &reports, &tracker);
        assert_eq!(action, ReconcileAction::JoinReplica { serial: 2 });
    }
}

mod dangling {
    use super::*;

    #[test]
    fn test_dangling_pvc_is_recreated_when_others_are_ready() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(3)
            .with_status(status(3, 3, "db-1"))
            .build();
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1), ready_pod(&cluster, 2)],
            vec![],
            vec![pvc(&cluster, 1), pvc(&cluster, 2), pvc(&cluster, 3)],
        );
        let reports = reports(vec![
            primary_report("db-1", 1),
            replica_report("db-2", 2, 100),
        ]);

        let (status, action) = decide(&cluster, &resources, &reports, &ExpectationTracker::new());

        assert_eq!(status.dangling_pvc, vec!["db-3".to_string()]);
        assert_eq!(
            action,
            ReconcileAction::RecreateInstances {
                pvcs: vec!["db-3".to_string()]
            }
        );
    }

    #[test]
    fn test_dangling_pvc_waits_for_not_ready_instance() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(3)
            .with_status(status(3, 3, "db-1"))
            .build();
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1), instance_pod(&cluster, 2, false)],
            vec![],
            vec![pvc(&cluster, 1), pvc(&cluster, 2), pvc(&cluster, 3)],
        );
        let reports = reports(vec![primary_report("db-1", 1)]);

        let (_, action) = decide(&cluster, &resources, &reports, &ExpectationTracker::new());
        assert_eq!(action, ReconcileAction::Wait(WaitReason::InstancesNotReady));
    }

    #[test]
    fn test_maintenance_window_recreates_without_waiting() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(3)
            .with_maintenance_window(true, true)
            .with_status(status(3, 3, "db-1"))
            .build();
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1), instance_pod(&cluster, 2, false)],
            vec![],
            vec![pvc(&cluster, 1), pvc(&cluster, 2), pvc(&cluster, 3)],
        );
        let reports = reports(vec![primary_report("db-1", 1)]);

        let (_, action) = decide(&cluster, &resources, &reports, &ExpectationTracker::new());
        assert_eq!(
            action,
            ReconcileAction::RecreateInstances {
                pvcs: vec!["db-3".to_string()]
            }
        );
    }
}

mod steady_state {
    use super::*;

    #[test]
    fn test_converged_cluster_is_healthy() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(2)
            .with_status(status(2, 2, "db-1"))
            .build();
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1), ready_pod(&cluster, 2)],
            vec![],
            vec![pvc(&cluster, 1), pvc(&cluster, 2)],
        );
        let reports = reports(vec![
            primary_report("db-1", 1),
            replica_report("db-2", 2, 100),
        ]);

        let (status, action) = decide(&cluster, &resources, &reports, &ExpectationTracker::new());
        assert_eq!(status.instance_names, vec!["db-1".to_string(), "db-2".to_string()]);
        assert_eq!(action, ReconcileAction::Healthy);
    }

    #[test]
    fn test_scale_down_removes_highest_serial_replica() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(2)
            .with_status(status(3, 3, "db-3"))
            .build();
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1), ready_pod(&cluster, 2), ready_pod(&cluster, 3)],
            vec![],
            vec![pvc(&cluster, 1), pvc(&cluster, 2), pvc(&cluster, 3)],
        );
        let reports = reports(vec![
            primary_report("db-3", 3),
            replica_report("db-1", 1, 100),
            replica_report("db-2", 2, 100),
        ]);

        let (_, action) = decide(&cluster, &resources, &reports, &ExpectationTracker::new());
        assert_eq!(
            action,
            ReconcileAction::ScaleDown {
                instance: "db-2".to_string()
            }
        );
    }

    #[test]
    fn test_foreign_pods_do_not_count() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(1)
            .with_status(status(1, 1, "db-1"))
            .build();
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1), foreign_pod("db-debug", "db")],
            vec![],
            vec![pvc(&cluster, 1)],
        );
        let reports = reports(vec![primary_report("db-1", 1)]);

        let (status, action) = decide(&cluster, &resources, &reports, &ExpectationTracker::new());
        assert_eq!(status.instances, 1);
        assert_eq!(action, ReconcileAction::Healthy);
    }
}

mod projection {
    use super::*;

    #[test]
    fn test_owned_fields_are_carried_over() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(2)
            .with_status(ClusterStatus {
                target_primary: "db-2".to_string(),
                current_primary: "db-1".to_string(),
                latest_generated_node: 7,
                phase: ClusterPhase::FailingOver,
                phase_reason: "primary lost".to_string(),
                ..Default::default()
            })
            .build();
        let resources = snapshot(&cluster, vec![ready_pod(&cluster, 2)], vec![], vec![]);

        let status = project_status(&cluster, &resources, &InstanceStatusList::default());

        assert_eq!(status.target_primary, "db-2");
        assert_eq!(status.latest_generated_node, 7);
        assert_eq!(status.phase, ClusterPhase::FailingOver);
        assert_eq!(status.phase_reason, "primary lost");
        // No instance reports a primary, so the last known one is kept
        assert_eq!(status.current_primary, "db-1");
        assert_eq!(status.observed_generation, Some(1));
    }

    #[test]
    fn test_current_primary_follows_promoted_target() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(2)
            .with_status(ClusterStatus {
                target_primary: "db-2".to_string(),
                current_primary: "db-1".to_string(),
                ..Default::default()
            })
            .build();
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1), ready_pod(&cluster, 2)],
            vec![],
            vec![],
        );
        // Both report primary while the old one is being demoted
        let reports = reports(vec![primary_report("db-1", 1), primary_report("db-2", 2)]);

        let status = project_status(&cluster, &resources, &reports);
        assert_eq!(status.current_primary, "db-2");
    }

    #[test]
    fn test_projection_is_idempotent() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(2)
            .with_status(status(2, 2, "db-1"))
            .build();
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1), ready_pod(&cluster, 2)],
            vec![],
            vec![pvc(&cluster, 1), pvc(&cluster, 2)],
        );
        let reports = reports(vec![
            primary_report("db-1", 1),
            replica_report("db-2", 2, 100),
        ]);

        let first = project_status(&cluster, &resources, &reports);
        let mut updated = cluster.clone();
        updated.status = Some(first.clone());
        let second = project_status(&updated, &resources, &reports);
        assert_eq!(first, second);
    }

    #[test]
    fn test_written_status_clears_recreated_dangling_pvc() {
        let cluster = ClusterBuilder::new("db", "default")
            .with_instances(2)
            .with_status(ClusterStatus {
                dangling_pvc: vec!["db-2".to_string()],
                phase: ClusterPhase::RecreatingInstance,
                phase_reason: "Recreating instances on db-2".to_string(),
                ..status(2, 1, "db-1")
            })
            .build();
        let resources = snapshot(
            &cluster,
            vec![ready_pod(&cluster, 1), ready_pod(&cluster, 2)],
            vec![],
            vec![pvc(&cluster, 1), pvc(&cluster, 2)],
        );
        let reports = reports(vec![
            primary_report("db-1", 1),
            replica_report("db-2", 2, 100),
        ]);

        let mut projected = project_status(&cluster, &resources, &reports);
        assert!(projected.dangling_pvc.is_empty());
        projected.phase = ClusterPhase::Healthy;
        projected.phase_reason = String::new();

        // The write replaces the status wholesale, so emptied fields are
        // emptied on the server too
        let body = status_update_body(&cluster, &projected).unwrap();
        let written: Cluster = serde_json::from_slice(&body).unwrap();
        assert_eq!(written.metadata.resource_version.as_deref(), Some("1"));

        let stored = written.status.clone().unwrap();
        assert_eq!(stored, projected);
        assert!(stored.dangling_pvc.is_empty());
        assert!(stored.phase_reason.is_empty());

        let input = SelectorInput::new(&written, &stored, &resources, true);
        assert_eq!(select_action(&input), ReconcileAction::Healthy);
    }
}
