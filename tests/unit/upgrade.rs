//! Unit tests for rolling upgrade planning

use k8s_openapi::api::core::v1::Pod;
use pg_cluster_operator::controller::upgrade::{UpgradePlan, plan_upgrade, stale_reason};
use pg_cluster_operator::crd::{Cluster, ClusterPhase, PrimaryUpdateStrategy};
use pg_cluster_operator::instance::InstanceStatusList;

use crate::common::*;

const OLD_IMAGE: &str = "ghcr.io/cloudnative-pg/postgresql:15";
const NEW_IMAGE: &str = "ghcr.io/cloudnative-pg/postgresql:16";

fn cluster(image: &str) -> Cluster {
    ClusterBuilder::new("db", "default")
        .with_instances(3)
        .with_image(image)
        .with_status(status(3, 3, "db-1"))
        .build()
}

fn three_replicas_reports() -> InstanceStatusList {
    reports(vec![
        primary_report("db-1", 1),
        replica_report("db-2", 2, 0x200),
        replica_report("db-3", 3, 0x100),
    ])
}

#[test]
fn test_up_to_date() {
    let current = cluster(NEW_IMAGE);
    let pods: Vec<Pod> = (1..=3).map(|s| ready_pod(&current, s)).collect();

    assert_eq!(
        plan_upgrade(&current, &pods, &three_replicas_reports(), "db-1"),
        UpgradePlan::UpToDate
    );
}

#[test]
fn test_stale_replicas_go_first_highest_serial_first() {
    let old = cluster(OLD_IMAGE);
    let new = cluster(NEW_IMAGE);
    let pods: Vec<Pod> = (1..=3).map(|s| ready_pod(&old, s)).collect();

    assert_eq!(
        plan_upgrade(&new, &pods, &three_replicas_reports(), "db-1"),
        UpgradePlan::Recreate {
            pod: "db-3".to_string()
        }
    );

    let reason = stale_reason(&new, &pods[2]).unwrap();
    assert!(reason.contains(OLD_IMAGE));
}

#[test]
fn test_stale_primary_switches_over_when_unsupervised() {
    let old = cluster(OLD_IMAGE);
    let new = cluster(NEW_IMAGE);
    let pods = vec![ready_pod(&old, 1), ready_pod(&new, 2), ready_pod(&new, 3)];

    assert_eq!(
        plan_upgrade(&new, &pods, &three_replicas_reports(), "db-1"),
        UpgradePlan::Switchover {
            from: "db-1".to_string(),
            to: "db-2".to_string(),
        }
    );
}

#[test]
fn test_stale_primary_waits_for_user_when_supervised() {
    let old = cluster(OLD_IMAGE);
    let mut new = cluster(NEW_IMAGE);
    new.spec.primary_update_strategy = PrimaryUpdateStrategy::Supervised;
    let pods = vec![ready_pod(&old, 1), ready_pod(&new, 2), ready_pod(&new, 3)];

    assert_eq!(
        plan_upgrade(&new, &pods, &three_replicas_reports(), "db-1"),
        UpgradePlan::WaitForUser {
            primary: "db-1".to_string()
        }
    );
}

#[test]
fn test_single_instance_primary_waits_for_user() {
    let old = ClusterBuilder::new("db", "default").with_image(OLD_IMAGE).build();
    let new = ClusterBuilder::new("db", "default").with_image(NEW_IMAGE).build();
    let pods = vec![ready_pod(&old, 1)];

    assert_eq!(
        plan_upgrade(&new, &pods, &reports(vec![primary_report("db-1", 1)]), "db-1"),
        UpgradePlan::WaitForUser {
            primary: "db-1".to_string()
        }
    );
}

#[test]
fn test_parameter_change_marks_pods_stale() {
    let old = cluster(NEW_IMAGE);
    let new = ClusterBuilder::new("db", "default")
        .with_instances(3)
        .with_parameter("max_connections", "200")
        .build();
    let pod = ready_pod(&old, 2);

    assert_eq!(stale_reason(&new, &pod), Some("configuration changed".to_string()));
    assert_eq!(stale_reason(&old, &pod), None);
}

#[test]
fn test_supervised_wait_keeps_one_phase_across_reconciles() {
    let old = cluster(OLD_IMAGE);
    let mut new = cluster(NEW_IMAGE);
    new.spec.primary_update_strategy = PrimaryUpdateStrategy::Supervised;
    let pods = vec![ready_pod(&old, 1), ready_pod(&new, 2), ready_pod(&new, 3)];

    let first = plan_upgrade(&new, &pods, &three_replicas_reports(), "db-1");
    let second = plan_upgrade(&new, &pods, &three_replicas_reports(), "db-1");
    assert_eq!(first, second);
    assert_eq!(first.phase(), ClusterPhase::WaitingForUser);
}

#[test]
fn test_only_an_up_to_date_cluster_is_healthy() {
    let old = cluster(OLD_IMAGE);
    let new = cluster(NEW_IMAGE);
    let stale: Vec<Pod> = (1..=3).map(|s| ready_pod(&old, s)).collect();
    let current: Vec<Pod> = (1..=3).map(|s| ready_pod(&new, s)).collect();

    let plan = plan_upgrade(&new, &stale, &three_replicas_reports(), "db-1");
    assert_eq!(plan.phase(), ClusterPhase::Upgrading);

    let plan = plan_upgrade(&new, &current, &three_replicas_reports(), "db-1");
    assert_eq!(plan.phase(), ClusterPhase::Healthy);

    let switchover = UpgradePlan::Switchover {
        from: "db-1".to_string(),
        to: "db-2".to_string(),
    };
    assert_eq!(switchover.phase(), ClusterPhase::Switchover);
}
