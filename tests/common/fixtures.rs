//! Test fixtures and builders for Cluster resources and their children
//!
//! Children are produced by the real generators, so they carry the owner
//! reference, labels, serial and spec hash annotations the controller expects.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let cluster = ClusterBuilder::new("db", "default")
//!     .with_instances(3)
//!     .with_status(status(2, 2, "db-1"))
//!     .build();
//! let pods = vec![ready_pod(&cluster, 1), ready_pod(&cluster, 2)];
//! ```

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodCondition, PodStatus};
use kube::core::ObjectMeta;
use pg_cluster_operator::crd::{
    BackupConfiguration, BarmanObjectStoreConfiguration, Cluster, ClusterSpec, ClusterStatus,
    DEFAULT_IMAGE_NAME, NodeMaintenanceWindow, PostgresConfiguration, PrimaryUpdateStrategy,
    StorageSpec,
};
use pg_cluster_operator::instance::{InstanceStatus, InstanceStatusList, Lsn};
use pg_cluster_operator::resources::instance::{
    generate_initdb_job, generate_instance_pod, generate_pvc,
};

pub const TEST_UID: &str = "test-uid-12345";

// =============================================================================
// Cluster builder
// =============================================================================

/// Builder for Cluster resources
pub struct ClusterBuilder {
    name: String,
    namespace: String,
    uid: String,
    generation: Option<i64>,
    spec: ClusterSpec,
    status: Option<ClusterStatus>,
}

impl ClusterBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: TEST_UID.to_string(),
            generation: Some(1),
            spec: ClusterSpec {
                instances: 1,
                image_name: DEFAULT_IMAGE_NAME.to_string(),
                postgresql: PostgresConfiguration::default(),
                storage: StorageSpec {
                    storage_class: Some("standard".to_string()),
                    size: "1Gi".to_string(),
                },
                resources: None,
                primary_update_strategy: PrimaryUpdateStrategy::Unsupervised,
                node_maintenance_window: None,
                backup: None,
            },
            status: None,
        }
    }

    pub fn with_instances(mut self, instances: i32) -> Self {
        self.spec.instances = instances;
        self
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.spec.image_name = image.to_string();
        self
    }

    pub fn with_parameter(mut self, key: &str, value: &str) -> Self {
        self.spec
            .postgresql
            .parameters
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_primary_update_strategy(mut self, strategy: PrimaryUpdateStrategy) -> Self {
        self.spec.primary_update_strategy = strategy;
        self
    }

    pub fn with_maintenance_window(mut self, in_progress: bool, reuse_pvc: bool) -> Self {
        self.spec.node_maintenance_window = Some(NodeMaintenanceWindow {
            in_progress,
            reuse_pvc,
        });
        self
    }

    pub fn with_object_store(mut self, store: BarmanObjectStoreConfiguration) -> Self {
        self.spec.backup = Some(BackupConfiguration {
            barman_object_store: Some(store),
        });
        self
    }

    pub fn with_status(mut self, status: ClusterStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn build(self) -> Cluster {
        Cluster {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: Some(self.uid),
                generation: self.generation,
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: self.spec,
            status: self.status,
        }
    }
}

/// Create a cluster with the given desired instance count and no status
pub fn create_test_cluster(name: &str, instances: i32) -> Cluster {
    ClusterBuilder::new(name, "default")
        .with_instances(instances)
        .build()
}

/// Status of a cluster whose primary is both current and target
pub fn status(instances: i32, ready: i32, primary: &str) -> ClusterStatus {
    ClusterStatus {
        instances,
        ready_instances: ready,
        current_primary: primary.to_string(),
        target_primary: primary.to_string(),
        latest_generated_node: instances,
        ..Default::default()
    }
}

// =============================================================================
// Children
// =============================================================================

/// Instance pod generated from the cluster, with the given readiness
pub fn instance_pod(cluster: &Cluster, serial: i32, ready: bool) -> Pod {
    let mut pod = generate_instance_pod(cluster, serial);
    pod.status = Some(PodStatus {
        pod_ip: Some(format!("10.0.0.{}", serial)),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

pub fn ready_pod(cluster: &Cluster, serial: i32) -> Pod {
    instance_pod(cluster, serial, true)
}

pub fn pvc(cluster: &Cluster, serial: i32) -> PersistentVolumeClaim {
    generate_pvc(cluster, serial)
}

/// Bootstrap job, either still running or completed
pub fn initdb_job(cluster: &Cluster, serial: i32, running: bool) -> Job {
    let mut job = generate_initdb_job(cluster, serial);
    if !running {
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Complete".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }
    job
}

/// Pod carrying the cluster label but owned by someone else
pub fn foreign_pod(name: &str, cluster_name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(BTreeMap::from([(
                pg_cluster_operator::resources::common::CLUSTER_LABEL.to_string(),
                cluster_name.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

// =============================================================================
// Instance reports
// =============================================================================

pub fn primary_report(name: &str, serial: i32) -> InstanceStatus {
    InstanceStatus {
        pod_name: name.to_string(),
        serial,
        reachable: true,
        pod_ready: true,
        is_primary: true,
        timeline_id: Some(1),
        ..Default::default()
    }
}

pub fn replica_report(name: &str, serial: i32, replay: u64) -> InstanceStatus {
    InstanceStatus {
        pod_name: name.to_string(),
        serial,
        reachable: true,
        pod_ready: true,
        is_primary: false,
        received_lsn: Some(Lsn(replay)),
        replay_lsn: Some(Lsn(replay)),
        timeline_id: Some(1),
        ..Default::default()
    }
}

pub fn unreachable_report(name: &str, serial: i32, pod_ready: bool) -> InstanceStatus {
    InstanceStatus {
        pod_name: name.to_string(),
        serial,
        reachable: false,
        pod_ready,
        error: Some("connection refused".to_string()),
        ..Default::default()
    }
}

pub fn reports(items: Vec<InstanceStatus>) -> InstanceStatusList {
    InstanceStatusList::new(items)
}
