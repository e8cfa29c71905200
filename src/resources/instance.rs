//! Per-instance object generation: PVC, bootstrap Jobs and the instance Pod
//!
//! Every instance owns a PVC named after it. An instance is bootstrapped by a
//! Job writing into that PVC (`initdb` for the first instance, `join` for
//! replicas). Once the Job is done the PVC has no pod, and the reconciler
//! starts the instance Pod on it through the dangling-PVC path.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use sha2::{Digest, Sha256};

use crate::crd::{Cluster, ResourceList};
use crate::resources::common::{
    CLUSTER_LABEL, JOB_ROLE_LABEL, ROLE_LABEL, ROLE_PRIMARY, ROLE_REPLICA, SPEC_HASH_ANNOTATION,
    instance_metadata, instance_name,
};

/// Name of the PostgreSQL container in instance pods
pub const POSTGRES_CONTAINER: &str = "postgres";

/// Port of the in-pod management endpoint
pub const MANAGEMENT_PORT: u16 = 8000;

/// PostgreSQL port
pub const POSTGRES_PORT: i32 = 5432;

const PGDATA_MOUNT: &str = "/var/lib/postgresql/data";
const PGDATA: &str = "/var/lib/postgresql/data/pgdata";
const MANAGER_BINARY: &str = "/controller/manager";

/// Purpose of a bootstrap job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobRole {
    /// Initialize the data directory of the first instance
    Initdb,
    /// Clone the primary into a new replica
    Join,
}

impl JobRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRole::Initdb => "initdb",
            JobRole::Join => "join",
        }
    }
}

/// Name of the bootstrap job of an instance
pub fn job_name(instance: &str, role: JobRole) -> String {
    format!("{}-{}", instance, role.as_str())
}

/// Generate the data PVC of the instance with the given serial
pub fn generate_pvc(cluster: &Cluster, serial: i32) -> PersistentVolumeClaim {
    let name = instance_name(&cluster.name_any(), serial);

    PersistentVolumeClaim {
        metadata: instance_metadata(cluster, name, serial),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: cluster.spec.storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(cluster.spec.storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the job initializing a brand new primary
pub fn generate_initdb_job(cluster: &Cluster, serial: i32) -> Job {
    generate_bootstrap_job(
        cluster,
        serial,
        JobRole::Initdb,
        vec!["instance".to_string(), "init".to_string()],
    )
}

/// Generate the job cloning `primary` into a new replica
pub fn generate_join_job(cluster: &Cluster, serial: i32, primary: &str) -> Job {
    generate_bootstrap_job(
        cluster,
        serial,
        JobRole::Join,
        vec![
            "instance".to_string(),
            "join".to_string(),
            "--parent-node".to_string(),
            primary.to_string(),
        ],
    )
}

fn generate_bootstrap_job(cluster: &Cluster, serial: i32, role: JobRole, args: Vec<String>) -> Job {
    let instance = instance_name(&cluster.name_any(), serial);
    let mut metadata = instance_metadata(cluster, job_name(&instance, role), serial);
    if let Some(labels) = metadata.labels.as_mut() {
        labels.insert(JOB_ROLE_LABEL.to_string(), role.as_str().to_string());
    }

    let container = Container {
        args: Some(args),
        ..postgres_container(cluster, &instance)
    };

    // Job pods must not match the cluster services
    let mut pod_labels = metadata.labels.clone().unwrap_or_default();
    pod_labels.remove(CLUSTER_LABEL);

    Job {
        metadata,
        spec: Some(JobSpec {
            backoff_limit: Some(6),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        readiness_probe: None,
                        ..container
                    }],
                    volumes: Some(vec![pgdata_volume(&instance)]),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the pod of the instance with the given serial
///
/// The pod reuses the PVC named after the instance; the role label is set
/// from the current target primary and corrected on later reconciles.
pub fn generate_instance_pod(cluster: &Cluster, serial: i32) -> Pod {
    let instance = instance_name(&cluster.name_any(), serial);
    let mut metadata = instance_metadata(cluster, instance.clone(), serial);

    let is_target_primary = cluster
        .status
        .as_ref()
        .is_some_and(|s| s.target_primary == instance);
    if let Some(labels) = metadata.labels.as_mut() {
        let role = if is_target_primary {
            ROLE_PRIMARY
        } else {
            ROLE_REPLICA
        };
        labels.insert(ROLE_LABEL.to_string(), role.to_string());
    }
    if let Some(annotations) = metadata.annotations.as_mut() {
        annotations.insert(SPEC_HASH_ANNOTATION.to_string(), spec_hash(cluster));
    }

    let readiness_probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/readyz".to_string()),
            port: IntOrString::Int(i32::from(MANAGEMENT_PORT)),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    };

    let container = Container {
        args: Some(vec!["instance".to_string(), "run".to_string()]),
        readiness_probe: Some(readiness_probe),
        ..postgres_container(cluster, &instance)
    };

    Pod {
        metadata,
        spec: Some(PodSpec {
            hostname: Some(instance.clone()),
            subdomain: Some(cluster.name_any()),
            containers: vec![container],
            volumes: Some(vec![pgdata_volume(&instance)]),
            termination_grace_period_seconds: Some(1800),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn postgres_container(cluster: &Cluster, instance: &str) -> Container {
    let env = vec![
        EnvVar {
            name: "PGDATA".to_string(),
            value: Some(PGDATA.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "POD_NAME".to_string(),
            value: Some(instance.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "CLUSTER_NAME".to_string(),
            value: Some(cluster.name_any()),
            ..Default::default()
        },
        EnvVar {
            name: "NAMESPACE".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.namespace".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    Container {
        name: POSTGRES_CONTAINER.to_string(),
        image: Some(cluster.spec.image_name.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![MANAGER_BINARY.to_string()]),
        env: Some(env),
        ports: Some(vec![
            ContainerPort {
                container_port: POSTGRES_PORT,
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: i32::from(MANAGEMENT_PORT),
                name: Some("status".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "pgdata".to_string(),
            mount_path: PGDATA_MOUNT.to_string(),
            ..Default::default()
        }]),
        resources: cluster.spec.resources.as_ref().map(|r| ResourceRequirements {
            limits: r.limits.as_ref().map(quantities),
            requests: r.requests.as_ref().map(quantities),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

fn pgdata_volume(instance: &str) -> Volume {
    Volume {
        name: "pgdata".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: instance.to_string(),
            read_only: Some(false),
        }),
        ..Default::default()
    }
}

/// Hash of the parts of the spec that require recreating an instance pod
///
/// SHA-256 over the canonical JSON encoding, so it is stable across operator
/// builds.
pub fn spec_hash(cluster: &Cluster) -> String {
    let relevant = serde_json::json!({
        "imageName": cluster.spec.image_name,
        "parameters": cluster.spec.postgresql.parameters,
        "resources": cluster.spec.resources,
    });

    let mut hasher = Sha256::new();
    hasher.update(relevant.to_string());
    format!("{:x}", hasher.finalize())
}
