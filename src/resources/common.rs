//! Common utilities for Kubernetes resource generation
//!
//! This module provides shared functions and constants used across
//! all resource generators to ensure consistency and reduce duplication.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::crd::Cluster;

/// API version of the Cluster CRD
pub const API_VERSION: &str = "postgresql.example.com/v1";

/// Kind of the Cluster CRD
pub const KIND: &str = "Cluster";

/// Operator field manager name
pub const FIELD_MANAGER: &str = "pg-cluster-operator";

/// Label holding the owning cluster name; used as the index key for listing children
pub const CLUSTER_LABEL: &str = "postgresql.example.com/cluster";

/// Label holding the instance name on pods, PVCs and jobs
pub const INSTANCE_NAME_LABEL: &str = "postgresql.example.com/instanceName";

/// Label holding the instance role, kept in sync for the services
pub const ROLE_LABEL: &str = "postgresql.example.com/role";

/// Label holding the purpose of a bootstrap job
pub const JOB_ROLE_LABEL: &str = "postgresql.example.com/jobRole";

/// Annotation holding the instance serial
pub const SERIAL_ANNOTATION: &str = "postgresql.example.com/nodeSerial";

/// Annotation holding the hash of the pod-relevant spec
pub const SPEC_HASH_ANNOTATION: &str = "postgresql.example.com/spec-hash";

/// Role label value of the primary
pub const ROLE_PRIMARY: &str = "primary";

/// Role label value of replicas
pub const ROLE_REPLICA: &str = "replica";

/// Generate an owner reference for a Cluster
///
/// Every child is controlled by its cluster, so it is garbage collected when
/// the cluster is deleted and can be traced back to it.
pub fn owner_reference(cluster: &Cluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Standard labels for all resources belonging to a Cluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "postgresql".to_string(),
        ),
        (
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels for a single instance's pod, PVC and jobs
pub fn instance_labels(cluster_name: &str, instance_name: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(INSTANCE_NAME_LABEL.to_string(), instance_name.to_string());
    labels
}

/// Label selector matching every child of a cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={}", CLUSTER_LABEL, cluster_name)
}

/// Name of the instance with the given serial
pub fn instance_name(cluster_name: &str, serial: i32) -> String {
    format!("{}-{}", cluster_name, serial)
}

/// Serial of an instance, from the annotation or, failing that, the name suffix
pub fn instance_serial(meta: &ObjectMeta) -> Option<i32> {
    if let Some(serial) = meta
        .annotations
        .as_ref()
        .and_then(|a| a.get(SERIAL_ANNOTATION))
        .and_then(|s| s.parse().ok())
    {
        return Some(serial);
    }

    meta.name
        .as_deref()
        .and_then(|n| n.rsplit_once('-'))
        .and_then(|(_, suffix)| suffix.parse().ok())
}

/// Metadata shared by every per-instance object
pub fn instance_metadata(cluster: &Cluster, name: String, serial: i32) -> ObjectMeta {
    let cluster_name = cluster.name_any();
    ObjectMeta {
        labels: Some(instance_labels(&cluster_name, &instance_name(&cluster_name, serial))),
        annotations: Some(BTreeMap::from([(
            SERIAL_ANNOTATION.to_string(),
            serial.to_string(),
        )])),
        name: Some(name),
        namespace: cluster.namespace(),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}
