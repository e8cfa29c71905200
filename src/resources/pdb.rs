//! PodDisruptionBudget generation for PostgreSQL clusters
//!
//! Protects cluster availability during voluntary disruptions. The budget is
//! only generated outside node maintenance windows: during a window the
//! instances are expected to go down with their node.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;

use crate::crd::Cluster;
use crate::resources::common::{CLUSTER_LABEL, owner_reference, standard_labels};

/// Name of the cluster PDB
pub fn pdb_name(cluster: &Cluster) -> String {
    format!("{}-pdb", cluster.name_any())
}

/// Generate a PodDisruptionBudget for the cluster
///
/// - 1 instance: min_available = 0 (allow disruption, will cause downtime)
/// - 2 instances: min_available = 1
/// - 3+ instances: min_available = instances - 1 (one disruption at a time)
pub fn generate_pdb(cluster: &Cluster) -> PodDisruptionBudget {
    let cluster_name = cluster.name_any();

    let min_available = match cluster.spec.instances {
        n if n <= 1 => 0,
        2 => 1,
        n => n - 1,
    };

    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(pdb_name(cluster)),
            namespace: cluster.namespace(),
            labels: Some(standard_labels(&cluster_name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available)),
            selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster_name)])),
                ..Default::default()
            }),
            unhealthy_pod_eviction_policy: Some("IfHealthyBudget".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
