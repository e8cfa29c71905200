//! Service generation for PostgreSQL clusters
//!
//! Three services front every cluster:
//! - `{cluster}-rw` routes to the instance labelled as primary
//! - `{cluster}-ro` routes to replicas only
//! - `{cluster}-r` routes to any instance
//!
//! The reconciler keeps the role label on instance pods in sync with
//! `status.currentPrimary`, so the selectors below follow switchovers.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;

use crate::crd::Cluster;
use crate::resources::common::{
    CLUSTER_LABEL, ROLE_LABEL, ROLE_PRIMARY, ROLE_REPLICA, owner_reference, standard_labels,
};
use crate::resources::instance::POSTGRES_PORT;

/// Generate the read-write service pointing at the primary
pub fn generate_rw_service(cluster: &Cluster) -> Service {
    generate_service(cluster, "rw", Some(ROLE_PRIMARY))
}

/// Generate the read-only service pointing at the replicas
pub fn generate_ro_service(cluster: &Cluster) -> Service {
    generate_service(cluster, "ro", Some(ROLE_REPLICA))
}

/// Generate the read service pointing at every instance
pub fn generate_r_service(cluster: &Cluster) -> Service {
    generate_service(cluster, "r", None)
}

/// All services of a cluster
pub fn generate_services(cluster: &Cluster) -> Vec<Service> {
    vec![
        generate_rw_service(cluster),
        generate_ro_service(cluster),
        generate_r_service(cluster),
    ]
}

fn generate_service(cluster: &Cluster, suffix: &str, role: Option<&str>) -> Service {
    let cluster_name = cluster.name_any();

    let mut selector = BTreeMap::from([(CLUSTER_LABEL.to_string(), cluster_name.clone())]);
    if let Some(role) = role {
        selector.insert(ROLE_LABEL.to_string(), role.to_string());
    }

    Service {
        metadata: ObjectMeta {
            name: Some(format!("{}-{}", cluster_name, suffix)),
            namespace: cluster.namespace(),
            labels: Some(standard_labels(&cluster_name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: POSTGRES_PORT,
                target_port: Some(IntOrString::Int(POSTGRES_PORT)),
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
