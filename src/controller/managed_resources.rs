//! Snapshot of the Pods, Jobs and PVCs owned by a cluster
//!
//! Children are listed server-side with the cluster label (kube has no
//! owner-reference field index) and cross-checked client-side against the
//! controller owner reference, so objects that merely carry the label (job
//! pods, copies made by users) never enter the snapshot.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ListParams;
use kube::{Api, Client, Resource, ResourceExt};
use std::collections::BTreeSet;

use crate::controller::error::Result;
use crate::controller::expectations::{OwnerKey, ResourceKind};
use crate::crd::Cluster;
use crate::resources::common::{API_VERSION, KIND, cluster_selector, instance_serial};

/// Child resource whose owning cluster can be derived uniformly
pub trait OwnedResource: Resource<DynamicType = ()> {
    /// Kind used for expectation bookkeeping
    const RESOURCE_KIND: ResourceKind;

    /// Controller owner reference, if any
    fn controller_owner(&self) -> Option<&OwnerReference> {
        self.meta()
            .owner_references
            .as_ref()?
            .iter()
            .find(|r| r.controller == Some(true))
    }

    /// Key of the owning cluster, if the controller owner is a Cluster
    fn owner_key(&self) -> Option<OwnerKey> {
        let owner = self.controller_owner()?;
        if owner.api_version != API_VERSION || owner.kind != KIND {
            return None;
        }
        Some(OwnerKey::new(
            self.meta().namespace.clone().unwrap_or_default(),
            owner.name.clone(),
        ))
    }
}

impl OwnedResource for Pod {
    const RESOURCE_KIND: ResourceKind = ResourceKind::Pod;
}

impl OwnedResource for Job {
    const RESOURCE_KIND: ResourceKind = ResourceKind::Job;
}

impl OwnedResource for PersistentVolumeClaim {
    const RESOURCE_KIND: ResourceKind = ResourceKind::PersistentVolumeClaim;
}

/// Per-invocation, read-only view of the children of a cluster
#[derive(Clone, Debug, Default)]
pub struct ManagedResources {
    pub pods: Vec<Pod>,
    pub jobs: Vec<Job>,
    pub pvcs: Vec<PersistentVolumeClaim>,
}

/// List every child owned by the cluster
///
/// Either all three lists succeed or the first error is returned.
pub async fn get_managed_resources(client: &Client, cluster: &Cluster) -> Result<ManagedResources> {
    let ns = cluster.namespace().unwrap_or_default();
    let params = ListParams::default().labels(&cluster_selector(&cluster.name_any()));

    let pods: Api<Pod> = Api::namespaced(client.clone(), &ns);
    let jobs: Api<Job> = Api::namespaced(client.clone(), &ns);
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &ns);

    let (pods, jobs, pvcs) = tokio::try_join!(
        pods.list(&params),
        jobs.list(&params),
        pvcs.list(&params)
    )?;

    Ok(ManagedResources::from_lists(
        &OwnerKey::for_cluster(cluster),
        pods.items,
        jobs.items,
        pvcs.items,
    ))
}

fn owned_by<T: OwnedResource>(key: &OwnerKey, items: Vec<T>) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| item.owner_key().as_ref() == Some(key))
        .collect()
}

impl ManagedResources {
    /// Build a snapshot keeping only objects controlled by `key`
    ///
    /// Pods are ordered by serial so the snapshot is deterministic.
    pub fn from_lists(
        key: &OwnerKey,
        pods: Vec<Pod>,
        jobs: Vec<Job>,
        pvcs: Vec<PersistentVolumeClaim>,
    ) -> Self {
        let mut pods = owned_by(key, pods);
        pods.sort_by_key(|p| (instance_serial(&p.metadata).unwrap_or(i32::MAX), p.name_any()));
        let mut pvcs = owned_by(key, pvcs);
        pvcs.sort_by_key(|p| p.name_any());

        Self {
            pods,
            jobs: owned_by(key, jobs),
            pvcs,
        }
    }

    /// Number of instance pods
    pub fn instance_count(&self) -> i32 {
        self.pods.len() as i32
    }

    /// Names of the instance pods, in serial order
    pub fn instance_names(&self) -> Vec<String> {
        self.pods.iter().map(|p| p.name_any()).collect()
    }

    /// Number of instance pods passing readiness
    pub fn ready_instances(&self) -> i32 {
        self.pods.iter().filter(|p| is_pod_ready(p)).count() as i32
    }

    /// Number of bootstrap jobs that have neither completed nor failed
    pub fn count_running_jobs(&self) -> i32 {
        self.jobs.iter().filter(|j| is_job_running(j)).count() as i32
    }

    /// PVCs with no pod of the same name
    ///
    /// PVCs being deleted, and PVCs still being written by a running
    /// bootstrap job, are not dangling.
    pub fn dangling_pvcs(&self) -> Vec<String> {
        let pod_names: BTreeSet<String> = self.pods.iter().map(|p| p.name_any()).collect();
        let busy: BTreeSet<String> = self
            .jobs
            .iter()
            .filter(|j| is_job_running(j))
            .filter_map(job_instance_name)
            .collect();

        self.pvcs
            .iter()
            .filter(|pvc| pvc.metadata.deletion_timestamp.is_none())
            .map(|pvc| pvc.name_any())
            .filter(|name| !pod_names.contains(name) && !busy.contains(name))
            .collect()
    }

    /// Highest serial seen on any pod or PVC
    pub fn highest_serial(&self) -> i32 {
        self.pods
            .iter()
            .map(|p| &p.metadata)
            .chain(self.pvcs.iter().map(|p| &p.metadata))
            .filter_map(instance_serial)
            .max()
            .unwrap_or(0)
    }

    /// Instance pod by name
    pub fn pod(&self, name: &str) -> Option<&Pod> {
        self.pods.iter().find(|p| p.name_any() == name)
    }
}

fn job_instance_name(job: &Job) -> Option<String> {
    job.labels()
        .get(crate::resources::common::INSTANCE_NAME_LABEL)
        .cloned()
}

/// Whether the pod's Ready condition is True
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether the job has neither a Complete nor a Failed condition
pub fn is_job_running(job: &Job) -> bool {
    let finished = job
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
        });
    !finished
}
