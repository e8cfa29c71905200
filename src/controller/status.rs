//! Status projection and persistence for Cluster resources
//!
//! [`project_status`] derives the observed part of the status from the child
//! snapshot and the instance reports. [`StatusManager`] persists it on the
//! status subresource with optimistic concurrency: every write carries the
//! `resourceVersion` it was computed from, and a 409 surfaces as
//! [`Error::StatusConflict`] for the caller to retry on the next invocation.

use chrono::Utc;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use crate::controller::error::{Error, Result, is_conflict};
use crate::controller::managed_resources::ManagedResources;
use crate::crd::{Cluster, ClusterPhase, ClusterStatus, Condition};
use crate::instance::InstanceStatusList;
use crate::resources::common::FIELD_MANAGER;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// All instances are ready and match the spec
    pub const READY: &str = "Ready";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't
    ///
    /// The transition time only moves when the status changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Set the Ready condition
    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        let status = if is_ready {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(condition_types::READY, status, reason, message)
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Derive the observed status of a cluster
///
/// Fields owned by other components (target primary, serial allocator,
/// phase) are carried over from the stored status unchanged.
pub fn project_status(
    cluster: &Cluster,
    resources: &ManagedResources,
    reports: &InstanceStatusList,
) -> ClusterStatus {
    let mut status = cluster.status_or_default();

    status.instances = resources.instance_count();
    status.ready_instances = resources.ready_instances();
    status.instance_names = resources.instance_names();
    status.dangling_pvc = resources.dangling_pvcs();
    status.observed_generation = cluster.metadata.generation;

    let primaries: Vec<&str> = reports.primaries().map(|r| r.pod_name.as_str()).collect();
    if let Some(primary) = primaries
        .iter()
        .find(|name| **name == status.target_primary)
        .or_else(|| primaries.first())
    {
        status.current_primary = (*primary).to_string();
    }

    status
}

/// Writes the status subresource of one cluster
///
/// Keeps the latest known copy of the object so consecutive writes within a
/// reconciliation carry the right `resourceVersion`.
pub struct StatusManager {
    api: Api<Cluster>,
    cluster: Cluster,
}

impl StatusManager {
    pub fn new(client: Client, cluster: &Cluster) -> Self {
        let ns = cluster.namespace().unwrap_or_default();
        Self {
            api: Api::namespaced(client, &ns),
            cluster: cluster.clone(),
        }
    }

    /// Latest known copy of the cluster
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Latest known status, or an empty one
    pub fn status(&self) -> ClusterStatus {
        self.cluster.status_or_default()
    }

    /// Persist `status`, skipping the write when nothing changed
    pub async fn update_status(&mut self, status: ClusterStatus) -> Result<()> {
        if self.cluster.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let name = self.cluster.name_any();
        let body = status_update_body(&self.cluster, &status)?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        let updated = self
            .api
            .replace_status(&name, &params, body)
            .await
            .map_err(|e| {
                if is_conflict(&e) {
                    Error::StatusConflict(format!(
                        "{}/{}",
                        self.cluster.namespace().unwrap_or_default(),
                        name
                    ))
                } else {
                    Error::KubeError(e)
                }
            })?;

        debug!(cluster = %name, phase = %status.phase, "Updated cluster status");
        self.cluster = updated;
        Ok(())
    }

    /// Record the phase and keep the Ready condition in sync with it
    pub async fn register_phase(&mut self, phase: ClusterPhase, reason: &str) -> Result<()> {
        let mut status = self.status();
        status.phase = phase;
        status.phase_reason = reason.to_string();
        status.conditions = phase_conditions(&self.cluster, phase, reason);
        self.update_status(status).await
    }
}

/// Body of a status write: the whole object with `status` replacing the old one
///
/// The status is replaced wholesale, so fields emptied by the projection are
/// cleared on the server. The `resourceVersion` of `cluster` makes the write
/// fail with a conflict if the object changed since it was read.
pub fn status_update_body(cluster: &Cluster, status: &ClusterStatus) -> Result<Vec<u8>> {
    let mut updated = cluster.clone();
    updated.status = Some(status.clone());
    Ok(serde_json::to_vec(&updated)?)
}

fn phase_conditions(cluster: &Cluster, phase: ClusterPhase, reason: &str) -> Vec<Condition> {
    let existing = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let builder = ConditionBuilder::from_existing(existing, cluster.metadata.generation);

    if phase == ClusterPhase::Healthy {
        builder.ready(true, "ClusterIsReady", "All instances are ready")
    } else {
        builder.ready(false, "ClusterIsNotReady", &format!("{}: {}", phase, reason))
    }
    .build()
}
