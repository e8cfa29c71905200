//! Rolling upgrade sequencing
//!
//! Entered only when the cluster is healthy at its target size. One step is
//! taken per reconciliation:
//!
//! 1. stale replicas are deleted one at a time, highest serial first; their
//!    PVC is kept so the dangling-PVC rule recreates them from the new spec
//! 2. once only the primary is stale, either wait for the user (supervised)
//!    or switch over to the most advanced replica (unsupervised), after which
//!    the old primary is a stale replica like any other

use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::{Api, ResourceExt};
use tracing::info;

use crate::controller::Context;
use crate::controller::error::{Result, is_not_found};
use crate::controller::expectations::{OwnerKey, ResourceKind};
use crate::controller::status::StatusManager;
use crate::controller::topology::switchover_target;
use crate::crd::{Cluster, ClusterPhase, PrimaryUpdateStrategy};
use crate::instance::InstanceStatusList;
use crate::resources::common::{SPEC_HASH_ANNOTATION, instance_serial};
use crate::resources::instance::{POSTGRES_CONTAINER, spec_hash};

/// Next rolling upgrade step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradePlan {
    /// Every instance matches the spec
    UpToDate,
    /// Delete this replica pod so it is recreated with the new spec
    Recreate { pod: String },
    /// Only the primary is stale; switch over to `to` first
    Switchover { from: String, to: String },
    /// Only the primary is stale and the switchover needs a user
    WaitForUser { primary: String },
}

impl UpgradePlan {
    /// Phase the cluster is in while this step is pending
    pub fn phase(&self) -> ClusterPhase {
        match self {
            UpgradePlan::UpToDate => ClusterPhase::Healthy,
            UpgradePlan::Recreate { .. } => ClusterPhase::Upgrading,
            UpgradePlan::Switchover { .. } => ClusterPhase::Switchover,
            UpgradePlan::WaitForUser { .. } => ClusterPhase::WaitingForUser,
        }
    }
}

/// Why a pod does not match the spec, if it does not
pub fn stale_reason(cluster: &Cluster, pod: &Pod) -> Option<String> {
    let image = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.iter().find(|c| c.name == POSTGRES_CONTAINER))
        .and_then(|c| c.image.as_deref());
    if image != Some(cluster.spec.image_name.as_str()) {
        return Some(format!(
            "image {} differs from {}",
            image.unwrap_or("<none>"),
            cluster.spec.image_name
        ));
    }

    let expected = spec_hash(cluster);
    if pod.annotations().get(SPEC_HASH_ANNOTATION) != Some(&expected) {
        return Some("configuration changed".to_string());
    }

    None
}

/// Decide the next upgrade step
pub fn plan_upgrade(
    cluster: &Cluster,
    pods: &[Pod],
    reports: &InstanceStatusList,
    primary: &str,
) -> UpgradePlan {
    let mut stale: Vec<(&Pod, i32)> = pods
        .iter()
        .filter(|p| stale_reason(cluster, p).is_some())
        .map(|p| (p, instance_serial(&p.metadata).unwrap_or_default()))
        .collect();
    stale.sort_by_key(|(_, serial)| std::cmp::Reverse(*serial));

    if let Some((replica, _)) = stale.iter().find(|(p, _)| p.name_any() != primary) {
        return UpgradePlan::Recreate {
            pod: replica.name_any(),
        };
    }

    if stale.is_empty() {
        return UpgradePlan::UpToDate;
    }

    if cluster.spec.primary_update_strategy == PrimaryUpdateStrategy::Supervised {
        return UpgradePlan::WaitForUser {
            primary: primary.to_string(),
        };
    }

    match switchover_target(reports, primary) {
        Some(to) => UpgradePlan::Switchover {
            from: primary.to_string(),
            to,
        },
        None => UpgradePlan::WaitForUser {
            primary: primary.to_string(),
        },
    }
}

/// Take the next rolling upgrade step, if any
///
/// Only the phase of the planned step is recorded, so a cluster waiting on
/// an upgrade never flips through `Healthy` in between.
pub async fn maybe_upgrade(
    ctx: &Context,
    status_manager: &mut StatusManager,
    cluster: &Cluster,
    pods: &[Pod],
    reports: &InstanceStatusList,
) -> Result<UpgradePlan> {
    let primary = status_manager.status().current_primary;
    let plan = plan_upgrade(cluster, pods, reports, &primary);

    match &plan {
        UpgradePlan::UpToDate => {
            status_manager.register_phase(plan.phase(), "").await?;
        }
        UpgradePlan::Recreate { pod } => {
            let reason = pods
                .iter()
                .find(|p| p.name_any() == *pod)
                .and_then(|p| stale_reason(cluster, p))
                .unwrap_or_default();
            info!(pod = %pod, reason = %reason, "Recreating stale replica");

            status_manager
                .register_phase(plan.phase(), &format!("Recreating {}: {}", pod, reason))
                .await?;

            let api: Api<Pod> =
                Api::namespaced(ctx.client.clone(), &cluster.namespace().unwrap_or_default());
            let key = OwnerKey::for_cluster(cluster);
            ctx.expectations.expect_deletions(&key, ResourceKind::Pod, 1);
            if let Err(e) = api.delete(pod, &DeleteParams::default()).await {
                ctx.expectations.observe_deletion(&key, ResourceKind::Pod);
                if !is_not_found(&e) {
                    return Err(e.into());
                }
            }
        }
        UpgradePlan::Switchover { from, to } => {
            info!(currentPrimary = %from, targetPrimary = %to, "Switching over to upgrade the primary");
            let mut status = status_manager.status();
            status.target_primary = to.clone();
            status.phase = plan.phase();
            status.phase_reason = format!("Switching over to {} to upgrade {}", to, from);
            status_manager.update_status(status).await?;
        }
        UpgradePlan::WaitForUser { primary } => {
            status_manager
                .register_phase(
                    plan.phase(),
                    &format!("Primary {} needs a switchover to be upgraded", primary),
                )
                .await?;
        }
    }

    Ok(plan)
}
