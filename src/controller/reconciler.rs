//! Reconciliation logic for Cluster resources
//!
//! Each invocation rebuilds its view from scratch and takes at most one
//! action on instances:
//!
//! 1. snapshot the owned Pods, Jobs and PVCs
//! 2. query every instance for its health and replication position
//! 3. project and persist the observed status
//! 4. elect the target primary and keep the pod role labels in sync
//! 5. ensure the services and the disruption budget exist
//! 6. select one action, gated on pending expectations, and execute it

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::action_selector::{ReconcileAction, SelectorInput, select_action};
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result, is_already_exists, is_not_found};
use crate::health::HealthState;
use crate::controller::expectations::OwnerKey;
use crate::controller::managed_resources::{ManagedResources, OwnedResource, get_managed_resources};
use crate::controller::status::{StatusManager, project_status};
use crate::controller::topology::update_target_primary;
use crate::controller::upgrade::maybe_upgrade;
use crate::crd::{Cluster, ClusterPhase};
use crate::resources::common::{
    FIELD_MANAGER, ROLE_LABEL, ROLE_PRIMARY, ROLE_REPLICA, instance_name, instance_serial,
};
use crate::resources::{instance, pdb, service};

/// Requeue delay while waiting on instances or in-flight operations
const WAIT_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue delay after a status write conflict
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let start = Instant::now();

    debug!("Reconciling Cluster");

    let result = finish_reconcile(
        reconcile_cluster(&cluster, &ctx).await,
        ctx.health_state.as_deref(),
        &ns,
        &name,
        start.elapsed(),
    );
    if result.is_ok() {
        ctx.failures.reset(&OwnerKey::for_cluster(&cluster));
    }

    if let Some(ref health) = ctx.health_state {
        health
            .metrics
            .set_pending_expectations(ctx.expectations.total_pending());
    }

    result
}

/// Turn status conflicts into a short requeue and record the outcome
///
/// A conflict is not a failure: someone else wrote the status first and the
/// next invocation starts from the fresh object.
fn finish_reconcile(
    result: Result<Action>,
    health: Option<&HealthState>,
    ns: &str,
    name: &str,
    elapsed: Duration,
) -> Result<Action> {
    let result = match result {
        Err(e) if e.is_conflict() => {
            debug!("Status changed concurrently, retrying: {}", e);
            Ok(Action::requeue(CONFLICT_REQUEUE))
        }
        other => other,
    };

    if let Some(health) = health {
        match &result {
            Ok(_) => {
                health
                    .metrics
                    .record_reconcile(ns, name, elapsed.as_secs_f64());
                health.last_reconcile.store(
                    chrono::Utc::now().timestamp().max(0) as u64,
                    Ordering::Relaxed,
                );
            }
            Err(_) => health.metrics.record_error(ns, name),
        }
    }

    result
}

/// Requeue a failed cluster with exponential backoff
///
/// The delay grows with every consecutive failure of the same cluster and
/// starts over after the next successful reconciliation.
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let attempt = ctx.failures.record(&OwnerKey::for_cluster(&cluster));
    let delay = BackoffConfig::default().delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(
            attempt = attempt + 1,
            "Retryable error for {}: {:?}, requeuing in {:?}",
            cluster.name_any(),
            error,
            delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?}",
            cluster.name_any(),
            error,
            delay
        );
    }

    Action::requeue(delay)
}

async fn reconcile_cluster(cached: &Cluster, ctx: &Context) -> Result<Action> {
    let ns = cached.namespace().unwrap_or_default();
    let key = OwnerKey::for_cluster(cached);

    // The cached copy may be stale; a deleted cluster is left to the garbage
    // collector
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &ns);
    let Some(cluster) = api.get_opt(&cached.name_any()).await? else {
        debug!("Cluster no longer exists");
        ctx.expectations.delete_expectations(&key);
        return Ok(Action::await_change());
    };
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("Cluster is being deleted");
        ctx.expectations.delete_expectations(&key);
        return Ok(Action::await_change());
    }

    if is_namespace_terminating(ctx, &ns).await? {
        debug!("Namespace is terminating, skipping");
        return Ok(Action::await_change());
    }

    let resources = get_managed_resources(&ctx.client, &cluster).await?;
    let reports = ctx.instance_client.get_status_list(&resources.pods).await;

    let mut status_manager = StatusManager::new(ctx.client.clone(), &cluster);
    status_manager
        .update_status(project_status(&cluster, &resources, &reports))
        .await?;

    update_target_primary(&mut status_manager, &reports).await?;

    let status = status_manager.status();
    update_labels_on_pods(ctx, &ns, &resources.pods, &status.current_primary).await?;

    create_cluster_objects(ctx, &cluster).await?;

    if let Some(ref health) = ctx.health_state {
        health.metrics.set_cluster_instances(
            &ns,
            &cluster.name_any(),
            i64::from(cluster.spec.instances),
            i64::from(status.ready_instances),
        );
    }

    let satisfied = ctx.expectations.satisfied_expectations(&key);
    if !satisfied {
        debug!(pending = ?ctx.expectations.pending(&key), "Managed resources are being created or deleted");
    }
    let input = SelectorInput::new(&cluster, &status, &resources, satisfied);
    let action = select_action(&input);

    info!(action = action.kind(), "{}", action);
    if let Some(ref health) = ctx.health_state {
        health.metrics.record_action(action.kind());
    }

    execute_action(ctx, &mut status_manager, &cluster, &resources, &reports, action).await
}

async fn execute_action(
    ctx: &Context,
    status_manager: &mut StatusManager,
    cluster: &Cluster,
    resources: &ManagedResources,
    reports: &crate::instance::InstanceStatusList,
    action: ReconcileAction,
) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let key = OwnerKey::for_cluster(cluster);
    let cluster_name = cluster.name_any();

    match &action {
        ReconcileAction::Wait(reason) => {
            if let Some(phase) = action.phase() {
                status_manager
                    .register_phase(phase, &reason.to_string())
                    .await?;
            }
            Ok(Action::requeue(WAIT_REQUEUE))
        }

        ReconcileAction::RecreateInstances { pvcs } => {
            status_manager
                .register_phase(
                    ClusterPhase::RecreatingInstance,
                    &format!("Recreating instances on {}", pvcs.join(", ")),
                )
                .await?;

            let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
            for pvc_name in pvcs {
                let Some(serial) = resources
                    .pvcs
                    .iter()
                    .find(|p| p.name_any() == *pvc_name)
                    .and_then(|p| instance_serial(&p.metadata))
                else {
                    warn!(pvc = %pvc_name, "Cannot determine the serial of a dangling PVC");
                    continue;
                };
                let pod = instance::generate_instance_pod(status_manager.cluster(), serial);
                create_child(ctx, &key, &pods, &pod).await?;
            }
            Ok(Action::requeue(WAIT_REQUEUE))
        }

        ReconcileAction::CreatePrimary { serial } => {
            let serial = *serial;
            let primary = instance_name(&cluster_name, serial);
            let mut status = status_manager.status();
            status.latest_generated_node = serial;
            status.target_primary = primary.clone();
            status.phase = ClusterPhase::SettingUpPrimary;
            status.phase_reason = format!("Creating primary instance {}", primary);
            status_manager.update_status(status).await?;

            info!(instance = %primary, "Creating primary instance");
            let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);
            let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
            create_child(ctx, &key, &pvcs, &instance::generate_pvc(cluster, serial)).await?;
            create_child(
                ctx,
                &key,
                &jobs,
                &instance::generate_initdb_job(cluster, serial),
            )
            .await?;
            Ok(Action::requeue(WAIT_REQUEUE))
        }

        ReconcileAction::JoinReplica { serial } => {
            let serial = *serial;
            let replica = instance_name(&cluster_name, serial);
            let mut status = status_manager.status();
            let parent = if status.current_primary.is_empty() {
                status.target_primary.clone()
            } else {
                status.current_primary.clone()
            };
            status.latest_generated_node = serial;
            status.phase = ClusterPhase::CreatingReplica;
            status.phase_reason = format!("Creating replica {}", replica);
            status_manager.update_status(status).await?;

            info!(instance = %replica, parent = %parent, "Joining new replica");
            let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);
            let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
            create_child(ctx, &key, &pvcs, &instance::generate_pvc(cluster, serial)).await?;
            create_child(
                ctx,
                &key,
                &jobs,
                &instance::generate_join_job(cluster, serial, &parent),
            )
            .await?;
            Ok(Action::requeue(WAIT_REQUEUE))
        }

        ReconcileAction::ScaleDown { instance } => {
            status_manager
                .register_phase(
                    ClusterPhase::ScalingDown,
                    &format!("Removing instance {}", instance),
                )
                .await?;

            info!(instance = %instance, "Scaling down");
            let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
            let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &ns);
            delete_child(ctx, &key, &pods, instance).await?;
            delete_child(ctx, &key, &pvcs, instance).await?;
            Ok(Action::requeue(WAIT_REQUEUE))
        }

        ReconcileAction::Healthy => {
            let plan = maybe_upgrade(ctx, status_manager, cluster, &resources.pods, reports).await?;
            debug!(plan = ?plan, "Rolling upgrade check");
            Ok(Action::requeue(ctx.config.requeue_interval))
        }

        ReconcileAction::NoOp => Ok(Action::requeue(ctx.config.requeue_interval)),
    }
}

/// Create a child, recording the expected creation first
///
/// An existing object with the same name counts as created.
async fn create_child<K>(ctx: &Context, key: &OwnerKey, api: &Api<K>, obj: &K) -> Result<()>
where
    K: OwnedResource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    ctx.expectations.expect_creations(key, K::RESOURCE_KIND, 1);
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => {
            debug!(kind = %K::RESOURCE_KIND, name = %obj.name_any(), "Created");
            Ok(())
        }
        Err(e) => {
            // Nothing new will be observed for this create
            ctx.expectations.observe_creation(key, K::RESOURCE_KIND);
            if is_already_exists(&e) {
                debug!(kind = %K::RESOURCE_KIND, name = %obj.name_any(), "Already exists");
                Ok(())
            } else {
                Err(e.into())
            }
        }
    }
}

/// Delete a child, recording the expected deletion first
///
/// A missing object counts as deleted.
async fn delete_child<K>(ctx: &Context, key: &OwnerKey, api: &Api<K>, name: &str) -> Result<()>
where
    K: OwnedResource + Clone + DeserializeOwned + std::fmt::Debug,
{
    ctx.expectations.expect_deletions(key, K::RESOURCE_KIND, 1);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            debug!(kind = %K::RESOURCE_KIND, name = name, "Deleted");
            Ok(())
        }
        Err(e) => {
            ctx.expectations.observe_deletion(key, K::RESOURCE_KIND);
            if is_not_found(&e) {
                Ok(())
            } else {
                Err(e.into())
            }
        }
    }
}

async fn is_namespace_terminating(ctx: &Context, ns: &str) -> Result<bool> {
    let api: Api<Namespace> = Api::all(ctx.client.clone());
    let namespace = api.get_opt(ns).await?;
    Ok(namespace
        .and_then(|n| n.status)
        .and_then(|s| s.phase)
        .is_some_and(|phase| phase == "Terminating"))
}

/// Point the role label of every instance at the current primary
///
/// The `-rw` and `-ro` services select on this label.
async fn update_labels_on_pods(ctx: &Context, ns: &str, pods: &[Pod], primary: &str) -> Result<()> {
    if primary.is_empty() {
        return Ok(());
    }

    let api: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    for pod in pods {
        let name = pod.name_any();
        let role = if name == primary {
            ROLE_PRIMARY
        } else {
            ROLE_REPLICA
        };
        if pod.labels().get(ROLE_LABEL).map(String::as_str) == Some(role) {
            continue;
        }

        let labels = BTreeMap::from([(ROLE_LABEL, role)]);
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        match api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!(pod = %name, role = role, "Updated instance role label"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Ensure the services and the disruption budget exist
///
/// The disruption budget is removed during node maintenance windows.
async fn create_cluster_objects(ctx: &Context, cluster: &Cluster) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();

    for svc in service::generate_services(cluster) {
        apply_resource(ctx, &ns, &svc).await?;
    }

    if cluster.is_node_maintenance_window_in_progress() {
        let api: Api<PodDisruptionBudget> = Api::namespaced(ctx.client.clone(), &ns);
        if let Err(e) = api
            .delete(&pdb::pdb_name(cluster), &DeleteParams::default())
            .await
            && !is_not_found(&e)
        {
            return Err(e.into());
        }
    } else {
        apply_resource(ctx, &ns, &pdb::generate_pdb(cluster)).await?;
    }

    Ok(())
}

/// Apply a Kubernetes resource using server-side apply
async fn apply_resource<T>(ctx: &Context, ns: &str, resource: &T) -> Result<()>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + serde::Serialize
        + DeserializeOwned
        + Clone
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(ctx.client.clone(), ns);
    let name = resource.name_any();

    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&name, &params, &Patch::Apply(resource)).await?;
    debug!("Applied resource: {}", name);

    Ok(())
}
