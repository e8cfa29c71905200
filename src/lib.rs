pub mod archive;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod instance;
pub mod resources;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, ExpectationTracker, Result, error_policy, reconcile,
};
pub use crd::Cluster;
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use crate::controller::run_expectation_observer;
use crate::resources::common::CLUSTER_LABEL;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the Cluster controller.
///
/// Watches Cluster resources and the Pods, Jobs, PVCs, Services and
/// PodDisruptionBudgets they own, and runs the expectation observer next to
/// it. When `config.watch_namespace` is set only that namespace is watched.
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    config: OperatorConfig,
) {
    let namespace = config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    tracing::info!(
        "Starting controller for Cluster resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let expectations = Arc::new(ExpectationTracker::with_ttl(config.expectations_ttl));
    let observer = {
        let client = client.clone();
        let expectations = expectations.clone();
        let namespace = namespace.map(str::to_string);
        tokio::spawn(async move {
            run_expectation_observer(client, namespace.as_deref(), expectations).await;
        })
    };

    let ctx = Arc::new(Context::new(
        client.clone(),
        health_state,
        expectations,
        config,
    ));

    let clusters: Api<Cluster> = scoped_api(client.clone(), namespace);
    let pods: Api<Pod> = scoped_api(client.clone(), namespace);
    let jobs: Api<Job> = scoped_api(client.clone(), namespace);
    let pvcs: Api<PersistentVolumeClaim> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let pdbs: Api<PodDisruptionBudget> = scoped_api(client.clone(), namespace);

    // Children are only ever created with the cluster label
    let watcher_config = WatcherConfig::default().any_semantic();
    let owned_config = watcher_config.clone().labels(CLUSTER_LABEL);

    Controller::new(clusters, watcher_config)
        .owns(pods, owned_config.clone())
        .owns(jobs, owned_config.clone())
        .owns(pvcs, owned_config.clone())
        .owns(services, owned_config.clone())
        .owns(pdbs, owned_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // ObjectNotFound errors are expected right after deletion
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    observer.abort();
    tracing::info!("Controller stream ended");
}
