//! Probe and metrics endpoints
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the
//! controller has started, and `/metrics` serves the reconciler metrics in
//! Prometheus text format.

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Per-cluster metric labels
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl ReconcileLabels {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl prometheus_client::encoding::EncodeLabelSet for ReconcileLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Label of the actions counter
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ActionLabels {
    pub action: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ActionLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("action", self.action.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Reconciler metrics
///
/// Status write conflicts count as reconciliations, never as errors.
pub struct Metrics {
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,

    /// Actions taken by the reconciler, by kind
    pub actions_total: Family<ActionLabels, Counter>,
    /// Creates and deletes not yet observed, across all clusters
    pub pending_expectations: Gauge,
    /// Desired instances per cluster
    pub cluster_instances_desired: Family<ReconcileLabels, Gauge>,
    /// Ready instances per cluster
    pub cluster_instances_ready: Family<ReconcileLabels, Gauge>,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "pg_cluster_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "pg_cluster_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "pg_cluster_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let actions_total = Family::<ActionLabels, Counter>::default();
        registry.register(
            "pg_cluster_operator_actions",
            "Total number of actions taken by the reconciler",
            actions_total.clone(),
        );

        let pending_expectations = Gauge::default();
        registry.register(
            "pg_cluster_operator_pending_expectations",
            "Creates and deletes issued but not yet observed",
            pending_expectations.clone(),
        );

        let cluster_instances_desired = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "pg_cluster_operator_cluster_instances_desired",
            "Desired number of instances for each cluster",
            cluster_instances_desired.clone(),
        );

        let cluster_instances_ready = Family::<ReconcileLabels, Gauge>::default();
        registry.register(
            "pg_cluster_operator_cluster_instances_ready",
            "Number of ready instances for each cluster",
            cluster_instances_ready.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            actions_total,
            pending_expectations,
            cluster_instances_desired,
            cluster_instances_ready,
            registry,
        }
    }

    /// Record a successful reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ReconcileLabels::new(namespace, name);
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors_total
            .get_or_create(&ReconcileLabels::new(namespace, name))
            .inc();
    }

    /// Record an action taken by the reconciler
    pub fn record_action(&self, action: &str) {
        let labels = ActionLabels {
            action: action.to_string(),
        };
        self.actions_total.get_or_create(&labels).inc();
    }

    /// Update the number of pending expectations
    pub fn set_pending_expectations(&self, pending: u64) {
        self.pending_expectations
            .set(i64::try_from(pending).unwrap_or(i64::MAX));
    }

    /// Desired and ready instance counts of one cluster
    pub fn set_cluster_instances(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = ReconcileLabels::new(namespace, name);
        self.cluster_instances_desired
            .get_or_create(&labels)
            .set(desired);
        self.cluster_instances_ready
            .get_or_create(&labels)
            .set(ready);
    }

    /// Prometheus text encoding, empty if encoding fails
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// State shared between the controller and the health server
pub struct HealthState {
    /// Set once the controller runs, cleared on shutdown
    pub ready: RwLock<bool>,
    pub metrics: Metrics,
    /// Unix time of the last successful reconciliation
    pub last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the probe and metrics endpoints on all interfaces
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Health server listening on {}", addr);

    axum::serve(listener, app).await
}
