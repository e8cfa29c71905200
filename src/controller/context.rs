use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::controller::error::FailureCounter;
use crate::controller::expectations::ExpectationTracker;
use crate::health::HealthState;
use crate::instance::InstanceStatusClient;

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Health state for metrics; absent in tests
    pub health_state: Option<Arc<HealthState>>,
    /// In-flight creates and deletes, shared with the expectation observer
    pub expectations: Arc<ExpectationTracker>,
    /// Client for the in-pod management endpoint
    pub instance_client: InstanceStatusClient,
    /// Consecutive failures per cluster, driving the error backoff
    pub failures: Arc<FailureCounter>,
    pub config: OperatorConfig,
}

impl Context {
    pub fn new(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        expectations: Arc<ExpectationTracker>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            client,
            health_state,
            expectations,
            instance_client: InstanceStatusClient::new(config.instance_status_timeout),
            failures: Arc::new(FailureCounter::new()),
            config,
        }
    }
}
