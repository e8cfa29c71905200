//! Operator runtime configuration read from the environment

use std::time::Duration;

use crate::controller::expectations::DEFAULT_EXPECTATIONS_TTL;
use crate::instance::DEFAULT_STATUS_TIMEOUT;

/// Default port of the health and metrics server
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Default periodic requeue of healthy clusters
pub const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Runtime configuration of the operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace to watch; cluster-wide when `None`
    pub watch_namespace: Option<String>,
    /// Leader election identity
    pub pod_name: String,
    /// Namespace holding the leader election lease
    pub pod_namespace: String,
    pub expectations_ttl: Duration,
    pub instance_status_timeout: Duration,
    pub health_port: u16,
    pub requeue_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            pod_name: "pg-cluster-operator".to_string(),
            pod_namespace: "default".to_string(),
            expectations_ttl: DEFAULT_EXPECTATIONS_TTL,
            instance_status_timeout: DEFAULT_STATUS_TIMEOUT,
            health_port: DEFAULT_HEALTH_PORT,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`
    ///
    /// Unparseable numbers fall back to their default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let pod_name = lookup("POD_NAME")
            .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
            .unwrap_or(defaults.pod_name);

        Self {
            watch_namespace: lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty()),
            pod_name,
            pod_namespace: lookup("POD_NAMESPACE").unwrap_or(defaults.pod_namespace),
            expectations_ttl: seconds(&lookup, "EXPECTATIONS_TTL_SECS", defaults.expectations_ttl),
            instance_status_timeout: seconds(
                &lookup,
                "INSTANCE_STATUS_TIMEOUT_SECS",
                defaults.instance_status_timeout,
            ),
            health_port: parse(&lookup, "HEALTH_PORT", defaults.health_port),
            requeue_interval: seconds(&lookup, "REQUEUE_INTERVAL_SECS", defaults.requeue_interval),
        }
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key = key, value = %raw, "Invalid value, using default");
            default
        }),
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse(lookup, key, default.as_secs()))
}
