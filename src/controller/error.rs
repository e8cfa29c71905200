//! Error types for the Cluster controller

use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use crate::controller::expectations::OwnerKey;

/// Error variants are named with the `Error` suffix where they wrap another error.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The status subresource was written concurrently; retry on the next invocation.
    #[error("Status of {0} was updated concurrently")]
    StatusConflict(String),

    #[error("{command} exited with code {exit_code}: {stderr}")]
    ArchiveCommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Incompatible tool version: {0}")]
    IncompatibleToolVersion(String),

    #[error("Failed to run {command}: {source}")]
    CommandIoError {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Check if this error indicates a resource was not found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(e) if is_not_found(e))
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::StatusConflict(_) => true,
            Error::KubeError(e) => is_conflict(e),
            _ => false,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    // 4xx errors (except 409 Conflict, 429 TooManyRequests) are usually not retryable
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            Error::StatusConflict(_) => true,
            Error::ArchiveCommandFailed { .. } => true,
            Error::CommandIoError { .. } => true,
            Error::InvalidConfig(_) => false,
            Error::IncompatibleToolVersion(_) => false,
            Error::SerializationError(_) => false,
        }
    }
}

/// Whether a kube error is a 409 Conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 409)
}

/// Whether a kube error is a 409 AlreadyExists
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists")
}

/// Whether a kube error is a 404 NotFound
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(api_err) if api_err.code == 404)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300), // 5 minutes
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.min(31) as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Non-retryable errors wait for manual intervention
            self.max_delay
        }
    }
}

/// Consecutive reconciliation failures per cluster
#[derive(Debug, Default)]
pub struct FailureCounter {
    counts: DashMap<OwnerKey, u32>,
}

impl FailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return how many preceded it
    pub fn record(&self, key: &OwnerKey) -> u32 {
        let mut count = self.counts.entry(key.clone()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub fn reset(&self, key: &OwnerKey) {
        self.counts.remove(key);
    }
}
