//! Instance status reports collected from the in-pod management endpoint
//!
//! Every instance pod runs a management agent listening on port 8000. The
//! operator queries `GET /pg/status` on each pod IP to learn whether the
//! instance is primary and how far its replication has progressed.
//!
//! Queries are best-effort: a pod that cannot be reached within the timeout
//! is reported with `reachable = false` and never fails the reconciliation.
//!
//! # Requirements
//!
//! **In-cluster deployment**: the operator needs network access to pod IPs.
//! When running outside the cluster every instance is reported unreachable.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::controller::managed_resources::is_pod_ready;
use crate::resources::common::instance_serial;
use crate::resources::instance::MANAGEMENT_PORT;

/// Default timeout of a single status query (connect + request + response)
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

const STATUS_PATH: &str = "/pg/status";

/// Errors that can occur while querying an instance
#[derive(Debug, thiserror::Error)]
pub enum InstanceStatusError {
    #[error("Pod IP not available for {0}")]
    NoPodIp(String),

    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    #[error("Request timed out")]
    Timeout,
}

/// A PostgreSQL write-ahead log position
///
/// Rendered as two hexadecimal halves separated by a slash, e.g. `16/B374D848`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl FromStr for Lsn {
    type Err = InstanceStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InstanceStatusError::InvalidLsn(s.to_string());
        let (high, low) = s.split_once('/').ok_or_else(invalid)?;
        let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(high) << 32) | u64::from(low)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// Body of the management endpoint response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    is_primary: bool,
    #[serde(default)]
    received_lsn: Option<String>,
    #[serde(default)]
    replay_lsn: Option<String>,
    #[serde(default)]
    timeline_id: Option<u32>,
}

/// Health and replication state of one instance
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceStatus {
    pub pod_name: String,
    pub serial: i32,
    /// The management endpoint answered
    pub reachable: bool,
    /// Kubernetes reports the pod Ready
    pub pod_ready: bool,
    pub is_primary: bool,
    pub received_lsn: Option<Lsn>,
    pub replay_lsn: Option<Lsn>,
    pub timeline_id: Option<u32>,
    /// Why the query failed, when it did
    pub error: Option<String>,
}

impl InstanceStatus {
    fn from_pod(pod: &Pod) -> Self {
        Self {
            pod_name: pod.name_any(),
            serial: instance_serial(&pod.metadata).unwrap_or_default(),
            pod_ready: is_pod_ready(pod),
            ..Default::default()
        }
    }

    fn unreachable(mut self, error: InstanceStatusError) -> Self {
        self.reachable = false;
        self.error = Some(error.to_string());
        self
    }

    fn apply_response(mut self, response: StatusResponse) -> Result<Self, InstanceStatusError> {
        self.reachable = true;
        self.is_primary = response.is_primary;
        self.received_lsn = response.received_lsn.as_deref().map(str::parse).transpose()?;
        self.replay_lsn = response.replay_lsn.as_deref().map(str::parse).transpose()?;
        self.timeline_id = response.timeline_id;
        Ok(self)
    }
}

/// Reports of every instance of a cluster
///
/// Sorted primary first, then by most advanced replay position, then by
/// lowest serial; unreachable instances come last.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceStatusList {
    pub items: Vec<InstanceStatus>,
}

impl InstanceStatusList {
    pub fn new(mut items: Vec<InstanceStatus>) -> Self {
        items.sort_by(compare_instances);
        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceStatus> {
        self.items.iter()
    }

    pub fn get(&self, pod_name: &str) -> Option<&InstanceStatus> {
        self.items.iter().find(|i| i.pod_name == pod_name)
    }

    /// Reachable instances reporting the primary role
    pub fn primaries(&self) -> impl Iterator<Item = &InstanceStatus> {
        self.items.iter().filter(|i| i.reachable && i.is_primary)
    }
}

fn compare_instances(a: &InstanceStatus, b: &InstanceStatus) -> Ordering {
    b.reachable
        .cmp(&a.reachable)
        .then_with(|| b.is_primary.cmp(&a.is_primary))
        .then_with(|| b.replay_lsn.cmp(&a.replay_lsn))
        .then_with(|| a.serial.cmp(&b.serial))
}

/// Client for the in-pod management endpoint
#[derive(Clone, Debug)]
pub struct InstanceStatusClient {
    timeout: Duration,
}

impl Default for InstanceStatusClient {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_TIMEOUT)
    }
}

impl InstanceStatusClient {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Query every pod concurrently
    pub async fn get_status_list(&self, pods: &[Pod]) -> InstanceStatusList {
        let reports = join_all(pods.iter().map(|pod| self.get_status(pod))).await;
        InstanceStatusList::new(reports)
    }

    /// Query a single pod, folding any failure into an unreachable report
    pub async fn get_status(&self, pod: &Pod) -> InstanceStatus {
        let report = InstanceStatus::from_pod(pod);

        let Some(pod_ip) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()) else {
            return report.unreachable(InstanceStatusError::NoPodIp(pod.name_any()));
        };

        let result = match timeout(self.timeout, query_status(&pod_ip)).await {
            Ok(result) => result,
            Err(_) => Err(InstanceStatusError::Timeout),
        };

        match result.and_then(|response| report.clone().apply_response(response)) {
            Ok(report) => report,
            Err(e) => {
                debug!(pod = %report.pod_name, error = %e, "Instance status query failed");
                report.unreachable(e)
            }
        }
    }
}

/// Address of the management endpoint of a pod
///
/// IPv6 pod IPs are bracketed when rendered.
pub fn management_addr(pod_ip: &str) -> Result<SocketAddr, InstanceStatusError> {
    let ip: IpAddr = pod_ip.parse().map_err(|e| {
        InstanceStatusError::ConnectionError(format!("Invalid pod IP {}: {}", pod_ip, e))
    })?;
    Ok(SocketAddr::new(ip, MANAGEMENT_PORT))
}

async fn query_status(pod_ip: &str) -> Result<StatusResponse, InstanceStatusError> {
    let addr = management_addr(pod_ip)?;

    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| InstanceStatusError::ConnectionError(e.to_string()))?;

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| InstanceStatusError::HttpError(e.to_string()))?;

    let req = Request::builder()
        .method("GET")
        .uri(STATUS_PATH)
        .header("Host", addr.to_string())
        .body(Empty::<Bytes>::new())
        .map_err(|e| InstanceStatusError::HttpError(e.to_string()))?;

    let response = tokio::select! {
        conn_result = conn => {
            if let Err(e) = conn_result {
                debug!("Connection closed: {}", e);
            }
            return Err(InstanceStatusError::ConnectionError("Connection closed unexpectedly".to_string()));
        }
        response = sender.send_request(req) => {
            response.map_err(|e| InstanceStatusError::HttpError(e.to_string()))?
        }
    };

    if !response.status().is_success() {
        return Err(InstanceStatusError::HttpError(format!(
            "HTTP {}: {}",
            response.status().as_u16(),
            response.status().canonical_reason().unwrap_or("Unknown")
        )));
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| InstanceStatusError::HttpError(e.to_string()))?
        .to_bytes();

    trace!(pod_ip = pod_ip, response = %String::from_utf8_lossy(&body), "Instance status response");

    Ok(serde_json::from_slice(&body)?)
}
