//! Target primary election
//!
//! The operator never promotes an instance itself. It records the instance
//! that should be primary in `status.targetPrimary`; the agent running inside
//! that pod notices and promotes PostgreSQL, after which the status projector
//! moves `status.currentPrimary` to it. While the two differ, the action
//! selector leaves pods alone.

use tracing::{info, warn};

use crate::controller::error::Result;
use crate::controller::status::StatusManager;
use crate::crd::{ClusterPhase, ClusterStatus};
use crate::instance::{InstanceStatus, InstanceStatusList};

/// Outcome of a target primary election
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyDecision {
    /// Leave the target primary as it is
    Unchanged,
    /// No target was recorded yet; adopt the running primary
    Adopt { primary: String },
    /// The primary is lost; promote the most advanced replica
    Failover { from: String, to: String },
}

/// Why the recorded primary is considered lost, if it is
fn primary_lost(primary: &str, reports: &InstanceStatusList) -> Option<&'static str> {
    match reports.get(primary) {
        None => Some("primary pod is missing"),
        Some(report) if !report.reachable && !report.pod_ready => {
            Some("primary is unreachable and not ready")
        }
        Some(report) if report.reachable && !report.is_primary => {
            Some("primary no longer reports the primary role")
        }
        Some(_) => None,
    }
}

/// Whether `report` can be promoted
fn is_candidate(report: &InstanceStatus, exclude: &str) -> bool {
    report.reachable && !report.is_primary && report.pod_name != exclude
}

/// Best replica to promote, ignoring `exclude`
///
/// Most advanced replay position wins; ties go to the lowest serial.
pub fn switchover_target(reports: &InstanceStatusList, exclude: &str) -> Option<String> {
    reports
        .iter()
        .filter(|r| is_candidate(r, exclude))
        .min_by(|a, b| {
            b.replay_lsn
                .cmp(&a.replay_lsn)
                .then_with(|| a.serial.cmp(&b.serial))
        })
        .map(|r| r.pod_name.clone())
}

/// Decide the target primary from the instance reports
pub fn elect_target_primary(status: &ClusterStatus, reports: &InstanceStatusList) -> TopologyDecision {
    if reports.is_empty() {
        return TopologyDecision::Unchanged;
    }

    // A promotion is already in flight
    if !status.current_primary.is_empty() && status.current_primary != status.target_primary {
        return TopologyDecision::Unchanged;
    }

    if let Some(primary) = reports.primaries().next() {
        if status.target_primary.is_empty() {
            return TopologyDecision::Adopt {
                primary: primary.pod_name.clone(),
            };
        }
        return TopologyDecision::Unchanged;
    }

    // No reachable primary: nothing to fail over from until a target exists
    if status.target_primary.is_empty() {
        return TopologyDecision::Unchanged;
    }
    let primary = status.target_primary.as_str();

    if primary_lost(primary, reports).is_none() {
        return TopologyDecision::Unchanged;
    }

    match switchover_target(reports, primary) {
        Some(to) => TopologyDecision::Failover {
            from: primary.to_string(),
            to,
        },
        None => TopologyDecision::Unchanged,
    }
}

/// Elect and persist the target primary
pub async fn update_target_primary(
    status_manager: &mut StatusManager,
    reports: &InstanceStatusList,
) -> Result<TopologyDecision> {
    let mut status = status_manager.status();
    let decision = elect_target_primary(&status, reports);

    match &decision {
        TopologyDecision::Unchanged => return Ok(decision),
        TopologyDecision::Adopt { primary } => {
            info!(primary = %primary, "Adopting running primary as target primary");
            status.target_primary = primary.clone();
            status_manager.update_status(status).await?;
        }
        TopologyDecision::Failover { from, to } => {
            let reason = primary_lost(from, reports).unwrap_or("primary lost");
            warn!(
                currentPrimary = %from,
                targetPrimary = %to,
                reason = reason,
                "Primary lost, electing new target primary"
            );
            status.target_primary = to.clone();
            status.phase = ClusterPhase::FailingOver;
            status.phase_reason = format!("Failing over from {} to {}: {}", from, to, reason);
            status_manager.update_status(status).await?;
        }
    }

    Ok(decision)
}
