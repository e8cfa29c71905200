//! The reconciliation decision tree
//!
//! [`select_action`] is a pure function from the observed state of a cluster
//! to exactly one next action. Rules are evaluated top to bottom and the
//! first one that matches wins; every rule may assume all the rules above it
//! did not match.

use std::fmt;

use kube::ResourceExt;

use crate::controller::managed_resources::ManagedResources;
use crate::crd::{Cluster, ClusterPhase, ClusterStatus};
use crate::resources::common::instance_serial;

/// Why the selector chose not to act
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitReason {
    /// Creates or deletes issued earlier have not been observed yet
    ExpectationsPending,
    /// A failover or switchover is being carried out by the instances
    PrimaryChangeInProgress,
    /// A bootstrap job is still initializing or cloning an instance
    JobsRunning,
    /// Some instance is not ready yet
    InstancesNotReady,
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitReason::ExpectationsPending => {
                write!(f, "waiting for managed resources to be created or deleted")
            }
            WaitReason::PrimaryChangeInProgress => {
                write!(f, "a switchover or failover is in progress")
            }
            WaitReason::JobsRunning => write!(f, "waiting for bootstrap jobs to finish"),
            WaitReason::InstancesNotReady => write!(f, "waiting for instances to become ready"),
        }
    }
}

/// The one action a reconciliation takes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    Wait(WaitReason),
    /// Start pods on PVCs that lost theirs
    RecreateInstances { pvcs: Vec<String> },
    /// Bootstrap the first instance
    CreatePrimary { serial: i32 },
    /// Everything matches the spec; check for rolling upgrades
    Healthy,
    /// Clone the primary into a new instance
    JoinReplica { serial: i32 },
    /// Remove one instance
    ScaleDown { instance: String },
    NoOp,
}

impl ReconcileAction {
    /// Short label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileAction::Wait(_) => "wait",
            ReconcileAction::RecreateInstances { .. } => "recreate_instances",
            ReconcileAction::CreatePrimary { .. } => "create_primary",
            ReconcileAction::Healthy => "healthy",
            ReconcileAction::JoinReplica { .. } => "join_replica",
            ReconcileAction::ScaleDown { .. } => "scale_down",
            ReconcileAction::NoOp => "noop",
        }
    }

    /// Phase the cluster enters when the action is taken
    pub fn phase(&self) -> Option<ClusterPhase> {
        match self {
            ReconcileAction::RecreateInstances { .. } => Some(ClusterPhase::RecreatingInstance),
            ReconcileAction::CreatePrimary { .. } => Some(ClusterPhase::SettingUpPrimary),
            ReconcileAction::Healthy => Some(ClusterPhase::Healthy),
            ReconcileAction::JoinReplica { .. } => Some(ClusterPhase::CreatingReplica),
            ReconcileAction::ScaleDown { .. } => Some(ClusterPhase::ScalingDown),
            ReconcileAction::Wait(WaitReason::InstancesNotReady) => {
                Some(ClusterPhase::WaitingForInstances)
            }
            ReconcileAction::Wait(_) | ReconcileAction::NoOp => None,
        }
    }
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::Wait(reason) => write!(f, "wait: {}", reason),
            ReconcileAction::RecreateInstances { pvcs } => {
                write!(f, "recreate instances on {}", pvcs.join(", "))
            }
            ReconcileAction::CreatePrimary { serial } => {
                write!(f, "create primary instance (serial {})", serial)
            }
            ReconcileAction::Healthy => write!(f, "healthy"),
            ReconcileAction::JoinReplica { serial } => {
                write!(f, "join replica instance (serial {})", serial)
            }
            ReconcileAction::ScaleDown { instance } => write!(f, "scale down {}", instance),
            ReconcileAction::NoOp => write!(f, "nothing to do"),
        }
    }
}

/// An instance pod as seen by the selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRef {
    pub name: String,
    pub serial: i32,
}

/// Everything the selector looks at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectorInput {
    pub expectations_satisfied: bool,
    pub spec_instances: i32,
    pub instances: i32,
    pub ready_instances: i32,
    pub current_primary: String,
    pub target_primary: String,
    pub running_jobs: i32,
    pub dangling_pvcs: Vec<String>,
    pub maintenance_in_progress: bool,
    pub maintenance_reuse_pvc: bool,
    pub latest_generated_node: i32,
    /// Instance pods with their serials
    pub pods: Vec<InstanceRef>,
    /// Highest serial held by any pod or PVC
    pub highest_serial: i32,
}

impl SelectorInput {
    pub fn new(
        cluster: &Cluster,
        status: &ClusterStatus,
        resources: &ManagedResources,
        expectations_satisfied: bool,
    ) -> Self {
        Self {
            expectations_satisfied,
            spec_instances: cluster.spec.instances,
            instances: status.instances,
            ready_instances: status.ready_instances,
            current_primary: status.current_primary.clone(),
            target_primary: status.target_primary.clone(),
            running_jobs: resources.count_running_jobs(),
            dangling_pvcs: status.dangling_pvc.clone(),
            maintenance_in_progress: cluster.is_node_maintenance_window_in_progress(),
            maintenance_reuse_pvc: cluster.is_node_maintenance_window_reuse_pvc(),
            latest_generated_node: status.latest_generated_node,
            pods: resources
                .pods
                .iter()
                .filter_map(|p| {
                    instance_serial(&p.metadata).map(|serial| InstanceRef {
                        name: p.name_any(),
                        serial,
                    })
                })
                .collect(),
            highest_serial: resources.highest_serial(),
        }
    }

    /// Serial of the next instance to create
    pub fn next_serial(&self) -> i32 {
        self.latest_generated_node.max(self.highest_serial) + 1
    }

    /// Instance to remove when scaling down
    ///
    /// Highest serial first, never the current or target primary.
    pub fn scale_down_candidate(&self) -> Option<&InstanceRef> {
        self.pods
            .iter()
            .filter(|p| p.name != self.current_primary && p.name != self.target_primary)
            .max_by_key(|p| p.serial)
    }
}

/// Pick the next action
pub fn select_action(input: &SelectorInput) -> ReconcileAction {
    // 1. Earlier creates/deletes are not visible yet
    if !input.expectations_satisfied {
        return ReconcileAction::Wait(WaitReason::ExpectationsPending);
    }

    // 2. The instances are promoting the target primary
    if !input.current_primary.is_empty() && input.current_primary != input.target_primary {
        return ReconcileAction::Wait(WaitReason::PrimaryChangeInProgress);
    }

    // 2b. An instance is being initialized or cloned
    if input.running_jobs > 0 {
        return ReconcileAction::Wait(WaitReason::JobsRunning);
    }

    // 3. PVCs without pods
    if !input.dangling_pvcs.is_empty() {
        if !input.maintenance_in_progress && input.ready_instances != input.instances {
            return ReconcileAction::Wait(WaitReason::InstancesNotReady);
        }
        return ReconcileAction::RecreateInstances {
            pvcs: input.dangling_pvcs.clone(),
        };
    }

    // 4. Nothing exists yet
    if input.instances == 0 {
        return ReconcileAction::CreatePrimary {
            serial: input.next_serial(),
        };
    }

    // 5. Converged
    if input.ready_instances == input.instances && input.instances == input.spec_instances {
        return ReconcileAction::Healthy;
    }

    // 6. An instance is still starting
    if !input.maintenance_reuse_pvc && input.ready_instances < input.instances {
        return ReconcileAction::Wait(WaitReason::InstancesNotReady);
    }

    // 7. Scale up
    if input.instances < input.spec_instances && input.ready_instances == input.instances {
        return ReconcileAction::JoinReplica {
            serial: input.next_serial(),
        };
    }

    // 8. Scale down
    if input.instances > input.spec_instances {
        if let Some(candidate) = input.scale_down_candidate() {
            return ReconcileAction::ScaleDown {
                instance: candidate.name.clone(),
            };
        }
    }

    ReconcileAction::NoOp
}
