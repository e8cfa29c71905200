pub mod action_selector;
pub mod context;
pub mod error;
pub mod expectations;
pub mod managed_resources;
pub mod observer;
pub mod reconciler;
pub mod status;
pub mod topology;
pub mod upgrade;

pub use action_selector::{ReconcileAction, SelectorInput, WaitReason, select_action};
pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use expectations::{ExpectationTracker, OwnerKey, ResourceKind};
pub use managed_resources::{ManagedResources, OwnedResource, get_managed_resources};
pub use observer::run_expectation_observer;
pub use reconciler::{error_policy, reconcile};
pub use status::{ConditionBuilder, StatusManager, project_status, status_update_body};
pub use topology::{TopologyDecision, elect_target_primary, switchover_target};
pub use upgrade::{UpgradePlan, plan_upgrade};
