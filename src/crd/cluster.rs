use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default PostgreSQL operand image
pub const DEFAULT_IMAGE_NAME: &str = "ghcr.io/cloudnative-pg/postgresql:16";

/// Cluster is the Schema for the clusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgresql.example.com",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    shortname = "pgc",
    namespaced,
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".status.instances"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyInstances"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Number of instances (one primary, the rest streaming replicas)
    #[serde(default = "default_instances")]
    pub instances: i32,

    /// PostgreSQL container image
    #[serde(default = "default_image_name")]
    pub image_name: String,

    /// PostgreSQL configuration
    #[serde(default)]
    pub postgresql: PostgresConfiguration,

    /// Storage configuration for the instance volumes
    pub storage: StorageSpec,

    /// Resource requirements for the postgres container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// How the primary is updated during a rolling upgrade
    #[serde(default)]
    pub primary_update_strategy: PrimaryUpdateStrategy,

    /// Node maintenance window settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_maintenance_window: Option<NodeMaintenanceWindow>,

    /// Backup configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupConfiguration>,
}

fn default_instances() -> i32 {
    1
}

fn default_image_name() -> String {
    DEFAULT_IMAGE_NAME.to_string()
}

/// postgresql.conf parameters
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresConfiguration {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Storage configuration for PostgreSQL data volumes
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage class name (uses default if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Size of the persistent volume (e.g., "10Gi")
    pub size: String,
}

/// Resource requirements for PostgreSQL pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Primary update strategy for rolling upgrades
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum PrimaryUpdateStrategy {
    /// Switch over to the most advanced replica and upgrade the old primary
    #[default]
    Unsupervised,
    /// Wait for a user to trigger the switchover
    Supervised,
}

/// Node maintenance window flags
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeMaintenanceWindow {
    /// Whether a node maintenance is currently happening
    #[serde(default)]
    pub in_progress: bool,

    /// Whether instances should wait for their node and reuse their PVC
    #[serde(default = "default_reuse_pvc", rename = "reusePVC")]
    pub reuse_pvc: bool,
}

fn default_reuse_pvc() -> bool {
    true
}

/// Backup configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barman_object_store: Option<BarmanObjectStoreConfiguration>,
}

/// Object store used by barman-cloud for base backups and WAL archiving
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BarmanObjectStoreConfiguration {
    /// Path where files are stored, e.g. "s3://bucket/path"
    pub destination_path: String,

    /// Endpoint used instead of the provider default
    #[serde(default, rename = "endpointURL", skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,

    /// Server name in the object store (defaults to the cluster name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_credentials: Option<S3Credentials>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_credentials: Option<AzureCredentials>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal: Option<WalBackupConfiguration>,
}

/// Secret references for S3 access
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct S3Credentials {
    pub access_key_id: SecretKeyRef,
    pub secret_access_key: SecretKeyRef,
}

/// Secret references for Azure Blob Storage access
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AzureCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_account: Option<SecretKeyRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<SecretKeyRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<SecretKeyRef>,
}

/// Reference to a key inside a Secret in the cluster namespace
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// WAL archiving options
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WalBackupConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionType>,
}

/// Compression applied by barman-cloud
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    Gzip,
    Bzip2,
    Snappy,
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionType::Gzip => write!(f, "gzip"),
            CompressionType::Bzip2 => write!(f, "bzip2"),
            CompressionType::Snappy => write!(f, "snappy"),
        }
    }
}

/// Server-side encryption requested from the object store
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum EncryptionType {
    #[serde(rename = "AES256")]
    Aes256,
    #[serde(rename = "aws:kms")]
    AwsKms,
}

impl std::fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncryptionType::Aes256 => write!(f, "AES256"),
            EncryptionType::AwsKms => write!(f, "aws:kms"),
        }
    }
}

/// Observed state of the Cluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Number of instance pods
    #[serde(default)]
    pub instances: i32,

    /// Number of instance pods passing readiness
    #[serde(default)]
    pub ready_instances: i32,

    /// Names of the instance pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_names: Vec<String>,

    /// Instance currently acting as primary
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_primary: String,

    /// Instance elected to become (or stay) primary
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_primary: String,

    /// Highest instance serial ever allocated
    #[serde(default)]
    pub latest_generated_node: i32,

    /// PVCs with no instance pod attached
    #[serde(default, rename = "danglingPVC", skip_serializing_if = "Vec::is_empty")]
    pub dangling_pvc: Vec<String>,

    /// Current phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human readable reason for the phase
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase_reason: String,

    /// Observed generation of the resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    /// Nothing has been done yet
    #[default]
    Pending,
    /// The first instance is being created
    #[serde(rename = "Setting up primary")]
    SettingUpPrimary,
    /// A new replica is joining the cluster
    #[serde(rename = "Creating a new replica")]
    CreatingReplica,
    /// An instance is being recreated on its existing PVC
    #[serde(rename = "Recreating instance")]
    RecreatingInstance,
    /// Waiting for instances to become ready
    #[serde(rename = "Waiting for the instances to become active")]
    WaitingForInstances,
    /// The number of instances is being reduced
    #[serde(rename = "Scaling down")]
    ScalingDown,
    /// The primary is lost and a replica has been elected
    #[serde(rename = "Failing over")]
    FailingOver,
    /// A planned primary change is in progress
    #[serde(rename = "Switchover in progress")]
    Switchover,
    /// Instances are being recreated with a new spec
    #[serde(rename = "Upgrading cluster")]
    Upgrading,
    /// The primary needs a user-triggered switchover to be upgraded
    #[serde(rename = "Waiting for user action")]
    WaitingForUser,
    /// All instances are ready and match the spec
    #[serde(rename = "Cluster in healthy state")]
    Healthy,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::SettingUpPrimary => write!(f, "Setting up primary"),
            ClusterPhase::CreatingReplica => write!(f, "Creating a new replica"),
            ClusterPhase::RecreatingInstance => write!(f, "Recreating instance"),
            ClusterPhase::WaitingForInstances => {
                write!(f, "Waiting for the instances to become active")
            }
            ClusterPhase::ScalingDown => write!(f, "Scaling down"),
            ClusterPhase::FailingOver => write!(f, "Failing over"),
            ClusterPhase::Switchover => write!(f, "Switchover in progress"),
            ClusterPhase::Upgrading => write!(f, "Upgrading cluster"),
            ClusterPhase::WaitingForUser => write!(f, "Waiting for user action"),
            ClusterPhase::Healthy => write!(f, "Cluster in healthy state"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Cluster {
    /// Whether a node maintenance window is in progress
    pub fn is_node_maintenance_window_in_progress(&self) -> bool {
        self.spec
            .node_maintenance_window
            .as_ref()
            .is_some_and(|w| w.in_progress)
    }

    /// Whether a maintenance window is in progress and PVCs should be reused
    pub fn is_node_maintenance_window_reuse_pvc(&self) -> bool {
        self.spec
            .node_maintenance_window
            .as_ref()
            .is_some_and(|w| w.in_progress && w.reuse_pvc)
    }

    /// The object store configuration, if WAL archiving is configured
    pub fn barman_object_store(&self) -> Option<&BarmanObjectStoreConfiguration> {
        self.spec
            .backup
            .as_ref()
            .and_then(|b| b.barman_object_store.as_ref())
    }

    /// Status or an empty default
    pub fn status_or_default(&self) -> ClusterStatus {
        self.status.clone().unwrap_or_default()
    }
}
