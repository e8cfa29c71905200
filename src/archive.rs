//! WAL archiving through `barman-cloud-wal-archive`
//!
//! The archiver turns the backup section of a Cluster into the argument list
//! of the external tool and runs it. Credentials are passed in as environment
//! variables by the caller. The exit code and the captured stderr are the only
//! contract with the tool.

use semver::Version;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::controller::error::{Error, Result};
use crate::crd::Cluster;

/// Name of the archiving tool
pub const BARMAN_CLOUD_WAL_ARCHIVE: &str = "barman-cloud-wal-archive";

/// First barman-cloud release supporting `--cloud-provider`
const CLOUD_PROVIDER_MIN_VERSION: Version = Version::new(2, 13, 0);

/// Build the tool arguments for archiving `wal_name`
///
/// `--cloud-provider` is only passed to barman-cloud 2.13 or later; Azure
/// storage cannot be used without it, so an older or unknown version is
/// rejected before running anything.
pub fn barman_cloud_wal_archive_options(
    cluster: &Cluster,
    cluster_name: &str,
    wal_name: &str,
    version: Option<&Version>,
) -> Result<Vec<String>> {
    let configuration = cluster.barman_object_store().ok_or_else(|| {
        Error::InvalidConfig("backup.barmanObjectStore is not configured".to_string())
    })?;

    let supports_cloud_provider = version.is_some_and(|v| *v >= CLOUD_PROVIDER_MIN_VERSION);

    let mut options = Vec::new();
    if let Some(wal) = &configuration.wal {
        if let Some(compression) = wal.compression {
            options.push(format!("--{}", compression));
        }
        if let Some(encryption) = wal.encryption {
            options.push("-e".to_string());
            options.push(encryption.to_string());
        }
    }

    if let Some(endpoint) = configuration.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
        options.push("--endpoint-url".to_string());
        options.push(endpoint.to_string());
    }

    if supports_cloud_provider {
        if configuration.s3_credentials.is_some() {
            options.push("--cloud-provider".to_string());
            options.push("aws-s3".to_string());
        }
        if configuration.azure_credentials.is_some() {
            options.push("--cloud-provider".to_string());
            options.push("azure-blob-storage".to_string());
        }
    } else if configuration.azure_credentials.is_some() {
        return Err(Error::IncompatibleToolVersion(format!(
            "barman >= 2.13 is required to use Azure object storage, current: {}",
            version.map_or_else(|| "unknown".to_string(), Version::to_string)
        )));
    }

    let server_name = configuration
        .server_name
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(cluster_name);

    options.push(configuration.destination_path.clone());
    options.push(server_name.to_string());
    options.push(wal_name.to_string());
    Ok(options)
}

/// Parse the output of `barman-cloud-wal-archive --version`
///
/// barman prints `<tool> <major>.<minor>[.<patch>]`; missing components
/// are taken as zero.
pub fn parse_barman_version(output: &str) -> Option<Version> {
    let raw = output.split_whitespace().last()?;
    let mut parts = raw.split('.').map(|p| p.parse::<u64>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

/// Runs the archiving tool
#[derive(Clone, Debug)]
pub struct WalArchiver {
    tool: String,
}

impl Default for WalArchiver {
    fn default() -> Self {
        Self::new(BARMAN_CLOUD_WAL_ARCHIVE)
    }
}

impl WalArchiver {
    pub fn new(tool: impl Into<String>) -> Self {
        Self { tool: tool.into() }
    }

    /// Version of the installed tool, if it can be determined
    pub async fn detect_version(&self) -> Option<Version> {
        let output = match Command::new(&self.tool).arg("--version").output().await {
            Ok(output) => output,
            Err(e) => {
                error!(tool = %self.tool, error = %e, "Cannot run tool to get its version");
                return None;
            }
        };

        // Older barman releases print the version on stderr
        let text = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        let version = parse_barman_version(&text);
        debug!(tool = %self.tool, version = ?version, "Detected tool version");
        version
    }

    /// Archive one WAL file
    ///
    /// Succeeds without running anything when no object store is configured.
    pub async fn archive(
        &self,
        cluster: &Cluster,
        wal_name: &str,
        env: &[(String, String)],
    ) -> Result<()> {
        let status = cluster.status_or_default();

        if cluster.barman_object_store().is_none() {
            info!(
                walName = wal_name,
                currentPrimary = %status.current_primary,
                targetPrimary = %status.target_primary,
                "Backup not configured, skip WAL archiving"
            );
            return Ok(());
        }

        let version = self.detect_version().await;
        let cluster_name = kube::ResourceExt::name_any(cluster);
        let options =
            barman_cloud_wal_archive_options(cluster, &cluster_name, wal_name, version.as_ref())?;

        debug!(
            walName = wal_name,
            currentPrimary = %status.current_primary,
            targetPrimary = %status.target_primary,
            options = ?options,
            "Executing {}", self.tool
        );

        let output = Command::new(&self.tool)
            .args(&options)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .map_err(|source| Error::CommandIoError {
                command: self.tool.clone(),
                source,
            })?;

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                walName = wal_name,
                currentPrimary = %status.current_primary,
                targetPrimary = %status.target_primary,
                options = ?options,
                exitCode = exit_code,
                stderr = %stderr,
                "Error invoking {}", self.tool
            );
            return Err(Error::ArchiveCommandFailed {
                command: self.tool.clone(),
                exit_code,
                stderr,
            });
        }

        info!(
            walName = wal_name,
            currentPrimary = %status.current_primary,
            targetPrimary = %status.target_primary,
            "Archived WAL file"
        );
        Ok(())
    }
}
