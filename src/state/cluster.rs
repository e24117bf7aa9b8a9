//! Cluster-wide configuration.
//!
//! A single record at `/cluster/configuration`, written at bootstrap and
//! afterwards only changed through [`reconfigure`].

use curator_kv::Compare;
use curator_kv::CompareOp;
use curator_kv::TxnOp;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use snafu::OptionExt;
use snafu::ResultExt;
use snafu::ensure;

use crate::error::CodecSnafu;
use crate::error::CuratorError;
use crate::error::FailedPreconditionSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::PermissionDeniedSnafu;
use crate::error::UnavailableSnafu;
use crate::leadership::Leadership;
use crate::state::node::TpmUsage;

pub const CLUSTER_CONFIGURATION_KEY: &str = "/cluster/configuration";

/// Whether nodes must seal their local data with a TPM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpmMode {
    #[default]
    Required,
    BestEffort,
    Disabled,
}

impl TpmMode {
    /// Whether a node should use its TPM, given whether it has one.
    pub fn node_should_use_tpm(self, available: bool) -> Result<bool, CuratorError> {
        match self {
            TpmMode::Disabled => Ok(false),
            TpmMode::Required => {
                ensure!(
                    available,
                    PermissionDeniedSnafu {
                        message: "TPM required but not available",
                    }
                );
                Ok(true)
            }
            TpmMode::BestEffort => Ok(available),
        }
    }

    pub fn node_tpm_usage(self, have: bool) -> Result<TpmUsage, CuratorError> {
        let used = self.node_should_use_tpm(have)?;
        Ok(match (have, used) {
            (true, true) => TpmUsage::PresentAndUsed,
            (true, false) => TpmUsage::PresentButUnused,
            (false, _) => TpmUsage::NotPresent,
        })
    }
}

/// How a node protects its local data partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageSecurity {
    Insecure,
    Encrypted,
    AuthenticatedEncrypted,
}

/// Which [`StorageSecurity`] levels nodes may use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageSecurityPolicy {
    Permissive,
    NeedsEncryption,
    #[default]
    NeedsEncryptionAndAuthentication,
    NeedsInsecure,
}

impl StorageSecurityPolicy {
    pub fn permits(self, security: StorageSecurity) -> bool {
        match self {
            StorageSecurityPolicy::Permissive => true,
            StorageSecurityPolicy::NeedsEncryption => security != StorageSecurity::Insecure,
            StorageSecurityPolicy::NeedsEncryptionAndAuthentication => {
                security == StorageSecurity::AuthenticatedEncrypted
            }
            StorageSecurityPolicy::NeedsInsecure => security == StorageSecurity::Insecure,
        }
    }

    pub fn recommended(self) -> StorageSecurity {
        match self {
            StorageSecurityPolicy::NeedsInsecure => StorageSecurity::Insecure,
            _ => StorageSecurity::AuthenticatedEncrypted,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Regexes of node label keys mirrored into Kubernetes.
    #[serde(default)]
    pub node_labels_to_synchronize: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub cluster_domain: String,
    #[serde(default)]
    pub tpm_mode: TpmMode,
    #[serde(default)]
    pub storage_security_policy: StorageSecurityPolicy,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        Self {
            cluster_domain: "cluster.internal".to_string(),
            tpm_mode: TpmMode::default(),
            storage_security_policy: StorageSecurityPolicy::default(),
            kubernetes: KubernetesConfig::default(),
        }
    }
}

impl ClusterConfiguration {
    pub fn validate(&self) -> Result<(), CuratorError> {
        ensure!(
            !self.cluster_domain.is_empty(),
            InvalidArgumentSnafu {
                message: "cluster_domain must be set",
            }
        );
        for (i, pattern) in self.kubernetes.node_labels_to_synchronize.iter().enumerate() {
            if let Err(e) = Regex::new(pattern) {
                return InvalidArgumentSnafu {
                    message: format!("kubernetes.node_labels_to_synchronize[{i}] is not a valid regex: {e}"),
                }
                .fail();
            }
        }
        Ok(())
    }
}

/// A partially populated configuration, as sent in reconfiguration requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfigurationPatch {
    #[serde(default)]
    pub cluster_domain: Option<String>,
    #[serde(default)]
    pub tpm_mode: Option<TpmMode>,
    #[serde(default)]
    pub storage_security_policy: Option<StorageSecurityPolicy>,
    #[serde(default)]
    pub kubernetes: Option<KubernetesConfigPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesConfigPatch {
    #[serde(default)]
    pub node_labels_to_synchronize: Option<Vec<String>>,
}

impl ClusterConfigurationPatch {
    fn node_labels_to_synchronize(&self) -> Option<&Vec<String>> {
        self.kubernetes.as_ref()?.node_labels_to_synchronize.as_ref()
    }
}

impl From<&ClusterConfiguration> for ClusterConfigurationPatch {
    fn from(config: &ClusterConfiguration) -> Self {
        Self {
            cluster_domain: Some(config.cluster_domain.clone()),
            tpm_mode: Some(config.tpm_mode),
            storage_security_policy: Some(config.storage_security_policy),
            kubernetes: Some(KubernetesConfigPatch {
                node_labels_to_synchronize: Some(config.kubernetes.node_labels_to_synchronize.clone()),
            }),
        }
    }
}

const NODE_LABELS_TO_SYNCHRONIZE: &str = "kubernetes.node_labels_to_synchronize";
const IMMUTABLE_PATHS: &[&str] = &["cluster_domain", "tpm_mode", "storage_security_policy"];

/// Three-way merge of a configuration change.
///
/// For every path in `mask`, `new[path]` replaces `existing[path]`. If `base`
/// is given, `base[path]` must still equal `existing[path]`, otherwise the
/// change was computed against stale data.
pub fn reconfigure(
    base: Option<&ClusterConfigurationPatch>,
    new: Option<&ClusterConfigurationPatch>,
    existing: &ClusterConfiguration,
    mask: Option<&[String]>,
) -> Result<ClusterConfiguration, CuratorError> {
    let new = new.context(InvalidArgumentSnafu {
        message: "new_config must be set",
    })?;
    let mask = mask.context(InvalidArgumentSnafu {
        message: "update_mask must be set",
    })?;

    let mut result = existing.clone();
    for path in mask {
        match path.as_str() {
            NODE_LABELS_TO_SYNCHRONIZE => {
                let value = new.node_labels_to_synchronize().context(InvalidArgumentSnafu {
                    message: format!("new_config.{path} must be set"),
                })?;
                if let Some(base) = base {
                    let previous = base.node_labels_to_synchronize().context(InvalidArgumentSnafu {
                        message: format!("base_config.{path} must be set"),
                    })?;
                    ensure!(
                        *previous == existing.kubernetes.node_labels_to_synchronize,
                        FailedPreconditionSnafu {
                            message: format!("{path} has changed since base_config"),
                        }
                    );
                }
                result.kubernetes.node_labels_to_synchronize = value.clone();
            }
            immutable if IMMUTABLE_PATHS.contains(&immutable) => {
                return InvalidArgumentSnafu {
                    message: format!("{immutable} cannot be changed"),
                }
                .fail();
            }
            unknown => {
                return InvalidArgumentSnafu {
                    message: format!("unknown field {unknown} in update_mask"),
                }
                .fail();
            }
        }
    }
    result.validate()?;
    Ok(result)
}

impl Leadership {
    pub async fn cluster_load(&self) -> Result<ClusterConfiguration, CuratorError> {
        Ok(self.cluster_load_versioned().await?.0)
    }

    /// The configuration together with the mod revision it was read at.
    pub async fn cluster_load_versioned(&self) -> Result<(ClusterConfiguration, u64), CuratorError> {
        let response = self.txn_as_leader([TxnOp::get(CLUSTER_CONFIGURATION_KEY)]).await?;
        let kv = response.kv(0).context(UnavailableSnafu {
            message: "cluster configuration missing",
        })?;
        let config = serde_json::from_slice(&kv.value).context(CodecSnafu {
            key: CLUSTER_CONFIGURATION_KEY,
        })?;
        Ok((config, kv.mod_revision))
    }

    pub async fn cluster_save(&self, config: &ClusterConfiguration) -> Result<(), CuratorError> {
        self.txn_as_leader([cluster_put(config)?]).await?;
        Ok(())
    }

    /// Save `config` only if the stored configuration is still at `mod_revision`.
    pub async fn cluster_save_if(&self, config: &ClusterConfiguration, mod_revision: u64) -> Result<(), CuratorError> {
        self.txn_as_leader_if(
            [Compare::mod_revision(CLUSTER_CONFIGURATION_KEY, CompareOp::Equal, mod_revision)],
            [cluster_put(config)?],
        )
        .await?;
        Ok(())
    }
}

fn cluster_put(config: &ClusterConfiguration) -> Result<TxnOp, CuratorError> {
    let value = serde_json::to_vec(config).context(CodecSnafu {
        key: CLUSTER_CONFIGURATION_KEY,
    })?;
    Ok(TxnOp::put(CLUSTER_CONFIGURATION_KEY, value))
}
