use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;
use snafu::Snafu;

use crate::election::ElectionConfig;
use crate::networking::DEFAULT_CLUSTER_NETWORK;
use crate::networking::IpPrefix;
use crate::networking::PrefixError;
use crate::state::ClusterConfiguration;
use crate::state::StorageSecurityPolicy;
use crate::state::TpmMode;

/// Configuration of a curator node.
///
/// Configuration is loaded in layers with the following precedence (lowest to highest):
/// 1. Environment variables (CURATOR_*)
/// 2. TOML configuration file
/// 3. Command-line arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratorConfig {
    /// Directory holding the node key and the store.
    /// Defaults to "./data" if not specified.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Address the curator API listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// TTL of the election lease.
    #[serde(default = "default_leader_lease_ttl_secs")]
    pub leader_lease_ttl_secs: u64,

    /// Initial delay between election attempts.
    #[serde(default = "default_election_retry_ms")]
    pub election_retry_ms: u64,

    /// Period of the membership reconciler while leading.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// How long a call waits for the election to settle.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,

    /// Network within which nodes may advertise prefixes.
    #[serde(default = "default_cluster_network")]
    pub cluster_network: String,

    /// Port consensus peers listen on.
    #[serde(default = "default_consensus_peer_port")]
    pub consensus_peer_port: u16,

    /// Tracing filter, used when RUST_LOG is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Create a new cluster if the store is empty.
    #[serde(default)]
    pub bootstrap: Option<BootstrapConfig>,
}

/// Parameters of a new cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Hex-encoded ED25519 public key of the cluster owner.
    #[serde(default)]
    pub initial_owner: Option<String>,
    #[serde(default)]
    pub cluster_domain: Option<String>,
    #[serde(default)]
    pub tpm_mode: Option<TpmMode>,
    #[serde(default)]
    pub storage_security_policy: Option<StorageSecurityPolicy>,
    /// Address this node is reachable at by other nodes.
    #[serde(default)]
    pub external_address: Option<IpAddr>,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            listen_addr: default_listen_addr(),
            leader_lease_ttl_secs: default_leader_lease_ttl_secs(),
            election_retry_ms: default_election_retry_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            cluster_network: default_cluster_network(),
            consensus_peer_port: default_consensus_peer_port(),
            log_filter: default_log_filter(),
            bootstrap: None,
        }
    }
}

impl CuratorConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseTomlSnafu { path })
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables follow the pattern CURATOR_<FIELD_NAME> (uppercase).
    /// The bootstrap section is present if any CURATOR_BOOTSTRAP_* variable is set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bootstrap = BootstrapConfig {
            initial_owner: lookup("CURATOR_BOOTSTRAP_INITIAL_OWNER"),
            cluster_domain: lookup("CURATOR_BOOTSTRAP_CLUSTER_DOMAIN"),
            tpm_mode: lookup("CURATOR_BOOTSTRAP_TPM_MODE").and_then(|v| parse_enum(&v)),
            storage_security_policy: lookup("CURATOR_BOOTSTRAP_STORAGE_SECURITY_POLICY").and_then(|v| parse_enum(&v)),
            external_address: parse_var(&lookup, "CURATOR_BOOTSTRAP_EXTERNAL_ADDRESS"),
        };
        Self {
            data_dir: lookup("CURATOR_DATA_DIR").map(PathBuf::from),
            listen_addr: parse_var(&lookup, "CURATOR_LISTEN_ADDR").unwrap_or_else(default_listen_addr),
            leader_lease_ttl_secs: parse_var(&lookup, "CURATOR_LEADER_LEASE_TTL_SECS").unwrap_or_else(default_leader_lease_ttl_secs),
            election_retry_ms: parse_var(&lookup, "CURATOR_ELECTION_RETRY_MS").unwrap_or_else(default_election_retry_ms),
            reconcile_interval_ms: parse_var(&lookup, "CURATOR_RECONCILE_INTERVAL_MS").unwrap_or_else(default_reconcile_interval_ms),
            dispatch_timeout_ms: parse_var(&lookup, "CURATOR_DISPATCH_TIMEOUT_MS").unwrap_or_else(default_dispatch_timeout_ms),
            cluster_network: lookup("CURATOR_CLUSTER_NETWORK").unwrap_or_else(default_cluster_network),
            consensus_peer_port: parse_var(&lookup, "CURATOR_CONSENSUS_PEER_PORT").unwrap_or_else(default_consensus_peer_port),
            log_filter: lookup("CURATOR_LOG_FILTER").unwrap_or_else(default_log_filter),
            bootstrap: (bootstrap != BootstrapConfig::default()).then_some(bootstrap),
        }
    }

    /// Merge configuration from another source.
    ///
    /// Fields in `other` that are `Some` or non-default override fields in `self`.
    pub fn merge(&mut self, other: Self) {
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
        if other.listen_addr != default_listen_addr() {
            self.listen_addr = other.listen_addr;
        }
        if other.leader_lease_ttl_secs != default_leader_lease_ttl_secs() {
            self.leader_lease_ttl_secs = other.leader_lease_ttl_secs;
        }
        if other.election_retry_ms != default_election_retry_ms() {
            self.election_retry_ms = other.election_retry_ms;
        }
        if other.reconcile_interval_ms != default_reconcile_interval_ms() {
            self.reconcile_interval_ms = other.reconcile_interval_ms;
        }
        if other.dispatch_timeout_ms != default_dispatch_timeout_ms() {
            self.dispatch_timeout_ms = other.dispatch_timeout_ms;
        }
        if other.cluster_network != default_cluster_network() {
            self.cluster_network = other.cluster_network;
        }
        if other.consensus_peer_port != default_consensus_peer_port() {
            self.consensus_peer_port = other.consensus_peer_port;
        }
        if other.log_filter != default_log_filter() {
            self.log_filter = other.log_filter;
        }
        if let Some(other) = other.bootstrap {
            self.bootstrap = Some(match self.bootstrap.take() {
                Some(mut base) => {
                    base.merge(other);
                    base
                }
                None => other,
            });
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.leader_lease_ttl_secs == 0 {
            return ValidationSnafu {
                message: "leader_lease_ttl_secs must be non-zero",
            }
            .fail();
        }
        if self.election_retry_ms == 0 {
            return ValidationSnafu {
                message: "election_retry_ms must be non-zero",
            }
            .fail();
        }
        if self.reconcile_interval_ms == 0 {
            return ValidationSnafu {
                message: "reconcile_interval_ms must be non-zero",
            }
            .fail();
        }
        if self.dispatch_timeout_ms == 0 {
            return ValidationSnafu {
                message: "dispatch_timeout_ms must be non-zero",
            }
            .fail();
        }
        if self.reconcile_interval() >= self.lease_ttl() {
            return ValidationSnafu {
                message: "reconcile_interval_ms must be shorter than the leader lease TTL",
            }
            .fail();
        }
        self.cluster_network()?;
        if let Some(bootstrap) = &self.bootstrap {
            bootstrap.initial_owner()?;
            bootstrap.cluster_configuration().validate().map_err(|e| {
                ValidationSnafu {
                    message: format!("bootstrap: {e}"),
                }
                .build()
            })?;
        }
        Ok(())
    }

    /// Get the data directory, using the default if not specified.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| PathBuf::from("./data"))
    }

    pub fn node_key_path(&self) -> PathBuf {
        self.data_dir().join("node.key")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join("curator.redb")
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_lease_ttl_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn election(&self) -> ElectionConfig {
        ElectionConfig {
            lease_ttl: self.lease_ttl(),
            retry_delay: Duration::from_millis(self.election_retry_ms),
            ..ElectionConfig::default()
        }
    }

    pub fn cluster_network(&self) -> Result<IpPrefix, ConfigError> {
        IpPrefix::parse_canonical(&self.cluster_network).context(ClusterNetworkSnafu {
            value: self.cluster_network.clone(),
        })
    }
}

impl BootstrapConfig {
    fn merge(&mut self, other: Self) {
        if other.initial_owner.is_some() {
            self.initial_owner = other.initial_owner;
        }
        if other.cluster_domain.is_some() {
            self.cluster_domain = other.cluster_domain;
        }
        if other.tpm_mode.is_some() {
            self.tpm_mode = other.tpm_mode;
        }
        if other.storage_security_policy.is_some() {
            self.storage_security_policy = other.storage_security_policy;
        }
        if other.external_address.is_some() {
            self.external_address = other.external_address;
        }
    }

    pub fn initial_owner(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        let Some(key_hex) = &self.initial_owner else {
            return Ok(None);
        };
        let mut key = [0u8; 32];
        hex::decode_to_slice(key_hex, &mut key).map_err(|_| {
            ValidationSnafu {
                message: "bootstrap initial_owner must be 64 hex characters (32 bytes)",
            }
            .build()
        })?;
        Ok(Some(key))
    }

    pub fn cluster_configuration(&self) -> ClusterConfiguration {
        let defaults = ClusterConfiguration::default();
        ClusterConfiguration {
            cluster_domain: self.cluster_domain.clone().unwrap_or(defaults.cluster_domain),
            tpm_mode: self.tpm_mode.unwrap_or(defaults.tpm_mode),
            storage_security_policy: self.storage_security_policy.unwrap_or(defaults.storage_security_policy),
            kubernetes: defaults.kubernetes,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7835)
}

fn default_leader_lease_ttl_secs() -> u64 {
    60
}

fn default_election_retry_ms() -> u64 {
    1000
}

fn default_reconcile_interval_ms() -> u64 {
    5000
}

fn default_dispatch_timeout_ms() -> u64 {
    10_000
}

fn default_cluster_network() -> String {
    DEFAULT_CLUSTER_NETWORK.to_string()
}

fn default_consensus_peer_port() -> u16 {
    7834
}

fn default_log_filter() -> String {
    "info".into()
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key)?.parse().ok()
}

/// Parse a snake_case enum name the way it is written in TOML.
fn parse_enum<T: DeserializeOwned>(value: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_ascii_lowercase())).ok()
}

/// Configuration loading and parsing errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ReadFile { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse TOML config file {}: {source}", path.display()))]
    ParseToml { path: PathBuf, source: toml::de::Error },

    #[snafu(display("invalid cluster_network '{value}': {source}"))]
    ClusterNetwork { value: String, source: PrefixError },

    #[snafu(display("configuration validation failed: {message}"))]
    Validation { message: String },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> CuratorConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        CuratorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        let config = CuratorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:7835".parse().unwrap());
        assert_eq!(config.store_path(), PathBuf::from("./data/curator.redb"));
        assert_eq!(config.election().lease_ttl, Duration::from_secs(60));
        assert_eq!(config.cluster_network().unwrap().to_string(), "10.192.0.0/11");
    }

    #[test]
    fn rejects_zero_and_inverted_intervals() {
        let zero_ttl = CuratorConfig {
            leader_lease_ttl_secs: 0,
            ..Default::default()
        };
        assert!(zero_ttl.validate().is_err());

        let zero_dispatch = CuratorConfig {
            dispatch_timeout_ms: 0,
            ..Default::default()
        };
        assert!(zero_dispatch.validate().is_err());

        let slow_reconcile = CuratorConfig {
            leader_lease_ttl_secs: 5,
            reconcile_interval_ms: 5000,
            ..Default::default()
        };
        assert!(slow_reconcile.validate().is_err());
    }

    #[test]
    fn rejects_bad_network_and_owner() {
        let network = CuratorConfig {
            cluster_network: "10.192.0.1/11".into(),
            ..Default::default()
        };
        assert!(matches!(network.validate(), Err(ConfigError::ClusterNetwork { .. })));

        let owner = CuratorConfig {
            bootstrap: Some(BootstrapConfig {
                initial_owner: Some("abcd".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(owner.validate(), Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn env_layer() {
        let config = env(&[
            ("CURATOR_DATA_DIR", "/var/lib/curator"),
            ("CURATOR_RECONCILE_INTERVAL_MS", "2000"),
            ("CURATOR_BOOTSTRAP_TPM_MODE", "best_effort"),
        ]);
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/curator"));
        assert_eq!(config.reconcile_interval_ms, 2000);
        let bootstrap = config.bootstrap.unwrap();
        assert_eq!(bootstrap.tpm_mode, Some(TpmMode::BestEffort));
        assert_eq!(bootstrap.cluster_configuration().cluster_domain, "cluster.internal");

        assert!(env(&[]).bootstrap.is_none());
    }

    #[test]
    fn toml_overrides_env() {
        let mut config = env(&[("CURATOR_LISTEN_ADDR", "127.0.0.1:9000"), ("CURATOR_LOG_FILTER", "debug")]);
        let file: CuratorConfig = toml::from_str(
            r#"
            log_filter = "curator=trace"
            leader_lease_ttl_secs = 30

            [bootstrap]
            initial_owner = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
            tpm_mode = "disabled"
            "#,
        )
        .unwrap();
        config.merge(file);

        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.log_filter, "curator=trace");
        assert_eq!(config.leader_lease_ttl_secs, 30);
        let bootstrap = config.bootstrap.as_ref().unwrap();
        assert_eq!(bootstrap.initial_owner().unwrap(), Some([0xaa; 32]));
        assert_eq!(bootstrap.cluster_configuration().tpm_mode, TpmMode::Disabled);
        config.validate().unwrap();
    }
}
