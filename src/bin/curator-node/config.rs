//! Configuration loading for curator-node.

use anyhow::Context;
use anyhow::Result;
use curator::config::BootstrapConfig;
use curator::config::CuratorConfig;
use tracing_subscriber::EnvFilter;

use crate::args::Args;

/// Initialize tracing, preferring RUST_LOG over the configured filter.
pub fn init_tracing(log_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

/// Configuration from CLI arguments, layered over the TOML file and environment.
pub fn load_config(args: &Args) -> Result<CuratorConfig> {
    let mut config = CuratorConfig::from_env();
    if let Some(path) = &args.config {
        config.merge(CuratorConfig::from_toml_file(path)?);
    }
    config.merge(cli_config(args));
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn cli_config(args: &Args) -> CuratorConfig {
    let defaults = CuratorConfig::default();
    let bootstrap = BootstrapConfig {
        initial_owner: args.initial_owner.clone(),
        external_address: args.external_address,
        ..BootstrapConfig::default()
    };
    CuratorConfig {
        data_dir: args.data_dir.clone(),
        listen_addr: args.listen_addr.unwrap_or(defaults.listen_addr),
        leader_lease_ttl_secs: args.leader_lease_ttl_secs.unwrap_or(defaults.leader_lease_ttl_secs),
        election_retry_ms: args.election_retry_ms.unwrap_or(defaults.election_retry_ms),
        reconcile_interval_ms: args.reconcile_interval_ms.unwrap_or(defaults.reconcile_interval_ms),
        dispatch_timeout_ms: args.dispatch_timeout_ms.unwrap_or(defaults.dispatch_timeout_ms),
        cluster_network: args.cluster_network.clone().unwrap_or(defaults.cluster_network),
        consensus_peer_port: args.consensus_peer_port.unwrap_or(defaults.consensus_peer_port),
        log_filter: args.log_filter.clone().unwrap_or(defaults.log_filter),
        bootstrap: (args.bootstrap || bootstrap != BootstrapConfig::default()).then_some(bootstrap),
    }
}
