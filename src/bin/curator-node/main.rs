//! curator-node: runs one curator and serves its API.
//!
//! Startup order: configuration, tracing, node key, store, optional
//! bootstrap of a new cluster, then the curator and its HTTP server until
//! ctrl-c.

mod args;
mod config;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use curator::Curator;
use curator::bootstrap::BootstrapParams;
use curator::bootstrap::bootstrap_cluster;
use curator::bootstrap::is_bootstrapped;
use curator::config::CuratorConfig;
use curator::consensus::ConsensusAdmin;
use curator::identity::node_id;
use curator::leader::LeaderSettings;
use curator::pki::PkiContext;
use curator::server::ServerState;
use curator::state::TpmUsage;
use curator_kv::MemoryMembership;
use curator_kv::MemoryStore;
use ed25519_dalek::SigningKey;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::args::Args;
use crate::config::init_tracing;
use crate::config::load_config;

const LEASE_REAPER_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.log_filter);

    let node_key = load_or_create_node_key(&config.node_key_path())?;
    let public_key = node_key.verifying_key().to_bytes();
    let id = node_id(&public_key);
    info!(node_id = %id, data_dir = %config.data_dir().display(), "starting curator node");

    let store = MemoryStore::open(config.store_path())
        .with_context(|| format!("failed to open store at {}", config.store_path().display()))?;
    let _reaper = store.spawn_lease_reaper(LEASE_REAPER_INTERVAL);

    let pki = Arc::new(PkiContext::new());
    let external_address = config.bootstrap.as_ref().and_then(|b| b.external_address);
    let peer_host = external_address.map(|a| a.to_string()).unwrap_or_else(|| id.clone());
    let membership = Arc::new(MemoryMembership::with_voter(
        id.clone(),
        vec![format!("https://{peer_host}:{}", config.consensus_peer_port)],
    ));
    let consensus = Arc::new(ConsensusAdmin::new(membership, pki.clone(), config.consensus_peer_port));

    if let Some(bootstrap) = &config.bootstrap {
        if is_bootstrapped(&*store).await? {
            info!("store already holds a cluster, skipping bootstrap");
        } else {
            let params = BootstrapParams {
                initial_owner: bootstrap.initial_owner()?,
                cluster_configuration: bootstrap.cluster_configuration(),
                tpm_usage: TpmUsage::NotPresent,
                cluster_unlock_key: random_key().to_vec(),
                external_address: bootstrap.external_address.map(|a| a.to_string()),
            };
            if params.initial_owner.is_none() {
                warn!("bootstrapping without an initial owner, owner escrow will be unavailable");
            }
            let result = bootstrap_cluster(&*store, &consensus, &pki, public_key, random_key(), params).await?;
            info!(created = result.created, "bootstrap finished");
        }
    }

    let shutdown = CancellationToken::new();
    let handle = build_curator(&config, id, store.clone(), pki, consensus)?.start(shutdown.clone());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let server = tokio::spawn(curator::server::serve(listener, ServerState::new(handle.service()), shutdown.clone()));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutting down");
    shutdown.cancel();
    server.await.context("server task panicked")?.context("server failed")?;
    handle.shutdown().await;
    Ok(())
}

fn build_curator(
    config: &CuratorConfig,
    node_id: String,
    store: Arc<MemoryStore>,
    pki: Arc<PkiContext>,
    consensus: Arc<ConsensusAdmin>,
) -> Result<Curator> {
    Ok(Curator {
        node_id,
        store,
        pki,
        consensus,
        election: config.election(),
        settings: LeaderSettings {
            cluster_network: config.cluster_network()?,
            curator_port: config.listen_addr.port(),
        },
        reconcile_interval: config.reconcile_interval(),
        dispatch_timeout: config.dispatch_timeout(),
    })
}

/// Read the 32-byte node key seed, generating it on first start.
fn load_or_create_node_key(path: &Path) -> Result<SigningKey> {
    if path.exists() {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("{} must hold exactly 32 bytes, found {}", path.display(), bytes.len()))?;
        return Ok(SigningKey::from_bytes(&seed));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let seed = random_key();
    std::fs::write(path, seed).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "generated node key");
    Ok(SigningKey::from_bytes(&seed))
}

fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}
