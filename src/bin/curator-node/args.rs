//! CLI argument parsing for curator-node.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "curator-node")]
#[command(about = "Run a curator: leader election, node management and cluster PKI")]
pub struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory holding the node key and the store.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Address the curator API listens on.
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,

    /// TTL of the election lease in seconds.
    #[arg(long)]
    pub leader_lease_ttl_secs: Option<u64>,

    /// Initial delay between election attempts in milliseconds.
    #[arg(long)]
    pub election_retry_ms: Option<u64>,

    /// Period of the membership reconciler in milliseconds.
    #[arg(long)]
    pub reconcile_interval_ms: Option<u64>,

    /// How long calls wait for the election to settle, in milliseconds.
    #[arg(long)]
    pub dispatch_timeout_ms: Option<u64>,

    /// Network within which nodes may advertise prefixes.
    #[arg(long)]
    pub cluster_network: Option<String>,

    /// Port consensus peers listen on.
    #[arg(long)]
    pub consensus_peer_port: Option<u16>,

    /// Tracing filter, used when RUST_LOG is not set.
    #[arg(long)]
    pub log_filter: Option<String>,

    /// Bootstrap a new cluster if the store is empty.
    #[arg(long)]
    pub bootstrap: bool,

    /// Hex-encoded public key of the cluster owner (bootstrap only).
    #[arg(long)]
    pub initial_owner: Option<String>,

    /// Address this node is reachable at (bootstrap only).
    #[arg(long)]
    pub external_address: Option<IpAddr>,
}
