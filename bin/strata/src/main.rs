//! Strata - S3-compatible distributed object storage
//!
//! One binary, two roles: `strata node` serves a local data directory over
//! the internal object protocol; `strata gateway` fronts a fleet of nodes
//! with the S3 API, placing objects via consistent hashing with either
//! quorum replication or Reed-Solomon erasure coding.

mod cache;
mod coalesce;
mod gateway;
mod limiter;
mod multipart;
mod node;
mod util;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use strata_common::config::{
    CacheConfig, GatewayConfig, LimiterConfig, MultipartConfig, NodeConfig, RepairConfig,
};
use strata_common::{EcParams, ReplicationParams, StoragePolicy};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "S3-compatible distributed object storage")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a storage node over a local data directory
    Node(NodeArgs),
    /// Run the S3 gateway in front of a node fleet
    Gateway(GatewayArgs),
}

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Data directory this node exclusively owns
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Bearer token required from the gateway (empty = open)
    #[arg(long)]
    auth_token: Option<String>,

    /// Max request body size in MB
    #[arg(long, default_value_t = 5000)]
    max_body_mb: usize,
}

#[derive(Parser, Debug)]
struct GatewayArgs {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Comma-separated node URLs, in placement order
    #[arg(long, required = true, value_delimiter = ',')]
    nodes: Vec<String>,

    /// Storage policy: 'replication' or 'ec'
    #[arg(long, default_value = "replication")]
    storage_policy: String,

    /// Number of replicas (replication policy)
    #[arg(long, default_value_t = 3)]
    replicas: usize,

    /// Write quorum
    #[arg(short = 'w', long, default_value_t = 2)]
    write_quorum: usize,

    /// Read quorum
    #[arg(short = 'r', long, default_value_t = 2)]
    read_quorum: usize,

    /// EC data shards (ec policy)
    #[arg(long, default_value_t = 4)]
    ec_data: usize,

    /// EC parity shards (ec policy)
    #[arg(long, default_value_t = 2)]
    ec_parity: usize,

    /// Bearer token presented to backend nodes
    #[arg(long)]
    backend_auth_token: Option<String>,

    /// Bearer token required from clients (empty = open)
    #[arg(long)]
    auth_token: Option<String>,

    /// Scratch directory for multipart staging and EC encoding
    #[arg(long, default_value = "/tmp")]
    tmp_dir: PathBuf,

    /// Max request body size in MB
    #[arg(long, default_value_t = 5000)]
    max_body_mb: usize,

    /// Anti-entropy repair interval in seconds
    #[arg(long, default_value_t = 300)]
    repair_interval_secs: u64,

    /// Objects per repair batch
    #[arg(long, default_value_t = 100)]
    repair_batch: usize,

    /// Multipart sweep interval in seconds
    #[arg(long, default_value_t = 600)]
    mp_sweep_interval_secs: u64,

    /// Multipart upload TTL in seconds
    #[arg(long, default_value_t = 86_400)]
    mp_ttl_secs: u64,

    /// Disable the cache tier
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Metadata cache size in MB
    #[arg(long, default_value_t = 128)]
    metadata_cache_mb: u64,

    /// Small-object data cache size in MB
    #[arg(long, default_value_t = 512)]
    data_cache_mb: u64,

    /// Largest object the data cache will hold, in KB
    #[arg(long, default_value_t = 256)]
    max_object_cache_kb: u64,

    /// List-result cache size in MB
    #[arg(long, default_value_t = 64)]
    list_cache_mb: u64,

    /// Metadata/data cache TTL in seconds
    #[arg(long, default_value_t = 300)]
    cache_ttl_secs: u64,

    /// List cache TTL in seconds
    #[arg(long, default_value_t = 120)]
    list_cache_ttl_secs: u64,

    /// Disable adaptive rate limiting
    #[arg(long, default_value_t = false)]
    no_rate_limit: bool,

    /// Initial rate limit in requests/second
    #[arg(long, default_value_t = 1000)]
    rate_limit_initial: u64,

    /// Rate limit floor
    #[arg(long, default_value_t = 100)]
    rate_limit_min: u64,

    /// Rate limit ceiling
    #[arg(long, default_value_t = 10_000)]
    rate_limit_max: u64,

    /// Maintain an independent limiter per bucket
    #[arg(long, default_value_t = false)]
    per_bucket_rate_limit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Node(args) => node::run(node_config(args)).await,
        Command::Gateway(args) => gateway::run(gateway_config(args)?).await,
    }
}

fn node_config(args: NodeArgs) -> NodeConfig {
    NodeConfig {
        listen: args.listen,
        data_dir: args.data,
        auth_token: args.auth_token.filter(|t| !t.is_empty()),
        max_body: args.max_body_mb * 1024 * 1024,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_node_flags() {
        let cli = parse(&["strata", "node", "--data", "/srv/strata", "--auth-token", "t"]);
        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        let cfg = node_config(args);
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/strata"));
        assert_eq!(cfg.auth_token.as_deref(), Some("t"));
        assert_eq!(cfg.listen, "0.0.0.0:8080");
    }

    #[test]
    fn test_gateway_flags_replication() {
        let cli = parse(&[
            "strata",
            "gateway",
            "--nodes",
            "http://n1:8080,http://n2:8080,http://n3:8080",
            "--replicas",
            "3",
            "-w",
            "2",
            "-r",
            "2",
        ]);
        let Command::Gateway(args) = cli.command else {
            panic!("expected gateway subcommand");
        };
        let cfg = gateway_config(args).unwrap();
        assert_eq!(cfg.nodes.len(), 3);
        assert_eq!(cfg.storage_policy, StoragePolicy::Replication);
        assert_eq!(cfg.replication.write_quorum, 2);
        assert_eq!(cfg.cache.max_object_bytes, 256 * 1024);
        assert_eq!(cfg.repair.interval, Duration::from_secs(300));
    }

    #[test]
    fn test_gateway_flags_ec() {
        let cli = parse(&[
            "strata",
            "gateway",
            "--nodes",
            "http://n1:1,http://n2:1,http://n3:1,http://n4:1,http://n5:1,http://n6:1",
            "--storage-policy",
            "ec",
            "--ec-data",
            "4",
            "--ec-parity",
            "2",
        ]);
        let Command::Gateway(args) = cli.command else {
            panic!("expected gateway subcommand");
        };
        let cfg = gateway_config(args).unwrap();
        assert_eq!(cfg.storage_policy, StoragePolicy::ErasureCoding);
        assert_eq!(cfg.ec.total_shards(), 6);
    }

    #[test]
    fn test_gateway_rejects_bad_quorum() {
        let cli = parse(&[
            "strata", "gateway", "--nodes", "http://n1:1", "-w", "1", "-r", "1", "--replicas", "3",
        ]);
        let Command::Gateway(args) = cli.command else {
            panic!("expected gateway subcommand");
        };
        assert!(gateway_config(args).is_err());
    }

    #[test]
    fn test_gateway_rejects_unknown_policy() {
        let cli = parse(&[
            "strata",
            "gateway",
            "--nodes",
            "http://n1:1",
            "--storage-policy",
            "raid5",
        ]);
        let Command::Gateway(args) = cli.command else {
            panic!("expected gateway subcommand");
        };
        assert!(gateway_config(args).is_err());
    }
}

fn gateway_config(args: GatewayArgs) -> Result<GatewayConfig> {
    let storage_policy: StoragePolicy = args.storage_policy.parse()?;
    let replication =
        ReplicationParams::new(args.replicas, args.write_quorum, args.read_quorum)?;
    let ec = EcParams::new(args.ec_data, args.ec_parity)?;

    Ok(GatewayConfig {
        listen: args.listen,
        nodes: args.nodes,
        storage_policy,
        replication,
        ec,
        backend_auth_token: args.backend_auth_token.filter(|t| !t.is_empty()),
        auth_token: args.auth_token.filter(|t| !t.is_empty()),
        scratch_dir: args.tmp_dir,
        max_body: args.max_body_mb * 1024 * 1024,
        repair: RepairConfig {
            interval: Duration::from_secs(args.repair_interval_secs),
            batch: args.repair_batch,
        },
        multipart: MultipartConfig {
            sweep_interval: Duration::from_secs(args.mp_sweep_interval_secs),
            ttl: Duration::from_secs(args.mp_ttl_secs),
        },
        cache: CacheConfig {
            enabled: !args.no_cache,
            metadata_bytes: args.metadata_cache_mb * 1024 * 1024,
            data_bytes: args.data_cache_mb * 1024 * 1024,
            max_object_bytes: args.max_object_cache_kb * 1024,
            list_bytes: args.list_cache_mb * 1024 * 1024,
            ttl: Duration::from_secs(args.cache_ttl_secs),
            list_ttl: Duration::from_secs(args.list_cache_ttl_secs),
        },
        limiter: LimiterConfig {
            enabled: !args.no_rate_limit,
            initial_rate: args.rate_limit_initial,
            min_rate: args.rate_limit_min,
            max_rate: args.rate_limit_max,
            per_bucket: args.per_bucket_rate_limit,
        },
    })
}
