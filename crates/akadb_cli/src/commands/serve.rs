//! Serve command implementation.

use akadb_core::{Cluster, Config, IsolationLevel, NodeId};
use akadb_replication::{ReplicationConfig, ReplicationCoordinator, RetryConfig};
use akadb_server::{AkaServer, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Options of the serve command.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Listen address.
    pub bind: SocketAddr,
    /// Node count.
    pub nodes: u8,
    /// Default node for requests.
    pub local_node: NodeId,
    /// Commit log directory, in memory when absent.
    pub data_dir: Option<PathBuf>,
    /// Startup isolation level.
    pub isolation: IsolationLevel,
    /// Startup commit mode.
    pub auto_commit: bool,
    /// Status probe timeout.
    pub probe_timeout_ms: u64,
    /// Delivery attempts before a link lags.
    pub max_attempts: u32,
}

impl ServeOptions {
    fn cluster_config(&self) -> Config {
        let mut config = Config::new()
            .node_count(self.nodes)
            .isolation_level(self.isolation)
            .auto_commit(self.auto_commit);
        if let Some(dir) = &self.data_dir {
            config = config.data_dir(dir);
        }
        config
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.bind)
            .with_local_node(self.local_node)
            .with_probe_timeout(Duration::from_millis(self.probe_timeout_ms))
    }

    fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig::new().with_retry(RetryConfig::new(self.max_attempts))
    }
}

/// Runs the serve command until Ctrl-C.
pub fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    if options.local_node.as_u8() > options.nodes {
        return Err(format!(
            "local node {} is outside a {}-node cluster",
            options.local_node, options.nodes
        )
        .into());
    }
    if let Some(dir) = &options.data_dir {
        std::fs::create_dir_all(dir)?;
    }

    let cluster = Arc::new(Cluster::open(options.cluster_config())?);
    info!(
        nodes = options.nodes,
        data_dir = ?options.data_dir,
        settings = ?cluster.settings(),
        "cluster opened"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(serve(options, cluster))
}

async fn serve(
    options: ServeOptions,
    cluster: Arc<Cluster>,
) -> Result<(), Box<dyn std::error::Error>> {
    let coordinator = ReplicationCoordinator::start(&cluster, options.replication_config())?;
    let server = AkaServer::new(
        options.server_config(),
        Arc::clone(&cluster),
        Some(Arc::clone(&coordinator)),
    );

    let served = server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    coordinator.shutdown().await;
    info!(pending = cluster.pending_count(), "stopped");
    served?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ServeOptions {
        ServeOptions {
            bind: "127.0.0.1:0".parse().unwrap(),
            nodes: 2,
            local_node: NodeId::CENTRAL,
            data_dir: None,
            isolation: IsolationLevel::Serializable,
            auto_commit: false,
            probe_timeout_ms: 300,
            max_attempts: 7,
        }
    }

    #[test]
    fn options_shape_configs() {
        let options = options();
        let cluster = options.cluster_config();
        assert_eq!(cluster.node_count, 2);
        assert_eq!(cluster.settings.isolation_level, IsolationLevel::Serializable);
        assert!(!cluster.settings.auto_commit);
        assert!(cluster.data_dir.is_none());

        let server = options.server_config();
        assert_eq!(server.probe_timeout, Duration::from_millis(300));
        assert_eq!(server.local_node, NodeId::CENTRAL);

        assert_eq!(options.replication_config().retry.max_attempts, 7);
    }

    #[test]
    fn data_dir_is_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let options = ServeOptions {
            data_dir: Some(dir.path().to_path_buf()),
            ..options()
        };
        let config = options.cluster_config();
        assert_eq!(config.data_dir.as_deref(), Some(dir.path()));
        assert!(Cluster::open(config).is_ok());
    }

    #[test]
    fn rejects_local_node_outside_cluster() {
        let options = ServeOptions {
            local_node: NodeId::new(5).unwrap(),
            ..options()
        };
        assert!(run(options).is_err());
    }
}
