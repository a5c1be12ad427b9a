//! Cluster configuration.

use crate::query::DEFAULT_PAGE_LIMIT;
use crate::settings::Settings;
use crate::types::IsolationLevel;
use std::path::PathBuf;

/// Configuration for opening a cluster.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of nodes, `node1..nodeN`.
    pub node_count: u8,

    /// Directory for commit log files. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,

    /// Settings in effect at startup.
    pub settings: Settings,

    /// Page size when a read names no limit.
    pub default_page_limit: usize,

    /// Largest page a read may request.
    pub max_page_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_count: 3,
            data_dir: None,
            settings: Settings::default(),
            default_page_limit: DEFAULT_PAGE_LIMIT,
            max_page_limit: 1000,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of nodes.
    #[must_use]
    pub const fn node_count(mut self, count: u8) -> Self {
        self.node_count = count;
        self
    }

    /// Persists commit logs under `dir`.
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Sets the startup isolation level.
    #[must_use]
    pub const fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.settings.isolation_level = level;
        self
    }

    /// Sets the startup commit mode.
    #[must_use]
    pub const fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.settings.auto_commit = auto_commit;
        self
    }

    /// Sets the default and maximum page sizes.
    #[must_use]
    pub const fn page_limits(mut self, default_limit: usize, max_limit: usize) -> Self {
        self.default_page_limit = default_limit;
        self.max_page_limit = max_limit;
        self
    }

    /// Commit log path of a node, when persistent.
    pub fn log_path(&self, node: crate::types::NodeId) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", node.key())))
    }
}
