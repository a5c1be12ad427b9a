//! Per-node status for the dashboard.

use akadb_core::{Cluster, Node, NodeId, Settings, StatsSnapshot};
use akadb_replication::{LinkStatus, ReplicationCoordinator};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Liveness of a node as seen by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// Answered the probe in time.
    Online,
    /// Offline or too slow.
    Offline,
}

/// Status card of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Probe result.
    pub status: NodeState,
    /// `central` or `regional`.
    pub role: &'static str,
    /// Committed rows.
    pub rows: usize,
    /// Epoch millis of the latest committed write, if any.
    pub last_update: Option<u64>,
    /// Incoming replication link, when replication runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replication: Option<LinkStatus>,
}

impl NodeStatus {
    fn probe(node: &Node, timeout: Duration, replication: Option<&ReplicationCoordinator>) -> Self {
        let status = if node.ping(timeout) {
            NodeState::Online
        } else {
            NodeState::Offline
        };
        Self {
            status,
            role: node.id().role(),
            rows: node.store().row_count(),
            last_update: node.store().last_update(),
            replication: replication.and_then(|r| r.link_status(node.id()).ok()),
        }
    }
}

/// Body of `GET /status`.
///
/// Node cards are keyed `node1`, `node2`, ... at the top level.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Node cards.
    #[serde(flatten)]
    pub nodes: BTreeMap<String, NodeStatus>,
    /// Settings applied to new transactions.
    pub current_settings: Settings,
    /// Node this server answers for by default.
    pub local_node_id: NodeId,
    /// Open transactions across all nodes.
    #[serde(rename = "pendingTransactions")]
    pub pending_transactions: usize,
    /// Cluster counters.
    pub stats: StatsSnapshot,
}

impl StatusReport {
    /// Probes every node of `cluster`.
    pub fn collect(
        cluster: &Cluster,
        replication: Option<&ReplicationCoordinator>,
        local_node: NodeId,
        probe_timeout: Duration,
    ) -> Self {
        let nodes = cluster
            .nodes()
            .map(|node| {
                (
                    node.id().key(),
                    NodeStatus::probe(node, probe_timeout, replication),
                )
            })
            .collect();
        Self {
            nodes,
            current_settings: cluster.settings(),
            local_node_id: local_node,
            pending_transactions: cluster.pending_count(),
            stats: cluster.stats(),
        }
    }

    /// Card of one node.
    pub fn node(&self, node: NodeId) -> Option<&NodeStatus> {
        self.nodes.get(&node.key())
    }
}
