//! Request handlers for the HTTP endpoints.
//!
//! Handlers take decoded request bodies and return serializable responses.
//! Framing and routing live in [`crate::http`] and [`crate::router`].

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::status::StatusReport;
use akadb_core::{
    bool_as_int, Cluster, IsolationLevel, LogEntry, NodeId, Operation, Pagination, QueryResult,
    Record, RecordFilter, RecordKey, RecordPatch, RecordQuery, ReportKind, ReportRow, Settings,
    SimulationReport, TransactionId, TransactionInfo,
};
use akadb_replication::ReplicationCoordinator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// The cluster served.
    pub cluster: Arc<Cluster>,
    /// Replication, when running.
    pub replication: Option<Arc<ReplicationCoordinator>>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(
        config: ServerConfig,
        cluster: Arc<Cluster>,
        replication: Option<Arc<ReplicationCoordinator>>,
    ) -> Self {
        Self {
            config,
            cluster,
            replication,
        }
    }

    fn node_or_local(&self, node: Option<NodeId>) -> NodeId {
        node.unwrap_or(self.config.local_node)
    }

    fn replication(&self) -> ServerResult<&ReplicationCoordinator> {
        self.replication
            .as_deref()
            .ok_or(ServerError::ReplicationDisabled)
    }
}

/// Body of `POST /settings`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRequest {
    /// New isolation level; unchanged when absent.
    pub isolation_level: Option<IsolationLevel>,
    /// New auto-commit flag, as a boolean or `"true"`/`"false"`.
    #[serde(default, deserialize_with = "bool_as_int::option::deserialize")]
    pub auto_commit: Option<bool>,
}

/// Query of `GET /movies`.
#[derive(Debug, Clone, Default)]
pub struct MoviesQuery {
    /// Node to read.
    pub node: Option<NodeId>,
    /// Rows to skip; ignored when `page` is set.
    pub offset: Option<usize>,
    /// 1-based page.
    pub page: Option<usize>,
    /// Page size.
    pub limit: Option<usize>,
    /// Row predicate.
    pub filter: RecordFilter,
    /// Read inside this transaction.
    pub txn_id: Option<TransactionId>,
}

/// Body of `POST /insert`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertRequest {
    /// The new record.
    #[serde(flatten)]
    pub record: Record,
    /// Target node.
    pub node: Option<NodeId>,
    /// Join this open transaction.
    pub txn_id: Option<TransactionId>,
}

/// Body of `POST /update`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    /// Title of the row.
    pub title_id: String,
    /// Ordering of the row.
    pub ordering: i32,
    /// Fields to change.
    #[serde(flatten)]
    pub patch: RecordPatch,
    /// Target node.
    pub node: Option<NodeId>,
    /// Join this open transaction.
    pub txn_id: Option<TransactionId>,
}

/// Body of `POST /delete`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    /// Title whose rows are removed.
    pub title_id: String,
    /// Target node.
    pub node: Option<NodeId>,
    /// Join this open transaction.
    pub txn_id: Option<TransactionId>,
}

/// Body of `POST /simulate-concurrency`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateRequest {
    /// Node to run on.
    pub node: Option<NodeId>,
    /// Title to contend on; the node's first row when absent.
    pub title_id: Option<String>,
}

/// Body naming only a node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeRequest {
    /// Target node.
    pub node: Option<NodeId>,
}

/// Body of `POST /commit` and `POST /abort`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// Transaction to resolve; every open transaction of `node` when absent.
    pub txn_id: Option<TransactionId>,
    /// Node whose transactions are resolved.
    pub node: Option<NodeId>,
}

/// Body of `POST /node-state`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeStateRequest {
    /// Node to change.
    pub node: NodeId,
    /// Desired state.
    #[serde(with = "bool_as_int")]
    pub online: bool,
}

/// Response carrying step logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogsResponse {
    /// Human-readable steps.
    pub logs: Vec<String>,
}

impl From<Vec<String>> for LogsResponse {
    fn from(logs: Vec<String>) -> Self {
        Self { logs }
    }
}

/// Response of `POST /begin`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginResponse {
    /// The new transaction.
    pub txn_id: TransactionId,
    /// Human-readable steps.
    pub logs: Vec<String>,
}

/// Response of `GET /report/{kind}`.
#[derive(Debug, Clone, Serialize)]
pub struct ReportResponse {
    /// Pipe-delimited rendering.
    pub report: String,
    /// Report kind.
    pub kind: ReportKind,
    /// Node the report was computed on.
    pub node: NodeId,
    /// Column headers.
    pub columns: [&'static str; 2],
    /// Groups, largest first.
    pub rows: Vec<ReportRow>,
    /// Sum of all groups.
    pub total: usize,
}

/// Response of `GET /transactions`.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionsResponse {
    /// Open transactions.
    pub transactions: Vec<TransactionInfo>,
}

/// Response of `GET /logs`.
#[derive(Debug, Clone, Serialize)]
pub struct LogResponse {
    /// Node whose log was read.
    pub node: NodeId,
    /// Most recent entries, oldest first.
    pub entries: Vec<LogEntry>,
}

/// Handler for cluster requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// The handler's context.
    pub fn context(&self) -> &HandlerContext {
        &self.context
    }

    fn cluster(&self) -> &Cluster {
        &self.context.cluster
    }

    /// `GET /status`.
    pub fn handle_status(&self) -> StatusReport {
        StatusReport::collect(
            self.cluster(),
            self.context.replication.as_deref(),
            self.context.config.local_node,
            self.context.config.probe_timeout,
        )
    }

    /// `POST /settings`.
    pub fn handle_settings(&self, request: SettingsRequest) -> ServerResult<LogsResponse> {
        let current = self.cluster().settings();
        let next = Settings::new(
            request.isolation_level.unwrap_or(current.isolation_level),
            request.auto_commit.unwrap_or(current.auto_commit),
        );
        info!(isolation = %next.isolation_level, auto_commit = next.auto_commit, "settings applied");
        Ok(self.cluster().apply_settings(next).into())
    }

    /// `GET /movies`.
    pub fn handle_movies(&self, request: MoviesQuery) -> ServerResult<QueryResult> {
        let node = self.context.node_or_local(request.node);
        let limit = request
            .limit
            .unwrap_or(self.cluster().config().default_page_limit);
        let pagination = match request.page {
            Some(page) => Pagination::page(page, limit)?,
            None => Pagination::offset(request.offset.unwrap_or(0), limit),
        };
        let query = RecordQuery::filtered(request.filter).with_pagination(pagination);
        Ok(self.cluster().query(node, request.txn_id, &query)?)
    }

    /// `POST /insert`.
    pub fn handle_insert(&self, request: InsertRequest) -> ServerResult<LogsResponse> {
        let node = self.context.node_or_local(request.node);
        let key = request.record.key();
        let logs = self
            .cluster()
            .submit(node, request.txn_id, &Operation::Insert(request.record))?;
        info!(node = %node, key = %key, "insert handled");
        Ok(logs.into())
    }

    /// `POST /update`.
    pub fn handle_update(&self, request: UpdateRequest) -> ServerResult<LogsResponse> {
        let node = self.context.node_or_local(request.node);
        let op = Operation::Update {
            key: RecordKey::new(request.title_id, request.ordering),
            patch: request.patch,
        };
        let logs = self.cluster().submit(node, request.txn_id, &op)?;
        info!(node = %node, "update handled");
        Ok(logs.into())
    }

    /// `POST /delete`.
    pub fn handle_delete(&self, request: DeleteRequest) -> ServerResult<LogsResponse> {
        let node = self.context.node_or_local(request.node);
        if request.title_id.trim().is_empty() {
            return Err(ServerError::invalid("missing required field `titleId`"));
        }
        let op = Operation::Delete {
            title_id: request.title_id,
        };
        let logs = self.cluster().submit(node, request.txn_id, &op)?;
        info!(node = %node, "delete handled");
        Ok(logs.into())
    }

    /// `GET /report/{kind}`.
    pub fn handle_report(&self, kind: &str, node: Option<NodeId>) -> ServerResult<ReportResponse> {
        let kind: ReportKind = kind.parse()?;
        let node = self.context.node_or_local(node);
        let report = self.cluster().report(node, kind)?;
        Ok(ReportResponse {
            report: report.render_pipe(),
            kind: report.kind,
            node: report.node,
            columns: report.columns,
            rows: report.rows,
            total: report.total,
        })
    }

    /// `POST /simulate-concurrency`.
    pub fn handle_simulate(&self, request: SimulateRequest) -> ServerResult<SimulationReport> {
        let node = self.context.node_or_local(request.node);
        let report = self
            .cluster()
            .simulate_concurrency(node, request.title_id.as_deref())?;
        info!(node = %node, committed = report.committed.len(), "concurrency simulation finished");
        Ok(report)
    }

    /// `GET /transactions`.
    pub fn handle_transactions(&self) -> TransactionsResponse {
        TransactionsResponse {
            transactions: self.cluster().pending(),
        }
    }

    /// `POST /begin`.
    pub fn handle_begin(&self, request: NodeRequest) -> ServerResult<BeginResponse> {
        let node = self.context.node_or_local(request.node);
        let settings = self.cluster().settings();
        let txn_id = self.cluster().begin(node)?;
        Ok(BeginResponse {
            txn_id,
            logs: vec![format!(
                "Started {txn_id} on {node} ({}, Manual 2PC)",
                settings.isolation_level
            )],
        })
    }

    /// `POST /commit`.
    pub fn handle_commit(&self, request: ResolveRequest) -> ServerResult<LogsResponse> {
        match request.txn_id {
            Some(txn) => Ok(self.cluster().commit(txn)?.logs.into()),
            None => {
                let node = self.context.node_or_local(request.node);
                Ok(self.cluster().commit_pending(node)?.into())
            }
        }
    }

    /// `POST /abort`.
    pub fn handle_abort(&self, request: ResolveRequest) -> ServerResult<LogsResponse> {
        match request.txn_id {
            Some(txn) => Ok(self.cluster().abort(txn)?.into()),
            None => {
                let node = self.context.node_or_local(request.node);
                Ok(self.cluster().abort_pending(node)?.into())
            }
        }
    }

    /// `POST /node-state`. Bringing a node online wakes its replication link.
    pub fn handle_node_state(&self, request: NodeStateRequest) -> ServerResult<LogsResponse> {
        let mut logs = self.cluster().set_online(request.node, request.online)?;
        if request.online {
            if let Some(replication) = self.context.replication.as_deref() {
                logs.extend(replication.resume(request.node)?);
            }
        }
        info!(node = %request.node, online = request.online, "node state changed");
        Ok(logs.into())
    }

    /// `POST /recover`.
    pub fn handle_recover(&self, request: NodeRequest) -> ServerResult<LogsResponse> {
        let node = self.context.node_or_local(request.node);
        Ok(self.context.replication()?.recover(node)?.into())
    }

    /// `POST /replication/reset`.
    pub fn handle_replication_reset(&self, request: NodeRequest) -> ServerResult<LogsResponse> {
        let node = self.context.node_or_local(request.node);
        Ok(self.context.replication()?.reset(node)?.into())
    }

    /// `GET /logs`.
    pub fn handle_logs(&self, node: Option<NodeId>, limit: Option<usize>) -> ServerResult<LogResponse> {
        let node = self.context.node_or_local(node);
        let limit = limit.unwrap_or(self.context.config.log_tail);
        Ok(LogResponse {
            node,
            entries: self.cluster().recent_log(node, limit)?,
        })
    }
}
