//! The cluster façade: nodes, settings, transaction routing.
//!
//! A [`Cluster`] owns every node of a deployment. Requests name a node (and
//! optionally a transaction); the cluster routes them to that node's
//! transaction manager and publishes committed changes on its
//! [`ChangeFeed`], where replication picks them up.
//!
//! ## Commit modes
//!
//! With auto-commit on, each mutation runs in its own transaction that
//! commits (or aborts) before the call returns. With auto-commit off, a
//! mutation that names no transaction joins the node's session transaction,
//! opening one if needed, and stays pending until committed or aborted.

use crate::change::{ChangeFeed, ChangeSet, CommitListener};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use crate::query::{QueryResult, RecordQuery};
use crate::report::{Report, ReportKind};
use crate::settings::{Settings, SettingsHandle};
use crate::stats::{ClusterStats, StatsSnapshot};
use crate::store::ReadPoint;
use crate::transaction::{ApplyOutcome, CommitOutcome, Operation, TransactionInfo};
use crate::types::{CommitMode, IsolationLevel, NodeId, TransactionId};
use crate::wal::{CommitLog, LogEntry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Every node of a deployment plus shared settings.
pub struct Cluster {
    config: Config,
    nodes: BTreeMap<NodeId, Node>,
    settings: SettingsHandle,
    next_txn: AtomicU64,
    /// Open transaction -> node.
    owners: Mutex<HashMap<TransactionId, NodeId>>,
    /// Manual-mode session transaction per node.
    sessions: Mutex<HashMap<NodeId, TransactionId>>,
    feed: ChangeFeed,
    stats: Arc<ClusterStats>,
}

impl Cluster {
    /// Opens a cluster, replaying persisted commit logs if configured.
    pub fn open(config: Config) -> CoreResult<Self> {
        if config.node_count == 0 {
            return Err(CoreError::validation("a cluster needs at least one node"));
        }
        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)?;
        }

        let stats = Arc::new(ClusterStats::new());
        let mut nodes = BTreeMap::new();
        let mut last_txn = 0u64;
        for n in 1..=config.node_count {
            let id = NodeId::new(n)
                .ok_or_else(|| CoreError::validation(format!("invalid node number {n}")))?;
            let log = match config.log_path(id) {
                Some(path) => CommitLog::open(path)?,
                None => CommitLog::in_memory(),
            };
            if let Some(txn) = log.last_transaction_id() {
                last_txn = last_txn.max(txn.as_u64());
            }
            nodes.insert(id, Node::open(id, log, Arc::clone(&stats))?);
        }

        tracing::info!(
            nodes = nodes.len(),
            persistent = config.data_dir.is_some(),
            isolation = %config.settings.isolation_level,
            auto_commit = config.settings.auto_commit,
            "cluster opened"
        );

        Ok(Self {
            settings: SettingsHandle::new(config.settings),
            config,
            nodes,
            next_txn: AtomicU64::new(last_txn + 1),
            owners: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            feed: ChangeFeed::new(),
            stats,
        })
    }

    /// Opens an in-memory cluster with default settings.
    pub fn in_memory(node_count: u8) -> CoreResult<Self> {
        Self::open(Config::new().node_count(node_count))
    }

    /// Configuration the cluster was opened with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// All nodes in ascending order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Looks up a node.
    pub fn node(&self, id: NodeId) -> CoreResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or(CoreError::UnknownNode { node: id })
    }

    fn online_node(&self, id: NodeId) -> CoreResult<&Node> {
        let node = self.node(id)?;
        node.ensure_online()?;
        Ok(node)
    }

    /// Current settings.
    pub fn settings(&self) -> Settings {
        self.settings.get()
    }

    /// Replaces the settings for transactions opened from now on.
    pub fn apply_settings(&self, settings: Settings) -> Vec<String> {
        self.settings.apply(settings)
    }

    /// Registers a commit listener.
    pub fn subscribe(&self, listener: Arc<dyn CommitListener>) {
        self.feed.subscribe(listener);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Opens a manual transaction at the current isolation level.
    pub fn begin(&self, node: NodeId) -> CoreResult<TransactionId> {
        let isolation = self.settings().isolation_level;
        self.begin_with(node, isolation, CommitMode::Manual)
    }

    /// Opens a transaction with explicit parameters.
    pub fn begin_with(
        &self,
        node: NodeId,
        isolation: IsolationLevel,
        mode: CommitMode,
    ) -> CoreResult<TransactionId> {
        let target = self.online_node(node)?;
        let id = TransactionId::new(self.next_txn.fetch_add(1, Ordering::SeqCst));
        // owned before it is visible in the node's listing
        self.owners.lock().insert(id, node);
        if let Err(err) = target.manager().begin(id, isolation, mode) {
            self.owners.lock().remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Node an open transaction belongs to.
    pub fn owner(&self, txn: TransactionId) -> CoreResult<NodeId> {
        self.owners
            .lock()
            .get(&txn)
            .copied()
            .ok_or(CoreError::TransactionNotFound { txn })
    }

    /// Resolves the node of `txn`, aborting it if that node is offline.
    fn route(&self, txn: TransactionId) -> CoreResult<&Node> {
        let node = self.node(self.owner(txn)?)?;
        if let Err(err) = node.ensure_online() {
            if node.manager().abort(txn).is_ok() {
                tracing::info!(node = %node.id(), txn = %txn, "aborted transaction on offline node");
            }
            self.forget(txn);
            return Err(err);
        }
        Ok(node)
    }

    fn forget(&self, txn: TransactionId) {
        self.owners.lock().remove(&txn);
        self.sessions.lock().retain(|_, session| *session != txn);
    }

    fn settle(&self, node: &Node, txn: TransactionId) {
        if !node.manager().contains(txn) {
            self.forget(txn);
        }
    }

    /// Executes one operation inside an open transaction.
    pub fn execute(&self, txn: TransactionId, op: &Operation) -> CoreResult<String> {
        let node = self.route(txn)?;
        let result = node.manager().execute(txn, op);
        self.settle(node, txn);
        result
    }

    /// Commits a transaction and publishes its change.
    pub fn commit(&self, txn: TransactionId) -> CoreResult<CommitOutcome> {
        let node = self.route(txn)?;
        let result = node
            .manager()
            .commit_with(txn, |change| self.feed.emit(change));
        self.forget(txn);
        result
    }

    /// Rolls back a transaction.
    pub fn abort(&self, txn: TransactionId) -> CoreResult<Vec<String>> {
        let node = self.node(self.owner(txn)?)?;
        let result = node.manager().abort(txn);
        self.forget(txn);
        result
    }

    fn discard(&self, txn: TransactionId) {
        if let Ok(node) = self.owner(txn).and_then(|id| self.node(id)) {
            if node.manager().abort(txn).is_ok() {
                tracing::debug!(node = %node.id(), txn = %txn, "transaction discarded");
            }
        }
        self.forget(txn);
    }

    /// Runs a client mutation under the current settings.
    ///
    /// With `txn` set the operation joins that transaction, which must
    /// belong to `node`. Otherwise the current commit mode decides between a
    /// single-statement transaction and the node's session transaction.
    pub fn submit(
        &self,
        node: NodeId,
        txn: Option<TransactionId>,
        op: &Operation,
    ) -> CoreResult<Vec<String>> {
        if let Some(id) = txn {
            let owner = self.owner(id)?;
            if owner != node {
                return Err(CoreError::invalid_operation(format!(
                    "{id} belongs to {owner}, not {node}"
                )));
            }
            let line = self.execute(id, op)?;
            return Ok(vec![line, format!("{id} remains open; commit or abort to finish")]);
        }

        let settings = self.settings();
        let isolation = settings.isolation_level;

        if settings.auto_commit {
            let id = self.begin_with(node, isolation, CommitMode::AutoCommit)?;
            let mut logs = vec![format!(
                "Started {id} on {node} ({isolation}, {})",
                CommitMode::AutoCommit
            )];
            if let Err(err) = self.execute(id, op) {
                self.discard(id);
                return Err(err);
            }
            let outcome = self.commit(id)?;
            logs.extend(outcome.logs);
            return Ok(logs);
        }

        let (id, opened) = self.session_or_begin(node, isolation)?;
        let mut logs = Vec::new();
        if opened {
            logs.push(format!(
                "Started {id} on {node} ({isolation}, {})",
                CommitMode::Manual
            ));
        }
        logs.push(self.execute(id, op)?);
        logs.push(format!("{id} pending on {node}; commit or abort to finish"));
        Ok(logs)
    }

    fn session_or_begin(
        &self,
        node: NodeId,
        isolation: IsolationLevel,
    ) -> CoreResult<(TransactionId, bool)> {
        let mut sessions = self.sessions.lock();
        if let Some(&id) = sessions.get(&node) {
            if self.node(node)?.manager().contains(id) {
                return Ok((id, false));
            }
        }
        let id = self.begin_with(node, isolation, CommitMode::Manual)?;
        sessions.insert(node, id);
        Ok((id, true))
    }

    /// The node's manual-mode session transaction, if open.
    pub fn session(&self, node: NodeId) -> Option<TransactionId> {
        self.sessions.lock().get(&node).copied()
    }

    /// Commits every open transaction on a node, oldest first.
    pub fn commit_pending(&self, node: NodeId) -> CoreResult<Vec<String>> {
        self.resolve_pending(node, true)
    }

    /// Aborts every open transaction on a node.
    pub fn abort_pending(&self, node: NodeId) -> CoreResult<Vec<String>> {
        self.resolve_pending(node, false)
    }

    fn resolve_pending(&self, node: NodeId, commit: bool) -> CoreResult<Vec<String>> {
        let open: Vec<TransactionId> = self
            .node(node)?
            .manager()
            .list()
            .into_iter()
            .map(|info| info.txn_id)
            .collect();
        if open.is_empty() {
            return Ok(vec![format!("No pending transactions on {node}")]);
        }

        let mut logs = Vec::new();
        for id in open {
            let result = if commit {
                self.commit(id).map(|outcome| outcome.logs)
            } else {
                self.abort(id)
            };
            match result {
                Ok(lines) => logs.extend(lines),
                Err(err) => logs.push(format!("{id} failed: {err}")),
            }
        }
        Ok(logs)
    }

    /// Open transactions across all nodes.
    pub fn pending(&self) -> Vec<TransactionInfo> {
        self.nodes
            .values()
            .flat_map(|node| node.manager().list())
            .collect()
    }

    /// Number of open transactions across all nodes.
    pub fn pending_count(&self) -> usize {
        self.nodes
            .values()
            .map(|node| node.manager().active_count())
            .sum()
    }

    /// Filtered, paginated read on a node.
    ///
    /// Without `txn` the read sees the latest committed rows, plus open
    /// transactions' writes when the current level is READ UNCOMMITTED.
    pub fn query(
        &self,
        node: NodeId,
        txn: Option<TransactionId>,
        query: &RecordQuery,
    ) -> CoreResult<QueryResult> {
        let mut query = query.clone();
        query.pagination = query.pagination.clamped(self.config.max_page_limit)?;

        let isolation = self.settings().isolation_level;
        match txn {
            Some(id) => {
                let target = self.route(id)?;
                if target.id() != node {
                    return Err(CoreError::invalid_operation(format!(
                        "{id} belongs to {}, not {node}",
                        target.id()
                    )));
                }
                let result = target.manager().read(Some(id), isolation, &query);
                self.settle(target, id);
                result
            }
            None => self
                .online_node(node)?
                .manager()
                .read(None, isolation, &query),
        }
    }

    /// Grouped counts over a node's committed rows.
    pub fn report(&self, node: NodeId, kind: ReportKind) -> CoreResult<Report> {
        let target = self.online_node(node)?;
        let rows = target.store().rows(ReadPoint::Latest, &[]);
        Ok(Report::build(kind, node, &rows))
    }

    /// Takes a node offline or brings it back.
    pub fn set_online(&self, node: NodeId, online: bool) -> CoreResult<Vec<String>> {
        let previous = self.node(node)?.set_online(online);
        let state = if online { "ONLINE" } else { "OFFLINE" };
        Ok(vec![if previous == online {
            format!("{node} already {state}")
        } else {
            format!("{node} is now {state}")
        }])
    }

    /// Applies a change replicated from another node under the current
    /// isolation level.
    pub fn apply_replicated(&self, node: NodeId, change: &ChangeSet) -> CoreResult<ApplyOutcome> {
        let isolation = self.settings().isolation_level;
        self.online_node(node)?
            .manager()
            .apply_replicated(change, isolation)
    }

    /// The most recent commit log entries of a node.
    pub fn recent_log(&self, node: NodeId, limit: usize) -> CoreResult<Vec<LogEntry>> {
        self.node(node)?.log().tail(limit)
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.node_ids())
            .field("settings", &self.settings())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Pagination, RecordFilter};
    use crate::record::{Record, RecordKey, RecordPatch};

    fn node(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn insert(id: &str, ordering: i32, title: &str) -> Operation {
        Operation::Insert(Record::new(id, ordering, title, "US", "en", "movie"))
    }

    fn titles(cluster: &Cluster, n: u8) -> Vec<String> {
        cluster
            .query(node(n), None, &RecordQuery::default())
            .unwrap()
            .data
            .into_iter()
            .map(|r| r.title)
            .collect()
    }

    #[test]
    fn auto_commit_insert_read_delete() {
        let cluster = Cluster::in_memory(3).unwrap();
        let logs = cluster.submit(node(1), None, &insert("tt1", 1, "Alpha")).unwrap();
        assert!(logs.iter().any(|l| l.starts_with("Committed")));

        let result = cluster
            .query(node(1), None, &RecordQuery::filtered(RecordFilter::title_id("tt1")))
            .unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.data[0].title, "Alpha");
        assert_eq!(result.data[0].attributes, "N/A");

        cluster
            .submit(node(1), None, &Operation::Delete { title_id: "tt1".into() })
            .unwrap();
        assert!(titles(&cluster, 1).is_empty());
        assert_eq!(cluster.pending_count(), 0);
    }

    #[test]
    fn auto_commit_failure_aborts() {
        let cluster = Cluster::in_memory(1).unwrap();
        cluster.submit(node(1), None, &insert("tt1", 1, "Alpha")).unwrap();
        let err = cluster
            .submit(node(1), None, &insert("tt1", 1, "Again"))
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateKey { .. }));
        assert_eq!(cluster.pending_count(), 0);
        assert_eq!(titles(&cluster, 1), vec!["Alpha"]);
    }

    #[test]
    fn manual_mode_session_until_commit() {
        let cluster = Cluster::in_memory(2).unwrap();
        cluster.submit(node(1), None, &insert("tt1", 1, "Alpha")).unwrap();
        cluster.apply_settings(Settings::new(IsolationLevel::ReadCommitted, false));

        let update = Operation::Update {
            key: RecordKey::new("tt1", 1),
            patch: RecordPatch::title("Beta"),
        };
        cluster.submit(node(1), None, &update).unwrap();
        cluster.submit(node(1), None, &insert("tt2", 1, "Gamma")).unwrap();

        let session = cluster.session(node(1)).unwrap();
        assert_eq!(cluster.pending().len(), 1);
        assert_eq!(cluster.pending()[0].operations, 2);
        assert_eq!(titles(&cluster, 1), vec!["Alpha"]);

        let logs = cluster.commit_pending(node(1)).unwrap();
        assert!(logs.iter().any(|l| l.contains(&session.to_string())));
        assert_eq!(titles(&cluster, 1), vec!["Beta", "Gamma"]);
        assert!(cluster.session(node(1)).is_none());
    }

    #[test]
    fn statement_error_keeps_manual_session() {
        let cluster = Cluster::in_memory(1).unwrap();
        cluster.apply_settings(Settings::new(IsolationLevel::ReadCommitted, false));
        cluster.submit(node(1), None, &insert("tt1", 1, "A")).unwrap();
        let err = cluster.submit(node(1), None, &insert("tt1", 1, "B")).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateKey { .. }));
        assert!(cluster.session(node(1)).is_some());

        cluster.abort_pending(node(1)).unwrap();
        assert!(titles(&cluster, 1).is_empty());
    }

    #[test]
    fn offline_node_aborts_transaction() {
        let cluster = Cluster::in_memory(2).unwrap();
        let txn = cluster.begin(node(2)).unwrap();
        cluster.execute(txn, &insert("tt1", 1, "A")).unwrap();

        cluster.set_online(node(2), false).unwrap();
        let err = cluster.execute(txn, &insert("tt2", 1, "B")).unwrap_err();
        assert!(matches!(err, CoreError::NodeUnavailable { .. }));
        assert!(matches!(
            cluster.commit(txn),
            Err(CoreError::TransactionNotFound { .. })
        ));
        assert!(matches!(
            cluster.submit(node(2), None, &insert("tt3", 1, "C")),
            Err(CoreError::NodeUnavailable { .. })
        ));

        cluster.set_online(node(2), true).unwrap();
        assert!(titles(&cluster, 2).is_empty());
    }

    #[test]
    fn named_transaction_must_match_node() {
        let cluster = Cluster::in_memory(2).unwrap();
        let txn = cluster.begin(node(1)).unwrap();
        assert!(matches!(
            cluster.submit(node(2), Some(txn), &insert("tt1", 1, "A")),
            Err(CoreError::InvalidOperation { .. })
        ));
        cluster.submit(node(1), Some(txn), &insert("tt1", 1, "A")).unwrap();
        cluster.commit(txn).unwrap();
        assert_eq!(titles(&cluster, 1), vec!["A"]);
    }

    #[test]
    fn unknown_node_rejected() {
        let cluster = Cluster::in_memory(2).unwrap();
        assert!(matches!(
            cluster.query(node(9), None, &RecordQuery::default()),
            Err(CoreError::UnknownNode { .. })
        ));
    }

    #[test]
    fn page_limit_is_capped() {
        let cluster = Cluster::open(Config::new().node_count(1).page_limits(100, 2)).unwrap();
        for i in 0..5 {
            cluster
                .submit(node(1), None, &insert(&format!("tt{i}"), 1, "T"))
                .unwrap();
        }
        let query = RecordQuery::default().with_pagination(Pagination::offset(0, 50));
        let result = cluster.query(node(1), None, &query).unwrap();
        assert_eq!(result.data.len(), 2);
        assert_eq!(result.total, 5);
    }

    #[test]
    fn commit_emits_change() {
        #[derive(Default)]
        struct Count(Mutex<usize>);
        impl CommitListener for Count {
            fn on_commit(&self, _change: &ChangeSet) {
                *self.0.lock() += 1;
            }
        }

        let cluster = Cluster::in_memory(1).unwrap();
        let counter = Arc::new(Count::default());
        cluster.subscribe(counter.clone());
        cluster.submit(node(1), None, &insert("tt1", 1, "A")).unwrap();

        // empty commits publish nothing
        let txn = cluster.begin(node(1)).unwrap();
        cluster.commit(txn).unwrap();
        assert_eq!(*counter.0.lock(), 1);
    }

    #[test]
    fn concurrent_commits_publish_in_origin_order() {
        #[derive(Default)]
        struct Sequences(Mutex<Vec<u64>>);
        impl CommitListener for Sequences {
            fn on_commit(&self, change: &ChangeSet) {
                // widen the window between commit and publication
                std::thread::yield_now();
                self.0.lock().push(change.origin_seq.as_u64());
            }
        }

        let cluster = Arc::new(Cluster::in_memory(1).unwrap());
        let seen = Arc::new(Sequences::default());
        cluster.subscribe(seen.clone());

        let writers: Vec<_> = (0..8)
            .map(|w| {
                let cluster = Arc::clone(&cluster);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        cluster
                            .submit(node(1), None, &insert(&format!("tt{w}x{i}"), 1, "T"))
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let seen = seen.0.lock().clone();
        assert_eq!(seen, (1..=200).collect::<Vec<u64>>());
    }

    #[test]
    fn pending_resolution_races_with_begin() {
        let cluster = Arc::new(Cluster::in_memory(1).unwrap());
        let opener = {
            let cluster = Arc::clone(&cluster);
            std::thread::spawn(move || {
                (0..300)
                    .map(|_| cluster.begin(node(1)).unwrap())
                    .collect::<Vec<_>>()
            })
        };

        let mut failures = Vec::new();
        while !opener.is_finished() {
            for line in cluster.commit_pending(node(1)).unwrap() {
                if line.contains("failed") {
                    failures.push(line);
                }
            }
        }
        let opened = opener.join().unwrap();
        cluster.commit_pending(node(1)).unwrap();

        assert!(failures.is_empty(), "{failures:?}");
        assert_eq!(cluster.pending_count(), 0);
        assert!(opened.iter().all(|&txn| cluster.owner(txn).is_err()));
    }

    #[test]
    fn reopen_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cluster = Cluster::open(Config::new().node_count(2).data_dir(dir.path())).unwrap();
            cluster.submit(node(1), None, &insert("tt1", 1, "A")).unwrap();
            cluster.submit(node(1), None, &insert("tt2", 1, "B")).unwrap();
        }

        let cluster = Cluster::open(Config::new().node_count(2).data_dir(dir.path())).unwrap();
        assert_eq!(titles(&cluster, 1), vec!["A", "B"]);
        assert!(titles(&cluster, 2).is_empty());

        // transaction ids continue past the replayed ones
        let txn = cluster.begin(node(1)).unwrap();
        assert!(txn.as_u64() > 2);
    }

    #[test]
    fn report_counts_committed_rows() {
        let cluster = Cluster::in_memory(1).unwrap();
        cluster.submit(node(1), None, &insert("tt1", 1, "A")).unwrap();
        cluster
            .submit(
                node(1),
                None,
                &Operation::Insert(Record::new("tt2", 1, "B", "PH", "tl", "short")),
            )
            .unwrap();

        let report = cluster.report(node(1), ReportKind::Distribution).unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.rows.len(), 2);
    }
}
