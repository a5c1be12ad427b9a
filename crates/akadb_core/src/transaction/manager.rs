//! Per-node transaction manager.

use crate::change::ChangeSet;
use crate::error::{CoreError, CoreResult};
use crate::query::{QueryResult, RecordQuery};
use crate::record::{Record, RecordKey, RecordPatch};
use crate::stats::ClusterStats;
use crate::store::{Overlay, ReadPoint, RecordStore};
use crate::transaction::state::{PendingWrite, Transaction, TransactionInfo};
use crate::types::{now_millis, CommitMode, IsolationLevel, NodeId, SequenceNumber, TransactionId};
use crate::wal::{CommitLog, LogKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A mutation executed inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert a new record; fails if the key exists.
    Insert(Record),
    /// Change non-key fields of an existing record.
    Update {
        /// Record to change.
        key: RecordKey,
        /// Fields to set.
        patch: RecordPatch,
    },
    /// Remove every ordering of a title.
    Delete {
        /// Title to remove.
        title_id: String,
    },
}

impl Operation {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Operation::Insert(record) => format!("insert {}", record.key()),
            Operation::Update { key, .. } => format!("update {key}"),
            Operation::Delete { title_id } => format!("delete titleId {title_id}"),
        }
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Committed transaction.
    pub txn_id: TransactionId,
    /// Node it committed on.
    pub node: NodeId,
    /// Commit sequence, `None` when there was nothing to write.
    pub sequence: Option<SequenceNumber>,
    /// Change to replicate, `None` when there was nothing to write.
    pub change: Option<ChangeSet>,
    /// Per-step log lines.
    pub logs: Vec<String>,
}

/// Result of applying a replicated change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The change was applied under the given local sequence.
    Applied(SequenceNumber),
    /// The change was already applied earlier.
    Skipped,
}

#[derive(Debug, Default)]
struct ManagerState {
    active: BTreeMap<TransactionId, Transaction>,
    /// Write locks: key -> holder.
    locks: HashMap<RecordKey, TransactionId>,
    /// Highest origin sequence applied per origin node.
    watermarks: HashMap<NodeId, SequenceNumber>,
    /// Origin sequence of the last local commit. Local commits are numbered
    /// 1, 2, 3, ... with no gaps; replica applies do not advance it.
    local_seq: SequenceNumber,
}

/// Runs transactions against one node's store.
///
/// All state transitions happen under a single mutex, so commit sequencing,
/// lock bookkeeping, store installation and publication of the change are
/// atomic with respect to each other. Locking is no-wait: a write that finds
/// its key locked by another transaction fails immediately.
///
/// ## Visibility
///
/// - READ UNCOMMITTED reads see other open transactions' writes
/// - READ COMMITTED reads see the latest committed state
/// - REPEATABLE READ and SERIALIZABLE read the snapshot taken at open
///
/// Writes always check existence against the latest committed state plus
/// the transaction's own writes.
pub struct TransactionManager {
    node: NodeId,
    store: Arc<RecordStore>,
    log: Arc<CommitLog>,
    stats: Arc<ClusterStats>,
    state: Mutex<ManagerState>,
}

impl TransactionManager {
    /// Creates a manager over an empty store.
    pub fn new(node: NodeId, log: Arc<CommitLog>, stats: Arc<ClusterStats>) -> Self {
        Self {
            node,
            store: Arc::new(RecordStore::new()),
            log,
            stats,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Rebuilds the node's store by replaying its commit log.
    pub fn recover(node: NodeId, log: Arc<CommitLog>, stats: Arc<ClusterStats>) -> CoreResult<Self> {
        let manager = Self::new(node, log, stats);
        {
            let mut state = manager.state.lock();
            let mut replayed = 0usize;
            for (kind, change) in manager.log.data_entries()? {
                let seq = manager.store.committed_seq().next();
                manager.store.apply(seq, &change.ops, change.committed_at)?;
                match kind {
                    LogKind::ReplicaApply => {
                        let mark = state.watermarks.entry(change.origin).or_default();
                        *mark = (*mark).max(change.origin_seq);
                    }
                    _ => state.local_seq = state.local_seq.max(change.origin_seq),
                }
                replayed += 1;
            }
            manager.vacuum_locked(&state);
            if replayed > 0 {
                tracing::info!(
                    node = %node,
                    replayed,
                    rows = manager.store.row_count(),
                    "replayed commit log"
                );
            }
        }
        Ok(manager)
    }

    /// Node this manager serves.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The node's store.
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// The node's commit log.
    pub fn log(&self) -> &Arc<CommitLog> {
        &self.log
    }

    /// Opens a transaction with a caller-allocated id.
    pub fn begin(
        &self,
        id: TransactionId,
        isolation: IsolationLevel,
        mode: CommitMode,
    ) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.active.contains_key(&id) {
            return Err(CoreError::invalid_operation(format!("{id} is already open")));
        }
        let snapshot = self.store.committed_seq();
        state
            .active
            .insert(id, Transaction::new(id, self.node, isolation, mode, snapshot));
        self.stats.record_transaction_start();
        tracing::debug!(node = %self.node, txn = %id, isolation = %isolation, mode = %mode, "transaction opened");
        Ok(())
    }

    /// Returns true if the transaction is open here.
    pub fn contains(&self, id: TransactionId) -> bool {
        self.state.lock().active.contains_key(&id)
    }

    /// Listing entry of an open transaction.
    pub fn info(&self, id: TransactionId) -> Option<TransactionInfo> {
        self.state.lock().active.get(&id).map(Transaction::info)
    }

    /// All open transactions, oldest first.
    pub fn list(&self) -> Vec<TransactionInfo> {
        self.state.lock().active.values().map(Transaction::info).collect()
    }

    /// Number of open transactions.
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Executes one operation inside an open transaction.
    ///
    /// Statement errors leave the transaction open, except those for which
    /// [`CoreError::aborts_transaction`] holds.
    pub fn execute(&self, id: TransactionId, op: &Operation) -> CoreResult<String> {
        let mut state = self.state.lock();
        let result = self.execute_locked(&mut state, id, op);
        if let Err(err) = &result {
            self.stats.record_error();
            if matches!(
                err,
                CoreError::WriteConflict { .. } | CoreError::SerializationConflict { .. }
            ) {
                self.stats.record_conflict();
            }
            if err.aborts_transaction() && self.abort_locked(&mut state, id).is_some() {
                tracing::info!(node = %self.node, txn = %id, error = %err, "transaction aborted");
            }
        }
        result
    }

    fn execute_locked(
        &self,
        state: &mut ManagerState,
        id: TransactionId,
        op: &Operation,
    ) -> CoreResult<String> {
        let txn = state
            .active
            .get_mut(&id)
            .ok_or(CoreError::TransactionNotFound { txn: id })?;
        let locks = &mut state.locks;

        let line = match op {
            Operation::Insert(record) => {
                record.validate()?;
                let key = record.key();
                Self::lock_key(locks, txn, &key)?;
                if self.current(txn, &key).is_some() {
                    return Err(CoreError::DuplicateKey {
                        node: self.node,
                        key,
                    });
                }
                txn.put(record.clone(), true)?;
                format!("Inserted {key} on {} in {id}", self.node)
            }
            Operation::Update { key, patch } => {
                patch.validate()?;
                Self::lock_key(locks, txn, key)?;
                self.check_serializable(txn, key)?;
                let base = self
                    .current(txn, key)
                    .ok_or_else(|| CoreError::not_found(self.node, key.to_string()))?;
                txn.put(patch.apply(&base), false)?;
                format!("Updated {key} on {} in {id}", self.node)
            }
            Operation::Delete { title_id } => {
                if title_id.trim().is_empty() {
                    return Err(CoreError::validation("missing required field `titleId`"));
                }
                let keys = self.current_keys_for_title(txn, title_id);
                if keys.is_empty() {
                    return Err(CoreError::not_found(
                        self.node,
                        format!("titleId {title_id}"),
                    ));
                }
                for key in &keys {
                    Self::lock_key(locks, txn, key)?;
                    self.check_serializable(txn, key)?;
                }
                for key in &keys {
                    txn.delete(key.clone())?;
                }
                format!(
                    "Deleted {} row(s) for titleId {title_id} on {} in {id}",
                    keys.len(),
                    self.node
                )
            }
        };

        txn.log_step(line.clone());
        tracing::debug!(node = %self.node, txn = %id, op = %op.describe(), "statement executed");
        Ok(line)
    }

    fn lock_key(
        locks: &mut HashMap<RecordKey, TransactionId>,
        txn: &Transaction,
        key: &RecordKey,
    ) -> CoreResult<()> {
        if !txn.isolation().takes_write_locks() {
            return Ok(());
        }
        match locks.get(key) {
            Some(&holder) if holder != txn.id() => {
                if txn.isolation() == IsolationLevel::Serializable {
                    Err(CoreError::SerializationConflict {
                        txn: txn.id(),
                        key: key.clone(),
                    })
                } else {
                    Err(CoreError::WriteConflict {
                        key: key.clone(),
                        holder,
                    })
                }
            }
            Some(_) => Ok(()),
            None => {
                locks.insert(key.clone(), txn.id());
                Ok(())
            }
        }
    }

    /// Fails a serializable write on a key committed after the snapshot.
    fn check_serializable(&self, txn: &Transaction, key: &RecordKey) -> CoreResult<()> {
        if txn.isolation() != IsolationLevel::Serializable {
            return Ok(());
        }
        match self.store.latest_seq(key) {
            Some(seq) if seq > txn.snapshot_seq() => Err(CoreError::SerializationConflict {
                txn: txn.id(),
                key: key.clone(),
            }),
            _ => Ok(()),
        }
    }

    /// Latest committed value of a key with the transaction's writes applied.
    fn current(&self, txn: &Transaction, key: &RecordKey) -> Option<Record> {
        match txn.pending_write(key) {
            Some(PendingWrite::Put { record, .. }) => Some(record.clone()),
            Some(PendingWrite::Delete) => None,
            None => self.store.get(key, ReadPoint::Latest),
        }
    }

    fn current_keys_for_title(&self, txn: &Transaction, title_id: &str) -> Vec<RecordKey> {
        let mut keys = self.store.keys_for_title(title_id, ReadPoint::Latest);
        for (key, write) in txn.pending_writes() {
            if key.title_id == title_id
                && matches!(write, PendingWrite::Put { .. })
                && !keys.contains(key)
            {
                keys.push(key.clone());
            }
        }
        keys.retain(|key| self.current(txn, key).is_some());
        keys
    }

    /// Commits a transaction.
    ///
    /// The transaction is closed whether or not the commit succeeds; a failed
    /// commit leaves nothing behind.
    pub fn commit(&self, id: TransactionId) -> CoreResult<CommitOutcome> {
        self.commit_with(id, |_| {})
    }

    /// Commits a transaction and hands its change to `publish` before the
    /// next commit on this node can start.
    ///
    /// `publish` runs under the manager lock, so changes reach it in origin
    /// sequence order. It must not call back into this manager.
    pub fn commit_with<F>(&self, id: TransactionId, publish: F) -> CoreResult<CommitOutcome>
    where
        F: FnOnce(&ChangeSet),
    {
        let mut state = self.state.lock();
        let mut txn = state
            .active
            .remove(&id)
            .ok_or(CoreError::TransactionNotFound { txn: id })?;

        let result = self.commit_locked(&mut state, &txn);
        Self::release_locks(&mut state.locks, id);

        match result {
            Ok(outcome) => {
                if let Some(change) = &outcome.change {
                    publish(change);
                }
                txn.mark_committed();
                self.stats.record_transaction_commit();
                self.vacuum_locked(&state);
                Ok(outcome)
            }
            Err(err) => {
                txn.mark_aborted();
                self.stats.record_transaction_abort();
                self.stats.record_error();
                if matches!(err, CoreError::SerializationConflict { .. }) {
                    self.stats.record_conflict();
                }
                tracing::info!(node = %self.node, txn = %id, error = %err, "commit failed, transaction aborted");
                Err(err)
            }
        }
    }

    fn commit_locked(
        &self,
        state: &mut ManagerState,
        txn: &Transaction,
    ) -> CoreResult<CommitOutcome> {
        let id = txn.id();
        let mut logs = txn.steps().to_vec();

        if txn.write_count() == 0 {
            logs.push(format!("Committed {id} on {} (no changes)", self.node));
            return Ok(CommitOutcome {
                txn_id: id,
                node: self.node,
                sequence: None,
                change: None,
                logs,
            });
        }

        if txn.isolation() == IsolationLevel::Serializable {
            let written = txn.pending_writes().map(|(k, _)| k);
            let read = txn.read_set().map(|(k, _)| k);
            for key in written.chain(read) {
                self.check_serializable(txn, key)?;
            }
        }

        for (key, write) in txn.pending_writes() {
            if matches!(write, PendingWrite::Put { insert: true, .. }) && self.store.contains(key) {
                return Err(CoreError::DuplicateKey {
                    node: self.node,
                    key: key.clone(),
                });
            }
        }

        let seq = self.store.committed_seq().next();
        let origin_seq = state.local_seq.next();
        let committed_at = now_millis();
        let change = ChangeSet::new(self.node, origin_seq, id, committed_at, txn.change_ops());
        self.log.append_change(LogKind::LocalCommit, &change)?;
        self.store.apply(seq, &change.ops, committed_at)?;
        state.local_seq = origin_seq;
        self.stats.record_writes(change.len() as u64);

        logs.push(format!(
            "Committed {id} on {} at {seq} ({} change(s))",
            self.node,
            change.len()
        ));
        tracing::info!(node = %self.node, txn = %id, seq = %seq, origin_seq = %origin_seq, changes = change.len(), "transaction committed");

        Ok(CommitOutcome {
            txn_id: id,
            node: self.node,
            sequence: Some(seq),
            change: Some(change),
            logs,
        })
    }

    /// Rolls back an open transaction.
    pub fn abort(&self, id: TransactionId) -> CoreResult<Vec<String>> {
        let mut state = self.state.lock();
        let txn = self
            .abort_locked(&mut state, id)
            .ok_or(CoreError::TransactionNotFound { txn: id })?;
        let mut logs = txn.steps().to_vec();
        logs.push(format!(
            "Rolled back {id} on {} ({} change(s) discarded)",
            self.node,
            txn.write_count()
        ));
        tracing::info!(node = %self.node, txn = %id, "transaction rolled back");
        Ok(logs)
    }

    fn abort_locked(&self, state: &mut ManagerState, id: TransactionId) -> Option<Transaction> {
        let mut txn = state.active.remove(&id)?;
        Self::release_locks(&mut state.locks, id);
        txn.mark_aborted();
        self.stats.record_transaction_abort();
        self.vacuum_locked(state);
        Some(txn)
    }

    fn release_locks(locks: &mut HashMap<RecordKey, TransactionId>, id: TransactionId) {
        locks.retain(|_, holder| *holder != id);
    }

    /// Filtered, paginated read.
    ///
    /// Inside a transaction the read follows the transaction's isolation
    /// level and sees its own writes. Outside one, `isolation` decides
    /// whether other transactions' uncommitted writes are visible.
    pub fn read(
        &self,
        txn: Option<TransactionId>,
        isolation: IsolationLevel,
        query: &RecordQuery,
    ) -> CoreResult<QueryResult> {
        let mut state = self.state.lock();
        self.stats.record_read();

        let Some(id) = txn else {
            let overlay = if isolation == IsolationLevel::ReadUncommitted {
                Self::dirty_overlay(&state.active, None)
            } else {
                Vec::new()
            };
            return Ok(self.store.select(ReadPoint::Latest, &overlay, query));
        };

        let (point, overlay, serializable) = {
            let txn = state
                .active
                .get(&id)
                .ok_or(CoreError::TransactionNotFound { txn: id })?;
            let point = if txn.isolation().uses_snapshot() {
                ReadPoint::Snapshot(txn.snapshot_seq())
            } else {
                ReadPoint::Latest
            };
            let mut overlay = if txn.isolation() == IsolationLevel::ReadUncommitted {
                Self::dirty_overlay(&state.active, Some(id))
            } else {
                Vec::new()
            };
            overlay.extend(txn.overlay());
            (point, overlay, txn.isolation() == IsolationLevel::Serializable)
        };

        let result = self.store.select(point, &overlay, query);

        if serializable {
            if let Some(txn) = state.active.get_mut(&id) {
                for record in &result.data {
                    let key = record.key();
                    let seen = self.store.latest_seq(&key);
                    txn.record_read(key, seen);
                }
            }
        }
        Ok(result)
    }

    fn dirty_overlay(
        active: &BTreeMap<TransactionId, Transaction>,
        exclude: Option<TransactionId>,
    ) -> Overlay {
        active
            .values()
            .filter(|txn| Some(txn.id()) != exclude)
            .flat_map(Transaction::overlay)
            .collect()
    }

    /// Applies a change replicated from another node.
    ///
    /// The change commits immediately. Changes from one origin must arrive in
    /// origin sequence order: an already applied sequence is skipped, and one
    /// past the next expected sequence fails with [`CoreError::SequenceGap`]
    /// so the sender retries once the missing change has been delivered.
    /// Under isolation levels that take write locks, a key locked by a local
    /// transaction fails the apply with a [`CoreError::WriteConflict`].
    pub fn apply_replicated(
        &self,
        change: &ChangeSet,
        isolation: IsolationLevel,
    ) -> CoreResult<ApplyOutcome> {
        if change.origin == self.node {
            return Err(CoreError::invalid_operation(format!(
                "{} originated on {}",
                change.change_id, self.node
            )));
        }

        let mut state = self.state.lock();
        let mark = state
            .watermarks
            .get(&change.origin)
            .copied()
            .unwrap_or_default();
        if change.origin_seq <= mark {
            tracing::debug!(node = %self.node, origin = %change.origin, seq = %change.origin_seq, "replicated change already applied");
            return Ok(ApplyOutcome::Skipped);
        }
        if change.origin_seq != mark.next() {
            return Err(CoreError::SequenceGap {
                origin: change.origin,
                expected: mark.next(),
                received: change.origin_seq,
            });
        }

        if isolation.takes_write_locks() {
            for op in &change.ops {
                let key = op.key();
                if let Some(&holder) = state.locks.get(&key) {
                    self.stats.record_conflict();
                    return Err(CoreError::WriteConflict { key, holder });
                }
            }
        }

        let seq = self.store.committed_seq().next();
        self.log.append_change(LogKind::ReplicaApply, change)?;
        self.store.apply(seq, &change.ops, change.committed_at)?;
        state.watermarks.insert(change.origin, change.origin_seq);
        self.stats.record_replica_apply();
        self.vacuum_locked(&state);

        tracing::debug!(
            node = %self.node,
            origin = %change.origin,
            origin_seq = %change.origin_seq,
            seq = %seq,
            "replicated change applied"
        );
        Ok(ApplyOutcome::Applied(seq))
    }

    /// Origin sequence of the last local commit.
    pub fn local_seq(&self) -> SequenceNumber {
        self.state.lock().local_seq
    }

    /// Highest sequence from `origin` applied here.
    pub fn watermark(&self, origin: NodeId) -> SequenceNumber {
        self.state
            .lock()
            .watermarks
            .get(&origin)
            .copied()
            .unwrap_or_default()
    }

    /// Drops versions older than the oldest open snapshot.
    fn vacuum_locked(&self, state: &ManagerState) {
        let horizon = state
            .active
            .values()
            .filter(|txn| txn.isolation().uses_snapshot())
            .map(Transaction::snapshot_seq)
            .min()
            .unwrap_or_else(|| self.store.committed_seq());
        let removed = self.store.vacuum(horizon);
        if removed > 0 {
            tracing::trace!(node = %self.node, removed, horizon = %horizon, "vacuumed versions");
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("node", &self.node)
            .field("active", &self.active_count())
            .finish()
    }
}
