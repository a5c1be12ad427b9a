//! Transaction state.

use crate::change::ChangeOp;
use crate::error::{CoreError, CoreResult};
use crate::record::{Record, RecordKey};
use crate::store::Overlay;
use crate::types::{now_millis, CommitMode, IsolationLevel, NodeId, SequenceNumber, TransactionId};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// Represents a pending write in a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    /// Insert or replace a record.
    Put {
        /// After-image.
        record: Record,
        /// The key must not exist at commit time.
        insert: bool,
    },
    /// Delete a record.
    Delete,
}

/// An open transaction on one node.
///
/// Writes are buffered here until commit. Each key appears once in the write
/// set, at the position of its first write.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    node: NodeId,
    isolation: IsolationLevel,
    mode: CommitMode,
    /// Reads under snapshot levels see this point in time.
    snapshot_seq: SequenceNumber,
    state: TransactionState,
    opened_at: Instant,
    opened_at_ms: u64,
    writes: Vec<(RecordKey, PendingWrite)>,
    write_index: HashMap<RecordKey, usize>,
    /// Read set for conflict detection: key -> sequence observed.
    reads: HashMap<RecordKey, Option<SequenceNumber>>,
    operations: usize,
    steps: Vec<String>,
}

impl Transaction {
    /// Creates a new transaction.
    pub(crate) fn new(
        id: TransactionId,
        node: NodeId,
        isolation: IsolationLevel,
        mode: CommitMode,
        snapshot_seq: SequenceNumber,
    ) -> Self {
        Self {
            id,
            node,
            isolation,
            mode,
            snapshot_seq,
            state: TransactionState::Active,
            opened_at: Instant::now(),
            opened_at_ms: now_millis(),
            writes: Vec::new(),
            write_index: HashMap::new(),
            reads: HashMap::new(),
            operations: 0,
            steps: Vec::new(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Node the transaction belongs to.
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Isolation level fixed at open time.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Commit mode fixed at open time.
    #[must_use]
    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    /// Returns the snapshot sequence number.
    #[must_use]
    pub fn snapshot_seq(&self) -> SequenceNumber {
        self.snapshot_seq
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Records a put.
    pub fn put(&mut self, record: Record, insert: bool) -> CoreResult<()> {
        self.ensure_active()?;
        let key = record.key();
        match self.write_index.get(&key) {
            Some(&idx) => {
                // insert-after-own-delete replaces a committed row
                let insert = match &self.writes[idx].1 {
                    PendingWrite::Put { insert: was, .. } => *was,
                    PendingWrite::Delete => false,
                };
                self.writes[idx].1 = PendingWrite::Put { record, insert };
            }
            None => {
                self.write_index.insert(key.clone(), self.writes.len());
                self.writes.push((key, PendingWrite::Put { record, insert }));
            }
        }
        Ok(())
    }

    /// Records a delete.
    pub fn delete(&mut self, key: RecordKey) -> CoreResult<()> {
        self.ensure_active()?;
        match self.write_index.get(&key) {
            Some(&idx) => self.writes[idx].1 = PendingWrite::Delete,
            None => {
                self.write_index.insert(key.clone(), self.writes.len());
                self.writes.push((key, PendingWrite::Delete));
            }
        }
        Ok(())
    }

    /// Records a read for conflict detection.
    pub fn record_read(&mut self, key: RecordKey, observed_seq: Option<SequenceNumber>) {
        if !self.write_index.contains_key(&key) {
            self.reads.entry(key).or_insert(observed_seq);
        }
    }

    /// Gets the pending write for a key.
    #[must_use]
    pub fn pending_write(&self, key: &RecordKey) -> Option<&PendingWrite> {
        self.write_index.get(key).map(|&idx| &self.writes[idx].1)
    }

    /// Returns all pending writes in first-write order.
    pub fn pending_writes(&self) -> impl Iterator<Item = (&RecordKey, &PendingWrite)> {
        self.writes.iter().map(|(k, w)| (k, w))
    }

    /// Returns the number of keys written.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Keys read, with the sequence observed.
    pub fn read_set(&self) -> impl Iterator<Item = (&RecordKey, &Option<SequenceNumber>)> {
        self.reads.iter()
    }

    /// The write set as an overlay for reads.
    #[must_use]
    pub fn overlay(&self) -> Overlay {
        self.writes
            .iter()
            .map(|(key, write)| {
                let value = match write {
                    PendingWrite::Put { record, .. } => Some(record.clone()),
                    PendingWrite::Delete => None,
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// The write set as change operations.
    #[must_use]
    pub fn change_ops(&self) -> Vec<ChangeOp> {
        self.writes
            .iter()
            .map(|(key, write)| match write {
                PendingWrite::Put { record, .. } => ChangeOp::Put {
                    record: record.clone(),
                },
                PendingWrite::Delete => ChangeOp::Delete { key: key.clone() },
            })
            .collect()
    }

    /// Counts an executed operation and appends its log line.
    pub(crate) fn log_step(&mut self, step: impl Into<String>) {
        self.operations += 1;
        self.steps.push(step.into());
    }

    /// Log lines of executed operations.
    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    /// Marks the transaction as committed.
    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    /// Marks the transaction as aborted.
    pub(crate) fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
    }

    /// Summary for listings.
    #[must_use]
    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            txn_id: self.id,
            node: self.node,
            isolation_level: self.isolation,
            commit_mode: self.mode,
            state: self.state,
            operations: self.operations,
            writes: self.writes.len(),
            opened_at: self.opened_at_ms,
            age_ms: self.opened_at.elapsed().as_millis() as u64,
        }
    }

    /// Ensures the transaction is active.
    fn ensure_active(&self) -> CoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(CoreError::invalid_operation(
                "transaction already committed",
            )),
            TransactionState::Aborted => {
                Err(CoreError::invalid_operation("transaction already aborted"))
            }
        }
    }
}

/// Listing entry for an open transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    /// Transaction id.
    pub txn_id: TransactionId,
    /// Owning node.
    pub node: NodeId,
    /// Isolation level.
    pub isolation_level: IsolationLevel,
    /// Commit mode.
    pub commit_mode: CommitMode,
    /// Current state.
    pub state: TransactionState,
    /// Operations executed.
    pub operations: usize,
    /// Keys in the write set.
    pub writes: usize,
    /// Open time, epoch milliseconds.
    pub opened_at: u64,
    /// Time since open.
    pub age_ms: u64,
}
