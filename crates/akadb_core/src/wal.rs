//! Per-node commit log.
//!
//! Every change applied to a node is appended here before it becomes
//! visible, together with the replication journal for changes the node
//! originated. The log is append-only: replication status updates are new
//! entries, never edits.
//!
//! With a path the log is a JSON-lines file, flushed and synced on every
//! append. Only the most recent entries stay in memory; replay and catch-up
//! stream the file.
//!
//! ## Invariants
//!
//! - Entries are never modified after write
//! - A change is logged before it is applied to the store
//! - Replay applies `LOCAL_COMMIT` and `REPLICA_APPLY` entries in log order

use crate::change::ChangeSet;
use crate::error::CoreResult;
use crate::types::{now_millis, NodeId, SequenceNumber, TransactionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Kind of a commit log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    /// A transaction committed on this node.
    LocalCommit,
    /// A change from another node was applied here.
    ReplicaApply,
    /// A local change was queued for a peer.
    ReplicationPending,
    /// A peer applied a local change.
    ReplicationSuccess,
    /// Delivery to a peer failed; the change stays queued.
    ReplicationFailed,
}

impl LogKind {
    /// Returns true for entries that carry data applied to the store.
    pub fn is_data(self) -> bool {
        matches!(self, LogKind::LocalCommit | LogKind::ReplicaApply)
    }
}

/// One commit log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub log_id: u64,
    /// Transaction that produced the change.
    pub transaction_id: TransactionId,
    /// Change the entry is about.
    pub change_id: Uuid,
    /// Entry time, epoch milliseconds.
    pub timestamp: u64,
    /// Entry kind.
    pub kind: LogKind,
    /// Peer node for replication entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,
    /// Full change for data entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<ChangeSet>,
    /// Failure text for `REPLICATION_FAILED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Entries a file-backed log keeps in memory. Older entries are read back
/// from the file on demand.
pub const DEFAULT_RECENT_ENTRIES: usize = 1024;

struct LogInner {
    /// Most recent entries, oldest first. In-memory logs keep all of them.
    recent: VecDeque<LogEntry>,
    /// Entries written so far, including those no longer in `recent`.
    count: u64,
    last_local_txn: Option<TransactionId>,
    file: Option<File>,
}

impl LogInner {
    fn remember(&mut self, entry: LogEntry, keep: usize) {
        if entry.kind == LogKind::LocalCommit {
            self.last_local_txn = self.last_local_txn.max(Some(entry.transaction_id));
        }
        self.count = self.count.max(entry.log_id);
        self.recent.push_back(entry);
        while self.recent.len() > keep {
            self.recent.pop_front();
        }
    }
}

/// Append-only commit log of one node.
pub struct CommitLog {
    path: Option<PathBuf>,
    keep: usize,
    inner: Mutex<LogInner>,
}

impl CommitLog {
    /// Creates a log that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            keep: usize::MAX,
            inner: Mutex::new(LogInner {
                recent: VecDeque::new(),
                count: 0,
                last_local_txn: None,
                file: None,
            }),
        }
    }

    /// Opens (or creates) a file-backed log.
    ///
    /// A trailing partial line, left by a crash mid-append, is cut off so
    /// the next append starts on a fresh line.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        Self::open_with_recent(path, DEFAULT_RECENT_ENTRIES)
    }

    /// Opens a file-backed log keeping at most `keep` entries in memory.
    pub fn open_with_recent(path: impl AsRef<Path>, keep: usize) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let keep = keep.max(1);
        let mut inner = LogInner {
            recent: VecDeque::new(),
            count: 0,
            last_local_txn: None,
            file: None,
        };

        if path.exists() {
            let scan = scan_file(&path, |entry| inner.remember(entry, keep))?;
            if let Some(torn) = scan.torn {
                tracing::warn!(
                    path = %path.display(),
                    offset = scan.valid_len,
                    error = %torn,
                    "truncating torn commit log tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }
        }

        inner.file = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        tracing::debug!(path = %path.display(), entries = inner.count, "commit log opened");

        Ok(Self {
            path: Some(path),
            keep,
            inner: Mutex::new(inner),
        })
    }

    /// Reads the last `limit` entries of a log file without opening it for
    /// writing. A torn tail is skipped, not repaired.
    pub fn read_tail(path: impl AsRef<Path>, limit: usize) -> CoreResult<Vec<LogEntry>> {
        let mut tail = VecDeque::new();
        scan_file(path.as_ref(), |entry| push_bounded(&mut tail, entry, limit))?;
        Ok(tail.into())
    }

    /// File path, if persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records a change applied to this node.
    pub fn append_change(&self, kind: LogKind, change: &ChangeSet) -> CoreResult<u64> {
        self.append(kind, change, None, Some(change.clone()), None)
    }

    /// Records a replication journal entry for a local change.
    pub fn append_replication(
        &self,
        kind: LogKind,
        change: &ChangeSet,
        target: NodeId,
        error: Option<String>,
    ) -> CoreResult<u64> {
        self.append(kind, change, Some(target), None, error)
    }

    fn append(
        &self,
        kind: LogKind,
        about: &ChangeSet,
        target: Option<NodeId>,
        change: Option<ChangeSet>,
        error: Option<String>,
    ) -> CoreResult<u64> {
        let mut inner = self.inner.lock();
        let entry = LogEntry {
            log_id: inner.count + 1,
            transaction_id: about.txn_id,
            change_id: about.change_id,
            timestamp: now_millis(),
            kind,
            target,
            change,
            error,
        };

        if let Some(file) = inner.file.as_mut() {
            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            file.write_all(&line)?;
            file.flush()?;
            file.sync_data()?;
        }

        let log_id = entry.log_id;
        inner.remember(entry, self.keep);
        Ok(log_id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().count as usize
    }

    /// Returns true if the log has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> CoreResult<Vec<LogEntry>> {
        let inner = self.inner.lock();
        if limit <= inner.recent.len() || inner.count as usize == inner.recent.len() {
            let start = inner.recent.len().saturating_sub(limit);
            return Ok(inner.recent.range(start..).cloned().collect());
        }
        let mut tail = VecDeque::new();
        self.each_entry(&inner, |entry| push_bounded(&mut tail, entry, limit))?;
        Ok(tail.into())
    }

    /// Entries that carry data, in log order.
    pub fn data_entries(&self) -> CoreResult<Vec<(LogKind, ChangeSet)>> {
        let inner = self.inner.lock();
        let mut data = Vec::new();
        self.each_entry(&inner, |entry| {
            if entry.kind.is_data() {
                if let Some(change) = entry.change {
                    data.push((entry.kind, change));
                }
            }
        })?;
        Ok(data)
    }

    /// Highest transaction id that committed locally.
    pub fn last_transaction_id(&self) -> Option<TransactionId> {
        self.inner.lock().last_local_txn
    }

    /// Local commits with an origin sequence above `after`, in commit order.
    pub fn local_commits_after(&self, after: SequenceNumber) -> CoreResult<Vec<ChangeSet>> {
        let inner = self.inner.lock();
        let mut commits = Vec::new();
        self.each_entry(&inner, |entry| {
            if entry.kind == LogKind::LocalCommit {
                if let Some(change) = entry.change.filter(|c| c.origin_seq > after) {
                    commits.push(change);
                }
            }
        })?;
        Ok(commits)
    }

    /// Visits every entry in log order. Holding `inner` keeps appends out.
    fn each_entry<F>(&self, inner: &LogInner, mut visit: F) -> CoreResult<()>
    where
        F: FnMut(LogEntry),
    {
        match &self.path {
            Some(path) if inner.count as usize > inner.recent.len() => {
                scan_file(path, visit)?;
            }
            _ => inner.recent.iter().cloned().for_each(&mut visit),
        }
        Ok(())
    }
}

fn push_bounded(tail: &mut VecDeque<LogEntry>, entry: LogEntry, limit: usize) {
    if limit == 0 {
        return;
    }
    if tail.len() == limit {
        tail.pop_front();
    }
    tail.push_back(entry);
}

struct Scan {
    /// Bytes up to the end of the last complete entry.
    valid_len: u64,
    /// Why the remainder was rejected, if there is one.
    torn: Option<String>,
}

/// Streams the entries of a log file.
///
/// Only the final line may be damaged; an unreadable line followed by more
/// data is an error.
fn scan_file<F>(path: &Path, mut visit: F) -> CoreResult<Scan>
where
    F: FnMut(LogEntry),
{
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    let mut valid_len = 0u64;
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(Scan {
                valid_len,
                torn: None,
            });
        }
        if line.last() != Some(&b'\n') {
            return Ok(Scan {
                valid_len,
                torn: Some("unterminated entry".to_string()),
            });
        }
        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<LogEntry>(&line) {
                Ok(entry) => visit(entry),
                Err(e) => {
                    let mut rest = Vec::new();
                    reader.read_to_end(&mut rest)?;
                    if rest.iter().all(u8::is_ascii_whitespace) {
                        return Ok(Scan {
                            valid_len,
                            torn: Some(e.to_string()),
                        });
                    }
                    return Err(e.into());
                }
            }
        }
        valid_len += read as u64;
    }
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog")
            .field("path", &self.path)
            .field("entries", &self.len())
            .field("keep", &self.keep)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeOp;
    use crate::record::Record;

    fn change(seq: u64) -> ChangeSet {
        ChangeSet::new(
            NodeId::CENTRAL,
            SequenceNumber::new(seq),
            TransactionId::new(seq),
            1_000 + seq,
            vec![ChangeOp::Put {
                record: Record::new(format!("tt{seq}"), 1, "T", "US", "en", "movie"),
            }],
        )
    }

    #[test]
    fn in_memory_append_and_tail() {
        let log = CommitLog::in_memory();
        let c = change(1);
        assert_eq!(log.append_change(LogKind::LocalCommit, &c).unwrap(), 1);
        log.append_replication(LogKind::ReplicationPending, &c, NodeId::new(2).unwrap(), None)
            .unwrap();

        assert_eq!(log.len(), 2);
        let tail = log.tail(1).unwrap();
        assert_eq!(tail[0].kind, LogKind::ReplicationPending);
        assert_eq!(tail[0].change_id, c.change_id);
        assert!(tail[0].change.is_none());
        assert_eq!(log.data_entries().unwrap().len(), 1);
    }

    #[test]
    fn local_commits_after_filters_by_sequence() {
        let log = CommitLog::in_memory();
        for seq in 1..=3 {
            log.append_change(LogKind::LocalCommit, &change(seq)).unwrap();
        }
        log.append_change(LogKind::ReplicaApply, &change(9)).unwrap();

        let after: Vec<u64> = log
            .local_commits_after(SequenceNumber::new(1))
            .unwrap()
            .iter()
            .map(|c| c.origin_seq.as_u64())
            .collect();
        assert_eq!(after, vec![2, 3]);
    }

    #[test]
    fn file_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node1.log");

        {
            let log = CommitLog::open(&path).unwrap();
            log.append_change(LogKind::LocalCommit, &change(1)).unwrap();
            log.append_change(LogKind::LocalCommit, &change(2)).unwrap();
        }

        let log = CommitLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.data_entries().unwrap()[1].1.origin_seq,
            SequenceNumber::new(2)
        );
        assert_eq!(log.last_transaction_id(), Some(TransactionId::new(2)));

        log.append_change(LogKind::LocalCommit, &change(3)).unwrap();
        assert_eq!(log.tail(10).unwrap().last().unwrap().log_id, 3);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node2.log");
        {
            let log = CommitLog::open(&path).unwrap();
            log.append_change(LogKind::LocalCommit, &change(1)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"logId\":2,\"transac").unwrap();
        drop(file);

        let log = CommitLog::open(&path).unwrap();
        assert_eq!(log.len(), 1);
        log.append_change(LogKind::LocalCommit, &change(2)).unwrap();
        drop(log);

        let log = CommitLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        let seqs: Vec<u64> = log
            .data_entries()
            .unwrap()
            .iter()
            .map(|(_, c)| c.origin_seq.as_u64())
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn damaged_entry_before_the_tail_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node3.log");
        {
            let log = CommitLog::open(&path).unwrap();
            log.append_change(LogKind::LocalCommit, &change(1)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not json\n").unwrap();
        drop(file);
        {
            let log = CommitLog::open(&path).unwrap();
            assert_eq!(log.len(), 1);
        }

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not json\n{}\n").unwrap();
        drop(file);
        assert!(CommitLog::open(&path).is_err());
    }

    #[test]
    fn file_log_keeps_only_recent_entries_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node1.log");
        let log = CommitLog::open_with_recent(&path, 2).unwrap();
        for seq in 1..=5 {
            log.append_change(LogKind::LocalCommit, &change(seq)).unwrap();
        }

        assert_eq!(log.inner.lock().recent.len(), 2);
        assert_eq!(log.len(), 5);
        assert_eq!(log.last_transaction_id(), Some(TransactionId::new(5)));

        let ids: Vec<u64> = log.tail(4).unwrap().iter().map(|e| e.log_id).collect();
        assert_eq!(ids, vec![2, 3, 4, 5]);
        let ids: Vec<u64> = log.tail(1).unwrap().iter().map(|e| e.log_id).collect();
        assert_eq!(ids, vec![5]);

        assert_eq!(log.data_entries().unwrap().len(), 5);
        let after: Vec<u64> = log
            .local_commits_after(SequenceNumber::new(3))
            .unwrap()
            .iter()
            .map(|c| c.origin_seq.as_u64())
            .collect();
        assert_eq!(after, vec![4, 5]);
        drop(log);

        let log = CommitLog::open_with_recent(&path, 2).unwrap();
        assert_eq!(log.inner.lock().recent.len(), 2);
        assert_eq!(log.append_change(LogKind::LocalCommit, &change(6)).unwrap(), 6);
    }

    #[test]
    fn read_tail_leaves_a_torn_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node1.log");
        {
            let log = CommitLog::open(&path).unwrap();
            log.append_change(LogKind::LocalCommit, &change(1)).unwrap();
            log.append_change(LogKind::LocalCommit, &change(2)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"logId\":3").unwrap();
        drop(file);
        let size = std::fs::metadata(&path).unwrap().len();

        let entries = CommitLog::read_tail(&path, 1).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].log_id, 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
    }
}
