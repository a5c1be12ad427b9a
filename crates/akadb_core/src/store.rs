//! Per-node multi-version record table.
//!
//! Each key keeps a chain of versions stamped with the commit sequence that
//! produced them. A version with no record is a tombstone. Readers pick a
//! [`ReadPoint`]: the latest committed state, or a snapshot sequence.
//!
//! Row order is insertion order. An update keeps the row's position; a
//! delete followed by a re-insert moves the row to the end.

use crate::change::ChangeOp;
use crate::error::{CoreError, CoreResult};
use crate::query::{QueryResult, RecordQuery};
use crate::record::{Record, RecordKey};
use crate::types::SequenceNumber;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Which committed state a read observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPoint {
    /// Everything committed so far.
    Latest,
    /// Only commits with a sequence at or below the snapshot.
    Snapshot(SequenceNumber),
}

/// Uncommitted writes layered over committed state, in application order.
///
/// `None` hides the key.
pub type Overlay = Vec<(RecordKey, Option<Record>)>;

#[derive(Debug, Clone)]
struct Version {
    seq: SequenceNumber,
    order: u64,
    record: Option<Record>,
}

#[derive(Debug, Default)]
struct StoreInner {
    rows: HashMap<RecordKey, Vec<Version>>,
    next_order: u64,
    committed_seq: SequenceNumber,
    last_update: Option<u64>,
    live: usize,
}

impl StoreInner {
    fn visible(&self, key: &RecordKey, point: ReadPoint) -> Option<&Version> {
        let chain = self.rows.get(key)?;
        match point {
            ReadPoint::Latest => chain.last(),
            ReadPoint::Snapshot(seq) => chain.iter().rev().find(|v| v.seq <= seq),
        }
    }

    fn live_version(&self, key: &RecordKey) -> Option<&Version> {
        self.rows
            .get(key)
            .and_then(|chain| chain.last())
            .filter(|v| v.record.is_some())
    }
}

/// Versioned table of records owned by one node.
#[derive(Debug, Default)]
pub struct RecordStore {
    inner: RwLock<StoreInner>,
}

impl RecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads one record.
    pub fn get(&self, key: &RecordKey, point: ReadPoint) -> Option<Record> {
        let inner = self.inner.read();
        inner.visible(key, point).and_then(|v| v.record.clone())
    }

    /// Returns true if the key holds a live record in the latest state.
    pub fn contains(&self, key: &RecordKey) -> bool {
        self.inner.read().live_version(key).is_some()
    }

    /// Sequence of the most recent committed version of a key, tombstones
    /// included.
    pub fn latest_seq(&self, key: &RecordKey) -> Option<SequenceNumber> {
        let inner = self.inner.read();
        inner.rows.get(key).and_then(|c| c.last()).map(|v| v.seq)
    }

    /// Live keys for a title id at a read point.
    pub fn keys_for_title(&self, title_id: &str, point: ReadPoint) -> Vec<RecordKey> {
        let inner = self.inner.read();
        let mut keys: Vec<(u64, RecordKey)> = inner
            .rows
            .keys()
            .filter(|k| k.title_id == title_id)
            .filter_map(|k| {
                inner
                    .visible(k, point)
                    .filter(|v| v.record.is_some())
                    .map(|v| (v.order, k.clone()))
            })
            .collect();
        keys.sort_by_key(|(order, _)| *order);
        keys.into_iter().map(|(_, k)| k).collect()
    }

    /// All visible rows in stable order, with an optional overlay of
    /// uncommitted writes applied on top.
    pub fn rows(&self, point: ReadPoint, overlay: &[(RecordKey, Option<Record>)]) -> Vec<Record> {
        let inner = self.inner.read();
        let mut visible: HashMap<&RecordKey, (u64, Record)> = inner
            .rows
            .keys()
            .filter_map(|k| {
                inner
                    .visible(k, point)
                    .and_then(|v| v.record.clone().map(|r| (k, (v.order, r))))
            })
            .collect();

        let mut next_order = inner.next_order;
        for (key, write) in overlay {
            match write {
                Some(record) => {
                    let order = match visible.get(key) {
                        Some((order, _)) => *order,
                        None => {
                            next_order += 1;
                            next_order
                        }
                    };
                    visible.insert(key, (order, record.clone()));
                }
                None => {
                    visible.remove(key);
                }
            }
        }

        let mut rows: Vec<(u64, Record)> = visible.into_values().collect();
        rows.sort_by_key(|(order, _)| *order);
        rows.into_iter().map(|(_, r)| r).collect()
    }

    /// Filtered, paginated read.
    pub fn select(
        &self,
        point: ReadPoint,
        overlay: &[(RecordKey, Option<Record>)],
        query: &RecordQuery,
    ) -> QueryResult {
        query.run(self.rows(point, overlay))
    }

    /// Installs committed writes under a new sequence number.
    ///
    /// The sequence must be greater than every sequence applied so far.
    pub fn apply(&self, seq: SequenceNumber, ops: &[ChangeOp], committed_at: u64) -> CoreResult<()> {
        let mut inner = self.inner.write();
        if seq <= inner.committed_seq {
            return Err(CoreError::invalid_operation(format!(
                "{seq} is not after committed {}",
                inner.committed_seq
            )));
        }

        for op in ops {
            match op {
                ChangeOp::Put { record } => {
                    let key = record.key();
                    let existing = inner.live_version(&key).map(|v| v.order);
                    let order = match existing {
                        Some(order) => order,
                        None => {
                            inner.live += 1;
                            inner.next_order += 1;
                            inner.next_order
                        }
                    };
                    inner.rows.entry(key).or_default().push(Version {
                        seq,
                        order,
                        record: Some(record.clone()),
                    });
                }
                ChangeOp::Delete { key } => {
                    let Some(order) = inner.live_version(key).map(|v| v.order) else {
                        continue;
                    };
                    inner.live -= 1;
                    inner.rows.entry(key.clone()).or_default().push(Version {
                        seq,
                        order,
                        record: None,
                    });
                }
            }
        }

        inner.committed_seq = seq;
        inner.last_update = Some(inner.last_update.map_or(committed_at, |t| t.max(committed_at)));
        Ok(())
    }

    /// Drops versions no reader at or after `horizon` can see.
    ///
    /// Returns the number of versions removed.
    pub fn vacuum(&self, horizon: SequenceNumber) -> usize {
        let mut inner = self.inner.write();
        let mut removed = 0;
        inner.rows.retain(|_, chain| {
            if let Some(keep_from) = chain.iter().rposition(|v| v.seq <= horizon) {
                removed += keep_from;
                chain.drain(..keep_from);
            }
            let dead = chain.len() == 1 && chain[0].record.is_none() && chain[0].seq <= horizon;
            if dead {
                removed += 1;
            }
            !dead
        });
        removed
    }

    /// Number of live rows.
    pub fn row_count(&self) -> usize {
        self.inner.read().live
    }

    /// Number of stored versions, tombstones included.
    pub fn version_count(&self) -> usize {
        self.inner.read().rows.values().map(Vec::len).sum()
    }

    /// Highest sequence applied.
    pub fn committed_seq(&self) -> SequenceNumber {
        self.inner.read().committed_seq
    }

    /// Commit time of the latest applied write, in epoch milliseconds.
    pub fn last_update(&self) -> Option<u64> {
        self.inner.read().last_update
    }

    /// Returns true if the table can be read within `timeout`.
    pub fn probe(&self, timeout: Duration) -> bool {
        self.inner.try_read_for(timeout).is_some()
    }
}
