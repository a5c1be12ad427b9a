//! Where replicated changes are applied.

use crate::error::{ReplicationError, ReplicationResult};
use akadb_core::{ApplyOutcome, ChangeSet, Cluster, CoreError, NodeId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// A replica target applies changes to destination nodes.
///
/// This trait abstracts the delivery path, allowing for different
/// implementations (in-process, remote, fault-injecting for tests).
pub trait ReplicaTarget: Send + Sync {
    /// Applies one change on `dest`.
    fn apply(&self, dest: NodeId, change: &ChangeSet) -> ReplicationResult<ApplyOutcome>;

    /// Checks whether `dest` currently accepts changes.
    fn is_reachable(&self, dest: NodeId) -> bool;
}

/// Applies changes to nodes of an in-process cluster.
///
/// Holds the cluster weakly: the cluster owns the coordinator through its
/// change feed.
#[derive(Debug, Clone)]
pub struct LocalReplica {
    cluster: Weak<Cluster>,
}

impl LocalReplica {
    /// Creates a target for `cluster`.
    pub fn new(cluster: &Arc<Cluster>) -> Self {
        Self {
            cluster: Arc::downgrade(cluster),
        }
    }

    fn cluster(&self) -> ReplicationResult<Arc<Cluster>> {
        self.cluster.upgrade().ok_or(ReplicationError::ClusterClosed)
    }
}

impl ReplicaTarget for LocalReplica {
    fn apply(&self, dest: NodeId, change: &ChangeSet) -> ReplicationResult<ApplyOutcome> {
        self.cluster()?
            .apply_replicated(dest, change)
            .map_err(|source| ReplicationError::apply(dest, source))
    }

    fn is_reachable(&self, dest: NodeId) -> bool {
        self.cluster()
            .ok()
            .and_then(|cluster| cluster.node(dest).ok().map(|node| node.is_online()))
            .unwrap_or(false)
    }
}

/// Wraps a target and fails deliveries on demand.
pub struct FaultInjector<T> {
    inner: T,
    /// Remaining forced failures per destination; `None` fails forever.
    faults: Mutex<HashMap<NodeId, Option<u32>>>,
}

impl<T: ReplicaTarget> FaultInjector<T> {
    /// Wraps `inner` with no faults.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Fails the next `count` deliveries to `dest`.
    pub fn fail_next(&self, dest: NodeId, count: u32) {
        self.faults.lock().insert(dest, Some(count));
    }

    /// Fails every delivery to `dest` until [`heal`](Self::heal).
    pub fn partition(&self, dest: NodeId) {
        self.faults.lock().insert(dest, None);
    }

    /// Removes faults for `dest`.
    pub fn heal(&self, dest: NodeId) {
        self.faults.lock().remove(&dest);
    }

    fn take_fault(&self, dest: NodeId) -> bool {
        let mut faults = self.faults.lock();
        match faults.get_mut(&dest) {
            Some(None) => true,
            Some(Some(0)) => {
                faults.remove(&dest);
                false
            }
            Some(Some(remaining)) => {
                *remaining -= 1;
                true
            }
            None => false,
        }
    }
}

impl<T: ReplicaTarget> ReplicaTarget for FaultInjector<T> {
    fn apply(&self, dest: NodeId, change: &ChangeSet) -> ReplicationResult<ApplyOutcome> {
        if self.take_fault(dest) {
            return Err(ReplicationError::apply(
                dest,
                CoreError::NodeUnavailable { node: dest },
            ));
        }
        self.inner.apply(dest, change)
    }

    fn is_reachable(&self, dest: NodeId) -> bool {
        !matches!(self.faults.lock().get(&dest), Some(None)) && self.inner.is_reachable(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use akadb_core::{ChangeOp, Record, SequenceNumber, TransactionId};

    fn change() -> ChangeSet {
        ChangeSet::new(
            NodeId::CENTRAL,
            SequenceNumber::new(1),
            TransactionId::new(1),
            0,
            vec![ChangeOp::Put {
                record: Record::new("tt1", 1, "A", "US", "en", "movie"),
            }],
        )
    }

    #[test]
    fn local_replica_applies_to_cluster() {
        let cluster = Arc::new(Cluster::in_memory(2).unwrap());
        let target = LocalReplica::new(&cluster);
        let dest = NodeId::new(2).unwrap();

        assert!(target.is_reachable(dest));
        assert!(matches!(
            target.apply(dest, &change()).unwrap(),
            ApplyOutcome::Applied(_)
        ));
        assert_eq!(cluster.node(dest).unwrap().store().row_count(), 1);
    }

    #[test]
    fn local_replica_reports_closed_cluster() {
        let cluster = Arc::new(Cluster::in_memory(2).unwrap());
        let target = LocalReplica::new(&cluster);
        drop(cluster);
        assert!(matches!(
            target.apply(NodeId::new(2).unwrap(), &change()),
            Err(ReplicationError::ClusterClosed)
        ));
    }

    #[test]
    fn fault_injector_counts_down() {
        let cluster = Arc::new(Cluster::in_memory(2).unwrap());
        let target = FaultInjector::new(LocalReplica::new(&cluster));
        let dest = NodeId::new(2).unwrap();

        target.fail_next(dest, 2);
        assert!(target.apply(dest, &change()).unwrap_err().is_retryable());
        assert!(target.apply(dest, &change()).is_err());
        assert!(target.apply(dest, &change()).is_ok());

        target.partition(dest);
        assert!(!target.is_reachable(dest));
        target.heal(dest);
        assert!(target.is_reachable(dest));
    }
}
