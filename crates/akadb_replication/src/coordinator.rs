//! Asynchronous fan-out of committed changes to peer nodes.
//!
//! The coordinator subscribes to the cluster's change feed. Each commit is
//! queued once per destination and delivered by that destination's worker
//! task, which retries transient failures with backoff and parks the origin
//! once retries are exhausted, marking the link `LAGGING`. Changes from other
//! origins keep flowing. Parked origins are retried when the link is woken by
//! the next change, by [`ReplicationCoordinator::resume`], or by the periodic
//! sweep.

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::queue::{DestinationQueue, LinkState, LinkStatus};
use crate::schedule::{ScheduledTask, TaskHandle};
use crate::target::{LocalReplica, ReplicaTarget};
use akadb_core::{ApplyOutcome, ChangeSet, Cluster, CommitListener, LogKind, NodeId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Link {
    queue: Mutex<DestinationQueue>,
    wake: Notify,
}

struct Shared {
    cluster: Weak<Cluster>,
    target: Arc<dyn ReplicaTarget>,
    config: ReplicationConfig,
    links: BTreeMap<NodeId, Arc<Link>>,
    shutdown: watch::Sender<bool>,
}

/// Propagates committed changes between the nodes of a cluster.
pub struct ReplicationCoordinator {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sweep: Mutex<Option<TaskHandle>>,
}

impl ReplicationCoordinator {
    /// Starts replication between the nodes of `cluster`.
    pub fn start(
        cluster: &Arc<Cluster>,
        config: ReplicationConfig,
    ) -> ReplicationResult<Arc<Self>> {
        let target = Arc::new(LocalReplica::new(cluster));
        Self::start_with_target(cluster, config, target)
    }

    /// Starts replication delivering through `target`.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start_with_target(
        cluster: &Arc<Cluster>,
        config: ReplicationConfig,
        target: Arc<dyn ReplicaTarget>,
    ) -> ReplicationResult<Arc<Self>> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ReplicationError::NoRuntime)?;

        let links = cluster
            .node_ids()
            .into_iter()
            .map(|id| {
                let link = Link {
                    queue: Mutex::new(DestinationQueue::new(id)),
                    wake: Notify::new(),
                };
                (id, Arc::new(link))
            })
            .collect();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            cluster: Arc::downgrade(cluster),
            target,
            config,
            links,
            shutdown,
        });

        let workers = shared
            .links
            .keys()
            .map(|&dest| {
                let shared = Arc::clone(&shared);
                let shutdown = shared.shutdown.subscribe();
                runtime.spawn(async move { shared.run_link(dest, shutdown).await })
            })
            .collect();

        let sweep = shared.config.sweep_interval.map(|period| {
            let shared = Arc::clone(&shared);
            ScheduledTask::every("replication-sweep", period, move || shared.sweep())
        });

        let coordinator = Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
            sweep: Mutex::new(sweep),
        });
        cluster.subscribe(Arc::clone(&coordinator) as Arc<dyn CommitListener>);
        info!(
            links = coordinator.shared.links.len(),
            max_attempts = coordinator.shared.config.retry.max_attempts,
            "replication started"
        );
        Ok(coordinator)
    }

    /// Queues `change` for every node other than its origin.
    ///
    /// The origin's own link is woken too: the commit released its locks,
    /// which may unblock changes parked there.
    pub fn propagate(&self, change: &ChangeSet) {
        for (&dest, link) in &self.shared.links {
            if dest != change.origin {
                let queued = link.queue.lock().push(change.clone());
                if queued {
                    self.shared
                        .journal(LogKind::ReplicationPending, change, dest, None);
                }
            }
            link.wake.notify_one();
        }
    }

    /// Status of every link, by destination.
    pub fn status(&self) -> Vec<LinkStatus> {
        self.shared
            .links
            .values()
            .map(|link| link.queue.lock().status())
            .collect()
    }

    /// Status of the link to `node`.
    pub fn link_status(&self, node: NodeId) -> ReplicationResult<LinkStatus> {
        Ok(self.shared.link(node)?.queue.lock().status())
    }

    /// Wakes the link to `node` so queued changes are retried now.
    pub fn resume(&self, node: NodeId) -> ReplicationResult<Vec<String>> {
        let link = self.shared.link(node)?;
        let queued = link.queue.lock().len();
        link.wake.notify_one();
        Ok(vec![format!(
            "Resumed replication to {node} ({queued} change(s) queued)"
        )])
    }

    /// Discards everything queued for `node`.
    pub fn reset(&self, node: NodeId) -> ReplicationResult<Vec<String>> {
        let discarded = self.shared.link(node)?.queue.lock().clear();
        warn!(node = %node, discarded, "replication queue discarded");
        Ok(vec![format!(
            "Discarded {discarded} queued change(s) for {node}"
        )])
    }

    /// Queues every peer commit that `node` has not applied yet.
    pub fn recover(&self, node: NodeId) -> ReplicationResult<Vec<String>> {
        let cluster = self.shared.cluster()?;
        let link = self.shared.link(node)?;
        let dest = cluster.node(node)?;

        let mut logs = Vec::new();
        for origin in cluster.nodes().filter(|n| n.id() != node) {
            let watermark = dest.manager().watermark(origin.id());
            let missing = origin.log().local_commits_after(watermark)?;
            let mut queued = 0;
            for change in missing {
                if link.queue.lock().push(change.clone()) {
                    self.shared
                        .journal(LogKind::ReplicationPending, &change, node, None);
                    queued += 1;
                }
            }
            logs.push(format!(
                "Queued {queued} change(s) from {} for {node} (applied through {watermark})",
                origin.id()
            ));
        }
        link.wake.notify_one();
        info!(node = %node, "replication recovery queued");
        Ok(logs)
    }

    /// Waits until every queue is empty. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = async {
            loop {
                if self.is_idle() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }

    /// Returns true if nothing is queued on any link.
    pub fn is_idle(&self) -> bool {
        self.shared
            .links
            .values()
            .all(|link| link.queue.lock().is_empty())
    }

    /// Stops the sweep and every worker.
    pub async fn shutdown(&self) {
        if let Some(mut sweep) = self.sweep.lock().take() {
            sweep.cancel();
        }
        self.shared.shutdown.send_replace(true);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "replication worker ended abnormally");
            }
        }
        info!("replication stopped");
    }
}

impl CommitListener for ReplicationCoordinator {
    fn on_commit(&self, change: &ChangeSet) {
        if *self.shared.shutdown.borrow() {
            warn!(change = %change.change_id, "commit after replication shutdown not propagated");
            return;
        }
        self.propagate(change);
    }
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("links", &self.status())
            .finish()
    }
}

impl Shared {
    fn cluster(&self) -> ReplicationResult<Arc<Cluster>> {
        self.cluster.upgrade().ok_or(ReplicationError::ClusterClosed)
    }

    fn link(&self, node: NodeId) -> ReplicationResult<&Arc<Link>> {
        self.links
            .get(&node)
            .ok_or(ReplicationError::UnknownLink { node })
    }

    /// Writes a replication entry to the origin's commit log.
    fn journal(&self, kind: LogKind, change: &ChangeSet, dest: NodeId, error: Option<String>) {
        let result = self.cluster().and_then(|cluster| {
            cluster
                .node(change.origin)?
                .log()
                .append_replication(kind, change, dest, error)
                .map_err(ReplicationError::from)
        });
        if let Err(e) = result {
            warn!(target_node = %dest, change = %change.change_id, error = %e, "replication journal write failed");
        }
    }

    /// Wakes lagging links whose destination is reachable.
    fn sweep(&self) {
        for (&dest, link) in &self.links {
            let lagging = link.queue.lock().state() == LinkState::Lagging;
            if lagging && self.target.is_reachable(dest) {
                debug!(target_node = %dest, "sweep retrying lagging link");
                link.wake.notify_one();
            }
        }
    }

    async fn run_link(&self, dest: NodeId, mut shutdown: watch::Receiver<bool>) {
        let Ok(link) = self.link(dest).cloned() else {
            return;
        };
        debug!(target_node = %dest, "replication worker started");
        loop {
            if !self.drain(dest, &link, &mut shutdown).await {
                break;
            }
            tokio::select! {
                _ = link.wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(target_node = %dest, "replication worker stopped");
    }

    /// Delivers queued changes until the queue is empty or every origin
    /// left in it is parked. Returns false when shutting down.
    async fn drain(&self, dest: NodeId, link: &Link, shutdown: &mut watch::Receiver<bool>) -> bool {
        let max_attempts = self.config.retry.max_attempts;
        link.queue.lock().unpark();
        'changes: loop {
            if *shutdown.borrow() {
                return false;
            }
            let next = link.queue.lock().front();
            let Some(change) = next else {
                return true;
            };

            let mut attempt = 0;
            loop {
                match self.target.apply(dest, &change) {
                    Ok(outcome) => {
                        link.queue.lock().complete(&change);
                        self.journal(LogKind::ReplicationSuccess, &change, dest, None);
                        match outcome {
                            ApplyOutcome::Applied(seq) => debug!(
                                target_node = %dest,
                                origin = %change.origin,
                                origin_seq = %change.origin_seq,
                                seq = %seq,
                                "change replicated"
                            ),
                            ApplyOutcome::Skipped => debug!(
                                target_node = %dest,
                                origin = %change.origin,
                                origin_seq = %change.origin_seq,
                                "change already present"
                            ),
                        }
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        attempt += 1;
                        let message = e.to_string();
                        if attempt >= max_attempts {
                            let first = {
                                let mut queue = link.queue.lock();
                                queue.fail(message.clone(), LinkState::Lagging);
                                queue.lag(&change)
                            };
                            if first {
                                warn!(target_node = %dest, origin = %change.origin, attempts = attempt, error = %message, "replication link lagging");
                                self.journal(LogKind::ReplicationFailed, &change, dest, Some(message));
                            }
                            continue 'changes;
                        }

                        let failures = link.queue.lock().fail(message.clone(), LinkState::Retrying);
                        let delay = self.config.retry.delay_for_attempt(attempt);
                        debug!(
                            target_node = %dest,
                            attempt,
                            failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "replication retry scheduled"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return false;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        warn!(target_node = %dest, change = %change.change_id, error = %message, "change dropped");
                        link.queue.lock().discard(&change, message.clone());
                        self.journal(LogKind::ReplicationFailed, &change, dest, Some(message));
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use akadb_core::{Operation, Record};

    fn node(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn fast_config() -> ReplicationConfig {
        ReplicationConfig::new()
            .with_retry(
                RetryConfig::new(2)
                    .with_initial_delay(Duration::from_millis(5))
                    .with_jitter(false),
            )
            .without_sweep()
    }

    #[tokio::test]
    async fn commit_reaches_every_peer() {
        let cluster = Arc::new(Cluster::in_memory(3).unwrap());
        let coordinator = ReplicationCoordinator::start(&cluster, fast_config()).unwrap();

        cluster
            .submit(
                node(1),
                None,
                &Operation::Insert(Record::new("tt1", 1, "Alpha", "US", "en", "movie")),
            )
            .unwrap();
        assert!(coordinator.wait_idle(Duration::from_secs(5)).await);

        for id in cluster.node_ids() {
            assert_eq!(cluster.node(id).unwrap().store().row_count(), 1, "{id}");
        }
        assert!(coordinator
            .status()
            .iter()
            .all(|s| s.state == LinkState::Synced));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_link_is_rejected() {
        let cluster = Arc::new(Cluster::in_memory(2).unwrap());
        let coordinator = ReplicationCoordinator::start(&cluster, fast_config()).unwrap();
        assert!(matches!(
            coordinator.link_status(node(9)),
            Err(ReplicationError::UnknownLink { .. })
        ));
        assert!(coordinator.reset(node(9)).is_err());
        coordinator.shutdown().await;
    }

    #[test]
    fn start_requires_runtime() {
        let cluster = Arc::new(Cluster::in_memory(2).unwrap());
        assert!(matches!(
            ReplicationCoordinator::start(&cluster, fast_config()),
            Err(ReplicationError::NoRuntime)
        ));
    }
}
