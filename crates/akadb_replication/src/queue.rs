//! Per-destination replication queues and link status.

use akadb_core::{ChangeSet, NodeId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ops::Bound;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// The delivery state of one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    /// Nothing queued.
    Synced,
    /// Changes are queued and being delivered.
    Pending,
    /// A delivery failed and is waiting to be retried.
    Retrying,
    /// Retries are exhausted; changes stay queued until the next sweep,
    /// commit, or resume.
    Lagging,
}

impl LinkState {
    /// Returns true if the link is behind its origins.
    pub fn is_behind(&self) -> bool {
        !matches!(self, LinkState::Synced)
    }
}

/// A snapshot of one destination's link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkStatus {
    /// Destination node.
    pub node: NodeId,
    /// Delivery state.
    pub state: LinkState,
    /// Changes waiting for delivery.
    pub queued: usize,
    /// Failed attempts since the last success.
    pub consecutive_failures: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Epoch millis of the most recent successful delivery.
    pub last_success: Option<u64>,
}

/// Changes waiting for one destination, kept FIFO per origin.
///
/// Origins take turns: after a delivery from one origin the next head comes
/// from the following origin. An origin whose head exhausted its retries is
/// parked and skipped until the link is woken again, so one stuck change does
/// not hold back the other origins.
#[derive(Debug)]
pub(crate) struct DestinationQueue {
    dest: NodeId,
    queues: BTreeMap<NodeId, VecDeque<ChangeSet>>,
    last_origin: Option<NodeId>,
    parked: BTreeSet<NodeId>,
    state: LinkState,
    failures: u32,
    last_error: Option<String>,
    last_success: Option<u64>,
    reported: Option<Uuid>,
}

impl DestinationQueue {
    pub(crate) fn new(dest: NodeId) -> Self {
        Self {
            dest,
            queues: BTreeMap::new(),
            last_origin: None,
            parked: BTreeSet::new(),
            state: LinkState::Synced,
            failures: 0,
            last_error: None,
            last_success: None,
            reported: None,
        }
    }

    /// Queues a change in origin sequence order. Returns false if it is
    /// already queued.
    pub(crate) fn push(&mut self, change: ChangeSet) -> bool {
        if self.contains(change.change_id) {
            return false;
        }
        let queue = self.queues.entry(change.origin).or_default();
        let at = queue
            .iter()
            .rposition(|queued| queued.origin_seq < change.origin_seq)
            .map_or(0, |i| i + 1);
        queue.insert(at, change);
        if self.state == LinkState::Synced {
            self.state = LinkState::Pending;
        }
        true
    }

    pub(crate) fn contains(&self, change_id: Uuid) -> bool {
        self.queues
            .values()
            .flatten()
            .any(|queued| queued.change_id == change_id)
    }

    /// The next change to deliver: the head of the first unparked origin
    /// after the one served last.
    pub(crate) fn front(&self) -> Option<ChangeSet> {
        let ready = |(origin, queue): (&NodeId, &VecDeque<ChangeSet>)| {
            if self.parked.contains(origin) {
                None
            } else {
                queue.front().cloned()
            }
        };
        let after = match self.last_origin {
            Some(last) => self
                .queues
                .range((Bound::Excluded(last), Bound::Unbounded))
                .find_map(ready),
            None => None,
        };
        after.or_else(|| self.queues.iter().find_map(ready))
    }

    /// Makes parked origins eligible again.
    pub(crate) fn unpark(&mut self) {
        self.parked.clear();
    }

    /// Removes a delivered change and clears the failure streak.
    pub(crate) fn complete(&mut self, change: &ChangeSet) {
        self.remove(change);
        self.failures = 0;
        self.last_success = Some(epoch_millis());
        self.reported = None;
        self.state = self.settled_state();
    }

    /// Removes a change that can never be delivered.
    pub(crate) fn discard(&mut self, change: &ChangeSet, error: String) {
        self.remove(change);
        self.failures += 1;
        self.last_error = Some(error);
        if self.is_empty() {
            self.state = LinkState::Synced;
        }
    }

    fn settled_state(&self) -> LinkState {
        if self.is_empty() {
            LinkState::Synced
        } else if self.parked.is_empty() {
            LinkState::Pending
        } else {
            LinkState::Lagging
        }
    }

    fn remove(&mut self, change: &ChangeSet) {
        self.last_origin = Some(change.origin);
        if let Some(queue) = self.queues.get_mut(&change.origin) {
            queue.retain(|queued| queued.change_id != change.change_id);
            if queue.is_empty() {
                self.queues.remove(&change.origin);
                self.parked.remove(&change.origin);
            }
        }
    }

    /// Records a failed attempt; returns the failure streak.
    pub(crate) fn fail(&mut self, error: String, state: LinkState) -> u32 {
        self.failures += 1;
        self.last_error = Some(error);
        self.state = state;
        self.failures
    }

    /// Marks the link lagging and parks the change's origin. Returns true
    /// the first time a given change exhausts its retries.
    pub(crate) fn lag(&mut self, change: &ChangeSet) -> bool {
        self.state = LinkState::Lagging;
        self.parked.insert(change.origin);
        self.last_origin = Some(change.origin);
        let first = self.reported != Some(change.change_id);
        self.reported = Some(change.change_id);
        first
    }

    /// Drops everything queued; returns how many changes were discarded.
    pub(crate) fn clear(&mut self) -> usize {
        let discarded = self.len();
        self.queues.clear();
        self.parked.clear();
        self.last_origin = None;
        self.state = LinkState::Synced;
        self.failures = 0;
        self.reported = None;
        discarded
    }

    pub(crate) fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub(crate) fn state(&self) -> LinkState {
        self.state
    }

    pub(crate) fn status(&self) -> LinkStatus {
        LinkStatus {
            node: self.dest,
            state: self.state,
            queued: self.len(),
            consecutive_failures: self.failures,
            last_error: self.last_error.clone(),
            last_success: self.last_success,
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use akadb_core::{SequenceNumber, TransactionId};

    fn node(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn change(origin: u8, seq: u64) -> ChangeSet {
        ChangeSet::new(
            node(origin),
            SequenceNumber::new(seq),
            TransactionId::new(seq),
            0,
            Vec::new(),
        )
    }

    #[test]
    fn fifo_per_origin() {
        let mut queue = DestinationQueue::new(node(2));
        assert_eq!(queue.state(), LinkState::Synced);

        let first = change(1, 1);
        let second = change(1, 2);
        assert!(queue.push(first.clone()));
        assert!(queue.push(second.clone()));
        assert!(!queue.push(first.clone()));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.state(), LinkState::Pending);

        assert_eq!(queue.front().unwrap().change_id, first.change_id);
        queue.complete(&first);
        assert_eq!(queue.front().unwrap().change_id, second.change_id);
        queue.complete(&second);
        assert_eq!(queue.state(), LinkState::Synced);
        assert!(queue.status().last_success.is_some());
    }

    #[test]
    fn late_changes_are_ordered_by_sequence() {
        let mut queue = DestinationQueue::new(node(2));
        queue.push(change(1, 5));
        queue.push(change(1, 3));
        queue.push(change(3, 1));
        queue.push(change(1, 4));

        let mut seen = Vec::new();
        while let Some(next) = queue.front() {
            seen.push((next.origin.as_u8(), next.origin_seq.as_u64()));
            queue.complete(&next);
        }
        assert_eq!(seen, vec![(1, 3), (3, 1), (1, 4), (1, 5)]);
    }

    #[test]
    fn origins_take_turns() {
        let mut queue = DestinationQueue::new(node(1));
        for seq in 1..=3 {
            queue.push(change(2, seq));
            queue.push(change(3, seq));
        }
        queue.push(change(4, 1));

        let mut origins = Vec::new();
        while let Some(next) = queue.front() {
            origins.push(next.origin.as_u8());
            queue.complete(&next);
        }
        assert_eq!(origins, vec![2, 3, 4, 2, 3, 2, 3]);
    }

    #[test]
    fn stuck_origin_does_not_block_others() {
        let mut queue = DestinationQueue::new(node(1));
        let stuck = change(2, 1);
        queue.push(stuck.clone());
        queue.push(change(2, 2));
        queue.push(change(3, 1));

        assert_eq!(queue.front().unwrap().change_id, stuck.change_id);
        queue.fail("locked".into(), LinkState::Lagging);
        assert!(queue.lag(&stuck));

        let next = queue.front().unwrap();
        assert_eq!(next.origin, node(3));
        queue.complete(&next);
        assert_eq!(queue.state(), LinkState::Lagging);
        assert!(queue.front().is_none(), "only the parked origin is left");
        assert_eq!(queue.len(), 2);

        queue.unpark();
        assert_eq!(queue.front().unwrap().change_id, stuck.change_id);
        queue.complete(&stuck);
        assert_eq!(queue.state(), LinkState::Pending);
    }

    #[test]
    fn lag_reports_once_per_change() {
        let mut queue = DestinationQueue::new(node(2));
        let stuck = change(1, 1);
        queue.push(stuck.clone());

        assert_eq!(queue.fail("down".into(), LinkState::Retrying), 1);
        assert!(queue.lag(&stuck));
        assert_eq!(queue.fail("down".into(), LinkState::Retrying), 2);
        assert!(!queue.lag(&stuck));

        let status = queue.status();
        assert_eq!(status.state, LinkState::Lagging);
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.last_error.as_deref(), Some("down"));
        assert_eq!(status.queued, 1);
    }

    #[test]
    fn clear_resets_link() {
        let mut queue = DestinationQueue::new(node(3));
        queue.push(change(1, 1));
        queue.push(change(2, 1));
        queue.fail("x".into(), LinkState::Lagging);

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.state(), LinkState::Synced);
        assert_eq!(queue.status().consecutive_failures, 0);
    }

    #[test]
    fn discard_drops_undeliverable_change() {
        let mut queue = DestinationQueue::new(node(2));
        let bad = change(1, 1);
        queue.push(bad.clone());
        queue.discard(&bad, "invalid".into());
        assert!(queue.is_empty());
        assert_eq!(queue.state(), LinkState::Synced);
    }

    #[test]
    fn status_serializes_camel_case() {
        let queue = DestinationQueue::new(node(2));
        let json = serde_json::to_value(queue.status()).unwrap();
        assert_eq!(json["state"], "SYNCED");
        assert_eq!(json["consecutiveFailures"], 0);
        assert_eq!(json["node"], 2);
    }
}
