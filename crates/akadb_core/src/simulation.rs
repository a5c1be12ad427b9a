//! Two-writer concurrency demonstration.

use crate::cluster::Cluster;
use crate::error::{CoreError, CoreResult};
use crate::query::{RecordFilter, RecordQuery};
use crate::record::{RecordKey, RecordPatch};
use crate::store::ReadPoint;
use crate::transaction::Operation;
use crate::types::{CommitMode, NodeId, TransactionId};
use serde::Serialize;

/// Outcome of [`Cluster::simulate_concurrency`].
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// One-line summary.
    pub message: String,
    /// Step-by-step log.
    pub logs: Vec<String>,
    /// Transactions that committed, in commit order.
    pub committed: Vec<TransactionId>,
}

impl Cluster {
    /// Runs two transactions that update the same record at the current
    /// isolation level and reports which of them committed.
    ///
    /// The record is the first ordering of `title_id`, or the node's first
    /// row when no title is given. A writer blocked by a write lock retries
    /// once after the other commits.
    pub fn simulate_concurrency(
        &self,
        node: NodeId,
        title_id: Option<&str>,
    ) -> CoreResult<SimulationReport> {
        let target = self.node(node)?;
        target.ensure_online()?;

        let key = match title_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => target
                .store()
                .keys_for_title(id, ReadPoint::Latest)
                .into_iter()
                .next()
                .ok_or_else(|| CoreError::not_found(node, format!("titleId {id}")))?,
            None => target
                .store()
                .rows(ReadPoint::Latest, &[])
                .first()
                .map(|record| record.key())
                .ok_or_else(|| CoreError::not_found(node, "any record"))?,
        };

        let isolation = self.settings().isolation_level;
        let t1 = self.begin_with(node, isolation, CommitMode::Manual)?;
        let t2 = match self.begin_with(node, isolation, CommitMode::Manual) {
            Ok(id) => id,
            Err(err) => {
                self.abort(t1)?;
                return Err(err);
            }
        };

        let mut run = Run {
            cluster: self,
            node,
            key,
            logs: vec![format!(
                "Two transactions update the same record on {node} at {isolation}"
            )],
            committed: Vec::new(),
        };
        run.logs.push(format!("T1 = {t1}, T2 = {t2}"));

        let base = run.read("T1", t1);
        run.read("T2", t2);

        run.update("T1", t1, &base);
        let t2_blocked = !run.update("T2", t2, &base);

        run.commit("T1", t1);
        if self.owner(t2).is_ok() {
            if t2_blocked {
                run.logs.push("T2 retries after T1 finished".to_string());
                run.update("T2", t2, &base);
            }
            run.commit("T2", t2);
        }

        for id in [t1, t2] {
            if self.owner(id).is_ok() {
                if let Ok(lines) = self.abort(id) {
                    run.logs.extend(lines);
                }
            }
        }

        let message = match run.committed.as_slice() {
            [_, _] => format!(
                "Both transactions committed at {isolation}; the later commit overwrote the earlier one"
            ),
            [winner] => {
                let label = if *winner == t1 { "T1" } else { "T2" };
                format!("Only {label} committed at {isolation}; the other was rolled back")
            }
            _ => format!("Neither transaction committed at {isolation}"),
        };
        tracing::info!(node = %node, isolation = %isolation, committed = run.committed.len(), "concurrency simulation finished");

        Ok(SimulationReport {
            message,
            logs: run.logs,
            committed: run.committed,
        })
    }
}

struct Run<'a> {
    cluster: &'a Cluster,
    node: NodeId,
    key: RecordKey,
    logs: Vec<String>,
    committed: Vec<TransactionId>,
}

impl Run<'_> {
    fn read(&mut self, label: &str, txn: TransactionId) -> String {
        let query = RecordQuery::filtered(RecordFilter::title_id(self.key.title_id.clone()));
        match self.cluster.query(self.node, Some(txn), &query) {
            Ok(result) => {
                let title = result
                    .data
                    .into_iter()
                    .find(|record| record.key() == self.key)
                    .map(|record| record.title)
                    .unwrap_or_default();
                self.logs.push(format!("{label} read {}: {title:?}", self.key));
                title
            }
            Err(err) => {
                self.logs.push(format!("{label} read failed: {err}"));
                String::new()
            }
        }
    }

    fn update(&mut self, label: &str, txn: TransactionId, base: &str) -> bool {
        let op = Operation::Update {
            key: self.key.clone(),
            patch: RecordPatch::title(format!("{base} [{label}]")),
        };
        match self.cluster.execute(txn, &op) {
            Ok(line) => {
                self.logs.push(format!("{label}: {line}"));
                true
            }
            Err(err) => {
                self.logs.push(format!("{label} update failed ({}): {err}", err.kind()));
                false
            }
        }
    }

    fn commit(&mut self, label: &str, txn: TransactionId) {
        match self.cluster.commit(txn) {
            Ok(outcome) => {
                if let Some(last) = outcome.logs.last() {
                    self.logs.push(format!("{label}: {last}"));
                }
                self.committed.push(txn);
            }
            Err(err) => self
                .logs
                .push(format!("{label} commit failed ({}): {err}", err.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::settings::Settings;
    use crate::types::IsolationLevel;

    fn seeded(isolation: IsolationLevel) -> Cluster {
        let cluster = Cluster::in_memory(1).unwrap();
        cluster
            .submit(
                NodeId::CENTRAL,
                None,
                &Operation::Insert(Record::new("tt1", 1, "Alpha", "US", "en", "movie")),
            )
            .unwrap();
        cluster.apply_settings(Settings::new(isolation, true));
        cluster
    }

    #[test]
    fn serializable_lets_only_one_commit() {
        let cluster = seeded(IsolationLevel::Serializable);
        let report = cluster
            .simulate_concurrency(NodeId::CENTRAL, Some("tt1"))
            .unwrap();
        assert_eq!(report.committed.len(), 1);
        assert!(report.message.starts_with("Only T1"));
        assert_eq!(cluster.pending_count(), 0);
    }

    #[test]
    fn weaker_levels_commit_both() {
        for isolation in [
            IsolationLevel::ReadUncommitted,
            IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead,
        ] {
            let cluster = seeded(isolation);
            let report = cluster.simulate_concurrency(NodeId::CENTRAL, None).unwrap();
            assert_eq!(report.committed.len(), 2, "{isolation}: {:?}", report.logs);
            assert_eq!(cluster.pending_count(), 0);
        }
    }

    #[test]
    fn missing_record_is_not_found() {
        let cluster = Cluster::in_memory(1).unwrap();
        assert!(matches!(
            cluster.simulate_concurrency(NodeId::CENTRAL, None),
            Err(CoreError::NotFound { .. })
        ));
    }
}
