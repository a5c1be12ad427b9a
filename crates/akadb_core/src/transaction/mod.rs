//! Transactions over a node's record store.
//!
//! Each node runs its own [`TransactionManager`]:
//! - **Isolation**: four levels, from dirty reads to first-committer-wins
//! - **Locking**: no-wait per-key write locks at READ COMMITTED and above
//! - **Durability**: commits are logged before they become visible
//! - **Replication input**: changes from other nodes apply as single commits

mod manager;
mod state;

pub use manager::{ApplyOutcome, CommitOutcome, Operation, TransactionManager};
pub use state::{PendingWrite, Transaction, TransactionInfo, TransactionState};
