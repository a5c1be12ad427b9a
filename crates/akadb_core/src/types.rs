//! Core type definitions for AkaDB.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for a transaction.
///
/// Transaction IDs are allocated cluster-wide, monotonically increasing and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Sequence number for ordering commits on a single node.
///
/// Higher sequence numbers indicate later commits. Sequence `0` means
/// "nothing committed yet".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Identifier of a node in the cluster.
///
/// Node 1 is the central node; every other node is regional. On the wire a
/// node is written as its number and read from `2`, `"2"` or `"node2"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u8);

impl NodeId {
    /// The central node.
    pub const CENTRAL: NodeId = NodeId(1);

    /// Creates a node ID. Returns `None` for zero.
    #[must_use]
    pub const fn new(id: u8) -> Option<Self> {
        if id == 0 {
            None
        } else {
            Some(Self(id))
        }
    }

    /// Returns the raw node number.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns true for the central node.
    #[must_use]
    pub const fn is_central(self) -> bool {
        self.0 == 1
    }

    /// Returns the node's role label.
    #[must_use]
    pub const fn role(self) -> &'static str {
        if self.is_central() {
            "central"
        } else {
            "regional"
        }
    }

    /// Returns the `nodeN` key used in status maps.
    #[must_use]
    pub fn key(self) -> String {
        format!("node{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("node")
            .or_else(|| trimmed.strip_prefix("Node"))
            .unwrap_or(trimmed);
        digits
            .parse::<u8>()
            .ok()
            .and_then(NodeId::new)
            .ok_or_else(|| format!("invalid node id: {s:?}"))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.0)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => u8::try_from(n)
                .ok()
                .and_then(NodeId::new)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid node id: {n}"))),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Reads may observe other transactions' uncommitted writes.
    ReadUncommitted,
    /// Reads observe data committed as of each read.
    #[default]
    ReadCommitted,
    /// Reads observe a snapshot taken when the transaction opened.
    RepeatableRead,
    /// Snapshot reads plus first-committer-wins validation.
    Serializable,
}

impl IsolationLevel {
    /// All levels, weakest first.
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// Returns the SQL spelling of the level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Whether writers take per-key locks at this level.
    #[must_use]
    pub const fn takes_write_locks(self) -> bool {
        !matches!(self, IsolationLevel::ReadUncommitted)
    }

    /// Whether reads use the snapshot taken at transaction open.
    #[must_use]
    pub const fn uses_snapshot(self) -> bool {
        matches!(
            self,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    /// Accepts `READ COMMITTED`, `read-committed`, `read_committed` and
    /// similar spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '-' | '_' => ' ',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("unknown isolation level: {s:?}")),
        }
    }
}

impl Serialize for IsolationLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for IsolationLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How a transaction is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitMode {
    /// Every operation commits immediately.
    #[default]
    AutoCommit,
    /// The transaction stays pending until explicitly committed or aborted.
    Manual,
}

impl CommitMode {
    /// Maps the `autoCommit` flag onto a mode.
    #[must_use]
    pub const fn from_auto_commit(auto_commit: bool) -> Self {
        if auto_commit {
            CommitMode::AutoCommit
        } else {
            CommitMode::Manual
        }
    }

    /// Returns true for auto-commit.
    #[must_use]
    pub const fn is_auto(self) -> bool {
        matches!(self, CommitMode::AutoCommit)
    }

    /// Human-readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            CommitMode::AutoCommit => "Auto Commit",
            CommitMode::Manual => "Manual 2PC",
        }
    }
}

impl fmt::Display for CommitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
