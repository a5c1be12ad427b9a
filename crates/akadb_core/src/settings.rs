//! Process-wide transaction settings.
//!
//! Every new transaction reads the current settings once, when it opens.
//! Changing the settings never touches transactions that are already open.

use crate::types::{CommitMode, IsolationLevel};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Isolation level and commit mode applied to new transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Isolation level of new transactions.
    pub isolation_level: IsolationLevel,
    /// Whether each statement commits on its own.
    pub auto_commit: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(IsolationLevel::ReadCommitted, true)
    }
}

impl Settings {
    /// Creates settings.
    pub const fn new(isolation_level: IsolationLevel, auto_commit: bool) -> Self {
        Self {
            isolation_level,
            auto_commit,
        }
    }

    /// Commit mode implied by `auto_commit`.
    pub const fn commit_mode(&self) -> CommitMode {
        CommitMode::from_auto_commit(self.auto_commit)
    }
}

/// Shared, mutable settings.
#[derive(Debug, Default)]
pub struct SettingsHandle {
    current: RwLock<Settings>,
}

impl SettingsHandle {
    /// Creates a handle holding `initial`.
    pub fn new(initial: Settings) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Current settings.
    pub fn get(&self) -> Settings {
        *self.current.read()
    }

    /// Replaces the settings and describes what changed.
    pub fn apply(&self, next: Settings) -> Vec<String> {
        let mut current = self.current.write();
        let previous = *current;
        *current = next;
        drop(current);

        let mut logs = Vec::new();
        if previous.isolation_level != next.isolation_level {
            logs.push(format!(
                "Isolation level changed from {} to {}",
                previous.isolation_level, next.isolation_level
            ));
        } else {
            logs.push(format!("Isolation level remains {}", next.isolation_level));
        }
        if previous.auto_commit != next.auto_commit {
            logs.push(format!(
                "Commit mode changed from {} to {}",
                previous.commit_mode().label(),
                next.commit_mode().label()
            ));
        } else {
            logs.push(format!("Commit mode remains {}", next.commit_mode().label()));
        }
        logs.push("Open transactions keep the settings they started with".to_string());

        tracing::info!(
            isolation = %next.isolation_level,
            auto_commit = next.auto_commit,
            "settings updated"
        );
        logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_read_committed_auto() {
        let settings = Settings::default();
        assert_eq!(settings.isolation_level, IsolationLevel::ReadCommitted);
        assert!(settings.auto_commit);
        assert!(settings.commit_mode().is_auto());
    }

    #[test]
    fn apply_reports_changes() {
        let handle = SettingsHandle::new(Settings::new(IsolationLevel::ReadCommitted, true));
        let logs = handle.apply(Settings::new(IsolationLevel::Serializable, false));

        assert!(logs[0].contains("READ COMMITTED to SERIALIZABLE"));
        assert!(logs[1].contains("Auto Commit to Manual 2PC"));
        assert_eq!(handle.get().isolation_level, IsolationLevel::Serializable);
        assert!(!handle.get().auto_commit);

        let logs = handle.apply(Settings::new(IsolationLevel::Serializable, false));
        assert!(logs[0].contains("remains SERIALIZABLE"));
    }
}
