use std::collections::BTreeMap;

use crate::msg::{Command, Index, LogEntry, Snapshot};

/// Deterministic key/value store, mutated only by applying committed log
/// entries in index order.
#[derive(Clone, Debug, Default)]
pub struct KvStateMachine {
    data: BTreeMap<String, String>,
    last_applied: Index,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> Index {
        self.last_applied
    }

    /// Applies `entry`, which must directly follow the last applied entry.
    /// Returns the previous value of the key a write touched.
    pub fn apply(&mut self, entry: &LogEntry) -> Option<String> {
        assert_eq!(
            entry.index,
            self.last_applied + 1,
            "entries must be applied in index order"
        );
        self.last_applied = entry.index;
        match &entry.command {
            Command::Set { key, value } => self.data.insert(key.clone(), value.clone()),
            Command::Delete { key } => self.data.remove(key),
            Command::Noop | Command::JointConfig { .. } | Command::FinalConfig { .. } => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A copy of the applied state.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }

    /// Replaces the whole state with the snapshot's.
    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.data = snapshot.state.clone();
        self.last_applied = snapshot.last_included_index;
    }
}
