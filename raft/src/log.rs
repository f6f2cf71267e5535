use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{RaftError, Result};
use crate::membership::Configuration;
use crate::msg::{Command, Index, LogEntry, Snapshot, Term};

/// In-memory replicated log: a compacted snapshot followed by the entries
/// after it.
///
/// Entries are indexed from 1. `entries[0]` has index
/// `snapshot.last_included_index + 1`.
#[derive(Clone, Debug)]
pub struct RaftLog {
    snapshot: Snapshot,
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            snapshot: Snapshot::initial(configuration),
            entries: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn snapshot_index(&self) -> Index {
        self.snapshot.last_included_index
    }

    /// Number of entries held in memory, i.e. not folded into the snapshot.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last_index(&self) -> Index {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot.last_included_index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot.last_included_term)
    }

    /// Term of the entry at `index`. Known for the snapshot boundary and for
    /// every entry still in memory; `None` for compacted or missing indexes.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index == self.snapshot.last_included_index {
            return Some(self.snapshot.last_included_term);
        }
        self.position(index).map(|pos| self.entries[pos].term)
    }

    /// The entry at `index`, `Ok(None)` past the end of the log.
    pub fn entry(&self, index: Index) -> Result<Option<&LogEntry>> {
        if index <= self.snapshot.last_included_index {
            return Err(RaftError::Compacted {
                index,
                snapshot_index: self.snapshot.last_included_index,
            });
        }
        Ok(self.position(index).map(|pos| &self.entries[pos]))
    }

    /// Entries from `start` (inclusive) to the end of the log.
    pub fn entries_from(&self, start: Index) -> Result<&[LogEntry]> {
        if start <= self.snapshot.last_included_index {
            return Err(RaftError::Compacted {
                index: start,
                snapshot_index: self.snapshot.last_included_index,
            });
        }
        let offset = (start - self.snapshot.last_included_index - 1) as usize;
        Ok(self.entries.get(offset..).unwrap_or(&[]))
    }

    fn position(&self, index: Index) -> Option<usize> {
        if index <= self.snapshot.last_included_index || index > self.last_index() {
            return None;
        }
        Some((index - self.snapshot.last_included_index - 1) as usize)
    }

    /// Appends a new entry at the end of the log and returns its index.
    pub fn append(&mut self, term: Term, command: Command) -> Index {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            command,
            timestamp: unix_millis(),
        });
        index
    }

    /// Merges entries received from a leader. Entries already present with
    /// the same term are kept; the first entry whose term conflicts truncates
    /// the log from its index. Entries covered by the snapshot are skipped,
    /// since they are already committed.
    ///
    /// Returns true if anything was truncated.
    pub fn merge(&mut self, entries: Vec<LogEntry>) -> bool {
        let mut truncated = false;
        for entry in entries {
            if entry.index <= self.snapshot.last_included_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    truncated = true;
                }
                None => {}
            }
            debug_assert_eq!(entry.index, self.last_index() + 1);
            self.entries.push(entry);
        }
        truncated
    }

    fn truncate_from(&mut self, index: Index) {
        if let Some(pos) = self.position(index) {
            self.entries.truncate(pos);
        }
    }

    /// True if a log ending at (`last_index`, `last_term`) is at least as up
    /// to date as this one: compared by last term, then by last index.
    pub fn is_up_to_date(&self, last_index: Index, last_term: Term) -> bool {
        let our_term = self.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_index())
    }

    /// Folds every entry up to and including `upto` into a new snapshot
    /// holding `state`. Does nothing if `upto` is already compacted.
    pub fn compact(&mut self, upto: Index, state: BTreeMap<String, String>) -> Result<&Snapshot> {
        if upto <= self.snapshot.last_included_index {
            return Ok(&self.snapshot);
        }
        let term = self.term_at(upto).ok_or(RaftError::InvalidCommand(format!(
            "cannot compact past the last log index {}",
            self.last_index()
        )))?;
        let configuration = self.configuration_at(upto);
        let keep_from = (upto - self.snapshot.last_included_index) as usize;
        self.entries.drain(..keep_from);
        self.snapshot = Snapshot {
            last_included_index: upto,
            last_included_term: term,
            state,
            created_at: unix_millis(),
            configuration,
        };
        Ok(&self.snapshot)
    }

    /// Adopts `snapshot`. If the log holds the snapshot's last entry with the
    /// same term, the entries after it are kept; otherwise the whole log is
    /// discarded. Returns false if the snapshot is older than the current one.
    pub fn install(&mut self, snapshot: Snapshot) -> bool {
        if snapshot.last_included_index <= self.snapshot.last_included_index {
            return false;
        }
        let index = snapshot.last_included_index;
        if self.term_at(index) == Some(snapshot.last_included_term) {
            let keep_from = (index - self.snapshot.last_included_index) as usize;
            self.entries.drain(..keep_from);
        } else {
            self.entries.clear();
        }
        self.snapshot = snapshot;
        true
    }

    /// The configuration in effect: the latest configuration entry in the
    /// log, or the snapshot's.
    pub fn configuration(&self) -> Configuration {
        self.configuration_at(self.last_index())
    }

    /// Index of the entry that established the current configuration, or the
    /// snapshot index when it comes from the snapshot.
    pub fn configuration_index(&self) -> Index {
        self.entries
            .iter()
            .rev()
            .find(|e| e.command.is_config())
            .map(|e| e.index)
            .unwrap_or(self.snapshot.last_included_index)
    }

    /// The configuration in effect as of `index`.
    pub fn configuration_at(&self, index: Index) -> Configuration {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.index <= index)
            .find_map(|e| match &e.command {
                Command::JointConfig { old, new } => Some(Configuration::Joint {
                    old: old.clone(),
                    new: new.clone(),
                }),
                Command::FinalConfig { voters } => Some(Configuration::Stable(voters.clone())),
                _ => None,
            })
            .unwrap_or_else(|| self.snapshot.configuration.clone())
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
