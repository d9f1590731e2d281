//! The replicated log: a dense, 1-indexed sequence of `(term, payload)` entries.
//!
//! Index `0` is a sentinel meaning "before the first entry" and is never
//! actually stored; `getItemTerm(0)` always reads as term `0`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry<P> {
    pub term: u64,
    pub payload: P,
}

#[derive(Debug, Clone, Default)]
pub struct Log<P> {
    entries: Vec<LogEntry<P>>,
}

impl<P: Clone> Log<P> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Appends a new entry at `len()+1` and returns its index.
    pub fn append_item(&mut self, term: u64, payload: P) -> u64 {
        self.entries.push(LogEntry { term, payload });
        self.entries.len() as u64
    }

    /// Term stored at `index`, or `0` for the pre-first sentinel `index == 0`.
    pub fn get_item_term(&self, index: u64) -> u64 {
        if index == 0 {
            0
        } else {
            self.entries[(index - 1) as usize].term
        }
    }

    /// Payload at `index`. `None` exactly when `index == len()+1`.
    pub fn get_item(&self, index: u64) -> Option<P> {
        if self.len() + 1 == index {
            None
        } else {
            Some(self.entries[(index - 1) as usize].payload.clone())
        }
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The follower-side log repair primitive driving `AppendEntries`.
    ///
    /// Returns `false` when the follower lacks the entry at `index` and the
    /// leader must back off; truncates on a term conflict and returns `true`
    /// only once the truncation has emptied the log (signalling "try again"
    /// otherwise, per the source's observed behavior).
    pub fn sync_at_item(&mut self, index: u64, term: u64) -> bool {
        if self.len() < index {
            return false;
        }
        if self.get_item_term(index) != term {
            self.entries.truncate((index - 1) as usize);
            return self.len() == 0;
        }
        self.entries.truncate(index as usize);
        true
    }
}
