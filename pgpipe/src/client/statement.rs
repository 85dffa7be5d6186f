//! Prepared statement names known to one connection.
use std::collections::HashMap;

use crate::error::StatementConflict;

/// Maps a statement name to the sql text it was prepared with.
///
/// A name is reserved when a query using it is submitted, so a conflicting
/// text is rejected before anything is written. Entries are never evicted
/// implicitly, the server keeps the statement until it is closed.
#[derive(Debug, Default)]
pub(crate) struct StatementCache {
    entries: HashMap<String, Entry>,
}

#[derive(Debug)]
struct Entry {
    text: String,
    /// `Parse` was written and not rejected.
    parsed: bool,
    /// Queued queries relying on this entry.
    pending: usize,
}

impl StatementCache {
    /// Reserve `name` for `text` on submission.
    ///
    /// The cache is left untouched on conflict.
    pub(crate) fn reserve(&mut self, name: &str, text: &str) -> Result<(), StatementConflict> {
        match self.entries.get_mut(name) {
            Some(entry) if entry.text != text => Err(StatementConflict { name: name.into() }),
            Some(entry) => {
                entry.pending += 1;
                Ok(())
            },
            None => {
                self.entries.insert(name.into(), Entry { text: text.into(), parsed: false, pending: 1 });
                Ok(())
            },
        }
    }

    /// A reserved query was dropped before being written.
    pub(crate) fn release(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.pending = entry.pending.saturating_sub(1);
            if entry.pending == 0 && !entry.parsed {
                self.entries.remove(name);
            }
        }
    }

    /// A reserved query is being written, returns whether `Parse` must be sent.
    pub(crate) fn prepare(&mut self, name: &str, text: &str) -> bool {
        let entry = self.entries.entry(name.into()).or_insert_with(|| Entry {
            text: text.into(),
            parsed: false,
            pending: 1,
        });
        entry.pending = entry.pending.saturating_sub(1);
        !std::mem::replace(&mut entry.parsed, true)
    }

    /// The server rejected `Parse` for `name`.
    pub(crate) fn parse_failed(&mut self, name: &str) {
        self.forget(name);
    }

    /// The statement was closed on the server.
    pub(crate) fn close(&mut self, name: &str) {
        self.forget(name);
    }

    fn forget(&mut self, name: &str) {
        match self.entries.get_mut(name) {
            Some(entry) if entry.pending > 0 => entry.parsed = false,
            Some(_) => {
                self.entries.remove(name);
            },
            None => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|entry| entry.text.as_str())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conflict_does_not_mutate() {
        let mut cache = StatementCache::default();
        cache.reserve("s1", "SELECT 1").unwrap();
        assert!(cache.prepare("s1", "SELECT 1"));

        let err = cache.reserve("s1", "SELECT 2").unwrap_err();
        assert_eq!(err.name(), "s1");
        assert_eq!(cache.get("s1"), Some("SELECT 1"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn parse_once() {
        let mut cache = StatementCache::default();
        cache.reserve("s1", "SELECT 1").unwrap();
        cache.reserve("s1", "SELECT 1").unwrap();
        assert!(cache.prepare("s1", "SELECT 1"));
        assert!(!cache.prepare("s1", "SELECT 1"));
    }

    #[test]
    fn failed_parse_is_forgotten() {
        let mut cache = StatementCache::default();
        cache.reserve("s1", "SELEC 1").unwrap();
        assert!(cache.prepare("s1", "SELEC 1"));
        cache.parse_failed("s1");
        assert_eq!(cache.get("s1"), None);
        cache.reserve("s1", "SELECT 1").unwrap();
    }

    #[test]
    fn failed_parse_with_queued_user_parses_again() {
        let mut cache = StatementCache::default();
        cache.reserve("s1", "SELECT 1").unwrap();
        cache.reserve("s1", "SELECT 1").unwrap();
        assert!(cache.prepare("s1", "SELECT 1"));
        cache.parse_failed("s1");
        assert!(cache.prepare("s1", "SELECT 1"));
    }

    #[test]
    fn released_reservation() {
        let mut cache = StatementCache::default();
        cache.reserve("s1", "SELECT 1").unwrap();
        cache.release("s1");
        assert_eq!(cache.len(), 0);
    }
}
