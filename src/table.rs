//! The in-memory entry table: one record per key, kept in access
//! order so the least recently used entry is always at the front.
//! The table only tracks metadata — lengths, publication state, the
//! in-flight editor, the sequence number — while the value bytes live
//! in the clean files this module knows how to name.
use std::path::Path;
use std::path::PathBuf;

use linked_hash_map::LinkedHashMap;

/// What the cache knows about one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    /// Byte lengths of the published clean files; all zero until the
    /// first publish.
    pub lengths: Vec<u64>,

    /// True once an edit has successfully published; only readable
    /// entries serve snapshots and count toward the cache size.
    pub readable: bool,

    /// Id of the at-most-one in-flight editor, if any.  An entry that
    /// is not readable always has one: it only exists because an edit
    /// is underway (or was underway, during journal replay).
    pub editor: Option<u64>,

    /// Stamped from the cache-wide counter on each publish; lets a
    /// snapshot detect that the entry changed behind its back.
    pub sequence: u64,
}

impl Entry {
    pub fn new(value_count: usize) -> Entry {
        Entry {
            lengths: vec![0; value_count],
            readable: false,
            editor: None,
            sequence: 0,
        }
    }

    /// Total published bytes for this entry.
    pub fn total_length(&self) -> u64 {
        self.lengths.iter().sum()
    }
}

/// Path of the authoritative value file for `(key, index)`.
pub(crate) fn clean_path(dir: &Path, key: &str, index: usize) -> PathBuf {
    dir.join(format!("{}.{}", key, index))
}

/// Path of the staging file an in-flight edit writes for `(key, index)`.
pub(crate) fn dirty_path(dir: &Path, key: &str, index: usize) -> PathBuf {
    dir.join(format!("{}.{}.tmp", key, index))
}

/// Access-ordered map of entries: iteration runs from least to most
/// recently used, lookups through [`EntryTable::touch`] move the entry
/// to the back.
#[derive(Debug, Default)]
pub(crate) struct EntryTable {
    entries: LinkedHashMap<String, Entry>,
}

impl EntryTable {
    pub fn new() -> EntryTable {
        EntryTable {
            entries: LinkedHashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Looks up `key` without disturbing the access order.
    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Mutable lookup without disturbing the access order.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    /// Looks up `key` and marks it most recently used.
    pub fn touch(&mut self, key: &str) -> Option<&mut Entry> {
        self.entries.get_refresh(key)
    }

    /// Inserts a fresh entry as most recently used.
    pub fn insert(&mut self, key: String, entry: Entry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        self.entries.remove(key)
    }

    /// Iterates entries from least to most recently used.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    /// The least recently used key without an in-flight editor, i.e.
    /// the next eviction victim.  Entries mid-edit are skipped; their
    /// commit re-triggers eviction.
    pub fn eviction_candidate(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.editor.is_none())
            .map(|(key, _)| key.as_str())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;

    fn keys_in_order(table: &EntryTable) -> Vec<String> {
        table.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Touching an entry moves it to the back; untouched entries keep
    /// their relative order.
    #[test]
    fn test_touch_reorders() {
        let mut table = EntryTable::new();
        for key in ["a", "b", "c"] {
            table.insert(key.to_owned(), Entry::new(1));
        }

        assert!(table.touch("a").is_some());
        assert_eq!(keys_in_order(&table), vec!["b", "c", "a"]);

        // Plain lookups leave the order alone.
        assert!(table.get("b").is_some());
        assert!(table.get_mut("c").is_some());
        assert_eq!(keys_in_order(&table), vec!["b", "c", "a"]);

        assert!(table.touch("missing").is_none());
    }

    /// The eviction candidate is the front of the list, skipping
    /// entries pinned by an in-flight editor.
    #[test]
    fn test_eviction_candidate_skips_editors() {
        let mut table = EntryTable::new();
        for key in ["a", "b", "c"] {
            table.insert(key.to_owned(), Entry::new(1));
        }

        assert_eq!(table.eviction_candidate(), Some("a"));

        table.get_mut("a").expect("a exists").editor = Some(1);
        assert_eq!(table.eviction_candidate(), Some("b"));

        table.get_mut("b").expect("b exists").editor = Some(2);
        table.get_mut("c").expect("c exists").editor = Some(3);
        assert_eq!(table.eviction_candidate(), None);
    }

    #[test]
    fn test_entry_total_length() {
        let mut entry = Entry::new(3);
        assert_eq!(entry.total_length(), 0);

        entry.lengths = vec![3, 0, 7];
        assert_eq!(entry.total_length(), 10);
    }

    #[test]
    fn test_file_names() {
        let dir = Path::new("/cache");

        assert_eq!(clean_path(dir, "k1", 0), Path::new("/cache/k1.0"));
        assert_eq!(dirty_path(dir, "k1", 1), Path::new("/cache/k1.1.tmp"));
    }

    /// One step of the reference model: a plain `Vec` of keys in
    /// access order plus a pinned set.
    #[derive(Arbitrary, Clone, Copy, Debug)]
    enum Op {
        Insert(u8),
        Touch(u8),
        Remove(u8),
        Pin(u8),
        Unpin(u8),
    }

    fn key_name(raw: u8) -> String {
        format!("k{}", raw % 8)
    }

    proptest! {
        /// The table agrees with a Vec oracle on iteration order and
        /// on the eviction candidate, whatever the operation sequence.
        #[test]
        fn compare_order_oracle(ops in vec(any::<Op>(), 0..64usize)) {
            let mut table = EntryTable::new();
            let mut oracle: Vec<String> = Vec::new();
            let mut pinned: std::collections::HashSet<String> =
                std::collections::HashSet::new();

            for op in ops {
                match op {
                    Op::Insert(raw) => {
                        let key = key_name(raw);
                        if table.get(&key).is_none() {
                            table.insert(key.clone(), Entry::new(1));
                            oracle.push(key);
                        }
                    }
                    Op::Touch(raw) => {
                        let key = key_name(raw);
                        if table.touch(&key).is_some() {
                            let at = oracle.iter().position(|k| *k == key).unwrap();
                            let key = oracle.remove(at);
                            oracle.push(key);
                        }
                    }
                    Op::Remove(raw) => {
                        let key = key_name(raw);
                        if table.remove(&key).is_some() {
                            oracle.retain(|k| *k != key);
                            pinned.remove(&key);
                        }
                    }
                    Op::Pin(raw) => {
                        let key = key_name(raw);
                        if let Some(entry) = table.get_mut(&key) {
                            entry.editor = Some(1);
                            pinned.insert(key);
                        }
                    }
                    Op::Unpin(raw) => {
                        let key = key_name(raw);
                        if let Some(entry) = table.get_mut(&key) {
                            entry.editor = None;
                            pinned.remove(&key);
                        }
                    }
                }

                prop_assert_eq!(&keys_in_order(&table), &oracle);
                prop_assert_eq!(
                    table.eviction_candidate(),
                    oracle.iter().find(|k| !pinned.contains(*k)).map(|k| k.as_str())
                );
            }

            prop_assert_eq!(table.len(), oracle.len());
        }
    }
}
