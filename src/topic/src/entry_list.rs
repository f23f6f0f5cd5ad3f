//! Doubly-linked storage for one named list: entries keyed by stable ids,
//! ordered through prev/next pointers plus a head/tail pair.
//!
//! Moves rewrite at most four pointers, removals two. Traversal always
//! starts from the head so snapshots and subscribe catch-ups see one
//! deterministic order.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub value: Value,
    pub revision: Uuid,
    pub prev: Option<Uuid>,
    pub next: Option<Uuid>,
    pub scope_owner: Option<Uuid>,
}

/// Pointer transition of a completed move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveOutcome {
    pub old_prev: Option<Uuid>,
    pub old_next: Option<Uuid>,
    pub new_prev: Option<Uuid>,
    pub new_next: Option<Uuid>,
}

#[derive(Debug, Default)]
pub struct EntryList {
    entries: HashMap<Uuid, ListEntry>,
    head: Option<Uuid>,
    tail: Option<Uuid>,
}

impl EntryList {
    pub fn new() -> Self {
        EntryList::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: Uuid) -> Option<&ListEntry> {
        self.entries.get(&key)
    }

    pub fn head(&self) -> Option<Uuid> {
        self.head
    }

    pub fn tail(&self) -> Option<Uuid> {
        self.tail
    }

    /// Keys in list order, head to tail.
    pub fn keys(&self) -> Vec<Uuid> {
        let mut keys = Vec::with_capacity(self.entries.len());
        let mut cursor = self.head;
        while let Some(key) = cursor {
            keys.push(key);
            cursor = self.entries.get(&key).and_then(|e| e.next);
        }
        keys
    }

    /// Entries in list order, head to tail.
    pub fn iter(&self) -> impl Iterator<Item = (Uuid, &ListEntry)> {
        self.keys().into_iter().map(move |key| (key, &self.entries[&key]))
    }

    /// Whether `right` is currently the immediate successor of `left`,
    /// with `None` standing for the head/tail boundary.
    pub fn holds_adjacent(&self, left: Option<Uuid>, right: Option<Uuid>) -> bool {
        match (left, right) {
            (None, None) => self.is_empty(),
            (None, Some(right)) => self.head == Some(right),
            (Some(left), None) => self.tail == Some(left),
            (Some(left), Some(right)) => {
                self.entries.get(&left).map(|e| e.next) == Some(Some(right))
            }
        }
    }

    /// Insert a new entry whose id doubles as its revision.
    ///
    /// `reference == None` addresses the list boundary: inserting *before*
    /// the tail boundary appends, inserting *after* the head boundary
    /// prepends. Returns the (prev, next) neighbors of the new entry, or
    /// `None` when the reference is absent or the id already exists.
    pub fn insert(
        &mut self,
        key: Uuid,
        value: Value,
        reference: Option<Uuid>,
        before: bool,
        scope_owner: Option<Uuid>,
    ) -> Option<(Option<Uuid>, Option<Uuid>)> {
        if self.entries.contains_key(&key) {
            return None;
        }
        let (prev, next) = match (reference, before) {
            (None, true) => (self.tail, None),
            (None, false) => (None, self.head),
            (Some(reference), true) => {
                let entry = self.entries.get(&reference)?;
                (entry.prev, Some(reference))
            }
            (Some(reference), false) => {
                let entry = self.entries.get(&reference)?;
                (Some(reference), entry.next)
            }
        };
        self.entries.insert(
            key,
            ListEntry {
                value,
                revision: key,
                prev,
                next,
                scope_owner,
            },
        );
        self.link_neighbors(key, prev, next);
        Some((prev, next))
    }

    /// Rewrite the value (and revision, and scope owner) of an entry.
    pub fn set_value(
        &mut self,
        key: Uuid,
        value: Value,
        revision: Uuid,
        scope_owner: Option<Uuid>,
    ) -> bool {
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.value = value;
                entry.revision = revision;
                entry.scope_owner = scope_owner;
                true
            }
            None => false,
        }
    }

    /// Unlink and return an entry.
    pub fn remove(&mut self, key: Uuid) -> Option<ListEntry> {
        let entry = self.entries.remove(&key)?;
        self.bridge(entry.prev, entry.next);
        Some(entry)
    }

    /// Move an entry immediately before the reference entry.
    pub fn move_before(
        &mut self,
        key_to_move: Uuid,
        reference: Uuid,
        revision: Uuid,
    ) -> Option<MoveOutcome> {
        self.relocate(key_to_move, reference, true, revision)
    }

    /// Move an entry immediately after the reference entry.
    pub fn move_after(
        &mut self,
        key_to_move: Uuid,
        reference: Uuid,
        revision: Uuid,
    ) -> Option<MoveOutcome> {
        self.relocate(key_to_move, reference, false, revision)
    }

    fn relocate(
        &mut self,
        key: Uuid,
        reference: Uuid,
        before: bool,
        revision: Uuid,
    ) -> Option<MoveOutcome> {
        if key == reference || !self.entries.contains_key(&reference) {
            return None;
        }
        let (old_prev, old_next) = {
            let entry = self.entries.get(&key)?;
            (entry.prev, entry.next)
        };

        // Unlink, then splice next to the reference.
        self.bridge(old_prev, old_next);
        let (new_prev, new_next) = {
            let reference_entry = &self.entries[&reference];
            if before {
                (reference_entry.prev, Some(reference))
            } else {
                (Some(reference), reference_entry.next)
            }
        };
        {
            let entry = self.entries.get_mut(&key)?;
            entry.prev = new_prev;
            entry.next = new_next;
            entry.revision = revision;
        }
        self.link_neighbors(key, new_prev, new_next);

        Some(MoveOutcome {
            old_prev,
            old_next,
            new_prev,
            new_next,
        })
    }

    /// Append an already-materialized entry at the tail (snapshot restore).
    pub fn push_back_restored(&mut self, key: Uuid, value: Value, revision: Uuid, scope_owner: Option<Uuid>) {
        let prev = self.tail;
        self.entries.insert(
            key,
            ListEntry {
                value,
                revision,
                prev,
                next: None,
                scope_owner,
            },
        );
        self.link_neighbors(key, prev, None);
    }

    /// Point the neighbors (or head/tail) at a freshly placed entry.
    fn link_neighbors(&mut self, key: Uuid, prev: Option<Uuid>, next: Option<Uuid>) {
        match prev {
            Some(prev) => {
                if let Some(entry) = self.entries.get_mut(&prev) {
                    entry.next = Some(key);
                }
            }
            None => self.head = Some(key),
        }
        match next {
            Some(next) => {
                if let Some(entry) = self.entries.get_mut(&next) {
                    entry.prev = Some(key);
                }
            }
            None => self.tail = Some(key),
        }
    }

    /// Connect two entries (or the head/tail) directly to each other.
    fn bridge(&mut self, prev: Option<Uuid>, next: Option<Uuid>) {
        match prev {
            Some(prev) => {
                if let Some(entry) = self.entries.get_mut(&prev) {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(entry) = self.entries.get_mut(&next) {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    /// Structural integrity check used by tests: head/tail boundaries and a
    /// traversal visiting every entry exactly once.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let keys = self.keys();
        assert_eq!(keys.len(), self.entries.len(), "traversal misses entries");
        if let Some(first) = keys.first() {
            assert_eq!(self.entries[first].prev, None);
            assert_eq!(self.head, Some(*first));
        } else {
            assert_eq!(self.head, None);
            assert_eq!(self.tail, None);
        }
        if let Some(last) = keys.last() {
            assert_eq!(self.entries[last].next, None);
            assert_eq!(self.tail, Some(*last));
        }
        for window in keys.windows(2) {
            assert_eq!(self.entries[&window[0]].next, Some(window[1]));
            assert_eq!(self.entries[&window[1]].prev, Some(window[0]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filled(n: usize) -> (EntryList, Vec<Uuid>) {
        let mut list = EntryList::new();
        let mut keys = Vec::new();
        for i in 0..n {
            let key = Uuid::new_v4();
            list.insert(key, json!(i), None, true, None).unwrap();
            keys.push(key);
        }
        list.assert_consistent();
        (list, keys)
    }

    #[test]
    fn append_and_prepend() {
        let mut list = EntryList::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        // Append into empty, then append, then prepend.
        assert_eq!(list.insert(a, json!("a"), None, true, None), Some((None, None)));
        assert_eq!(list.insert(b, json!("b"), None, true, None), Some((Some(a), None)));
        assert_eq!(list.insert(c, json!("c"), None, false, None), Some((None, Some(a))));

        assert_eq!(list.keys(), vec![c, a, b]);
        list.assert_consistent();
    }

    #[test]
    fn insert_relative_to_reference() {
        let (mut list, keys) = filled(3);
        let x = Uuid::new_v4();
        list.insert(x, json!("x"), Some(keys[1]), true, None).unwrap();
        assert_eq!(list.keys(), vec![keys[0], x, keys[1], keys[2]]);

        let y = Uuid::new_v4();
        list.insert(y, json!("y"), Some(keys[2]), false, None).unwrap();
        assert_eq!(list.keys(), vec![keys[0], x, keys[1], keys[2], y]);
        list.assert_consistent();
    }

    #[test]
    fn insert_with_missing_reference_fails() {
        let (mut list, _) = filled(2);
        assert!(list.insert(Uuid::new_v4(), json!(0), Some(Uuid::new_v4()), true, None).is_none());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_relinks_neighbors() {
        let (mut list, keys) = filled(3);
        let removed = list.remove(keys[1]).unwrap();
        assert_eq!(removed.value, json!(1));
        assert_eq!(list.keys(), vec![keys[0], keys[2]]);
        list.assert_consistent();

        list.remove(keys[0]).unwrap();
        list.remove(keys[2]).unwrap();
        assert!(list.is_empty());
        list.assert_consistent();
    }

    #[test]
    fn move_to_front_and_back() {
        let (mut list, keys) = filled(3);
        let revision = Uuid::new_v4();

        list.move_before(keys[2], keys[0], revision).unwrap();
        assert_eq!(list.keys(), vec![keys[2], keys[0], keys[1]]);
        assert_eq!(list.get(keys[2]).unwrap().revision, revision);
        list.assert_consistent();

        list.move_after(keys[2], keys[1], Uuid::new_v4()).unwrap();
        assert_eq!(list.keys(), vec![keys[0], keys[1], keys[2]]);
        list.assert_consistent();
    }

    #[test]
    fn move_adjacent_is_positionally_noop() {
        let (mut list, keys) = filled(2);
        let outcome = list.move_before(keys[0], keys[1], Uuid::new_v4()).unwrap();
        assert_eq!(list.keys(), vec![keys[0], keys[1]]);
        assert_eq!(outcome.new_next, Some(keys[1]));
        list.assert_consistent();
    }

    #[test]
    fn move_with_missing_key_fails() {
        let (mut list, keys) = filled(2);
        assert!(list.move_before(Uuid::new_v4(), keys[0], Uuid::new_v4()).is_none());
        assert!(list.move_after(keys[0], Uuid::new_v4(), Uuid::new_v4()).is_none());
        assert!(list.move_before(keys[0], keys[0], Uuid::new_v4()).is_none());
    }

    #[test]
    fn adjacency_conditions() {
        let (list, keys) = filled(3);
        assert!(list.holds_adjacent(None, Some(keys[0])));
        assert!(list.holds_adjacent(Some(keys[0]), Some(keys[1])));
        assert!(list.holds_adjacent(Some(keys[2]), None));
        assert!(!list.holds_adjacent(Some(keys[0]), Some(keys[2])));
        assert!(!list.holds_adjacent(None, None));
        assert!(EntryList::new().holds_adjacent(None, None));
    }

    #[test]
    fn set_value_rewrites_revision() {
        let (mut list, keys) = filled(1);
        let revision = Uuid::new_v4();
        let owner = Uuid::new_v4();
        assert!(list.set_value(keys[0], json!("new"), revision, Some(owner)));

        let entry = list.get(keys[0]).unwrap();
        assert_eq!(entry.value, json!("new"));
        assert_eq!(entry.revision, revision);
        assert_eq!(entry.scope_owner, Some(owner));

        assert!(!list.set_value(Uuid::new_v4(), json!(0), revision, None));
    }
}
