use std::collections::HashMap;
use std::sync::Arc;

use murmur_storage::AuthorId;

use crate::config::Placement;
use crate::entry::{Entry, EntryKey, LocalId, Profile};

/// Ordered entries of one context with an id → position index.
///
/// Every mutation is a no-op when its precondition does not hold; callers decide what to apply,
/// the list only guarantees that no key appears twice.
#[derive(Debug, Clone, Default)]
pub struct EntryList {
    entries: Vec<Entry>,
    positions: HashMap<EntryKey, usize>,
    placement: Placement,
}

impl EntryList {
    pub fn new(placement: Placement) -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
            placement,
        }
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[Entry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn contains(&self, key: EntryKey) -> bool {
        self.positions.contains_key(&key)
    }

    pub fn position(&self, key: EntryKey) -> Option<usize> {
        self.positions.get(&key).copied()
    }

    pub fn get(&self, key: EntryKey) -> Option<&Entry> {
        self.position(key).and_then(|index| self.entries.get(index))
    }

    /// Inserts at the placement end; returns `false` if the key is already listed.
    pub fn append(&mut self, entry: Entry) -> bool {
        if self.positions.contains_key(&entry.key) {
            return false;
        }

        match self.placement {
            Placement::Tail => {
                self.positions.insert(entry.key, self.entries.len());
                self.entries.push(entry);
            }
            Placement::Head => {
                self.entries.insert(0, entry);
                self.reindex_from(0);
            }
        }

        true
    }

    /// Swaps the pending entry `local_id` for `confirmed`, keeping its position.
    ///
    /// A copy of `confirmed` that arrived earlier through another path is dropped so the key
    /// stays unique.
    pub fn reconcile(&mut self, local_id: LocalId, confirmed: Entry) -> bool {
        let local_key = EntryKey::Local(local_id);
        if !self.positions.contains_key(&local_key) {
            return false;
        }

        if confirmed.key != local_key
            && let Some(duplicate) = self.positions.remove(&confirmed.key)
        {
            self.entries.remove(duplicate);
            self.reindex_from(duplicate);
        }

        let Some(position) = self.positions.remove(&local_key) else {
            return false;
        };
        self.positions.insert(confirmed.key, position);
        self.entries[position] = confirmed;

        true
    }

    pub fn remove(&mut self, key: EntryKey) -> bool {
        let Some(position) = self.positions.remove(&key) else {
            return false;
        };

        self.entries.remove(position);
        self.reindex_from(position);
        true
    }

    /// Points every entry of `author_id` at `profile`; returns how many entries changed.
    pub fn patch_author(&mut self, author_id: AuthorId, profile: &Arc<Profile>) -> usize {
        let mut patched = 0;
        for entry in self
            .entries
            .iter_mut()
            .filter(|entry| entry.author_id == author_id)
        {
            let already_shared = entry
                .author
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, profile));
            if !already_shared {
                entry.author = Some(Arc::clone(profile));
                patched += 1;
            }
        }

        patched
    }

    /// Keeps entries matching `keep`; returns the removed entries in list order.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<Entry>
    where
        F: FnMut(&Entry) -> bool,
    {
        let (kept, removed): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|entry| keep(entry));
        self.entries = kept;
        self.positions.clear();
        self.reindex_from(0);

        removed
    }

    fn reindex_from(&mut self, start: usize) {
        for (index, entry) in self.entries.iter().enumerate().skip(start) {
            self.positions.insert(entry.key, index);
        }
    }
}
