use std::collections::HashSet;
use std::sync::Arc;

use murmur_storage::{AuthorId, ContextKey, EntryId, EntryRecord, EntryWithAuthor, NewEntry};
use tracing::debug;

use crate::config::Placement;
use crate::entry::{CurrentUser, Entry, EntryKey, EntryStatus, LocalId, LocalIdSource, Profile};
use crate::error::PushError;
use crate::list::EntryList;
use crate::profiles::ProfileResolver;
use crate::push::PushedEntry;

/// Result of folding one confirmed row into the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Listed now; `needs_profile` is set when the author still has to be fetched.
    Appended { needs_profile: Option<AuthorId> },
    Duplicate,
    /// The id was deleted earlier in this session.
    Tombstoned,
    ForeignContext,
}

/// Persistence request produced by a local submission, keyed by its provisional id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubmission {
    pub local_id: LocalId,
    pub context: ContextKey,
    pub entry: NewEntry,
}

/// Confirmed rows listed when a backfill was requested.
///
/// Only these can be judged deleted by the backfill's reply; rows confirmed or appended while
/// the fetch was in flight are newer than its view of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillScope {
    known: HashSet<EntryId>,
}

impl BackfillScope {
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}

/// Synchronous merge core for one context.
///
/// Each method is one atomic transition of the entry list. Nothing here suspends, so callers
/// that drive it from a single task get sequential consistency for free.
#[derive(Debug)]
pub struct Reconciler {
    context: ContextKey,
    user: CurrentUser,
    list: EntryList,
    local_ids: LocalIdSource,
    profiles: ProfileResolver,
    tombstones: HashSet<EntryId>,
}

impl Reconciler {
    pub fn new(
        context: ContextKey,
        user: CurrentUser,
        placement: Placement,
        profiles: ProfileResolver,
    ) -> Self {
        profiles.seed(user.author_id, user.profile.clone());

        Self {
            context,
            user,
            list: EntryList::new(placement),
            local_ids: LocalIdSource::default(),
            profiles,
            tombstones: HashSet::new(),
        }
    }

    pub fn context(&self) -> ContextKey {
        self.context
    }

    pub fn user(&self) -> &CurrentUser {
        &self.user
    }

    pub fn profiles(&self) -> &ProfileResolver {
        &self.profiles
    }

    pub fn list(&self) -> &EntryList {
        &self.list
    }

    pub fn entries(&self) -> &[Entry] {
        self.list.as_slice()
    }

    pub fn pending_count(&self) -> usize {
        self.list.iter().filter(|entry| entry.is_pending()).count()
    }

    pub fn is_tombstoned(&self, entry_id: EntryId) -> bool {
        self.tombstones.contains(&entry_id)
    }

    /// Loads an initial batch, caching the profiles it was joined with.
    ///
    /// Returns the authors that still have to be resolved.
    pub fn seed(&mut self, batch: Vec<EntryWithAuthor>) -> Vec<AuthorId> {
        let mut unresolved = Vec::new();
        for EntryWithAuthor { entry, author } in batch {
            let outcome = self.append_record(entry, author.map(Profile::from));
            collect_unresolved(&mut unresolved, outcome);
        }

        debug!(
            context = %self.context,
            entries = self.list.len(),
            unresolved = unresolved.len(),
            "seeded entry list"
        );
        unresolved
    }

    /// Appends the optimistic entry for `content`; blank input yields `None` and no change.
    pub fn begin_submission(&mut self, content: &str) -> Option<PendingSubmission> {
        let content = content.trim();
        if content.is_empty() {
            return None;
        }

        let local_id = self.local_ids.next_id();
        let author = self
            .profiles
            .cached(self.user.author_id)
            .unwrap_or_else(|| Arc::new(self.user.profile.clone()));
        self.list.append(Entry::pending(
            local_id,
            self.user.author_id,
            content,
            Some(author),
        ));

        debug!(context = %self.context, %local_id, "appended pending entry");
        Some(PendingSubmission {
            local_id,
            context: self.context,
            entry: NewEntry::new(self.user.author_id, content),
        })
    }

    /// Swaps the pending entry for its persisted row in place.
    ///
    /// Returns `false` when the pending entry is gone or the row was deleted meanwhile.
    pub fn confirm_submission(&mut self, local_id: LocalId, record: EntryRecord) -> bool {
        if self.tombstones.contains(&record.id) {
            self.list.remove(EntryKey::Local(local_id));
            debug!(
                context = %self.context,
                %local_id,
                entry_id = %record.id,
                "confirmed entry was already deleted"
            );
            return false;
        }

        let entry_id = record.id;
        let author = self.profiles.cached(record.author_id);
        let reconciled = self
            .list
            .reconcile(local_id, Entry::confirmed(record, author));
        debug!(context = %self.context, %local_id, %entry_id, reconciled, "confirmed submission");
        reconciled
    }

    pub fn fail_submission(&mut self, local_id: LocalId) -> bool {
        self.list.remove(EntryKey::Local(local_id))
    }

    /// Folds a raw insert notification into the list.
    pub fn apply_inserted(&mut self, record: EntryRecord) -> MergeOutcome {
        self.append_record(record, None)
    }

    /// Folds a pushed entry into the list, seeding its author profile when one is carried.
    pub fn apply_pushed(&mut self, pushed: PushedEntry) -> Result<MergeOutcome, PushError> {
        let (record, author) = pushed.into_parts()?;
        Ok(self.append_record(record, author))
    }

    /// Removes a deleted entry and remembers the id so late inserts cannot bring it back.
    pub fn apply_deleted(&mut self, entry_id: EntryId) -> bool {
        self.tombstones.insert(entry_id);
        self.list.remove(EntryKey::Stored(entry_id))
    }

    pub fn apply_profile(&mut self, author_id: AuthorId, profile: Arc<Profile>) -> usize {
        self.list.patch_author(author_id, &profile)
    }

    /// Captures the confirmed rows a backfill requested now may remove.
    pub fn begin_backfill(&self) -> BackfillScope {
        let known = self
            .list
            .iter()
            .filter(|entry| entry.status == EntryStatus::Confirmed)
            .filter_map(Entry::stored_id)
            .collect();
        BackfillScope { known }
    }

    /// Merges a re-fetched window of the most recent `limit` entries.
    ///
    /// Missing rows are appended. Rows of `scope` strictly inside the window that the store no
    /// longer returns were deleted while the feed was away and get removed. When the batch is
    /// shorter than `limit` it covers the whole history, so the window has no lower bound.
    /// Pending entries, rows newer than the batch and rows outside `scope` are left alone.
    pub fn apply_backfill(
        &mut self,
        scope: BackfillScope,
        batch: Vec<EntryWithAuthor>,
        limit: usize,
    ) -> Vec<AuthorId> {
        let returned: HashSet<EntryId> = batch.iter().map(|item| item.entry.id).collect();
        let lower = if batch.len() < limit {
            None
        } else {
            batch.first().map(|item| item.entry.created_at_unix_ms)
        };
        let upper = batch.last().map(|item| item.entry.created_at_unix_ms);

        let mut removed = Vec::new();
        if let Some(upper) = upper {
            removed = self.list.retain(|entry| {
                let Some(id) = entry.stored_id() else {
                    return true;
                };
                let inside = entry.created_at_unix_ms < upper
                    && lower.is_none_or(|lower| entry.created_at_unix_ms > lower);
                !scope.known.contains(&id) || !inside || returned.contains(&id)
            });
        }
        for entry in &removed {
            if let Some(id) = entry.stored_id() {
                self.tombstones.insert(id);
            }
        }

        let before = self.list.len();
        let mut unresolved = Vec::new();
        for EntryWithAuthor { entry, author } in batch {
            let outcome = self.append_record(entry, author.map(Profile::from));
            collect_unresolved(&mut unresolved, outcome);
        }

        debug!(
            context = %self.context,
            appended = self.list.len() - before,
            removed = removed.len(),
            "merged backfill"
        );
        unresolved
    }

    /// Only confirmed entries of the current user may be deleted locally.
    pub fn can_delete(&self, entry_id: EntryId) -> bool {
        self.list
            .get(EntryKey::Stored(entry_id))
            .is_some_and(|entry| {
                entry.status == EntryStatus::Confirmed && entry.author_id == self.user.author_id
            })
    }

    fn append_record(&mut self, record: EntryRecord, author: Option<Profile>) -> MergeOutcome {
        if record.context != self.context {
            return MergeOutcome::ForeignContext;
        }
        if self.tombstones.contains(&record.id) {
            return MergeOutcome::Tombstoned;
        }
        if self.list.contains(EntryKey::Stored(record.id)) {
            return MergeOutcome::Duplicate;
        }

        let author_id = record.author_id;
        let author = match author {
            Some(profile) => Some(self.profiles.seed(author_id, profile)),
            None => self.profiles.cached(author_id),
        };
        let needs_profile = author.is_none().then_some(author_id);
        self.list.append(Entry::confirmed(record, author));

        MergeOutcome::Appended { needs_profile }
    }
}

fn collect_unresolved(unresolved: &mut Vec<AuthorId>, outcome: MergeOutcome) {
    if let MergeOutcome::Appended {
        needs_profile: Some(author_id),
    } = outcome
        && !unresolved.contains(&author_id)
    {
        unresolved.push(author_id);
    }
}
