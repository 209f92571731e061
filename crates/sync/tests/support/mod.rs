#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use murmur_storage::{
    AuthorId, BoxFuture, ChangeFeed, ContextKey, EntryId, EntryRecord, EntryStore,
    EntryWithAuthor, FeedEvent, FeedHub, FeedSubscription, NewEntry, ProfileRecord, ProfileStore,
    StorageError, StorageResult,
};
use murmur_sync::{Room, RoomSnapshot};
use tokio::sync::{oneshot, watch};

pub const WAIT: Duration = Duration::from_secs(5);

/// In-memory backend whose persistence calls can be held, failed and counted.
pub struct ScriptedBackend {
    hub: FeedHub,
    state: Mutex<ScriptState>,
    create_arrivals: watch::Sender<usize>,
    completed_creates: AtomicUsize,
    profile_gate: watch::Sender<bool>,
    profile_fetches: AtomicUsize,
    listing_gate: watch::Sender<bool>,
    listing_arrivals: watch::Sender<usize>,
}

#[derive(Default)]
struct ScriptState {
    rows: Vec<EntryRecord>,
    profiles: HashMap<AuthorId, ProfileRecord>,
    clock: u64,
    quiet: bool,
    hold_creates: bool,
    create_gates: Vec<Option<oneshot::Sender<()>>>,
    fail_next_create: bool,
    fail_next_delete: bool,
    failing_subscribes: u32,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Self::with_hub(FeedHub::default())
    }

    /// Backend whose feed buffers at most `capacity` changes per subscription.
    pub fn with_feed_capacity(capacity: usize) -> Arc<Self> {
        Self::with_hub(FeedHub::new(capacity))
    }

    fn with_hub(hub: FeedHub) -> Arc<Self> {
        Arc::new(Self {
            hub,
            state: Mutex::new(ScriptState {
                clock: 1_000,
                ..ScriptState::default()
            }),
            create_arrivals: watch::channel(0).0,
            completed_creates: AtomicUsize::new(0),
            profile_gate: watch::channel(false).0,
            profile_fetches: AtomicUsize::new(0),
            listing_gate: watch::channel(false).0,
            listing_arrivals: watch::channel(0).0,
        })
    }

    pub fn hub(&self) -> &FeedHub {
        &self.hub
    }

    pub fn put_profile(&self, author_id: AuthorId, full_name: &str) {
        self.state.lock().unwrap().profiles.insert(
            author_id,
            ProfileRecord {
                author_id,
                full_name: full_name.to_string(),
                username: full_name.to_lowercase(),
                avatar_url: String::new(),
            },
        );
    }

    /// Persists a row written by another participant and notifies the feed.
    pub fn insert_from(&self, context: ContextKey, author_id: AuthorId, content: &str) -> EntryRecord {
        let (record, quiet) = {
            let mut state = self.state.lock().unwrap();
            let record = state.next_row(context, author_id, content);
            (record, state.quiet)
        };
        if !quiet {
            self.hub.emit(FeedEvent::Inserted(record.clone()));
        }
        record
    }

    /// Deletes a row without notifying anyone.
    pub fn remove_silently(&self, entry_id: EntryId) {
        self.state
            .lock()
            .unwrap()
            .rows
            .retain(|row| row.id != entry_id);
    }

    pub fn remove_and_notify(&self, record: &EntryRecord) {
        self.remove_silently(record.id);
        self.emit(FeedEvent::Deleted {
            context: record.context,
            entry_id: record.id,
        });
    }

    pub fn emit(&self, event: FeedEvent) -> usize {
        self.hub.emit(event)
    }

    pub fn rows(&self, context: ContextKey) -> Vec<EntryRecord> {
        self.state
            .lock()
            .unwrap()
            .rows
            .iter()
            .filter(|row| row.context == context)
            .cloned()
            .collect()
    }

    /// Stops emitting insert notifications for persisted rows.
    pub fn set_quiet(&self, quiet: bool) {
        self.state.lock().unwrap().quiet = quiet;
    }

    pub fn hold_creates(&self) {
        self.state.lock().unwrap().hold_creates = true;
    }

    pub fn release_create(&self, arrival: usize) {
        let gate = self.state.lock().unwrap().create_gates[arrival].take();
        if let Some(gate) = gate {
            let _ = gate.send(());
        }
    }

    pub async fn wait_for_create_arrivals(&self, count: usize) {
        let mut arrivals = self.create_arrivals.subscribe();
        tokio::time::timeout(WAIT, arrivals.wait_for(|seen| *seen >= count))
            .await
            .expect("timed out waiting for create calls")
            .expect("arrival counter dropped");
    }

    pub async fn wait_for_completed_creates(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.completed_creates.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for create calls to finish");
    }

    pub fn fail_next_create(&self) {
        self.state.lock().unwrap().fail_next_create = true;
    }

    pub fn fail_next_delete(&self) {
        self.state.lock().unwrap().fail_next_delete = true;
    }

    pub fn fail_next_subscribes(&self, count: u32) {
        self.state.lock().unwrap().failing_subscribes = count;
    }

    pub fn hold_profiles(&self) {
        self.profile_gate.send_replace(true);
    }

    pub fn release_profiles(&self) {
        self.profile_gate.send_replace(false);
    }

    pub fn profile_fetches(&self) -> usize {
        self.profile_fetches.load(Ordering::SeqCst)
    }

    /// Listings still read the rows at call time but return only once released.
    pub fn hold_listings(&self) {
        self.listing_gate.send_replace(true);
    }

    pub fn release_listings(&self) {
        self.listing_gate.send_replace(false);
    }

    pub async fn wait_for_listing_arrivals(&self, count: usize) {
        let mut arrivals = self.listing_arrivals.subscribe();
        tokio::time::timeout(WAIT, arrivals.wait_for(|seen| *seen >= count))
            .await
            .expect("timed out waiting for list calls")
            .expect("arrival counter dropped");
    }

    /// Moves the server clock; the next row is stamped `at + 1`.
    pub fn set_clock(&self, at: u64) {
        self.state.lock().unwrap().clock = at;
    }
}

impl ScriptState {
    fn next_row(&mut self, context: ContextKey, author_id: AuthorId, content: &str) -> EntryRecord {
        self.clock += 1;
        let record = EntryRecord {
            id: EntryId::new_v7(),
            context,
            author_id,
            content: content.to_string(),
            created_at_unix_ms: self.clock,
        };
        self.rows.push(record.clone());
        record
    }
}

impl EntryStore for ScriptedBackend {
    fn create_entry<'a>(
        &'a self,
        context: ContextKey,
        input: NewEntry,
    ) -> BoxFuture<'a, StorageResult<EntryRecord>> {
        Box::pin(async move {
            let (outcome, gate) = {
                let mut state = self.state.lock().unwrap();
                let outcome = if state.fail_next_create {
                    state.fail_next_create = false;
                    Err(StorageError::Unavailable {
                        stage: "scripted-create",
                        details: "create rejected by script".to_string(),
                    })
                } else {
                    Ok(state.next_row(context, input.author_id, &input.content))
                };
                let gate = if state.hold_creates {
                    let (release, gate) = oneshot::channel();
                    state.create_gates.push(Some(release));
                    Some(gate)
                } else {
                    state.create_gates.push(None);
                    None
                };
                if let Ok(record) = &outcome
                    && !state.quiet
                {
                    self.hub.emit(FeedEvent::Inserted(record.clone()));
                }
                (outcome, gate)
            };

            self.create_arrivals.send_modify(|seen| *seen += 1);
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            self.completed_creates.fetch_add(1, Ordering::SeqCst);
            outcome
        })
    }

    fn delete_entry<'a>(
        &'a self,
        context: ContextKey,
        entry_id: EntryId,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            {
                let mut state = self.state.lock().unwrap();
                if state.fail_next_delete {
                    state.fail_next_delete = false;
                    return Err(StorageError::Unavailable {
                        stage: "scripted-delete",
                        details: "delete rejected by script".to_string(),
                    });
                }
                let before = state.rows.len();
                state.rows.retain(|row| row.id != entry_id);
                if state.rows.len() == before {
                    return Err(StorageError::EntryNotFound {
                        stage: "scripted-delete",
                        context,
                        entry_id,
                    });
                }
            }

            self.hub.emit(FeedEvent::Deleted { context, entry_id });
            Ok(())
        })
    }

    fn list_recent_entries<'a>(
        &'a self,
        context: ContextKey,
        limit: usize,
    ) -> BoxFuture<'a, StorageResult<Vec<EntryWithAuthor>>> {
        Box::pin(async move {
            let batch: Vec<EntryWithAuthor> = {
                let state = self.state.lock().unwrap();
                let rows: Vec<&EntryRecord> = state
                    .rows
                    .iter()
                    .filter(|row| row.context == context)
                    .collect();
                let skip = rows.len().saturating_sub(limit);
                rows.into_iter()
                    .skip(skip)
                    .map(|row| EntryWithAuthor {
                        entry: row.clone(),
                        author: state.profiles.get(&row.author_id).cloned(),
                    })
                    .collect()
            };

            self.listing_arrivals.send_modify(|seen| *seen += 1);
            let mut gate = self.listing_gate.subscribe();
            let _ = gate.wait_for(|held| !*held).await;
            Ok(batch)
        })
    }
}

impl ProfileStore for ScriptedBackend {
    fn fetch_profile<'a>(
        &'a self,
        author_id: AuthorId,
    ) -> BoxFuture<'a, StorageResult<Option<ProfileRecord>>> {
        Box::pin(async move {
            self.profile_fetches.fetch_add(1, Ordering::SeqCst);
            let mut gate = self.profile_gate.subscribe();
            let _ = gate.wait_for(|held| !*held).await;
            Ok(self.state.lock().unwrap().profiles.get(&author_id).cloned())
        })
    }

    fn upsert_profile<'a>(
        &'a self,
        profile: ProfileRecord,
    ) -> BoxFuture<'a, StorageResult<ProfileRecord>> {
        Box::pin(async move {
            self.state
                .lock()
                .unwrap()
                .profiles
                .insert(profile.author_id, profile.clone());
            Ok(profile)
        })
    }
}

impl ChangeFeed for ScriptedBackend {
    fn subscribe(&self, context: ContextKey) -> StorageResult<FeedSubscription> {
        let mut state = self.state.lock().unwrap();
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(StorageError::FeedUnavailable {
                stage: "scripted-subscribe",
                context,
            });
        }

        Ok(self.hub.subscribe(context))
    }
}

pub async fn wait_for_snapshot<F>(room: &Room, mut predicate: F) -> RoomSnapshot
where
    F: FnMut(&RoomSnapshot) -> bool,
{
    let mut snapshots = room.watch();
    let snapshot = tokio::time::timeout(WAIT, snapshots.wait_for(|snapshot| predicate(snapshot)))
        .await
        .expect("timed out waiting for room snapshot")
        .expect("room dispatcher stopped");
    RoomSnapshot::clone(&snapshot)
}

pub fn contents(snapshot: &RoomSnapshot) -> Vec<&str> {
    snapshot
        .entries
        .iter()
        .map(|entry| entry.content.as_str())
        .collect()
}
