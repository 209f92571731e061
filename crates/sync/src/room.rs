use std::sync::Arc;
use std::time::Duration;

use murmur_storage::{
    AuthorId, Backend, ContextKey, EntryId, EntryRecord, EntryWithAuthor, FeedEvent, FeedSignal,
    FeedSubscription, ProfileStore, StorageError, StorageResult,
};
use snafu::{OptionExt, ResultExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::SyncSettings;
use crate::entry::{CurrentUser, Entry, LocalId, Profile};
use crate::error::{ClosedSnafu, InitialLoadSnafu, RoomResult, SubscribeSnafu, WorkerSnafu};
use crate::profiles::ProfileResolver;
use crate::push::PushedEntry;
use crate::reconciler::{BackfillScope, MergeOutcome, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Live,
    /// Waiting to resubscribe; `attempt` starts at 1.
    Reconnecting { attempt: u32 },
    /// Gave up resubscribing; the list keeps its last known state.
    Disconnected,
}

/// What a renderer needs to draw one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub context: ContextKey,
    pub entries: Vec<Entry>,
    pub connection: ConnectionStatus,
    /// Distinct authors present in the context, the current user included; zero while offline.
    pub online: usize,
}

impl RoomSnapshot {
    fn capture(reconciler: &Reconciler, connection: ConnectionStatus, online: usize) -> Self {
        Self {
            context: reconciler.context(),
            entries: reconciler.entries().to_vec(),
            connection,
            online,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_pending()).count()
    }
}

/// Transient user-facing messages raised by failures absorbed into the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomNotice {
    /// The optimistic entry was rolled back; `content` is what the user typed.
    SendFailed {
        local_id: LocalId,
        content: String,
        reason: String,
    },
    DeleteFailed {
        entry_id: EntryId,
        reason: String,
    },
    DeleteRejected {
        entry_id: EntryId,
    },
}

enum RoomCommand {
    Submit {
        content: String,
        reply: oneshot::Sender<Option<LocalId>>,
    },
    Delete {
        entry_id: EntryId,
    },
    Close,
}

enum RoomEvent {
    SubmitSettled {
        local_id: LocalId,
        content: String,
        result: StorageResult<EntryRecord>,
    },
    DeleteSettled {
        entry_id: EntryId,
        result: StorageResult<()>,
    },
    ProfileResolved {
        author_id: AuthorId,
        profile: Arc<Profile>,
    },
    Backfilled {
        scope: BackfillScope,
        result: StorageResult<Vec<EntryWithAuthor>>,
    },
    RetrySubscribe {
        attempt: u32,
    },
}

/// Handle to one open chat room or comment thread.
///
/// All list mutation happens on a dispatcher task; the handle only sends commands and reads
/// snapshots. Dropping the handle closes the room and releases its feed subscription.
pub struct Room {
    context: ContextKey,
    commands: mpsc::UnboundedSender<RoomCommand>,
    snapshots: watch::Receiver<RoomSnapshot>,
    notices: mpsc::UnboundedReceiver<RoomNotice>,
    worker: Option<JoinHandle<()>>,
}

impl Room {
    /// Subscribes to `context`, loads its recent history and starts the dispatcher.
    ///
    /// The subscription is taken before the history load so no insert falls between them.
    pub async fn open<B>(
        backend: Arc<B>,
        context: ContextKey,
        user: CurrentUser,
        settings: SyncSettings,
    ) -> RoomResult<Self>
    where
        B: Backend + 'static,
    {
        let settings = settings.normalized();
        let mut subscription = backend.subscribe(context).context(SubscribeSnafu {
            stage: "open-room-subscribe",
            context,
        })?;
        subscription.track(user.author_id);
        let history = backend
            .list_recent_entries(context, settings.backfill_limit)
            .await
            .context(InitialLoadSnafu {
                stage: "open-room-history",
                context,
            })?;

        let profile_store: Arc<dyn ProfileStore> = backend.clone();
        let profiles = ProfileResolver::new(
            profile_store,
            Profile::new(settings.placeholder_name.clone()),
        );
        let mut reconciler = Reconciler::new(context, user, settings.placement, profiles);
        let unresolved = reconciler.seed(history);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(RoomSnapshot::capture(
            &reconciler,
            ConnectionStatus::Connecting,
            0,
        ));

        let dispatcher = Dispatcher {
            backend,
            settings,
            reconciler,
            subscription: Some(subscription),
            connection: ConnectionStatus::Connecting,
            online: 0,
            commands: commands_rx,
            events_tx,
            events_rx,
            notices: notices_tx,
            snapshots: snapshots_tx,
        };
        for author_id in unresolved {
            dispatcher.resolve_profile(author_id);
        }

        tracing::info!(%context, "room opened");
        let worker = tokio::spawn(dispatcher.run());

        Ok(Self {
            context,
            commands: commands_tx,
            snapshots: snapshots_rx,
            notices: notices_rx,
            worker: Some(worker),
        })
    }

    pub fn context(&self) -> ContextKey {
        self.context
    }

    /// Submits `content` and returns once its pending entry is visible in the snapshot.
    ///
    /// Blank content yields `Ok(None)`. Persistence runs in the background; its failure is
    /// reported through [`Room::next_notice`].
    pub async fn submit(&self, content: impl Into<String>) -> RoomResult<Option<LocalId>> {
        let (reply, accepted) = oneshot::channel();
        self.send(
            RoomCommand::Submit {
                content: content.into(),
                reply,
            },
            "room-submit",
        )?;

        accepted.await.ok().context(ClosedSnafu {
            stage: "room-submit-reply",
            context: self.context,
        })
    }

    /// Requests deletion of an own confirmed entry; the outcome arrives as a snapshot change
    /// or a notice.
    pub fn delete(&self, entry_id: EntryId) -> RoomResult<()> {
        self.send(RoomCommand::Delete { entry_id }, "room-delete")
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RoomSnapshot> {
        self.snapshots.clone()
    }

    pub async fn next_notice(&mut self) -> Option<RoomNotice> {
        self.notices.recv().await
    }

    pub fn try_next_notice(&mut self) -> Option<RoomNotice> {
        self.notices.try_recv().ok()
    }

    /// Stops the dispatcher and waits until the feed subscription is released.
    pub async fn close(mut self) -> RoomResult<()> {
        let _ = self.commands.send(RoomCommand::Close);
        if let Some(worker) = self.worker.take() {
            worker.await.context(WorkerSnafu {
                stage: "room-close",
            })?;
        }

        Ok(())
    }

    fn send(&self, command: RoomCommand, stage: &'static str) -> RoomResult<()> {
        self.commands.send(command).ok().context(ClosedSnafu {
            stage,
            context: self.context,
        })
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.commands.send(RoomCommand::Close);
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Room")
            .field("context", &self.context)
            .field("running", &self.worker.is_some())
            .finish()
    }
}

struct Dispatcher<B> {
    backend: Arc<B>,
    settings: SyncSettings,
    reconciler: Reconciler,
    subscription: Option<FeedSubscription>,
    connection: ConnectionStatus,
    online: usize,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
    events_rx: mpsc::UnboundedReceiver<RoomEvent>,
    notices: mpsc::UnboundedSender<RoomNotice>,
    snapshots: watch::Sender<RoomSnapshot>,
}

impl<B> Dispatcher<B>
where
    B: Backend + 'static,
{
    async fn run(mut self) {
        self.set_connection(ConnectionStatus::Live);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(RoomCommand::Close) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                signal = next_signal(&mut self.subscription) => self.handle_signal(signal),
            }
        }

        self.subscription = None;
        tracing::info!(context = %self.reconciler.context(), "room closed");
    }

    fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Submit { content, reply } => {
                let Some(submission) = self.reconciler.begin_submission(&content) else {
                    let _ = reply.send(None);
                    return;
                };
                self.publish_snapshot();
                let _ = reply.send(Some(submission.local_id));

                let backend = Arc::clone(&self.backend);
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let content = submission.entry.content.clone();
                    let result = backend
                        .create_entry(submission.context, submission.entry)
                        .await;
                    let _ = events.send(RoomEvent::SubmitSettled {
                        local_id: submission.local_id,
                        content,
                        result,
                    });
                });
            }
            RoomCommand::Delete { entry_id } => {
                if !self.reconciler.can_delete(entry_id) {
                    tracing::debug!(
                        context = %self.reconciler.context(),
                        %entry_id,
                        "rejected local delete"
                    );
                    self.notify(RoomNotice::DeleteRejected { entry_id });
                    return;
                }

                let backend = Arc::clone(&self.backend);
                let events = self.events_tx.clone();
                let context = self.reconciler.context();
                tokio::spawn(async move {
                    let result = backend.delete_entry(context, entry_id).await;
                    let _ = events.send(RoomEvent::DeleteSettled { entry_id, result });
                });
            }
            RoomCommand::Close => {}
        }
    }

    fn handle_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::SubmitSettled {
                local_id,
                result: Ok(record),
                ..
            } => {
                let pushed = self.settings.push_confirmed.then(|| {
                    let author = self.reconciler.profiles().cached(record.author_id);
                    PushedEntry::from_entry(&record, author.as_deref())
                });
                let confirmed = self.reconciler.confirm_submission(local_id, record);
                self.publish_snapshot();
                if confirmed && let Some(pushed) = pushed {
                    self.push(&pushed);
                }
            }
            RoomEvent::SubmitSettled {
                local_id,
                content,
                result: Err(error),
            } => {
                tracing::warn!(
                    context = %self.reconciler.context(),
                    %local_id,
                    error = %error,
                    "submission failed, rolling back pending entry"
                );
                if self.reconciler.fail_submission(local_id) {
                    self.publish_snapshot();
                }
                self.notify(RoomNotice::SendFailed {
                    local_id,
                    content,
                    reason: error.to_string(),
                });
            }
            RoomEvent::DeleteSettled {
                entry_id,
                result: Ok(()) | Err(StorageError::EntryNotFound { .. }),
            } => {
                if self.reconciler.apply_deleted(entry_id) {
                    self.publish_snapshot();
                }
            }
            RoomEvent::DeleteSettled {
                entry_id,
                result: Err(error),
            } => {
                tracing::warn!(
                    context = %self.reconciler.context(),
                    %entry_id,
                    error = %error,
                    "delete failed"
                );
                self.notify(RoomNotice::DeleteFailed {
                    entry_id,
                    reason: error.to_string(),
                });
            }
            RoomEvent::ProfileResolved { author_id, profile } => {
                if self.reconciler.apply_profile(author_id, profile) > 0 {
                    self.publish_snapshot();
                }
            }
            RoomEvent::Backfilled {
                scope,
                result: Ok(batch),
            } => {
                let unresolved = self.reconciler.apply_backfill(
                    scope,
                    batch,
                    self.settings.backfill_limit,
                );
                for author_id in unresolved {
                    self.resolve_profile(author_id);
                }
                self.publish_snapshot();
            }
            RoomEvent::Backfilled {
                result: Err(error),
                ..
            } => {
                tracing::warn!(
                    context = %self.reconciler.context(),
                    error = %error,
                    "backfill failed, keeping last known entries"
                );
            }
            RoomEvent::RetrySubscribe { attempt } => self.retry_subscribe(attempt),
        }
    }

    fn handle_signal(&mut self, signal: FeedSignal) {
        match signal {
            FeedSignal::Change(FeedEvent::Inserted(record)) => {
                let outcome = self.reconciler.apply_inserted(record);
                self.settle_merge(outcome, "insert");
            }
            FeedSignal::Change(FeedEvent::Deleted { entry_id, .. }) => {
                if self.reconciler.apply_deleted(entry_id) {
                    self.publish_snapshot();
                }
            }
            FeedSignal::Push(raw) => {
                let merged = PushedEntry::decode(&raw)
                    .and_then(|pushed| self.reconciler.apply_pushed(pushed));
                match merged {
                    Ok(outcome) => self.settle_merge(outcome, "push"),
                    Err(error) => {
                        tracing::warn!(
                            context = %self.reconciler.context(),
                            error = %error,
                            "dropping invalid pushed entry"
                        );
                    }
                }
            }
            FeedSignal::Lagged(skipped) => {
                tracing::warn!(
                    context = %self.reconciler.context(),
                    skipped,
                    "feed lagged, backfilling recent entries"
                );
                self.request_backfill();
            }
            FeedSignal::Presence(online) => {
                self.online = online;
                self.publish_snapshot();
            }
            FeedSignal::Closed => {
                tracing::warn!(context = %self.reconciler.context(), "feed closed");
                self.subscription = None;
                self.online = 0;
                self.schedule_reconnect(1);
            }
        }
    }

    fn settle_merge(&mut self, outcome: MergeOutcome, source: &'static str) {
        tracing::debug!(
            context = %self.reconciler.context(),
            source,
            ?outcome,
            "merged feed entry"
        );
        if let MergeOutcome::Appended { needs_profile } = outcome {
            if let Some(author_id) = needs_profile {
                self.resolve_profile(author_id);
            }
            self.publish_snapshot();
        }
    }

    fn resolve_profile(&self, author_id: AuthorId) {
        let resolver = self.reconciler.profiles().clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let profile = resolver.resolve(author_id).await;
            let _ = events.send(RoomEvent::ProfileResolved { author_id, profile });
        });
    }

    fn request_backfill(&self) {
        let backend = Arc::clone(&self.backend);
        let events = self.events_tx.clone();
        let context = self.reconciler.context();
        let limit = self.settings.backfill_limit;
        let scope = self.reconciler.begin_backfill();
        tracing::debug!(%context, known = scope.len(), limit, "requesting backfill");
        tokio::spawn(async move {
            let result = backend.list_recent_entries(context, limit).await;
            let _ = events.send(RoomEvent::Backfilled { scope, result });
        });
    }

    fn schedule_reconnect(&mut self, attempt: u32) {
        let context = self.reconciler.context();
        if attempt > self.settings.max_reconnect_attempts {
            tracing::warn!(%context, attempts = attempt - 1, "giving up on feed reconnect");
            self.set_connection(ConnectionStatus::Disconnected);
            return;
        }

        self.set_connection(ConnectionStatus::Reconnecting { attempt });
        let delay = Duration::from_millis(self.settings.reconnect_delay_ms);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(RoomEvent::RetrySubscribe { attempt });
        });
    }

    fn retry_subscribe(&mut self, attempt: u32) {
        let context = self.reconciler.context();
        match self.backend.subscribe(context) {
            Ok(mut subscription) => {
                tracing::info!(%context, attempt, "feed resubscribed");
                subscription.track(self.reconciler.user().author_id);
                self.subscription = Some(subscription);
                self.set_connection(ConnectionStatus::Live);
                self.request_backfill();
            }
            Err(error) => {
                tracing::warn!(%context, attempt, error = %error, "feed resubscribe failed");
                self.schedule_reconnect(attempt + 1);
            }
        }
    }

    fn push(&self, pushed: &PushedEntry) {
        let Some(subscription) = self.subscription.as_ref() else {
            return;
        };
        match pushed.encode() {
            Ok(payload) => {
                let receivers = subscription.publish(payload);
                tracing::debug!(entry_id = %pushed.id, receivers, "pushed confirmed entry");
            }
            Err(error) => {
                tracing::warn!(
                    entry_id = %pushed.id,
                    error = %error,
                    "failed to encode pushed entry"
                );
            }
        }
    }

    fn notify(&self, notice: RoomNotice) {
        let _ = self.notices.send(notice);
    }

    fn set_connection(&mut self, connection: ConnectionStatus) {
        self.connection = connection;
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshots
            .send_replace(RoomSnapshot::capture(
                &self.reconciler,
                self.connection,
                self.online,
            ));
    }
}

async fn next_signal(subscription: &mut Option<FeedSubscription>) -> FeedSignal {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}
