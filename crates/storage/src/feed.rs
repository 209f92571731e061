use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use super::ids::{AuthorId, ContextKey};
use super::types::FeedEvent;

pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Identity of one live subscription, used to keep pushes from echoing back to their sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SubscriberId(u64);

/// One item observed on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSignal {
    /// Reliable row-level notification.
    Change(FeedEvent),
    /// Best-effort payload published by another subscriber of the same context.
    Push(String),
    /// The subscription fell behind and dropped this many change notifications.
    Lagged(u64),
    /// Number of distinct authors currently present in the context.
    Presence(usize),
    /// The feed for this context was torn down; no further signals will arrive.
    Closed,
}

#[derive(Debug, Clone)]
struct PushEnvelope {
    origin: SubscriberId,
    payload: Arc<str>,
}

#[derive(Debug)]
struct ContextChannel {
    generation: u64,
    subscribers: usize,
    changes: broadcast::Sender<FeedEvent>,
    pushes: broadcast::Sender<PushEnvelope>,
    // Tracked subscriptions per author; one author may hold several.
    present: HashMap<AuthorId, usize>,
    online: watch::Sender<usize>,
}

impl ContextChannel {
    fn publish_online(&self) {
        let count = self.present.len();
        self.online.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
    }
}

#[derive(Debug)]
struct HubInner {
    capacity: usize,
    next_subscriber: AtomicU64,
    next_generation: AtomicU64,
    channels: Mutex<HashMap<ContextKey, ContextChannel>>,
}

/// In-process publish/subscribe hub scoped by context.
///
/// Store implementations call [`FeedHub::emit`] after a row change commits; readers hold a
/// [`FeedSubscription`] per open context. Channels are created lazily on first subscribe and
/// torn down when the last subscription is dropped.
#[derive(Debug, Clone)]
pub struct FeedHub {
    inner: Arc<HubInner>,
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl FeedHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                capacity: capacity.max(1),
                next_subscriber: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self, context: ContextKey) -> FeedSubscription {
        let id = SubscriberId(self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.channels();
        let channel = channels.entry(context).or_insert_with(|| {
            let (changes, _) = broadcast::channel(self.inner.capacity);
            let (pushes, _) = broadcast::channel(self.inner.capacity);
            ContextChannel {
                generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
                subscribers: 0,
                changes,
                pushes,
                present: HashMap::new(),
                online: watch::channel(0).0,
            }
        });
        channel.subscribers += 1;

        tracing::debug!(
            %context,
            subscriber = id.0,
            subscribers = channel.subscribers,
            "feed subscription opened"
        );

        FeedSubscription {
            id,
            context,
            generation: channel.generation,
            changes: channel.changes.subscribe(),
            pushes: channel.pushes.subscribe(),
            online: channel.online.subscribe(),
            tracked: None,
            changes_closed: false,
            pushes_closed: false,
            online_closed: false,
            hub: self.clone(),
        }
    }

    /// Delivers a row change to every subscription of the event's context.
    ///
    /// Returns the number of receivers reached; zero when nobody is subscribed.
    pub fn emit(&self, event: FeedEvent) -> usize {
        let context = event.context();
        let channels = self.channels();
        let Some(channel) = channels.get(&context) else {
            return 0;
        };

        channel.changes.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self, context: ContextKey) -> usize {
        self.channels()
            .get(&context)
            .map_or(0, |channel| channel.subscribers)
    }

    /// Distinct authors tracked by live subscriptions of `context`.
    pub fn online_count(&self, context: ContextKey) -> usize {
        self.channels()
            .get(&context)
            .map_or(0, |channel| channel.present.len())
    }

    /// Drops the channel for `context`; live subscriptions drain and then observe `Closed`.
    pub fn disconnect(&self, context: ContextKey) -> bool {
        let removed = self.channels().remove(&context).is_some();
        if removed {
            tracing::info!(%context, "feed channel disconnected");
        }
        removed
    }

    fn push(&self, context: ContextKey, origin: SubscriberId, payload: Arc<str>) -> usize {
        let channels = self.channels();
        let Some(channel) = channels.get(&context) else {
            return 0;
        };

        channel
            .pushes
            .send(PushEnvelope { origin, payload })
            .unwrap_or(0)
    }

    fn track(&self, context: ContextKey, generation: u64, author_id: AuthorId) -> bool {
        let mut channels = self.channels();
        let Some(channel) = channels
            .get_mut(&context)
            .filter(|channel| channel.generation == generation)
        else {
            return false;
        };

        *channel.present.entry(author_id).or_default() += 1;
        channel.publish_online();
        tracing::debug!(%context, %author_id, online = channel.present.len(), "presence tracked");
        true
    }

    fn release(
        &self,
        context: ContextKey,
        generation: u64,
        id: SubscriberId,
        tracked: Option<AuthorId>,
    ) {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(&context) else {
            return;
        };

        // A disconnect may have replaced the channel; stale handles must not touch the new one.
        if channel.generation != generation {
            return;
        }

        if let Some(author_id) = tracked
            && let Some(held) = channel.present.get_mut(&author_id)
        {
            *held -= 1;
            if *held == 0 {
                channel.present.remove(&author_id);
            }
            channel.publish_online();
        }
        channel.subscribers = channel.subscribers.saturating_sub(1);
        tracing::debug!(
            %context,
            subscriber = id.0,
            subscribers = channel.subscribers,
            "feed subscription released"
        );
        if channel.subscribers == 0 {
            channels.remove(&context);
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ContextKey, ContextChannel>> {
        self.inner
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Live subscription to one context; dropping it releases the subscription.
#[derive(Debug)]
pub struct FeedSubscription {
    id: SubscriberId,
    context: ContextKey,
    generation: u64,
    changes: broadcast::Receiver<FeedEvent>,
    pushes: broadcast::Receiver<PushEnvelope>,
    online: watch::Receiver<usize>,
    tracked: Option<AuthorId>,
    changes_closed: bool,
    pushes_closed: bool,
    online_closed: bool,
    hub: FeedHub,
}

impl FeedSubscription {
    pub fn context(&self) -> ContextKey {
        self.context
    }

    /// Marks `author_id` as present in this context until the subscription is dropped.
    ///
    /// Only the first call per subscription counts. Returns `false` when the channel was
    /// disconnected in the meantime.
    pub fn track(&mut self, author_id: AuthorId) -> bool {
        if self.tracked.is_some() {
            return true;
        }
        let tracked = self.hub.track(self.context, self.generation, author_id);
        if tracked {
            self.tracked = Some(author_id);
        }
        tracked
    }

    /// Waits for the next signal. Own pushes are skipped.
    ///
    /// Cancel safe: dropping the returned future never loses a signal.
    pub async fn recv(&mut self) -> FeedSignal {
        loop {
            if self.changes_closed && self.pushes_closed {
                return FeedSignal::Closed;
            }

            tokio::select! {
                biased;
                result = self.changes.recv(), if !self.changes_closed => match result {
                    Ok(event) => return FeedSignal::Change(event),
                    Err(RecvError::Lagged(skipped)) => return FeedSignal::Lagged(skipped),
                    Err(RecvError::Closed) => self.changes_closed = true,
                },
                result = self.pushes.recv(), if !self.pushes_closed => match result {
                    Ok(envelope) if envelope.origin == self.id => continue,
                    Ok(envelope) => return FeedSignal::Push(envelope.payload.to_string()),
                    // Pushes are best-effort; the change path covers anything dropped here.
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => self.pushes_closed = true,
                },
                result = self.online.changed(), if !self.online_closed => match result {
                    Ok(()) => return FeedSignal::Presence(*self.online.borrow_and_update()),
                    Err(_) => self.online_closed = true,
                },
            }
        }
    }

    /// Publishes a payload to every other subscriber of this context.
    pub fn publish(&self, payload: impl Into<String>) -> usize {
        let payload: String = payload.into();
        self.hub.push(self.context, self.id, Arc::from(payload))
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.hub
            .release(self.context, self.generation, self.id, self.tracked);
    }
}
