use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod feed;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use feed::{DEFAULT_FEED_CAPACITY, FeedHub, FeedSignal, FeedSubscription};
pub use ids::{AuthorId, ContextId, ContextKey, ContextKind, EntryId};
pub use sqlite::SqliteBackend;
pub use types::{EntryRecord, EntryWithAuthor, FeedEvent, NewEntry, ProfileRecord};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EntryStore: Send + Sync {
    /// Persists a new entry and returns the row with its server-assigned id and timestamp.
    fn create_entry<'a>(
        &'a self,
        context: ContextKey,
        input: NewEntry,
    ) -> BoxFuture<'a, StorageResult<EntryRecord>>;
    fn delete_entry<'a>(
        &'a self,
        context: ContextKey,
        entry_id: EntryId,
    ) -> BoxFuture<'a, StorageResult<()>>;
    /// Returns the newest `limit` entries of a context in chronological order.
    fn list_recent_entries<'a>(
        &'a self,
        context: ContextKey,
        limit: usize,
    ) -> BoxFuture<'a, StorageResult<Vec<EntryWithAuthor>>>;
}

pub trait ProfileStore: Send + Sync {
    fn fetch_profile<'a>(
        &'a self,
        author_id: AuthorId,
    ) -> BoxFuture<'a, StorageResult<Option<ProfileRecord>>>;
    fn upsert_profile<'a>(
        &'a self,
        profile: ProfileRecord,
    ) -> BoxFuture<'a, StorageResult<ProfileRecord>>;
}

pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, context: ContextKey) -> StorageResult<FeedSubscription>;
}

pub trait Backend: EntryStore + ProfileStore + ChangeFeed {}

impl<T> Backend for T where T: EntryStore + ProfileStore + ChangeFeed {}
