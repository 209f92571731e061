use super::ids::{AuthorId, ContextKey, EntryId};

/// Persisted message or comment row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub id: EntryId,
    pub context: ContextKey,
    pub author_id: AuthorId,
    pub content: String,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub author_id: AuthorId,
    pub content: String,
}

impl NewEntry {
    pub fn new(author_id: AuthorId, content: impl Into<String>) -> Self {
        Self {
            author_id,
            content: content.into(),
        }
    }
}

/// Display data for one author, keyed by the author id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub author_id: AuthorId,
    pub full_name: String,
    pub username: String,
    pub avatar_url: String,
}

/// Entry row joined with its author's profile, as returned by history loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryWithAuthor {
    pub entry: EntryRecord,
    pub author: Option<ProfileRecord>,
}

/// Row-level change notification fired by the store itself.
///
/// Inserts carry only raw columns; consumers resolve author display data separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Inserted(EntryRecord),
    Deleted { context: ContextKey, entry_id: EntryId },
}

impl FeedEvent {
    pub fn context(&self) -> ContextKey {
        match self {
            Self::Inserted(record) => record.context,
            Self::Deleted { context, .. } => *context,
        }
    }
}
