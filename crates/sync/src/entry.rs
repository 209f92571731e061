use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use murmur_storage::{AuthorId, EntryId, EntryRecord, ProfileRecord};

/// Prefix marking provisional ids in rendered output.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Client-side identifier of an entry that has not been persisted yet.
///
/// Unique within one [`LocalIdSource`], which lives as long as the room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{LOCAL_ID_PREFIX}{}", self.0)
    }
}

/// Monotonic generator of [`LocalId`]s.
#[derive(Debug, Default)]
pub struct LocalIdSource {
    last: u64,
}

impl LocalIdSource {
    pub fn next_id(&mut self) -> LocalId {
        self.last += 1;
        LocalId(self.last)
    }
}

/// Identity of a list entry in either id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Local(LocalId),
    Stored(EntryId),
}

impl EntryKey {
    pub fn stored_id(&self) -> Option<EntryId> {
        match self {
            Self::Stored(id) => Some(*id),
            Self::Local(_) => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl From<LocalId> for EntryKey {
    fn from(value: LocalId) -> Self {
        Self::Local(value)
    }
}

impl From<EntryId> for EntryKey {
    fn from(value: EntryId) -> Self {
        Self::Stored(value)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => id.fmt(formatter),
            Self::Stored(id) => id.fmt(formatter),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    /// Optimistically inserted, not yet known to be durable.
    Pending,
    Confirmed,
}

/// Author display data shared by every entry of the same author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub full_name: String,
    pub username: String,
    pub avatar_url: String,
}

impl Profile {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            username: String::new(),
            avatar_url: String::new(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_avatar_url(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = avatar_url.into();
        self
    }

    pub fn to_record(&self, author_id: AuthorId) -> ProfileRecord {
        ProfileRecord {
            author_id,
            full_name: self.full_name.clone(),
            username: self.username.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

impl From<ProfileRecord> for Profile {
    fn from(value: ProfileRecord) -> Self {
        Self {
            full_name: value.full_name,
            username: value.username,
            avatar_url: value.avatar_url,
        }
    }
}

/// The signed-in participant on whose behalf submissions are made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub author_id: AuthorId,
    pub profile: Profile,
}

impl CurrentUser {
    pub fn new(author_id: AuthorId, profile: Profile) -> Self {
        Self { author_id, profile }
    }
}

/// One displayed message or comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: EntryKey,
    pub content: String,
    pub author_id: AuthorId,
    /// Shared with the profile cache; `None` until the author resolves.
    pub author: Option<Arc<Profile>>,
    pub created_at_unix_ms: u64,
    pub status: EntryStatus,
}

impl Entry {
    /// Builds the optimistic entry for a local submission, stamped with client time.
    pub fn pending(
        local_id: LocalId,
        author_id: AuthorId,
        content: impl Into<String>,
        author: Option<Arc<Profile>>,
    ) -> Self {
        Self {
            key: EntryKey::Local(local_id),
            content: content.into(),
            author_id,
            author,
            created_at_unix_ms: unix_timestamp_millis(),
            status: EntryStatus::Pending,
        }
    }

    pub fn confirmed(record: EntryRecord, author: Option<Arc<Profile>>) -> Self {
        Self {
            key: EntryKey::Stored(record.id),
            content: record.content,
            author_id: record.author_id,
            author,
            created_at_unix_ms: record.created_at_unix_ms,
            status: EntryStatus::Confirmed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == EntryStatus::Pending
    }

    pub fn stored_id(&self) -> Option<EntryId> {
        self.key.stored_id()
    }
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_u64, |duration| duration.as_millis() as u64)
}
