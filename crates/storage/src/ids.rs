use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

// One definition for every uuid-backed id.
macro_rules! define_storage_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
                    stage: "parse-storage-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_storage_id!(EntryId, "entry-id");
define_storage_id!(AuthorId, "author-id");
define_storage_id!(ContextId, "context-id");

/// Kind of conversation an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextKind {
    Room,
    Post,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Room => "room",
            Self::Post => "post",
        }
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        match raw.trim() {
            "room" => Ok(Self::Room),
            "post" => Ok(Self::Post),
            other => Err(StorageError::UnknownContextKind {
                stage: "parse-context-kind",
                raw: other.to_string(),
            }),
        }
    }
}

/// Scope of one entry list: a chat room or the comment thread of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey {
    pub kind: ContextKind,
    pub id: ContextId,
}

impl ContextKey {
    pub const fn new(kind: ContextKind, id: ContextId) -> Self {
        Self { kind, id }
    }

    pub const fn room(id: ContextId) -> Self {
        Self::new(ContextKind::Room, id)
    }

    pub const fn post(id: ContextId) -> Self {
        Self::new(ContextKind::Post, id)
    }

    /// Parses the `kind:id` form produced by `Display`.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let raw = raw.trim();
        let (kind, id) = raw.split_once(':').unwrap_or((raw, ""));
        Ok(Self::new(ContextKind::parse(kind)?, ContextId::parse(id.trim())?))
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.kind.as_str(), self.id)
    }
}
