use murmur_storage::{AuthorId, ContextId, ContextKey, ContextKind, EntryId, EntryRecord};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::entry::Profile;
use crate::error::{DecodeSnafu, EncodeSnafu, InvalidFieldSnafu, PushError};

/// Fully-formed confirmed entry as published by its sender.
///
/// Ids travel as strings so the payload stays readable by clients without the typed ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedEntry {
    pub id: String,
    pub context_kind: String,
    pub context_id: String,
    pub author_id: String,
    pub content: String,
    pub created_at_unix_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<PushedProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedProfile {
    pub full_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar_url: String,
}

impl PushedEntry {
    pub fn from_entry(record: &EntryRecord, author: Option<&Profile>) -> Self {
        Self {
            id: record.id.to_string(),
            context_kind: record.context.kind.as_str().to_string(),
            context_id: record.context.id.to_string(),
            author_id: record.author_id.to_string(),
            content: record.content.clone(),
            created_at_unix_ms: record.created_at_unix_ms,
            author: author.map(|profile| PushedProfile {
                full_name: profile.full_name.clone(),
                username: profile.username.clone(),
                avatar_url: profile.avatar_url.clone(),
            }),
        }
    }

    pub fn encode(&self) -> Result<String, PushError> {
        serde_json::to_string(self).context(EncodeSnafu {
            stage: "encode-pushed-entry",
        })
    }

    pub fn decode(raw: &str) -> Result<Self, PushError> {
        serde_json::from_str(raw).context(DecodeSnafu {
            stage: "decode-pushed-entry",
        })
    }

    /// Validates the string fields and splits the payload into a record and its author.
    pub fn into_parts(self) -> Result<(EntryRecord, Option<Profile>), PushError> {
        let stage = "pushed-entry-into-parts";
        let id = EntryId::parse(&self.id).context(InvalidFieldSnafu { stage, field: "id" })?;
        let kind = ContextKind::parse(&self.context_kind).context(InvalidFieldSnafu {
            stage,
            field: "context_kind",
        })?;
        let context_id = ContextId::parse(&self.context_id).context(InvalidFieldSnafu {
            stage,
            field: "context_id",
        })?;
        let author_id = AuthorId::parse(&self.author_id).context(InvalidFieldSnafu {
            stage,
            field: "author_id",
        })?;

        let record = EntryRecord {
            id,
            context: ContextKey::new(kind, context_id),
            author_id,
            content: self.content,
            created_at_unix_ms: self.created_at_unix_ms,
        };
        let author = self.author.map(|profile| Profile {
            full_name: profile.full_name,
            username: profile.username,
            avatar_url: profile.avatar_url,
        });

        Ok((record, author))
    }
}
