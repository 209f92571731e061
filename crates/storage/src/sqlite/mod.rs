use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, EntryNotFoundSnafu, RejectedSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageError,
    StorageResult,
};
use super::feed::{FeedHub, FeedSubscription};
use super::ids::{AuthorId, ContextId, ContextKey, ContextKind, EntryId};
use super::types::{EntryRecord, EntryWithAuthor, FeedEvent, NewEntry, ProfileRecord};
use super::{BoxFuture, ChangeFeed, EntryStore, ProfileStore};

/// SQLite-backed store that announces committed row changes on an in-process [`FeedHub`].
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    feed: FeedHub,
}

impl SqliteBackend {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        Self::open_with_feed(database_location, FeedHub::default()).await
    }

    pub async fn open_with_feed(database_location: &str, feed: FeedHub) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single pinned connection keeps in-memory databases alive for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(%database_url, "sqlite backend opened");

        Ok(Self { pool, feed })
    }

    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    async fn insert_entry(&self, context: ContextKey, input: NewEntry) -> StorageResult<EntryRecord> {
        ensure!(
            !input.content.trim().is_empty(),
            RejectedSnafu {
                stage: "entry-create-validate",
                entity: "entry",
                details: "entry content must not be empty".to_string(),
            }
        );

        let record = EntryRecord {
            id: EntryId::new_v7(),
            context,
            author_id: input.author_id,
            content: input.content,
            created_at_unix_ms: unix_timestamp_millis(),
        };

        sqlx::query(
            "INSERT INTO entries (id, context_kind, context_id, author_id, content, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(context.kind.as_str())
        .bind(context.id.to_string())
        .bind(record.author_id.to_string())
        .bind(record.content.clone())
        .bind(u64_to_i64(record.created_at_unix_ms, "entry-create-created-at")?)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "entry-create-insert",
        })?;

        let receivers = self.feed.emit(FeedEvent::Inserted(record.clone()));
        tracing::debug!(%context, entry_id = %record.id, receivers, "entry inserted");

        Ok(record)
    }

    async fn remove_entry(&self, context: ContextKey, entry_id: EntryId) -> StorageResult<()> {
        let result = sqlx::query(
            "DELETE FROM entries WHERE id = ? AND context_kind = ? AND context_id = ?",
        )
        .bind(entry_id.to_string())
        .bind(context.kind.as_str())
        .bind(context.id.to_string())
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "entry-delete-apply",
        })?;

        if result.rows_affected() == 0 {
            return EntryNotFoundSnafu {
                stage: "entry-delete-missing",
                context,
                entry_id,
            }
            .fail();
        }

        let receivers = self.feed.emit(FeedEvent::Deleted { context, entry_id });
        tracing::debug!(%context, %entry_id, receivers, "entry deleted");

        Ok(())
    }

    async fn load_recent_entries(
        &self,
        context: ContextKey,
        limit: usize,
    ) -> StorageResult<Vec<EntryWithAuthor>> {
        let limit = usize_to_i64(limit, "entry-list-limit")?;
        let rows = sqlx::query_as::<_, EntryJoinRow>(
            "SELECT e.id, e.context_kind, e.context_id, e.author_id, e.content, e.created_at, \
             p.full_name, p.username, p.avatar_url \
             FROM entries e LEFT JOIN profiles p ON p.author_id = e.author_id \
             WHERE e.context_kind = ? AND e.context_id = ? \
             ORDER BY e.created_at DESC, e.rowid DESC LIMIT ?",
        )
        .bind(context.kind.as_str())
        .bind(context.id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "entry-list-query",
        })?;

        // Query runs newest-first so LIMIT keeps the tail; callers expect chronological order.
        rows.into_iter()
            .rev()
            .map(entry_join_row_to_record)
            .collect()
    }

    async fn load_profile(&self, author_id: AuthorId) -> StorageResult<Option<ProfileRecord>> {
        let row = sqlx::query_as::<_, ProfileRow>(
            "SELECT author_id, full_name, username, avatar_url FROM profiles WHERE author_id = ?",
        )
        .bind(author_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "profile-fetch-query",
        })?;

        row.map(profile_row_to_record).transpose()
    }

    async fn save_profile(&self, profile: ProfileRecord) -> StorageResult<ProfileRecord> {
        ensure!(
            !profile.full_name.trim().is_empty(),
            RejectedSnafu {
                stage: "profile-upsert-validate",
                entity: "profile",
                details: "full_name must not be empty".to_string(),
            }
        );

        sqlx::query(
            "INSERT INTO profiles (author_id, full_name, username, avatar_url, updated_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(author_id) DO UPDATE SET full_name = excluded.full_name, \
             username = excluded.username, avatar_url = excluded.avatar_url, updated_at = excluded.updated_at",
        )
        .bind(profile.author_id.to_string())
        .bind(profile.full_name.clone())
        .bind(profile.username.clone())
        .bind(profile.avatar_url.clone())
        .bind(u64_to_i64(unix_timestamp_millis(), "profile-upsert-updated-at")?)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "profile-upsert-apply",
        })?;

        Ok(profile)
    }
}

impl EntryStore for SqliteBackend {
    fn create_entry<'a>(
        &'a self,
        context: ContextKey,
        input: NewEntry,
    ) -> BoxFuture<'a, StorageResult<EntryRecord>> {
        Box::pin(self.insert_entry(context, input))
    }

    fn delete_entry<'a>(
        &'a self,
        context: ContextKey,
        entry_id: EntryId,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(self.remove_entry(context, entry_id))
    }

    fn list_recent_entries<'a>(
        &'a self,
        context: ContextKey,
        limit: usize,
    ) -> BoxFuture<'a, StorageResult<Vec<EntryWithAuthor>>> {
        Box::pin(self.load_recent_entries(context, limit))
    }
}

impl ProfileStore for SqliteBackend {
    fn fetch_profile<'a>(
        &'a self,
        author_id: AuthorId,
    ) -> BoxFuture<'a, StorageResult<Option<ProfileRecord>>> {
        Box::pin(self.load_profile(author_id))
    }

    fn upsert_profile<'a>(
        &'a self,
        profile: ProfileRecord,
    ) -> BoxFuture<'a, StorageResult<ProfileRecord>> {
        Box::pin(self.save_profile(profile))
    }
}

impl ChangeFeed for SqliteBackend {
    fn subscribe(&self, context: ContextKey) -> StorageResult<FeedSubscription> {
        Ok(self.feed.subscribe(context))
    }
}

#[derive(Debug, FromRow)]
struct EntryJoinRow {
    id: String,
    context_kind: String,
    context_id: String,
    author_id: String,
    content: String,
    created_at: i64,
    full_name: Option<String>,
    username: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, FromRow)]
struct ProfileRow {
    author_id: String,
    full_name: String,
    username: String,
    avatar_url: String,
}

fn entry_join_row_to_record(row: EntryJoinRow) -> StorageResult<EntryWithAuthor> {
    let author_id = AuthorId::parse(&row.author_id)?;
    let entry = EntryRecord {
        id: EntryId::parse(&row.id)?,
        context: ContextKey::new(
            ContextKind::parse(&row.context_kind)?,
            ContextId::parse(&row.context_id)?,
        ),
        author_id,
        content: row.content,
        created_at_unix_ms: i64_to_u64(row.created_at, "entry-row-created-at")?,
    };
    let author = row.full_name.map(|full_name| ProfileRecord {
        author_id,
        full_name,
        username: row.username.unwrap_or_default(),
        avatar_url: row.avatar_url.unwrap_or_default(),
    });

    Ok(EntryWithAuthor { entry, author })
}

fn profile_row_to_record(row: ProfileRow) -> StorageResult<ProfileRecord> {
    Ok(ProfileRecord {
        author_id: AuthorId::parse(&row.author_id)?,
        full_name: row.full_name,
        username: row.username,
        avatar_url: row.avatar_url,
    })
}

fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_u64, |duration| duration.as_millis() as u64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::OutOfRange {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::OutOfRange {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn usize_to_i64(value: usize, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::OutOfRange {
            stage,
            details: format!("usize '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
