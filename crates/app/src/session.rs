use std::path::PathBuf;
use std::sync::Arc;

use murmur_storage::{
    AuthorId, Backend, ContextKey, ContextKind, EntryId, ProfileStore, SqliteBackend,
};
use murmur_sync::{CurrentUser, Placement, Room, RoomResult, RoomSnapshot, SyncSettings};
use snafu::ResultExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{
    AppResult, OpenDatabaseSnafu, PublishProfileSnafu, RoomSnafu, SettingsSnafu, TerminalSnafu,
};
use crate::input::{HELP, InputCommand};
use crate::render::{render_notice, render_snapshot};
use crate::settings::{AppSettings, SettingsStore};

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Presentation options for one terminal session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub room_name: String,
    pub own_author: AuthorId,
    pub placeholder: String,
    pub clear_screen: bool,
}

impl SessionView {
    pub fn new(settings: &AppSettings, own_author: AuthorId) -> Self {
        Self {
            room_name: settings.room.name.clone(),
            own_author,
            placeholder: settings.sync.placeholder_name.clone(),
            clear_screen: true,
        }
    }
}

/// Opens rooms on one backend for the local user.
pub struct RoomLauncher<B> {
    backend: Arc<B>,
    user: CurrentUser,
    sync: SyncSettings,
}

impl<B> RoomLauncher<B>
where
    B: Backend + 'static,
{
    pub fn new(backend: Arc<B>, user: CurrentUser, sync: SyncSettings) -> Self {
        Self {
            backend,
            user,
            sync,
        }
    }

    pub fn author_id(&self) -> AuthorId {
        self.user.author_id
    }

    /// Opens `context`; chat rooms list oldest first and comment threads newest first.
    pub async fn open(&self, context: ContextKey) -> RoomResult<Room> {
        let placement = match context.kind {
            ContextKind::Room => Placement::Tail,
            ContextKind::Post => Placement::Head,
        };
        let sync = SyncSettings {
            placement,
            ..self.sync.clone()
        };
        Room::open(Arc::clone(&self.backend), context, self.user.clone(), sync).await
    }
}

/// Loads settings, opens the database and the configured room, then serves stdin/stdout.
pub async fn run(config_path: Option<PathBuf>) -> AppResult<()> {
    let store = config_path.map_or_else(SettingsStore::load, SettingsStore::new);
    let settings = store.ensure_identity().context(SettingsSnafu {
        stage: "ensure-identity",
    })?;
    let user = settings.current_user().context(SettingsSnafu {
        stage: "resolve-current-user",
    })?;
    let context = settings.context().context(SettingsSnafu {
        stage: "resolve-room-context",
    })?;

    let backend = SqliteBackend::open(&settings.database_path)
        .await
        .context(OpenDatabaseSnafu {
            stage: "open-database",
            path: settings.database_path.clone(),
        })?;
    let backend = Arc::new(backend);
    backend
        .upsert_profile(user.profile.to_record(user.author_id))
        .await
        .context(PublishProfileSnafu {
            stage: "upsert-own-profile",
        })?;

    let launcher = RoomLauncher::new(backend, user, settings.sync.clone());
    let room = launcher
        .open(context)
        .await
        .context(RoomSnafu { stage: "open-room" })?;
    tracing::info!(%context, config = ?store.config_path(), "joined room");

    let view = SessionView::new(&settings, launcher.author_id());
    let mut stdout = tokio::io::stdout();
    run_session(
        &launcher,
        room,
        view,
        BufReader::new(tokio::io::stdin()),
        &mut stdout,
    )
    .await
}

/// Feeds input lines into `room` and writes every snapshot change and notice to `output`.
///
/// `/join` opens the target context through `launcher` and closes the room it replaces. Ends
/// on `/quit` or end of input and closes the current room before returning.
pub async fn run_session<B, R, W>(
    launcher: &RoomLauncher<B>,
    mut room: Room,
    mut view: SessionView,
    input: R,
    output: &mut W,
) -> AppResult<()>
where
    B: Backend + 'static,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut snapshots = room.watch();
    let rendered = render_view(&view, &snapshots.borrow_and_update());
    write_block(output, &rendered).await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = line.context(TerminalSnafu { stage: "read-input-line" })?;
                match line.as_deref().map(InputCommand::parse) {
                    None | Some(InputCommand::Quit) => break,
                    Some(InputCommand::Empty) => {}
                    Some(InputCommand::Help) => write_block(output, HELP).await?,
                    Some(InputCommand::Submit(content)) => {
                        room.submit(content)
                            .await
                            .context(RoomSnafu { stage: "submit-input" })?;
                    }
                    Some(InputCommand::Delete(raw)) => match EntryId::parse(&raw) {
                        Ok(entry_id) => room
                            .delete(entry_id)
                            .context(RoomSnafu { stage: "delete-input" })?,
                        Err(error) => write_block(output, &format!("! {error}")).await?,
                    },
                    Some(InputCommand::Join(raw)) => {
                        let (target, name) = raw
                            .split_once(char::is_whitespace)
                            .map_or((raw.as_str(), ""), |(target, name)| (target, name.trim()));
                        let context = match ContextKey::parse(target) {
                            Ok(context) => context,
                            Err(error) => {
                                write_block(output, &format!("! {error}")).await?;
                                continue;
                            }
                        };
                        let next = match launcher.open(context).await {
                            Ok(next) => next,
                            Err(error) => {
                                tracing::warn!(%context, error = %error, "join failed");
                                let message = format!("! could not join {context}: {error}");
                                write_block(output, &message).await?;
                                continue;
                            }
                        };

                        let previous = std::mem::replace(&mut room, next);
                        let left = previous.context();
                        previous.close().await.context(RoomSnafu { stage: "leave-room" })?;
                        tracing::info!(from = %left, to = %context, "switched room");

                        view.room_name = if name.is_empty() {
                            context.kind.as_str().to_string()
                        } else {
                            name.to_string()
                        };
                        snapshots = room.watch();
                        let rendered = render_view(&view, &snapshots.borrow_and_update());
                        write_block(output, &rendered).await?;
                    }
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let rendered = render_view(&view, &snapshots.borrow_and_update());
                write_block(output, &rendered).await?;
            }
            Some(notice) = room.next_notice() => {
                write_block(output, &render_notice(&notice)).await?;
            }
        }
    }

    room.close().await.context(RoomSnafu { stage: "close-room" })
}

fn render_view(view: &SessionView, snapshot: &RoomSnapshot) -> String {
    let body = render_snapshot(snapshot, &view.room_name, view.own_author, &view.placeholder);
    if view.clear_screen {
        format!("{CLEAR_SCREEN}{body}")
    } else {
        body
    }
}

async fn write_block<W>(output: &mut W, text: &str) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    output
        .write_all(text.as_bytes())
        .await
        .context(TerminalSnafu {
            stage: "write-output",
        })?;
    if !text.ends_with('\n') {
        output.write_all(b"\n").await.context(TerminalSnafu {
            stage: "write-output",
        })?;
    }
    output.flush().await.context(TerminalSnafu {
        stage: "flush-output",
    })
}
