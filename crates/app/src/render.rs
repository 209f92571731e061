use murmur_storage::AuthorId;
use murmur_sync::{ConnectionStatus, Entry, RoomNotice, RoomSnapshot};

pub const PENDING_MARKER: &str = "…";

pub fn connection_badge(connection: ConnectionStatus) -> String {
    match connection {
        ConnectionStatus::Connecting => "connecting".to_string(),
        ConnectionStatus::Live => "live".to_string(),
        ConnectionStatus::Reconnecting { attempt } => format!("reconnecting, attempt {attempt}"),
        ConnectionStatus::Disconnected => "offline".to_string(),
    }
}

/// Renders one line per entry under a status header.
pub fn render_snapshot(
    snapshot: &RoomSnapshot,
    room_name: &str,
    own_author: AuthorId,
    placeholder: &str,
) -> String {
    let mut output = format!(
        "── #{room_name} ({}) [{}] {} online ──\n",
        snapshot.context,
        connection_badge(snapshot.connection),
        snapshot.online
    );
    if snapshot.entries.is_empty() {
        output.push_str("   (no messages yet)\n");
    }
    for entry in &snapshot.entries {
        output.push_str(&render_entry(entry, own_author, placeholder));
        output.push('\n');
    }

    output
}

pub fn render_entry(entry: &Entry, own_author: AuthorId, placeholder: &str) -> String {
    let marker = if entry.is_pending() { PENDING_MARKER } else { " " };
    let author = entry
        .author
        .as_ref()
        .map(|profile| profile.full_name.as_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(placeholder);
    let own = if entry.author_id == own_author { " (you)" } else { "" };

    format!("{marker} {author}{own}: {}  [{}]", entry.content, entry.key)
}

pub fn render_notice(notice: &RoomNotice) -> String {
    match notice {
        RoomNotice::SendFailed {
            content, reason, ..
        } => format!("! message not sent ({reason}): {content}"),
        RoomNotice::DeleteFailed { entry_id, reason } => {
            format!("! could not delete {entry_id}: {reason}")
        }
        RoomNotice::DeleteRejected { entry_id } => {
            format!("! only your own sent messages can be deleted ({entry_id})")
        }
    }
}
