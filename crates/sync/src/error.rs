use murmur_storage::{ContextKey, StorageError};
use snafu::Snafu;

/// Failures decoding or encoding the push side channel payload.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PushError {
    #[snafu(display("failed to encode pushed entry on `{stage}`"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode pushed entry on `{stage}`"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("pushed entry field `{field}` is invalid on `{stage}`"))]
    InvalidField {
        stage: &'static str,
        field: &'static str,
        source: StorageError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RoomError {
    #[snafu(display("failed to subscribe to {context} on `{stage}`"))]
    Subscribe {
        stage: &'static str,
        context: ContextKey,
        source: StorageError,
    },
    #[snafu(display("failed to load history of {context} on `{stage}`"))]
    InitialLoad {
        stage: &'static str,
        context: ContextKey,
        source: StorageError,
    },
    #[snafu(display("room {context} is closed (`{stage}`)"))]
    Closed {
        stage: &'static str,
        context: ContextKey,
    },
    #[snafu(display("room dispatcher task failed on `{stage}`"))]
    Worker {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

pub type RoomResult<T> = Result<T, RoomError>;
