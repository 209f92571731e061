use murmur_storage::StorageError;
use murmur_sync::RoomError;
use snafu::Snafu;

use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("settings failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to open database at '{path}' on `{stage}`: {source}"))]
    OpenDatabase {
        stage: &'static str,
        path: String,
        source: StorageError,
    },
    #[snafu(display("failed to publish own profile on `{stage}`: {source}"))]
    PublishProfile {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("room failed on `{stage}`: {source}"))]
    Room {
        stage: &'static str,
        source: RoomError,
    },
    #[snafu(display("terminal io failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;
