use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_storage::{AuthorId, ContextId, ContextKey, ContextKind, StorageError};
use murmur_sync::{CurrentUser, Placement, Profile, SyncSettings};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "murmur.db";
pub const ENV_PREFIX: &str = "MURMUR_";
pub const DEFAULT_FULL_NAME: &str = "Anonymous";
pub const DEFAULT_ROOM_NAME: &str = "lobby";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Generated on first run.
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default = "default_full_name")]
    pub full_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar_url: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            author_id: None,
            full_name: default_full_name(),
            username: String::new(),
            avatar_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSettings {
    /// `room` for chat, `post` for a comment thread.
    #[serde(default = "default_room_kind")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_room_name")]
    pub name: String,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            kind: default_room_kind(),
            id: None,
            name: default_room_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub user: UserSettings,
    #[serde(default)]
    pub room: RoomSettings,
    #[serde(default)]
    pub sync: SyncSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            user: UserSettings::default(),
            room: RoomSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.database_path = if self.database_path.trim().is_empty() {
            default_database_path()
        } else {
            self.database_path.trim().to_string()
        };

        self.user.author_id = normalize_optional(self.user.author_id);
        self.user.full_name = if self.user.full_name.trim().is_empty() {
            default_full_name()
        } else {
            self.user.full_name.trim().to_string()
        };
        self.user.username = self.user.username.trim().to_string();
        self.user.avatar_url = self.user.avatar_url.trim().to_string();

        self.room.kind = match ContextKind::parse(&self.room.kind) {
            Ok(kind) => kind.as_str().to_string(),
            Err(_) => default_room_kind(),
        };
        self.room.id = normalize_optional(self.room.id);
        if self.room.name.trim().is_empty() {
            self.room.name = default_room_name();
        }

        // Comment threads always list newest first.
        if self.room.kind == ContextKind::Post.as_str() {
            self.sync.placement = Placement::Head;
        }
        self.sync = self.sync.normalized();

        self
    }

    pub fn has_identity(&self) -> bool {
        self.author_id().is_ok() && self.context().is_ok()
    }

    /// Fills in a fresh author id and room id where none parse.
    pub fn with_generated_identity(mut self) -> Self {
        if self.author_id().is_err() {
            self.user.author_id = Some(AuthorId::new_v7().to_string());
        }
        if self
            .room
            .id
            .as_deref()
            .is_none_or(|raw| ContextId::parse(raw).is_err())
        {
            self.room.id = Some(ContextId::new_v7().to_string());
        }

        self
    }

    pub fn author_id(&self) -> Result<AuthorId, SettingsError> {
        AuthorId::parse(self.user.author_id.as_deref().unwrap_or_default()).context(
            InvalidIdentitySnafu {
                stage: "settings-author-id",
                field: "user.author_id",
            },
        )
    }

    pub fn context(&self) -> Result<ContextKey, SettingsError> {
        let kind = ContextKind::parse(&self.room.kind).context(InvalidIdentitySnafu {
            stage: "settings-room-kind",
            field: "room.kind",
        })?;
        let id = ContextId::parse(self.room.id.as_deref().unwrap_or_default()).context(
            InvalidIdentitySnafu {
                stage: "settings-room-id",
                field: "room.id",
            },
        )?;

        Ok(ContextKey::new(kind, id))
    }

    pub fn current_user(&self) -> Result<CurrentUser, SettingsError> {
        let profile = Profile::new(self.user.full_name.clone())
            .with_username(self.user.username.clone())
            .with_avatar_url(self.user.avatar_url.clone());

        Ok(CurrentUser::new(self.author_id()?, profile))
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_sources(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Returns settings with a usable author and room id, persisting generated ones.
    pub fn ensure_identity(&self) -> Result<Arc<AppSettings>, SettingsError> {
        let current = self.settings();
        if current.has_identity() {
            return Ok(current);
        }

        let generated = AppSettings::clone(&current).with_generated_identity();
        tracing::info!(
            author_id = ?generated.user.author_id,
            room_id = ?generated.room.id,
            "generated local identity"
        );
        self.update(generated)?;
        Ok(self.settings())
    }

    fn load_from_sources(path: &Path) -> AppSettings {
        let mut figment = Figment::from(Serialized::defaults(AppSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("settings field `{field}` is invalid on `{stage}`: {source}"))]
    InvalidIdentity {
        stage: &'static str,
        field: &'static str,
        source: StorageError,
    },
}

fn default_full_name() -> String {
    DEFAULT_FULL_NAME.to_string()
}

fn default_room_kind() -> String {
    ContextKind::Room.as_str().to_string()
}

fn default_room_name() -> String {
    DEFAULT_ROOM_NAME.to_string()
}

fn default_database_path() -> String {
    SettingsStore::default_config_dir()
        .join(DATABASE_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}
