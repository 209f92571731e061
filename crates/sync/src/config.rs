use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKFILL_LIMIT: usize = 100;
pub const MAX_BACKFILL_LIMIT: usize = 1_000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_PLACEHOLDER_NAME: &str = "Unknown";

/// Where newly appended entries land in the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// Oldest first; chat rooms.
    #[default]
    Tail,
    /// Newest first; comment threads.
    Head,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub placement: Placement,
    /// Push confirmed own entries on the side channel right after persistence succeeds.
    pub push_confirmed: bool,
    /// Entries loaded on open and re-fetched after a feed gap.
    pub backfill_limit: usize,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub placeholder_name: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            placement: Placement::Tail,
            push_confirmed: true,
            backfill_limit: DEFAULT_BACKFILL_LIMIT,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            placeholder_name: DEFAULT_PLACEHOLDER_NAME.to_string(),
        }
    }
}

impl SyncSettings {
    pub fn normalized(mut self) -> Self {
        self.backfill_limit = self.backfill_limit.clamp(1, MAX_BACKFILL_LIMIT);
        self.reconnect_delay_ms = self.reconnect_delay_ms.max(1);
        self.placeholder_name = self.placeholder_name.trim().to_string();
        if self.placeholder_name.is_empty() {
            self.placeholder_name = DEFAULT_PLACEHOLDER_NAME.to_string();
        }

        self
    }

    pub fn for_comments() -> Self {
        Self {
            placement: Placement::Head,
            ..Self::default()
        }
    }
}
