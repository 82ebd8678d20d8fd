/// Application name
pub const APP_NAME: &str = "Ekklesia";

/// Capacity of the engine command channel
pub const DEFAULT_COMMAND_CAPACITY: usize = 256;

/// Capacity of the engine notification channel
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Roster preview length, in characters
pub const DEFAULT_PREVIEW_CHARS: usize = 80;

/// Number of recently seen inbox message ids remembered by the roster
pub const DEFAULT_DEDUP_WINDOW: usize = 512;

/// Subscription retry policy
pub const DEFAULT_SUBSCRIBE_RETRIES: u32 = 5;
pub const DEFAULT_SUBSCRIBE_BACKOFF_MS: u64 = 250;
