/// Application name
pub const APP_NAME: &str = "Hearth";

/// Prefix of client-assigned message ids. Durable ids never start with it.
pub const TEMP_ID_PREFIX: &str = "optimistic-";

/// Freshness window of a cached message list, in seconds
pub const DEFAULT_MESSAGE_TTL_SECS: u64 = 60;

/// Freshness window of a cached conversation list, in seconds
pub const DEFAULT_CONVERSATION_TTL_SECS: u64 = 300;

/// Non-forced fetches closer together than this are coalesced
pub const DEFAULT_FETCH_DEBOUNCE_MS: u64 = 300;

/// Number of messages requested per container fetch
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Background workers computing per-container unread counts
pub const DEFAULT_ENRICH_WORKERS: usize = 4;

/// Maximum creation-time distance between an optimistic entry and the
/// durable row that confirms it, in seconds
pub const DEFAULT_DUPLICATE_WINDOW_SECS: u64 = 10;

/// Capacity of the change-event broadcast channel
pub const CHANGE_BUS_CAPACITY: usize = 1024;

/// Length of the body snippet shown in reply previews
pub const REPLY_SNIPPET_CHARS: usize = 80;
