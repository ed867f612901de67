/// Credential pool sizing and freshness thresholds (seconds)
pub const DEFAULT_POOL_SIZE: usize = 5;
pub const CREDENTIAL_FRESH_MAX_AGE_SECS: u64 = 180;
pub const CREDENTIAL_HARD_EXPIRY_SECS: u64 = 3000;
pub const PREEMPTIVE_REFRESH_THRESHOLD_SECS: u64 = 120;

/// Waiter-queue timeouts for the two refresh paths
pub const COLD_REFRESH_WAIT_SECS: u64 = 60;
pub const RETRY_REFRESH_WAIT_SECS: u64 = 30;

/// Settle delays after a credential swap, before the retry fires
pub const COLD_SETTLE_DELAY_MS: u64 = 500;
pub const RETRY_SETTLE_DELAY_MS: u64 = 300;

/// Statuses treated as auth failures when the 400-retry policy is enabled.
/// 400 shows up here because the backend reports stale session tokens as
/// malformed requests.
pub const AUTH_RETRY_STATUS_CODES: &[u16] = &[400, 401, 403];
pub const STRICT_AUTH_STATUS_CODES: &[u16] = &[401, 403];

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const TRANSPORT_RETRY_BASE_DELAY_MS: u64 = 200;

/// Chunk aggregator defaults
pub const AGGREGATOR_MIN_CHUNK_SIZE: usize = 256;
pub const AGGREGATOR_MAX_BUFFER_MS: u64 = 100;

/// Stream processor defaults
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const TAIL_WINDOW_CHARS: usize = 512;

/// Diff block fence markers
pub const DIFF_SEARCH_START: &str = "<<<<<<< SEARCH";
pub const DIFF_SEPARATOR: &str = "=======";
pub const DIFF_REPLACE_END: &str = ">>>>>>> REPLACE";

/// The header rotated in place by `update_token`; the backend expects the
/// token wrapped in a single-element JSON array.
pub const REAUTH_HEADER: &str = "x-goog-first-party-reauth";

/// Token estimation ratios
pub const CHARS_PER_TOKEN_LATIN: f64 = 4.0;
pub const CHARS_PER_TOKEN_CJK: f64 = 1.5;
pub const CHARS_PER_COMPLETION_TOKEN: f64 = 3.5;
pub const TOKENS_PER_MESSAGE_OVERHEAD: u32 = 4;
pub const TOKENS_PER_IMAGE_PART: u32 = 765;

/// Image models report fixed usage: the backend gives us no counts at all.
pub const IMAGE_MODEL_PROMPT_TOKENS: u32 = 500;
pub const IMAGE_MODEL_COMPLETION_TOKENS: u32 = 1000;

/// Generation config floor: harvested sessions sometimes carry a tiny
/// maxOutputTokens from the browser UI.
pub const MIN_OUTPUT_TOKENS: i64 = 8192;
pub const DEFAULT_MAX_OUTPUT_TOKENS: i64 = 65535;

pub const THINKING_BUDGET_LOW: i64 = 8192;
pub const THINKING_BUDGET_HIGH: i64 = 32768;

/// Upstream transport tuning for long-lived streaming responses
pub const UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const UPSTREAM_READ_TIMEOUT_SECS: u64 = 180;
