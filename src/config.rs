use crate::error::{AppError, Result};

/// Scheduler tick interval (seconds). The tick loop only scans state — it
/// never blocks on network I/O, so a short fixed tick is cheap.
pub const SCHEDULER_TICK_SECS: u64 = 1;

/// Polling intervals below this floor are clamped at watch-file load time.
pub const MIN_POLL_INTERVAL_SECS: u64 = 10;

/// Backoff cap: a watch's delay never exceeds interval * this multiplier,
/// bounding worst-case staleness after a run of soft failures.
pub const BACKOFF_CAP_MULTIPLIER: u32 = 8;

/// Upper bound of the uniform random jitter added to every computed
/// next-due time, to de-synchronize watches sharing a domain.
pub const JITTER_MAX_MS: u64 = 3_000;

/// Consecutive soft failures at which a warning is logged. The watch stays
/// active; only fatal failures disable it.
pub const SOFT_FAIL_WARN_THRESHOLD: u32 = 5;

/// How long shutdown waits for in-flight poll cycles to drain before the
/// process exits anyway.
pub const SHUTDOWN_GRACE_SECS: u64 = 30;

/// Delivery attempts per notification before the dispatcher reports failure.
pub const MAX_NOTIFY_ATTEMPTS: u8 = 3;

/// Base delay of the dispatcher's doubling retry backoff (milliseconds).
pub const NOTIFY_BACKOFF_BASE_MS: u64 = 500;

/// Catalog API request timeout (seconds).
pub const FETCH_TIMEOUT_SECS: u64 = 30;

/// Listings requested per catalog page.
pub const FETCH_PAGE_SIZE: u32 = 96;

/// Seen-record retention sweep interval (seconds).
pub const PURGE_INTERVAL_SECS: u64 = 6 * 3_600;

/// Exchange-rate cache lifetime (seconds).
pub const RATES_CACHE_SECS: u64 = 24 * 3_600;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Path of the TOML watch file (WATCHES_FILE).
    pub watches_file: String,
    /// Global cap on simultaneously in-flight poll cycles (CONCURRENCY).
    pub concurrency: usize,
    /// Catalog pages fetched per poll cycle (MAX_PAGES_PER_POLL).
    pub max_pages_per_poll: u32,
    /// Default Discord webhook when a watch has no override (DISCORD_WEBHOOK_URL).
    pub default_webhook: Option<String>,
    /// Exchange-rate API base URL (CURRENCY_API_URL); static fallback rates
    /// are used when unset or unreachable.
    pub currency_api_url: Option<String>,
    /// Seen records older than this are purged (SEEN_RETENTION_DAYS).
    pub seen_retention_days: u32,
    /// Suppress thumbnails in notifications (DISABLE_IMAGES).
    pub disable_images: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "monitor.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            watches_file: std::env::var("WATCHES_FILE")
                .unwrap_or_else(|_| "watches.toml".to_string()),
            concurrency: std::env::var("CONCURRENCY")
                .unwrap_or_else(|_| "2".to_string())
                .parse::<usize>()
                .ok()
                .filter(|c| *c >= 1)
                .ok_or_else(|| AppError::Config("CONCURRENCY must be a positive integer".to_string()))?,
            max_pages_per_poll: std::env::var("MAX_PAGES_PER_POLL")
                .unwrap_or_else(|_| "2".to_string())
                .parse::<u32>()
                .unwrap_or(2)
                .max(1),
            default_webhook: std::env::var("DISCORD_WEBHOOK_URL").ok(),
            currency_api_url: std::env::var("CURRENCY_API_URL").ok(),
            seen_retention_days: std::env::var("SEEN_RETENTION_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u32>()
                .unwrap_or(30),
            disable_images: std::env::var("DISABLE_IMAGES")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
        })
    }
}
