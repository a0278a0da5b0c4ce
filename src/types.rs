use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Watch definitions
// ---------------------------------------------------------------------------

/// A named, user-configured recurring search. Loaded from the watch file,
/// immutable for the duration of a poll cycle; the registry swaps whole
/// snapshots on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchDefinition {
    /// Stable key. Unique across the watch file.
    pub name: String,
    /// Marketplace host, e.g. "www.vinted.de".
    pub domain: String,
    pub query: String,
    pub max_price: f64,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_interval")]
    pub polling_interval_secs: u64,
    #[serde(default)]
    pub min_seller_rating: Option<f64>,
    #[serde(default)]
    pub min_seller_feedback: Option<u32>,
    /// Per-watch webhook override; falls back to the global default.
    #[serde(default)]
    pub notification_webhook: Option<String>,
    #[serde(default)]
    pub filters: WatchFilters,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchFilters {
    /// Catalog sort order, e.g. "newest_first" (the default).
    #[serde(default)]
    pub sort_order: Option<String>,
    #[serde(default)]
    pub catalog_ids: Vec<u32>,
    #[serde(default)]
    pub brand_ids: Vec<u32>,
    #[serde(default)]
    pub size_ids: Vec<u32>,
    #[serde(default)]
    pub condition_ids: Vec<u32>,
    /// Titles containing any of these (case-insensitive) are rejected by the
    /// keyword classifier without being marked seen.
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn default_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// One listing as returned by the fetch capability. Transient; only the
/// (watch, listing_id) pair of a notified listing is persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RawListing {
    /// Unique per domain.
    pub listing_id: String,
    pub title: String,
    pub price_amount: f64,
    pub price_currency: String,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub brand: Option<String>,
    pub size: Option<String>,
    pub condition: Option<String>,
    pub seller_rating: Option<f64>,
    pub seller_feedback_count: Option<u32>,
    /// Unix seconds when this listing was observed.
    pub observed_at: u64,
}

// ---------------------------------------------------------------------------
// Poll outcomes
// ---------------------------------------------------------------------------

/// Result class of the most recent poll cycle for a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastResult {
    NeverRun,
    Success,
    SoftFail,
    FatalFail,
}

impl std::fmt::Display for LastResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LastResult::NeverRun => "never_run",
            LastResult::Success => "success",
            LastResult::SoftFail => "soft_fail",
            LastResult::FatalFail => "fatal_fail",
        };
        write!(f, "{s}")
    }
}

/// Terminal state of one poll cycle, reported by the executor back to the
/// scheduler. SoftFail feeds backoff; FatalFail disables the watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Success,
    SoftFail(String),
    FatalFail(String),
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Success => "success",
            CycleOutcome::SoftFail(_) => "soft_fail",
            CycleOutcome::FatalFail(_) => "fatal_fail",
        }
    }
}

/// Full report of one executed poll cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    /// Listings returned by the fetch capability (pre-filter).
    pub fetched: usize,
    /// Notifications delivered and recorded as seen this cycle.
    pub notified: usize,
    /// Dispatch attempts that exhausted retries; these listings stay unseen.
    pub dispatch_failures: usize,
    /// Dry-run only: listings that would have triggered a notification.
    pub would_notify: Vec<RawListing>,
}

impl CycleReport {
    pub fn soft(reason: impl Into<String>) -> Self {
        Self {
            outcome: CycleOutcome::SoftFail(reason.into()),
            fetched: 0,
            notified: 0,
            dispatch_failures: 0,
            would_notify: Vec::new(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            outcome: CycleOutcome::FatalFail(reason.into()),
            fetched: 0,
            notified: 0,
            dispatch_failures: 0,
            would_notify: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Classifier verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchVerdict {
    Accept,
    Reject,
}

// ---------------------------------------------------------------------------
// Notification event
// ---------------------------------------------------------------------------

/// Ephemeral value handed to the dispatcher for one qualifying listing.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub watch_name: String,
    pub listing: RawListing,
    /// Resolved target: per-watch override or the global default. None means
    /// nothing is configured, which the transport reports as an invalid
    /// target (and the listing is not marked seen).
    pub webhook: Option<String>,
}

// ---------------------------------------------------------------------------
// Status snapshots for the control surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PollStatus {
    pub name: String,
    pub domain: String,
    pub query: String,
    pub polling_interval_secs: u64,
    pub last_result: LastResult,
    pub consecutive_failures: u32,
    pub in_flight: bool,
    /// Milliseconds until the next scheduled poll (0 when overdue).
    pub next_due_in_ms: u64,
    /// Set when a fatal failure disabled this watch.
    pub disabled_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Clock helpers
// ---------------------------------------------------------------------------

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
