use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::{FETCH_PAGE_SIZE, FETCH_TIMEOUT_SECS};
use crate::types::{now_secs, RawListing, WatchDefinition};

#[derive(Debug, Error)]
pub enum FetchError {
    /// Transient: network errors, timeouts, rate limits, bot challenges.
    /// Reported to the scheduler as SoftFail and retried via backoff.
    #[error("transient fetch failure: {0}")]
    Soft(String),
    /// Permanent: the request itself is wrong (bad query/filters). The watch
    /// is disabled rather than silently retried.
    #[error("permanent fetch failure: {0}")]
    Fatal(String),
}

/// The page-fetching capability. One call returns one page of raw listings
/// for a watch's search; the scheduler core never touches the network
/// outside this seam.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_page(
        &self,
        watch: &WatchDefinition,
        page: u32,
    ) -> Result<Vec<RawListing>, FetchError>;
}

// ---------------------------------------------------------------------------
// Vinted catalog API client
// ---------------------------------------------------------------------------

pub struct VintedFetcher {
    client: reqwest::Client,
    per_page: u32,
}

impl VintedFetcher {
    pub fn new() -> Result<Self, crate::error::AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            )
            .build()?;
        Ok(Self { client, per_page: FETCH_PAGE_SIZE })
    }
}

#[async_trait]
impl Fetcher for VintedFetcher {
    async fn fetch_page(
        &self,
        watch: &WatchDefinition,
        page: u32,
    ) -> Result<Vec<RawListing>, FetchError> {
        let url = build_search_url(watch, page, self.per_page);
        debug!(watch = %watch.name, page, "Fetching catalog page");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Soft(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            // 4xx that indicate a malformed search are not worth retrying;
            // everything else (429, 5xx, auth challenges) is transient.
            return match status.as_u16() {
                400 | 404 | 422 => Err(FetchError::Fatal(format!("HTTP {status} for {url}"))),
                _ => Err(FetchError::Soft(format!("HTTP {status}"))),
            };
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Soft(format!("response body: {e}")))?;

        let items = body
            .get("items")
            .and_then(|i| i.as_array())
            .ok_or_else(|| FetchError::Soft("catalog response missing items array".to_string()))?;

        let observed_at = now_secs();
        let listings = items
            .iter()
            .filter_map(|item| parse_listing(item, &watch.domain, observed_at))
            .collect();
        Ok(listings)
    }
}

/// Build the catalog search URL for one page of a watch's query.
pub fn build_search_url(watch: &WatchDefinition, page: u32, per_page: u32) -> String {
    let order = watch
        .filters
        .sort_order
        .as_deref()
        .unwrap_or("newest_first");

    let mut url = format!(
        "https://{}/api/v2/catalog/items?search_text={}&price_to={}&currency={}&order={}&page={}&per_page={}",
        watch.domain,
        urlencode(&watch.query),
        watch.max_price,
        watch.currency,
        order,
        page,
        per_page,
    );
    if let Some(min) = watch.min_price {
        url.push_str(&format!("&price_from={min}"));
    }
    push_id_list(&mut url, "catalog_ids", &watch.filters.catalog_ids);
    push_id_list(&mut url, "brand_ids", &watch.filters.brand_ids);
    push_id_list(&mut url, "size_ids", &watch.filters.size_ids);
    push_id_list(&mut url, "status_ids", &watch.filters.condition_ids);
    url
}

fn push_id_list(url: &mut String, param: &str, ids: &[u32]) {
    if ids.is_empty() {
        return;
    }
    let joined = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    url.push_str(&format!("&{param}={joined}"));
}

/// Minimal query-string escaping for the characters that actually occur in
/// search terms.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push('+'),
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => out.push(c),
            _ => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).as_bytes() {
                    out.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    out
}

/// Parse one catalog item. Returns None for structurally unusable entries
/// (missing id or price); validation of values happens in the executor.
fn parse_listing(item: &serde_json::Value, domain: &str, observed_at: u64) -> Option<RawListing> {
    let listing_id = match item.get("id") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return None,
    };

    let (price_amount, price_currency) = parse_price(item)?;
    let title = item
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    let url = item
        .get("url")
        .and_then(|u| u.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("https://{domain}/items/{listing_id}"));

    let thumbnail_url = item
        .get("photo")
        .and_then(|p| p.get("url"))
        .and_then(|u| u.as_str())
        .map(str::to_string);

    let user = item.get("user");
    let seller_rating = user
        .and_then(|u| u.get("feedback_reputation"))
        .and_then(|r| r.as_f64())
        // reputation comes back as 0..1; watches configure a 0..5 floor
        .map(|r| r * 5.0);
    let seller_feedback_count = user
        .and_then(|u| u.get("feedback_count"))
        .and_then(|c| c.as_u64())
        .map(|c| c as u32);

    Some(RawListing {
        listing_id,
        title,
        price_amount,
        price_currency,
        url,
        thumbnail_url,
        brand: item
            .get("brand_title")
            .and_then(|b| b.as_str())
            .filter(|b| !b.is_empty())
            .map(str::to_string),
        size: item
            .get("size_title")
            .and_then(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        condition: item
            .get("status")
            .and_then(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        seller_rating,
        seller_feedback_count,
        observed_at,
    })
}

/// The catalog serves prices either nested (`price: {amount, currency_code}`)
/// or flat (`price` string plus `currency`).
fn parse_price(item: &serde_json::Value) -> Option<(f64, String)> {
    let price = item.get("price")?;
    if let Some(obj) = price.as_object() {
        let amount = as_f64_lenient(obj.get("amount")?)?;
        let currency = obj
            .get("currency_code")
            .and_then(|c| c.as_str())
            .unwrap_or("EUR")
            .to_string();
        return Some((amount, currency));
    }
    let amount = as_f64_lenient(price)?;
    let currency = item
        .get("currency")
        .and_then(|c| c.as_str())
        .unwrap_or("EUR")
        .to_string();
    Some((amount, currency))
}

fn as_f64_lenient(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
