use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RATES_CACHE_SECS;
use crate::types::now_secs;

/// Approximate rates used when no API is configured or the API is down.
/// Keys are (from, to); the inverse direction is derived.
const FALLBACK_RATES: &[(&str, &str, f64)] = &[
    ("EUR", "USD", 1.10),
    ("EUR", "GBP", 0.85),
    ("EUR", "PLN", 4.30),
    ("EUR", "CZK", 24.50),
    ("EUR", "JPY", 160.0),
    ("USD", "GBP", 0.77),
    ("USD", "PLN", 3.90),
    ("USD", "CZK", 22.30),
    ("GBP", "PLN", 5.10),
    ("GBP", "CZK", 29.0),
];

struct CachedRates {
    fetched_at: u64,
    rates: HashMap<String, f64>,
}

/// Converts listing prices into a watch's comparison currency. Rates are
/// fetched once per base currency and cached for 24h; every failure path
/// degrades to the static fallback table, and a miss there returns None so
/// the caller compares raw amounts instead of dropping the listing.
pub struct CurrencyConverter {
    client: reqwest::Client,
    api_url: Option<String>,
    cache: Mutex<HashMap<String, CachedRates>>,
}

impl CurrencyConverter {
    pub fn new(api_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_url,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn convert(&self, amount: f64, from: &str, to: &str) -> Option<f64> {
        if from == to {
            return Some(amount);
        }
        if let Some(rates) = self.rates_for(from).await {
            if let Some(rate) = rates.get(to) {
                return Some(amount * rate);
            }
        }
        fallback_rate(from, to).map(|rate| amount * rate)
    }

    /// Cached API rates for a base currency, or None when no API is
    /// configured or the fetch failed.
    async fn rates_for(&self, base: &str) -> Option<HashMap<String, f64>> {
        let api_url = self.api_url.as_deref()?;

        let mut cache = self.cache.lock().await;
        let now = now_secs();
        if let Some(cached) = cache.get(base) {
            if now.saturating_sub(cached.fetched_at) < RATES_CACHE_SECS {
                return Some(cached.rates.clone());
            }
        }

        let url = format!("{}/{}", api_url.trim_end_matches('/'), base);
        let rates = match self.fetch_rates(&url).await {
            Ok(r) => r,
            Err(e) => {
                warn!(base, "Exchange-rate fetch failed, using fallback table: {e}");
                return None;
            }
        };

        debug!(base, count = rates.len(), "Cached exchange rates");
        cache.insert(base.to_string(), CachedRates { fetched_at: now, rates: rates.clone() });
        Some(rates)
    }

    async fn fetch_rates(&self, url: &str) -> reqwest::Result<HashMap<String, f64>> {
        let resp: serde_json::Value = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut rates = HashMap::new();
        if let Some(obj) = resp.get("rates").and_then(|r| r.as_object()) {
            for (code, value) in obj {
                if let Some(rate) = value.as_f64() {
                    rates.insert(code.clone(), rate);
                }
            }
        }
        Ok(rates)
    }
}

fn fallback_rate(from: &str, to: &str) -> Option<f64> {
    for &(f, t, rate) in FALLBACK_RATES {
        if f == from && t == to {
            return Some(rate);
        }
        if f == to && t == from {
            return Some(1.0 / rate);
        }
    }
    None
}
