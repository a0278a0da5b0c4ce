use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::classify::Classifier;
use crate::currency::CurrencyConverter;
use crate::db::SeenStore;
use crate::fetch::{FetchError, Fetcher};
use crate::filters;
use crate::notify::Dispatcher;
use crate::types::{
    now_secs, CycleOutcome, CycleReport, MatchVerdict, NotificationEvent, RawListing,
    WatchDefinition,
};

/// Runs one watch's poll cycle: fetch → validate → filter → dedup →
/// classify → dispatch → mark seen. Every failure is contained here and
/// reported as the cycle outcome; nothing escapes to the scheduler loop.
pub struct PollExecutor {
    fetcher: Arc<dyn Fetcher>,
    classifier: Option<Arc<dyn Classifier>>,
    dispatcher: Dispatcher,
    store: SeenStore,
    converter: Option<Arc<CurrencyConverter>>,
    default_webhook: Option<String>,
    max_pages: u32,
}

impl PollExecutor {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        classifier: Option<Arc<dyn Classifier>>,
        dispatcher: Dispatcher,
        store: SeenStore,
        converter: Option<Arc<CurrencyConverter>>,
        default_webhook: Option<String>,
        max_pages: u32,
    ) -> Self {
        Self {
            fetcher,
            classifier,
            dispatcher,
            store,
            converter,
            default_webhook,
            max_pages: max_pages.max(1),
        }
    }

    /// One poll cycle. In dry-run mode nothing is dispatched and nothing is
    /// written to the seen store; the would-notify listings are returned in
    /// the report instead.
    pub async fn run_cycle(&self, watch: &WatchDefinition, dry_run: bool) -> CycleReport {
        let listings = match self.fetch_pages(watch).await {
            Ok(l) => l,
            Err(report) => return *report,
        };

        let mut report = CycleReport {
            outcome: CycleOutcome::Success,
            fetched: listings.len(),
            notified: 0,
            dispatch_failures: 0,
            would_notify: Vec::new(),
        };

        // Pages of the same cycle can overlap; handle each id once.
        let mut handled: HashSet<String> = HashSet::new();

        for listing in &listings {
            if !filters::is_valid(listing) {
                debug!(watch = %watch.name, "Skipping malformed listing");
                continue;
            }
            if !handled.insert(listing.listing_id.clone()) {
                continue;
            }

            let comparable = self.comparable_price(watch, listing).await;
            if let Err(rejection) = filters::check_listing(watch, listing, comparable) {
                debug!(
                    watch = %watch.name,
                    listing = %listing.listing_id,
                    "Filtered out: {rejection:?}"
                );
                continue;
            }

            match self.store.has(&watch.name, &listing.listing_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    report.outcome = CycleOutcome::SoftFail(format!("seen-store read: {e}"));
                    return report;
                }
            }

            if let Some(classifier) = &self.classifier {
                if classifier.classify(watch, listing).await == MatchVerdict::Reject {
                    // Not marked seen: stays eligible for re-classification.
                    debug!(watch = %watch.name, listing = %listing.listing_id, "Classifier reject");
                    continue;
                }
            }

            if dry_run {
                report.would_notify.push(listing.clone());
                continue;
            }

            let event = NotificationEvent {
                watch_name: watch.name.clone(),
                listing: listing.clone(),
                webhook: watch
                    .notification_webhook
                    .clone()
                    .or_else(|| self.default_webhook.clone()),
            };

            let result = self.dispatcher.dispatch(&event).await;
            if result.authorizes_seen() {
                if let Err(e) = self
                    .store
                    .mark_seen(&watch.name, &listing.listing_id, now_secs())
                    .await
                {
                    // Delivered but not recorded: the next cycle may notify
                    // again (at-least-once). Surface loudly.
                    error!(
                        watch = %watch.name,
                        listing = %listing.listing_id,
                        "Delivered notification could not be marked seen: {e}"
                    );
                    report.outcome = CycleOutcome::SoftFail(format!("seen-store write: {e}"));
                    return report;
                }
                if let Err(e) = self
                    .store
                    .record_notification(&watch.name, &listing.listing_id, now_secs())
                    .await
                {
                    warn!(watch = %watch.name, "Notification audit write failed: {e}");
                }
                report.notified += 1;
            } else {
                report.dispatch_failures += 1;
            }
        }

        if report.notified > 0 {
            info!(
                watch = %watch.name,
                notified = report.notified,
                fetched = report.fetched,
                "New listings notified"
            );
        }
        report
    }

    /// Fetch up to `max_pages` pages. A soft failure on the first page fails
    /// the cycle; on later pages it ends pagination with what was gathered.
    async fn fetch_pages(
        &self,
        watch: &WatchDefinition,
    ) -> Result<Vec<RawListing>, Box<CycleReport>> {
        let mut listings = Vec::new();
        for page in 1..=self.max_pages {
            match self.fetcher.fetch_page(watch, page).await {
                Ok(batch) => {
                    let len = batch.len();
                    listings.extend(batch);
                    if len == 0 {
                        break;
                    }
                }
                Err(FetchError::Soft(e)) if page == 1 => {
                    return Err(Box::new(CycleReport::soft(e)));
                }
                Err(FetchError::Soft(e)) => {
                    warn!(watch = %watch.name, page, "Pagination cut short: {e}");
                    break;
                }
                Err(FetchError::Fatal(e)) => {
                    return Err(Box::new(CycleReport::fatal(e)));
                }
            }
        }
        Ok(listings)
    }

    /// Listing price in the watch's currency, or the raw amount when no
    /// conversion is possible.
    async fn comparable_price(&self, watch: &WatchDefinition, listing: &RawListing) -> f64 {
        if listing.price_currency == watch.currency {
            return listing.price_amount;
        }
        if let Some(converter) = &self.converter {
            if let Some(converted) = converter
                .convert(listing.price_amount, &listing.price_currency, &watch.currency)
                .await
            {
                return converted;
            }
        }
        listing.price_amount
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::classify::TitleKeywordClassifier;
    use crate::db::tests::memory_store;
    use crate::notify::{Notifier, NotifyError};
    use crate::types::WatchFilters;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    pub(crate) fn test_watch(name: &str) -> WatchDefinition {
        WatchDefinition {
            name: name.to_string(),
            domain: "www.vinted.de".to_string(),
            query: "jacket".to_string(),
            max_price: 100.0,
            min_price: None,
            currency: "EUR".to_string(),
            polling_interval_secs: 30,
            min_seller_rating: None,
            min_seller_feedback: None,
            notification_webhook: Some("https://discord.example/hook".to_string()),
            filters: WatchFilters::default(),
            active: true,
        }
    }

    pub(crate) fn listing(id: &str, price: f64) -> RawListing {
        RawListing {
            listing_id: id.to_string(),
            title: format!("Listing {id}"),
            price_amount: price,
            price_currency: "EUR".to_string(),
            url: format!("https://www.vinted.de/items/{id}"),
            thumbnail_url: None,
            brand: None,
            size: None,
            condition: None,
            seller_rating: None,
            seller_feedback_count: None,
            observed_at: 0,
        }
    }

    /// Serves scripted pages in order; an exhausted script serves empty pages.
    pub(crate) struct ScriptedFetcher {
        pages: Mutex<VecDeque<Result<Vec<RawListing>, FetchError>>>,
    }

    impl ScriptedFetcher {
        pub(crate) fn new(
            pages: Vec<Result<Vec<RawListing>, FetchError>>,
        ) -> Arc<Self> {
            Arc::new(Self { pages: Mutex::new(pages.into_iter().collect()) })
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch_page(
            &self,
            _watch: &WatchDefinition,
            _page: u32,
        ) -> Result<Vec<RawListing>, FetchError> {
            self.pages.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// Records delivered listing ids; fails the first `fail_first` send calls
    /// with a transport error.
    pub(crate) struct RecordingNotifier {
        pub(crate) sent: Mutex<Vec<String>>,
        fail_first: Mutex<u32>,
    }

    impl RecordingNotifier {
        pub(crate) fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), fail_first: Mutex::new(fail_first) })
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
            let mut remaining = self.fail_first.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(NotifyError::Transport("simulated outage".to_string()));
            }
            drop(remaining);
            self.sent.lock().unwrap().push(event.listing.listing_id.clone());
            Ok(())
        }
    }

    async fn executor(
        fetcher: Arc<ScriptedFetcher>,
        notifier: Arc<RecordingNotifier>,
        store: SeenStore,
        max_pages: u32,
    ) -> PollExecutor {
        PollExecutor::new(
            fetcher,
            Some(Arc::new(TitleKeywordClassifier)),
            Dispatcher::new(notifier).with_backoff_base(Duration::from_millis(0)),
            store,
            None,
            None,
            max_pages,
        )
    }

    #[tokio::test]
    async fn reappearing_listings_notify_exactly_once_across_cycles() {
        // Three cycles: [A,B], [B,C], [C,D]. B and C reappear.
        let fetcher = ScriptedFetcher::new(vec![
            Ok(vec![listing("A", 10.0), listing("B", 20.0)]),
            Ok(vec![listing("B", 20.0), listing("C", 30.0)]),
            Ok(vec![listing("C", 30.0), listing("D", 40.0)]),
        ]);
        let notifier = RecordingNotifier::new(0);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier.clone(), store.clone(), 1).await;
        let watch = test_watch("w");

        for _ in 0..3 {
            let report = exec.run_cycle(&watch, false).await;
            assert_eq!(report.outcome, CycleOutcome::Success);
        }

        assert_eq!(*notifier.sent.lock().unwrap(), vec!["A", "B", "C", "D"]);
        for id in ["A", "B", "C", "D"] {
            assert!(store.has("w", id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn overlapping_pages_within_one_cycle_dedup() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(vec![listing("A", 10.0), listing("B", 20.0)]),
            Ok(vec![listing("B", 20.0), listing("C", 30.0)]),
        ]);
        let notifier = RecordingNotifier::new(0);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier.clone(), store, 2).await;

        let report = exec.run_cycle(&test_watch("w"), false).await;
        assert_eq!(report.notified, 3);
        assert_eq!(*notifier.sent.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_listing_unseen_for_next_cycle() {
        // First cycle: all three dispatch attempts fail, X stays unseen.
        // Second cycle: delivery succeeds, X is marked seen.
        let fetcher = ScriptedFetcher::new(vec![
            Ok(vec![listing("X", 10.0)]),
            Ok(vec![listing("X", 10.0)]),
        ]);
        let notifier = RecordingNotifier::new(3);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier.clone(), store.clone(), 1).await;
        let watch = test_watch("w");

        let first = exec.run_cycle(&watch, false).await;
        assert_eq!(first.outcome, CycleOutcome::Success);
        assert_eq!(first.dispatch_failures, 1);
        assert!(!store.has("w", "X").await.unwrap());

        let second = exec.run_cycle(&watch, false).await;
        assert_eq!(second.notified, 1);
        assert!(store.has("w", "X").await.unwrap());
        // Exactly one delivery recorded despite four send attempts.
        assert_eq!(*notifier.sent.lock().unwrap(), vec!["X"]);
    }

    #[tokio::test]
    async fn transient_dispatch_failures_mark_seen_only_after_delivery() {
        // Two transport failures, delivered on the third attempt within one
        // dispatch; one delivery recorded, then marked seen.
        let fetcher = ScriptedFetcher::new(vec![Ok(vec![listing("X", 10.0)])]);
        let notifier = RecordingNotifier::new(2);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier.clone(), store.clone(), 1).await;

        let report = exec.run_cycle(&test_watch("w"), false).await;
        assert_eq!(report.notified, 1);
        assert_eq!(report.dispatch_failures, 0);
        assert!(store.has("w", "X").await.unwrap());
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn classifier_reject_is_not_marked_seen() {
        let mut rejecting = test_watch("w");
        rejecting.filters.exclude_keywords = vec!["listing".to_string()];

        let fetcher = ScriptedFetcher::new(vec![
            Ok(vec![listing("A", 10.0)]),
            Ok(vec![listing("A", 10.0)]),
        ]);
        let notifier = RecordingNotifier::new(0);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier.clone(), store.clone(), 1).await;

        let report = exec.run_cycle(&rejecting, false).await;
        assert_eq!(report.notified, 0);
        assert!(!store.has("w", "A").await.unwrap());

        // After the exclusion is lifted the same listing can still notify.
        let accepting = test_watch("w");
        let report = exec.run_cycle(&accepting, false).await;
        assert_eq!(report.notified, 1);
        assert!(store.has("w", "A").await.unwrap());
    }

    #[tokio::test]
    async fn filtered_and_malformed_listings_are_skipped() {
        let mut too_cheap = listing("cheap", 1.0);
        too_cheap.price_amount = 200.0; // above max_price 100
        let mut bad = listing("", 10.0);
        bad.listing_id = String::new();

        let fetcher =
            ScriptedFetcher::new(vec![Ok(vec![too_cheap, bad, listing("ok", 50.0)])]);
        let notifier = RecordingNotifier::new(0);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier.clone(), store, 1).await;

        let report = exec.run_cycle(&test_watch("w"), false).await;
        assert_eq!(report.outcome, CycleOutcome::Success);
        assert_eq!(report.notified, 1);
        assert_eq!(*notifier.sent.lock().unwrap(), vec!["ok"]);
    }

    #[tokio::test]
    async fn soft_fetch_failure_on_first_page_fails_cycle() {
        let fetcher = ScriptedFetcher::new(vec![Err(FetchError::Soft("HTTP 429".to_string()))]);
        let notifier = RecordingNotifier::new(0);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier, store, 1).await;

        let report = exec.run_cycle(&test_watch("w"), false).await;
        assert!(matches!(report.outcome, CycleOutcome::SoftFail(_)));
    }

    #[tokio::test]
    async fn soft_failure_on_later_page_keeps_earlier_listings() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(vec![listing("A", 10.0)]),
            Err(FetchError::Soft("HTTP 429".to_string())),
        ]);
        let notifier = RecordingNotifier::new(0);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier.clone(), store, 3).await;

        let report = exec.run_cycle(&test_watch("w"), false).await;
        assert_eq!(report.outcome, CycleOutcome::Success);
        assert_eq!(*notifier.sent.lock().unwrap(), vec!["A"]);
    }

    #[tokio::test]
    async fn fatal_fetch_failure_is_reported() {
        let fetcher = ScriptedFetcher::new(vec![Err(FetchError::Fatal("HTTP 400".to_string()))]);
        let notifier = RecordingNotifier::new(0);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier, store, 1).await;

        let report = exec.run_cycle(&test_watch("w"), false).await;
        assert!(matches!(report.outcome, CycleOutcome::FatalFail(_)));
    }

    #[tokio::test]
    async fn empty_result_is_a_normal_success() {
        let fetcher = ScriptedFetcher::new(vec![Ok(Vec::new())]);
        let notifier = RecordingNotifier::new(0);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier, store, 1).await;

        let report = exec.run_cycle(&test_watch("w"), false).await;
        assert_eq!(report.outcome, CycleOutcome::Success);
        assert_eq!(report.fetched, 0);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing_and_sends_nothing() {
        let fetcher = ScriptedFetcher::new(vec![Ok(vec![listing("A", 10.0)])]);
        let notifier = RecordingNotifier::new(0);
        let store = memory_store().await;
        let exec = executor(fetcher, notifier.clone(), store.clone(), 1).await;

        let report = exec.run_cycle(&test_watch("w"), true).await;
        assert_eq!(report.outcome, CycleOutcome::Success);
        assert_eq!(report.would_notify.len(), 1);
        assert_eq!(report.would_notify[0].listing_id, "A");
        assert!(notifier.sent.lock().unwrap().is_empty());
        assert!(!store.has("w", "A").await.unwrap());
    }
}
