use async_trait::async_trait;

use crate::types::{MatchVerdict, RawListing, WatchDefinition};

/// The content-matching capability. A Reject drops the listing for this
/// cycle without marking it seen, so rejected listings stay eligible for
/// re-classification later.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, watch: &WatchDefinition, listing: &RawListing) -> MatchVerdict;
}

/// Rejects listings whose title contains any of the watch's exclude
/// keywords (case-insensitive). With no keywords configured everything is
/// accepted.
pub struct TitleKeywordClassifier;

#[async_trait]
impl Classifier for TitleKeywordClassifier {
    async fn classify(&self, watch: &WatchDefinition, listing: &RawListing) -> MatchVerdict {
        keyword_verdict(&watch.filters.exclude_keywords, &listing.title)
    }
}

fn keyword_verdict(exclude_keywords: &[String], title: &str) -> MatchVerdict {
    if exclude_keywords.is_empty() {
        return MatchVerdict::Accept;
    }
    let title = title.to_lowercase();
    for keyword in exclude_keywords {
        if !keyword.is_empty() && title.contains(&keyword.to_lowercase()) {
            return MatchVerdict::Reject;
        }
    }
    MatchVerdict::Accept
}
