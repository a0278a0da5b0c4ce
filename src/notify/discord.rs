use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::{Notifier, NotifyError};
use crate::types::NotificationEvent;

pub struct DiscordNotifier {
    client: reqwest::Client,
    disable_images: bool,
    timeout: Duration,
}

impl DiscordNotifier {
    pub fn new(disable_images: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            disable_images,
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let webhook = event
            .webhook
            .as_deref()
            .ok_or_else(|| NotifyError::InvalidTarget("no webhook configured".to_string()))?;
        if !webhook.starts_with("http") {
            return Err(NotifyError::InvalidTarget(format!("not a URL: {webhook}")));
        }

        let payload = WebhookPayload::for_listing(event, self.disable_images);

        let resp = self
            .client
            .post(webhook)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(format!("webhook request failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(NotifyError::Transport(format!("HTTP {status}")));
        }
        Err(NotifyError::Rejected(format!("HTTP {status}")))
    }
}

// ---------------------------------------------------------------------------
// Webhook payload
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WebhookPayload {
    content: Option<String>,
    embeds: Vec<Embed>,
}

#[derive(Serialize)]
struct Embed {
    title: String,
    description: String,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail: Option<EmbedThumbnail>,
}

#[derive(Serialize)]
struct EmbedThumbnail {
    url: String,
}

impl WebhookPayload {
    fn for_listing(event: &NotificationEvent, disable_images: bool) -> Self {
        let l = &event.listing;

        let mut lines = vec![format!(
            "**Price:** {:.2} {}",
            l.price_amount, l.price_currency
        )];
        if let Some(brand) = &l.brand {
            lines.push(format!("**Brand:** {brand}"));
        }
        if let Some(size) = &l.size {
            lines.push(format!("**Size:** {size}"));
        }
        if let Some(condition) = &l.condition {
            lines.push(format!("**Condition:** {condition}"));
        }
        if let Some(rating) = l.seller_rating {
            let feedback = l
                .seller_feedback_count
                .map(|c| format!(" ({c} reviews)"))
                .unwrap_or_default();
            lines.push(format!("**Seller:** {rating:.1}/5{feedback}"));
        }
        lines.push(format!("**Watch:** {}", event.watch_name));

        let thumbnail = if disable_images {
            None
        } else {
            l.thumbnail_url.clone().map(|url| EmbedThumbnail { url })
        };

        Self {
            content: None,
            embeds: vec![Embed {
                title: l.title.clone(),
                description: lines.join("\n"),
                url: l.url.clone(),
                thumbnail,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawListing;

    fn event(thumbnail: Option<&str>) -> NotificationEvent {
        NotificationEvent {
            watch_name: "jackets".to_string(),
            listing: RawListing {
                listing_id: "1".to_string(),
                title: "Leather jacket".to_string(),
                price_amount: 45.5,
                price_currency: "EUR".to_string(),
                url: "https://www.vinted.de/items/1".to_string(),
                thumbnail_url: thumbnail.map(str::to_string),
                brand: Some("Zara".to_string()),
                size: None,
                condition: None,
                seller_rating: Some(4.8),
                seller_feedback_count: Some(120),
                observed_at: 0,
            },
            webhook: Some("https://discord.example/webhook".to_string()),
        }
    }

    #[test]
    fn embed_carries_price_and_seller() {
        let payload = WebhookPayload::for_listing(&event(Some("https://img/1.jpg")), false);
        let embed = &payload.embeds[0];
        assert_eq!(embed.title, "Leather jacket");
        assert!(embed.description.contains("45.50 EUR"));
        assert!(embed.description.contains("4.8/5 (120 reviews)"));
        assert!(embed.thumbnail.is_some());
    }

    #[test]
    fn disable_images_drops_thumbnail() {
        let payload = WebhookPayload::for_listing(&event(Some("https://img/1.jpg")), true);
        assert!(payload.embeds[0].thumbnail.is_none());
    }

    #[tokio::test]
    async fn missing_webhook_is_invalid_target() {
        let notifier = DiscordNotifier::new(false);
        let mut ev = event(None);
        ev.webhook = None;
        let err = notifier.send(&ev).await.unwrap_err();
        assert!(matches!(err, NotifyError::InvalidTarget(_)));
    }
}
