use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, warn};

pub const SIGNATURE_HEADER: &str = "x-wellness-signature";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    Billing,
    Moderation,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::Billing => "billing",
            NotificationCategory::Moderation => "moderation",
        }
    }
}

// key: notification-sink -> fire-and-forget user notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        user_id: i32,
        category: NotificationCategory,
        event_key: &str,
        payload: Value,
    ) -> Result<()>;
}

/// Delivers to every recipient and logs failures. State changes that triggered
/// the notification are already committed, so nothing is propagated.
pub async fn dispatch(
    sink: &dyn NotificationSink,
    recipients: &[i32],
    category: NotificationCategory,
    event_key: &str,
    payload: &Value,
) -> usize {
    let mut delivered = 0;
    for user_id in recipients {
        match sink
            .notify(*user_id, category, event_key, payload.clone())
            .await
        {
            Ok(()) => delivered += 1,
            Err(err) => warn!(
                user_id,
                category = category.as_str(),
                event_key,
                error = %err,
                "notification delivery failed"
            ),
        }
    }
    delivered
}

/// Writes notifications to the log. Used when no webhook is configured.
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(
        &self,
        user_id: i32,
        category: NotificationCategory,
        event_key: &str,
        payload: Value,
    ) -> Result<()> {
        info!(
            user_id,
            category = category.as_str(),
            event_key,
            %payload,
            "notification"
        );
        Ok(())
    }
}

/// Posts each notification as JSON, signed with HMAC-SHA256 when a secret is set.
pub struct WebhookNotificationSink {
    url: String,
    secret: Option<String>,
    client: Client,
}

impl WebhookNotificationSink {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            url: url.into(),
            secret,
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }
}

pub fn sign_payload(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .context("invalid notification signing key")?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait]
impl NotificationSink for WebhookNotificationSink {
    async fn notify(
        &self,
        user_id: i32,
        category: NotificationCategory,
        event_key: &str,
        payload: Value,
    ) -> Result<()> {
        let body = serde_json::to_vec(&json!({
            "user_id": user_id,
            "category": category,
            "event": event_key,
            "payload": payload,
            "sent_at": Utc::now(),
        }))?;
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body)?);
        }
        request
            .body(body)
            .send()
            .await
            .context("notification webhook unreachable")?
            .error_for_status()
            .context("notification webhook rejected event")?;
        Ok(())
    }
}

/// Picks the webhook sink when configured, otherwise logs.
pub fn from_config() -> Arc<dyn NotificationSink> {
    match crate::config::NOTIFICATION_WEBHOOK_URL.as_deref() {
        Some(url) => Arc::new(WebhookNotificationSink::new(
            url,
            crate::config::NOTIFICATION_WEBHOOK_SECRET.clone(),
        )),
        None => Arc::new(TracingNotificationSink),
    }
}
