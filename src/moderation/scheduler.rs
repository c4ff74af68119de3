use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::{self, Duration as TokioDuration};
use tracing::warn;

use crate::config;

use super::queue::{EscalationSummary, ModerationQueueService};

// key: moderation-scheduler -> overdue escalation sweep
pub fn spawn(queue: ModerationQueueService) {
    tokio::spawn(async move {
        let mut ticker = time::interval(TokioDuration::from_secs(
            *config::MODERATION_ESCALATION_SCAN_INTERVAL_SECS,
        ));
        loop {
            ticker.tick().await;
            if let Err(err) = process_escalation_tick(&queue, Utc::now()).await {
                warn!(?err, "moderation escalation tick failed");
            }
        }
    });
}

pub async fn process_escalation_tick(
    queue: &ModerationQueueService,
    now: DateTime<Utc>,
) -> Result<EscalationSummary> {
    Ok(queue.escalate_overdue_items(now).await?)
}
