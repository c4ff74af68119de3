use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::error::BillingResult;
use super::models::{CreditTransaction, CreditWallet, TransactionType};
use super::store::{BillingStore, TimeRange};
use crate::config;
use crate::notifications::{dispatch, NotificationCategory, NotificationSink};
use crate::organizations::OrganizationDirectory;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Critical,
    Low,
    Spike,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Critical => "critical",
            AlertKind::Low => "low",
            AlertKind::Spike => "spike",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageAlert {
    pub kind: AlertKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletHealth {
    pub organization_id: i32,
    pub balance: Decimal,
    /// Size of a typical refill; balance alerts are relative to it.
    pub capacity: Decimal,
    pub daily_burn: Decimal,
    pub average_daily_burn: Decimal,
    pub forecast_depletion: Option<DateTime<Utc>>,
    pub alerts: Vec<UsageAlert>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageBreakdownEntry {
    pub action_type: String,
    pub credits: Decimal,
    pub transactions: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub credits: Decimal,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConsumerUsage {
    pub organization_id: i32,
    pub credits: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct WatchdogSummary {
    pub checked: usize,
    pub alerts_sent: usize,
    pub failed: usize,
}

// key: usage-watchdog -> burn rate,forecast,alerts
#[derive(Clone)]
pub struct UsageWatchdog {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn NotificationSink>,
    directory: Arc<dyn OrganizationDirectory>,
    timezone: FixedOffset,
}

impl UsageWatchdog {
    pub fn new(
        store: Arc<dyn BillingStore>,
        notifier: Arc<dyn NotificationSink>,
        directory: Arc<dyn OrganizationDirectory>,
    ) -> Self {
        Self {
            store,
            notifier,
            directory,
            timezone: *config::REPORTING_TIMEZONE,
        }
    }

    pub fn with_timezone(mut self, timezone: FixedOffset) -> Self {
        self.timezone = timezone;
        self
    }

    fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.timezone).date_naive()
    }

    /// UTC instant of local midnight starting `day`.
    fn day_start(&self, day: NaiveDate) -> DateTime<Utc> {
        let local_midnight = day.and_time(NaiveTime::MIN);
        let offset = Duration::seconds(i64::from(self.timezone.local_minus_utc()));
        Utc.from_utc_datetime(&(local_midnight - offset))
    }

    async fn consumed(&self, organization_id: i32, range: TimeRange) -> BillingResult<Decimal> {
        let transactions = self.store.transactions(organization_id, range).await?;
        Ok(transactions.iter().map(CreditTransaction::consumed).sum())
    }

    /// Credits consumed during the current local calendar day.
    pub async fn calculate_daily_burn(
        &self,
        organization_id: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<Decimal> {
        let start = self.day_start(self.local_date(now));
        self.consumed(
            organization_id,
            TimeRange {
                start: Some(start),
                end: None,
            },
        )
        .await
    }

    /// Mean daily consumption over the `days` complete days before today.
    pub async fn average_daily_burn(
        &self,
        organization_id: i32,
        days: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Decimal> {
        if days <= 0 {
            return Ok(Decimal::ZERO);
        }
        let today = self.local_date(now);
        let range = TimeRange::between(
            self.day_start(today - Duration::days(days)),
            self.day_start(today),
        );
        let total = self.consumed(organization_id, range).await?;
        Ok(total / Decimal::from(days))
    }

    /// Most recent purchase, else what one auto top-up would add.
    async fn capacity(&self, wallet: &CreditWallet) -> BillingResult<Decimal> {
        let purchase = self
            .store
            .latest_transaction(wallet.organization_id, TransactionType::Purchase)
            .await?;
        Ok(match purchase {
            Some(transaction) => transaction.amount,
            None => wallet.tier.credits_for_dollars(wallet.auto_topup_amount),
        })
    }

    pub async fn forecast_depletion(
        &self,
        organization_id: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<DateTime<Utc>>> {
        let wallet = self.store.ensure_wallet(organization_id).await?;
        let burn = self
            .average_daily_burn(organization_id, config::FORECAST_WINDOW_DAYS, now)
            .await?;
        Ok(depletion_at(wallet.balance, burn, now))
    }

    pub async fn check_health(
        &self,
        organization_id: i32,
        now: DateTime<Utc>,
    ) -> BillingResult<WalletHealth> {
        let wallet = self.store.ensure_wallet(organization_id).await?;
        let capacity = self.capacity(&wallet).await?;
        let daily_burn = self.calculate_daily_burn(organization_id, now).await?;
        let average = self
            .average_daily_burn(organization_id, config::SPIKE_BASELINE_DAYS, now)
            .await?;
        let forecast_burn = self
            .average_daily_burn(organization_id, config::FORECAST_WINDOW_DAYS, now)
            .await?;

        Ok(WalletHealth {
            organization_id,
            balance: wallet.balance,
            capacity,
            daily_burn,
            average_daily_burn: average,
            forecast_depletion: depletion_at(wallet.balance, forecast_burn, now),
            alerts: evaluate_alerts(wallet.balance, capacity, daily_burn, average),
        })
    }

    /// Checks every wallet and notifies admins of new alerts, at most once per alert kind
    /// per organization per day.
    pub async fn check_all_wallets(&self, now: DateTime<Utc>) -> BillingResult<WatchdogSummary> {
        let wallets = self.store.list_wallets().await?;
        let period = self.local_date(now).to_string();
        let mut summary = WatchdogSummary::default();

        for wallet in wallets {
            let organization_id = wallet.organization_id;
            summary.checked += 1;
            let health = match self.check_health(organization_id, now).await {
                Ok(health) => health,
                Err(err) => {
                    summary.failed += 1;
                    warn!(organization_id, error = %err, "wallet health check failed");
                    continue;
                }
            };
            for alert in &health.alerts {
                let job = format!("usage_alert:{organization_id}:{}", alert.kind.as_str());
                match self.store.claim_sweep(&job, &period, now).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        warn!(organization_id, error = %err, "alert dedupe claim failed");
                        continue;
                    }
                }
                let admins = match self.directory.admins(organization_id).await {
                    Ok(admins) => admins,
                    Err(err) => {
                        warn!(organization_id, error = %err, "admin lookup failed");
                        continue;
                    }
                };
                let payload = json!({
                    "organization_id": organization_id,
                    "kind": alert.kind,
                    "message": alert.message,
                    "balance": health.balance,
                    "daily_burn": health.daily_burn,
                    "forecast_depletion": health.forecast_depletion,
                });
                dispatch(
                    self.notifier.as_ref(),
                    &admins,
                    NotificationCategory::Billing,
                    &format!("usage_alert_{}", alert.kind.as_str()),
                    &payload,
                )
                .await;
                summary.alerts_sent += 1;
            }
        }

        info!(
            checked = summary.checked,
            alerts = summary.alerts_sent,
            failed = summary.failed,
            "usage watchdog sweep finished"
        );
        Ok(summary)
    }

    /// Consumption grouped by action type, largest first.
    pub async fn get_usage_breakdown(
        &self,
        organization_id: i32,
        range: TimeRange,
    ) -> BillingResult<Vec<UsageBreakdownEntry>> {
        let transactions = self.store.transactions(organization_id, range).await?;
        let mut grouped: BTreeMap<String, (Decimal, usize)> = BTreeMap::new();
        for transaction in transactions
            .iter()
            .filter(|transaction| transaction.transaction_type == TransactionType::Usage)
        {
            let key = transaction
                .action_type
                .clone()
                .unwrap_or_else(|| "unclassified".to_string());
            let slot = grouped.entry(key).or_default();
            slot.0 += transaction.consumed();
            slot.1 += 1;
        }
        let mut breakdown: Vec<_> = grouped
            .into_iter()
            .map(|(action_type, (credits, transactions))| UsageBreakdownEntry {
                action_type,
                credits,
                transactions,
            })
            .collect();
        breakdown.sort_by(|left, right| right.credits.cmp(&left.credits));
        Ok(breakdown)
    }

    /// One entry per local day for the last `days` days including today, oldest first.
    /// Days without usage are reported as zero.
    pub async fn get_daily_trend(
        &self,
        organization_id: i32,
        days: i64,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<DailyUsage>> {
        let days = days.max(1);
        let today = self.local_date(now);
        let first = today - Duration::days(days - 1);
        let transactions = self
            .store
            .transactions(
                organization_id,
                TimeRange {
                    start: Some(self.day_start(first)),
                    end: None,
                },
            )
            .await?;

        let mut totals: BTreeMap<NaiveDate, Decimal> = (0..days)
            .map(|offset| (first + Duration::days(offset), Decimal::ZERO))
            .collect();
        for transaction in &transactions {
            if let Some(total) = totals.get_mut(&self.local_date(transaction.created_at)) {
                *total += transaction.consumed();
            }
        }
        Ok(totals
            .into_iter()
            .map(|(date, credits)| DailyUsage { date, credits })
            .collect())
    }

    pub async fn get_top_consumers(
        &self,
        range: TimeRange,
        limit: usize,
    ) -> BillingResult<Vec<ConsumerUsage>> {
        let usage = self.store.usage_by_organization(range).await?;
        Ok(usage
            .into_iter()
            .take(limit)
            .map(|(organization_id, credits)| ConsumerUsage {
                organization_id,
                credits,
            })
            .collect())
    }
}

fn ratio(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// Balance alerts compare with `<=`, spikes with `>`. Critical supersedes low.
pub fn evaluate_alerts(
    balance: Decimal,
    capacity: Decimal,
    daily_burn: Decimal,
    average_daily_burn: Decimal,
) -> Vec<UsageAlert> {
    let mut alerts = Vec::new();
    if capacity > Decimal::ZERO {
        if balance <= capacity * ratio(config::CRITICAL_BALANCE_RATIO) {
            alerts.push(UsageAlert {
                kind: AlertKind::Critical,
                message: format!("Credit balance is critically low ({balance} remaining)"),
            });
        } else if balance <= capacity * ratio(config::LOW_BALANCE_RATIO) {
            alerts.push(UsageAlert {
                kind: AlertKind::Low,
                message: format!("Credit balance is running low ({balance} remaining)"),
            });
        }
    }
    if average_daily_burn > Decimal::ZERO
        && daily_burn > average_daily_burn * ratio(config::SPIKE_BURN_MULTIPLIER)
    {
        alerts.push(UsageAlert {
            kind: AlertKind::Spike,
            message: format!(
                "Usage today ({daily_burn}) is far above the daily average ({})",
                average_daily_burn.round_dp(2)
            ),
        });
    }
    alerts
}

/// `now + balance / burn` days; `None` when nothing is burning or nothing is left.
pub fn depletion_at(balance: Decimal, daily_burn: Decimal, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if daily_burn <= Decimal::ZERO || balance <= Decimal::ZERO {
        return None;
    }
    let days = (balance / daily_burn).to_f64()?;
    let seconds = (days * 86_400.0).round();
    if !seconds.is_finite() || seconds > i64::MAX as f64 / 1_000.0 {
        return None;
    }
    now.checked_add_signed(Duration::seconds(seconds as i64))
}
