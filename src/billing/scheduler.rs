use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::config;

use super::features::FeatureManager;
use super::store::PeriodReset;
use super::topup::{AutoTopUpService, TopUpBatchSummary};
use super::watchdog::{UsageWatchdog, WatchdogSummary};

/// Services driven by the billing background loops.
#[derive(Clone)]
pub struct BillingJobs {
    pub top_up: AutoTopUpService,
    pub features: FeatureManager,
    pub watchdog: UsageWatchdog,
    pub timezone: FixedOffset,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResetTickSummary {
    pub valves_reset: Option<u64>,
    pub counters_reset: Option<u64>,
}

// key: billing-scheduler -> top-up sweep,period resets,watchdog
pub fn spawn(jobs: BillingJobs) {
    spawn_loop(
        "auto top-up",
        *config::AUTO_TOPUP_SCAN_INTERVAL_SECS,
        jobs.clone(),
        |jobs, now| async move { process_topup_tick(&jobs, now).await.map(|_| ()) },
    );
    spawn_loop(
        "period reset",
        *config::VALVE_RESET_SCAN_INTERVAL_SECS,
        jobs.clone(),
        |jobs, now| async move { process_reset_tick(&jobs, now).await.map(|_| ()) },
    );
    spawn_loop(
        "usage watchdog",
        *config::USAGE_WATCHDOG_SCAN_INTERVAL_SECS,
        jobs,
        |jobs, now| async move { process_watchdog_tick(&jobs, now).await.map(|_| ()) },
    );
}

fn spawn_loop<F, Fut>(name: &'static str, interval_secs: u64, jobs: BillingJobs, tick: F)
where
    F: Fn(BillingJobs, DateTime<Utc>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(TokioDuration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            if let Err(err) = tick(jobs.clone(), Utc::now()).await {
                warn!(?err, job = name, "billing scheduler tick failed");
            }
        }
    });
}

pub async fn process_topup_tick(jobs: &BillingJobs, _now: DateTime<Utc>) -> Result<TopUpBatchSummary> {
    Ok(jobs.top_up.process_all_pending().await?)
}

/// Zeroes daily valve usage once per local day and top-up counters once per month.
/// A failed reset leaves its period unclaimed, so the next tick retries it.
pub async fn process_reset_tick(jobs: &BillingJobs, now: DateTime<Utc>) -> Result<ResetTickSummary> {
    let local = now.with_timezone(&jobs.timezone);
    let day = local.format("%Y-%m-%d").to_string();
    let month = local.format("%Y-%m").to_string();
    Ok(ResetTickSummary {
        valves_reset: run_reset(jobs, PeriodReset::DailyValveUsage, &day, now).await,
        counters_reset: run_reset(jobs, PeriodReset::MonthlyTopUpCounters, &month, now).await,
    })
}

async fn run_reset(
    jobs: &BillingJobs,
    reset: PeriodReset,
    period: &str,
    now: DateTime<Utc>,
) -> Option<u64> {
    match jobs.features.store().run_period_reset(reset, period, now).await {
        Ok(Some(count)) => {
            info!(job = reset.job(), period, count, "period reset applied");
            Some(count)
        }
        Ok(None) => {
            debug!(job = reset.job(), period, "period reset already claimed");
            None
        }
        Err(err) => {
            warn!(?err, job = reset.job(), period, "period reset failed; will retry");
            None
        }
    }
}

pub async fn process_watchdog_tick(jobs: &BillingJobs, now: DateTime<Utc>) -> Result<WatchdogSummary> {
    Ok(jobs.watchdog.check_all_wallets(now).await?)
}
