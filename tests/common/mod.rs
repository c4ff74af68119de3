#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;

use wellness_backend::billing::models::{
    AutoTopUpSettings, CreditRateCard, CreditTransaction, CreditWallet, FeatureKey, FeatureValve,
    TransactionType, ValveChange, WalletTier,
};
use wellness_backend::billing::{
    BillingStore, LedgerEntry, LedgerWrite, MemoryBillingStore, PaymentFailed, PaymentGateway,
    PaymentReceipt, PeriodReset, TimeRange,
};
use wellness_backend::db::{StoreError, StoreResult};
use wellness_backend::moderation::{ContentRegistry, MemoryModerationStore, ModerationStore};
use wellness_backend::notifications::{NotificationCategory, NotificationSink};
use wellness_backend::organizations::{MemberRole, StaticOrganizationDirectory};
use wellness_backend::{Collaborators, Platform};

pub const ORG: i32 = 1;
pub const ADMIN: i32 = 10;
pub const SUPERVISOR: i32 = 20;

#[derive(Debug, Clone)]
pub struct SentNotification {
    pub user_id: i32,
    pub category: NotificationCategory,
    pub event_key: String,
    pub payload: Value,
}

#[derive(Default)]
pub struct RecordingNotificationSink {
    sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotificationSink {
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().clone()
    }

    pub fn events_for(&self, user_id: i32) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|sent| sent.user_id == user_id)
            .map(|sent| sent.event_key.clone())
            .collect()
    }

    pub fn count(&self, event_key: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|sent| sent.event_key == event_key)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn notify(
        &self,
        user_id: i32,
        category: NotificationCategory,
        event_key: &str,
        payload: Value,
    ) -> anyhow::Result<()> {
        self.sent.lock().push(SentNotification {
            user_id,
            category,
            event_key: event_key.to_string(),
            payload,
        });
        Ok(())
    }
}

/// Gateway with a switchable card on file and charge outcome.
pub struct FakePaymentGateway {
    has_method: AtomicBool,
    succeed: AtomicBool,
    yields: AtomicBool,
    charges: AtomicUsize,
    charged: Mutex<Vec<(i32, Decimal)>>,
}

impl FakePaymentGateway {
    pub fn approving() -> Self {
        Self {
            has_method: AtomicBool::new(true),
            succeed: AtomicBool::new(true),
            yields: AtomicBool::new(false),
            charges: AtomicUsize::new(0),
            charged: Mutex::new(Vec::new()),
        }
    }

    pub fn declining() -> Self {
        let gateway = Self::approving();
        gateway.succeed.store(false, Ordering::SeqCst);
        gateway
    }

    pub fn without_card() -> Self {
        let gateway = Self::approving();
        gateway.has_method.store(false, Ordering::SeqCst);
        gateway
    }

    /// Every gateway call yields to the scheduler once, like a network round trip.
    pub fn yielding(self) -> Self {
        self.yields.store(true, Ordering::SeqCst);
        self
    }

    async fn round_trip(&self) {
        if self.yields.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn charge_attempts(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }

    pub fn charged(&self) -> Vec<(i32, Decimal)> {
        self.charged.lock().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakePaymentGateway {
    async fn has_payment_method(&self, _organization_id: i32) -> anyhow::Result<bool> {
        self.round_trip().await;
        Ok(self.has_method.load(Ordering::SeqCst))
    }

    async fn charge_customer(
        &self,
        organization_id: i32,
        dollars: Decimal,
    ) -> Result<PaymentReceipt, PaymentFailed> {
        self.round_trip().await;
        let attempt = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.succeed.load(Ordering::SeqCst) {
            let mut failure = PaymentFailed::new("card declined");
            failure.decline_code = Some("insufficient_funds".into());
            return Err(failure);
        }
        self.charged.lock().push((organization_id, dollars));
        Ok(PaymentReceipt {
            charge_id: format!("ch_test_{attempt}"),
            amount: dollars,
        })
    }
}

fn injected(detail: &str) -> StoreError {
    StoreError::Corrupt {
        table: "injected",
        detail: detail.to_string(),
    }
}

/// Memory store that fails on demand.
#[derive(Default)]
pub struct FlakyBillingStore {
    inner: MemoryBillingStore,
    /// Ledger writes that commit and then report an error.
    lost_acks: AtomicUsize,
    failing_resets: AtomicBool,
}

impl FlakyBillingStore {
    pub fn lose_next_acks(&self, count: usize) {
        self.lost_acks.store(count, Ordering::SeqCst);
    }

    pub fn fail_resets(&self, failing: bool) {
        self.failing_resets.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingStore for FlakyBillingStore {
    async fn find_wallet(&self, organization_id: i32) -> StoreResult<Option<CreditWallet>> {
        self.inner.find_wallet(organization_id).await
    }

    async fn ensure_wallet(&self, organization_id: i32) -> StoreResult<CreditWallet> {
        self.inner.ensure_wallet(organization_id).await
    }

    async fn list_wallets(&self) -> StoreResult<Vec<CreditWallet>> {
        self.inner.list_wallets().await
    }

    async fn apply_entry(
        &self,
        organization_id: i32,
        entry: LedgerEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerWrite> {
        let write = self.inner.apply_entry(organization_id, entry, now).await?;
        let lost = self
            .lost_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if lost {
            return Err(injected("connection reset after commit"));
        }
        Ok(write)
    }

    async fn set_grace_period(
        &self,
        organization_id: i32,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<CreditWallet> {
        self.inner.set_grace_period(organization_id, until).await
    }

    async fn save_auto_topup(
        &self,
        organization_id: i32,
        settings: &AutoTopUpSettings,
    ) -> StoreResult<CreditWallet> {
        self.inner.save_auto_topup(organization_id, settings).await
    }

    async fn record_auto_topup(&self, organization_id: i32) -> StoreResult<Option<CreditWallet>> {
        self.inner.record_auto_topup(organization_id).await
    }

    async fn release_auto_topup(&self, organization_id: i32) -> StoreResult<CreditWallet> {
        self.inner.release_auto_topup(organization_id).await
    }

    async fn set_tier(&self, organization_id: i32, tier: WalletTier) -> StoreResult<CreditWallet> {
        self.inner.set_tier(organization_id, tier).await
    }

    async fn lifetime_purchased(&self, organization_id: i32) -> StoreResult<Decimal> {
        self.inner.lifetime_purchased(organization_id).await
    }

    async fn transactions(
        &self,
        organization_id: i32,
        range: TimeRange,
    ) -> StoreResult<Vec<CreditTransaction>> {
        self.inner.transactions(organization_id, range).await
    }

    async fn latest_transaction(
        &self,
        organization_id: i32,
        transaction_type: TransactionType,
    ) -> StoreResult<Option<CreditTransaction>> {
        self.inner
            .latest_transaction(organization_id, transaction_type)
            .await
    }

    async fn usage_by_organization(&self, range: TimeRange) -> StoreResult<Vec<(i32, Decimal)>> {
        self.inner.usage_by_organization(range).await
    }

    async fn active_rate_card(&self, action_type: &str) -> StoreResult<Option<CreditRateCard>> {
        self.inner.active_rate_card(action_type).await
    }

    async fn publish_rate_card(
        &self,
        action_type: &str,
        credit_cost: Decimal,
        vendor_cost: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<CreditRateCard> {
        self.inner
            .publish_rate_card(action_type, credit_cost, vendor_cost, now)
            .await
    }

    async fn active_rate_cards(&self) -> StoreResult<Vec<CreditRateCard>> {
        self.inner.active_rate_cards().await
    }

    async fn find_valve(
        &self,
        organization_id: i32,
        feature: FeatureKey,
    ) -> StoreResult<Option<FeatureValve>> {
        self.inner.find_valve(organization_id, feature).await
    }

    async fn list_valves(&self, organization_id: i32) -> StoreResult<Vec<FeatureValve>> {
        self.inner.list_valves(organization_id).await
    }

    async fn upsert_valve(
        &self,
        change: &ValveChange,
        now: DateTime<Utc>,
    ) -> StoreResult<FeatureValve> {
        self.inner.upsert_valve(change, now).await
    }

    async fn increment_valve_usage(
        &self,
        organization_id: i32,
        feature: FeatureKey,
        by: i64,
    ) -> StoreResult<Option<FeatureValve>> {
        self.inner
            .increment_valve_usage(organization_id, feature, by)
            .await
    }

    async fn reset_valve_usage(&self) -> StoreResult<u64> {
        self.inner.reset_valve_usage().await
    }

    async fn claim_sweep(&self, job: &str, period: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        self.inner.claim_sweep(job, period, now).await
    }

    async fn run_period_reset(
        &self,
        reset: PeriodReset,
        period: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<u64>> {
        if self.failing_resets.load(Ordering::SeqCst) {
            return Err(injected("reset rolled back"));
        }
        self.inner.run_period_reset(reset, period, now).await
    }
}

pub struct TestPlatform {
    pub platform: Platform,
    pub notifier: Arc<RecordingNotificationSink>,
    pub gateway: Arc<FakePaymentGateway>,
    pub directory: Arc<StaticOrganizationDirectory>,
    pub content: ContentRegistry,
}

pub fn platform_with(gateway: FakePaymentGateway) -> TestPlatform {
    platform_on(
        Arc::new(MemoryBillingStore::new()),
        Arc::new(MemoryModerationStore::new()),
        gateway,
    )
}

/// Test collaborators wired around the given stores.
pub fn platform_on(
    billing: Arc<dyn BillingStore>,
    moderation: Arc<dyn ModerationStore>,
    gateway: FakePaymentGateway,
) -> TestPlatform {
    let notifier = Arc::new(RecordingNotificationSink::default());
    let gateway = Arc::new(gateway);
    let directory = Arc::new(
        StaticOrganizationDirectory::new()
            .with_member(ORG, ADMIN, MemberRole::Admin)
            .with_member(ORG, SUPERVISOR, MemberRole::Supervisor),
    );
    let content = ContentRegistry::new();
    let platform = Platform::assemble(
        billing,
        moderation,
        Collaborators {
            gateway: gateway.clone(),
            notifier: notifier.clone(),
            directory: directory.clone(),
            content: content.clone(),
        },
    );
    TestPlatform {
        platform,
        notifier,
        gateway,
        directory,
        content,
    }
}

pub fn platform() -> TestPlatform {
    platform_with(FakePaymentGateway::approving())
}

pub fn credits(value: i64) -> Decimal {
    Decimal::from(value)
}
