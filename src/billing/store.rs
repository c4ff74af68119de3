use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::{
    AutoTopUpSettings, CreditRateCard, CreditTransaction, CreditWallet, FeatureKey, FeatureValve,
    TransactionType, ValveChange, WalletTier,
};
use super::wallet::{settle, LedgerEntry, LedgerWrite};
use crate::db::StoreResult;

/// Half-open `[start, end)` window over transaction timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| at >= start) && self.end.map_or(true, |end| at < end)
    }
}

/// Resets the scheduler applies once per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodReset {
    /// Daily valve usage, claimed per local day.
    DailyValveUsage,
    /// Monthly auto top-up counters, claimed per local month.
    MonthlyTopUpCounters,
}

impl PeriodReset {
    pub fn job(&self) -> &'static str {
        match self {
            PeriodReset::DailyValveUsage => "valve_reset",
            PeriodReset::MonthlyTopUpCounters => "auto_topup_counter_reset",
        }
    }
}

// key: billing-store -> persistence seam for the credit ledger
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn find_wallet(&self, organization_id: i32) -> StoreResult<Option<CreditWallet>>;
    /// Returns the organization's wallet, creating an empty one on first use.
    async fn ensure_wallet(&self, organization_id: i32) -> StoreResult<CreditWallet>;
    async fn list_wallets(&self) -> StoreResult<Vec<CreditWallet>>;
    /// Locks the wallet, settles the entry, updates the balance and appends the
    /// transaction as one atomic step.
    async fn apply_entry(
        &self,
        organization_id: i32,
        entry: LedgerEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerWrite>;
    async fn set_grace_period(
        &self,
        organization_id: i32,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<CreditWallet>;
    async fn save_auto_topup(
        &self,
        organization_id: i32,
        settings: &AutoTopUpSettings,
    ) -> StoreResult<CreditWallet>;
    /// Takes one of this month's top-up slots. `None` when the counter already
    /// reached the monthly limit; the check and increment are one atomic step.
    async fn record_auto_topup(&self, organization_id: i32) -> StoreResult<Option<CreditWallet>>;
    /// Hands back a slot taken for a charge that never went through.
    async fn release_auto_topup(&self, organization_id: i32) -> StoreResult<CreditWallet>;
    async fn set_tier(&self, organization_id: i32, tier: WalletTier) -> StoreResult<CreditWallet>;
    async fn lifetime_purchased(&self, organization_id: i32) -> StoreResult<Decimal>;
    /// Transactions in creation order.
    async fn transactions(
        &self,
        organization_id: i32,
        range: TimeRange,
    ) -> StoreResult<Vec<CreditTransaction>>;
    async fn latest_transaction(
        &self,
        organization_id: i32,
        transaction_type: TransactionType,
    ) -> StoreResult<Option<CreditTransaction>>;
    /// Consumed credits per organization, largest first.
    async fn usage_by_organization(&self, range: TimeRange) -> StoreResult<Vec<(i32, Decimal)>>;
    async fn active_rate_card(&self, action_type: &str) -> StoreResult<Option<CreditRateCard>>;
    /// Deactivates the current rate for the action and inserts the new active row.
    async fn publish_rate_card(
        &self,
        action_type: &str,
        credit_cost: Decimal,
        vendor_cost: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<CreditRateCard>;
    async fn active_rate_cards(&self) -> StoreResult<Vec<CreditRateCard>>;
    async fn find_valve(
        &self,
        organization_id: i32,
        feature: FeatureKey,
    ) -> StoreResult<Option<FeatureValve>>;
    async fn list_valves(&self, organization_id: i32) -> StoreResult<Vec<FeatureValve>>;
    async fn upsert_valve(&self, change: &ValveChange, now: DateTime<Utc>)
        -> StoreResult<FeatureValve>;
    async fn increment_valve_usage(
        &self,
        organization_id: i32,
        feature: FeatureKey,
        by: i64,
    ) -> StoreResult<Option<FeatureValve>>;
    /// Zeroes `daily_usage` on every valve that carries a daily limit.
    async fn reset_valve_usage(&self) -> StoreResult<u64>;
    /// Records that `job` ran for `period`; returns false when another run already claimed it.
    async fn claim_sweep(&self, job: &str, period: &str, now: DateTime<Utc>) -> StoreResult<bool>;
    /// Claims `period` for the reset and applies it in one transaction. `None` when the
    /// period was already claimed; a failed reset leaves the period unclaimed.
    async fn run_period_reset(
        &self,
        reset: PeriodReset,
        period: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<u64>>;
}

#[derive(Default)]
struct BillingState {
    wallets: HashMap<i32, CreditWallet>,
    transactions: Vec<CreditTransaction>,
    rate_cards: Vec<CreditRateCard>,
    valves: HashMap<(i32, FeatureKey), FeatureValve>,
    sweeps: HashSet<(String, String)>,
}

impl BillingState {
    fn wallet_mut(&mut self, organization_id: i32, now: DateTime<Utc>) -> &mut CreditWallet {
        self.wallets
            .entry(organization_id)
            .or_insert_with(|| CreditWallet::new(organization_id, now))
    }

    fn reset_valve_usage(&mut self) -> u64 {
        let mut reset = 0;
        for valve in self
            .valves
            .values_mut()
            .filter(|valve| valve.daily_limit.is_some())
        {
            valve.daily_usage = 0;
            reset += 1;
        }
        reset
    }

    fn reset_auto_topup_counts(&mut self) -> u64 {
        let mut reset = 0;
        for wallet in self.wallets.values_mut() {
            if wallet.auto_topup_count_this_month != 0 {
                wallet.auto_topup_count_this_month = 0;
                reset += 1;
            }
        }
        reset
    }
}

/// In-memory [`BillingStore`]. One lock guards all state, so every write is atomic.
#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<BillingState>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_wallet<F>(&self, organization_id: i32, apply: F) -> CreditWallet
    where
        F: FnOnce(&mut CreditWallet),
    {
        let now = Utc::now();
        let mut state = self.state.lock();
        let wallet = state.wallet_mut(organization_id, now);
        apply(wallet);
        wallet.updated_at = now;
        wallet.clone()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn find_wallet(&self, organization_id: i32) -> StoreResult<Option<CreditWallet>> {
        Ok(self.state.lock().wallets.get(&organization_id).cloned())
    }

    async fn ensure_wallet(&self, organization_id: i32) -> StoreResult<CreditWallet> {
        let mut state = self.state.lock();
        Ok(state.wallet_mut(organization_id, Utc::now()).clone())
    }

    async fn list_wallets(&self) -> StoreResult<Vec<CreditWallet>> {
        let state = self.state.lock();
        let mut wallets: Vec<_> = state.wallets.values().cloned().collect();
        wallets.sort_by_key(|wallet| wallet.organization_id);
        Ok(wallets)
    }

    async fn apply_entry(
        &self,
        organization_id: i32,
        entry: LedgerEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerWrite> {
        let mut state = self.state.lock();

        if let Some(key) = entry.idempotency_key.as_deref() {
            let settled = state.transactions.iter().find(|transaction| {
                transaction.organization_id == organization_id
                    && transaction.idempotency_key.as_deref() == Some(key)
            });
            if let Some(transaction) = settled {
                return Ok(LedgerWrite::Replayed(transaction.clone()));
            }
        }

        let sequence = state.transactions.len() as i64 + 1;
        let wallet = state.wallet_mut(organization_id, now);
        let settlement = match settle(wallet, &entry, now) {
            Ok(settlement) => settlement,
            Err((required, available)) => {
                return Ok(LedgerWrite::Rejected {
                    required,
                    available,
                })
            }
        };
        wallet.balance = settlement.balance_after;
        wallet.updated_at = now;
        let wallet_id = wallet.id;

        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            sequence,
            organization_id,
            wallet_id,
            transaction_type: entry.transaction_type,
            amount: settlement.effect,
            action_type: entry.action_type,
            description: entry.description,
            balance_after: settlement.balance_after,
            metadata: settlement.metadata,
            user_id: entry.user_id,
            idempotency_key: entry.idempotency_key,
            created_at: now,
        };
        state.transactions.push(transaction.clone());
        Ok(LedgerWrite::Applied(transaction))
    }

    async fn set_grace_period(
        &self,
        organization_id: i32,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<CreditWallet> {
        Ok(self.update_wallet(organization_id, |wallet| wallet.grace_period_until = until))
    }

    async fn save_auto_topup(
        &self,
        organization_id: i32,
        settings: &AutoTopUpSettings,
    ) -> StoreResult<CreditWallet> {
        Ok(self.update_wallet(organization_id, |wallet| {
            wallet.auto_topup_enabled = settings.enabled;
            wallet.auto_topup_threshold = settings.threshold;
            wallet.auto_topup_amount = settings.amount;
            wallet.auto_topup_monthly_limit = settings.monthly_limit;
        }))
    }

    async fn record_auto_topup(&self, organization_id: i32) -> StoreResult<Option<CreditWallet>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let wallet = state.wallet_mut(organization_id, now);
        if !wallet.can_auto_top_up() {
            return Ok(None);
        }
        wallet.auto_topup_count_this_month += 1;
        wallet.updated_at = now;
        Ok(Some(wallet.clone()))
    }

    async fn release_auto_topup(&self, organization_id: i32) -> StoreResult<CreditWallet> {
        Ok(self.update_wallet(organization_id, |wallet| {
            wallet.auto_topup_count_this_month = (wallet.auto_topup_count_this_month - 1).max(0)
        }))
    }

    async fn set_tier(&self, organization_id: i32, tier: WalletTier) -> StoreResult<CreditWallet> {
        Ok(self.update_wallet(organization_id, |wallet| wallet.tier = tier))
    }

    async fn lifetime_purchased(&self, organization_id: i32) -> StoreResult<Decimal> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .iter()
            .filter(|transaction| {
                transaction.organization_id == organization_id
                    && transaction.transaction_type == TransactionType::Purchase
            })
            .map(|transaction| transaction.amount)
            .sum())
    }

    async fn transactions(
        &self,
        organization_id: i32,
        range: TimeRange,
    ) -> StoreResult<Vec<CreditTransaction>> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .iter()
            .filter(|transaction| {
                transaction.organization_id == organization_id
                    && range.contains(transaction.created_at)
            })
            .cloned()
            .collect())
    }

    async fn latest_transaction(
        &self,
        organization_id: i32,
        transaction_type: TransactionType,
    ) -> StoreResult<Option<CreditTransaction>> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .iter()
            .rev()
            .find(|transaction| {
                transaction.organization_id == organization_id
                    && transaction.transaction_type == transaction_type
            })
            .cloned())
    }

    async fn usage_by_organization(&self, range: TimeRange) -> StoreResult<Vec<(i32, Decimal)>> {
        let state = self.state.lock();
        let mut totals: BTreeMap<i32, Decimal> = BTreeMap::new();
        for transaction in state
            .transactions
            .iter()
            .filter(|transaction| range.contains(transaction.created_at))
        {
            if transaction.transaction_type == TransactionType::Usage {
                *totals.entry(transaction.organization_id).or_default() += transaction.consumed();
            }
        }
        let mut totals: Vec<_> = totals.into_iter().collect();
        totals.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(&right.0)));
        Ok(totals)
    }

    async fn active_rate_card(&self, action_type: &str) -> StoreResult<Option<CreditRateCard>> {
        let state = self.state.lock();
        Ok(state
            .rate_cards
            .iter()
            .find(|card| card.active && card.action_type == action_type)
            .cloned())
    }

    async fn publish_rate_card(
        &self,
        action_type: &str,
        credit_cost: Decimal,
        vendor_cost: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<CreditRateCard> {
        let mut state = self.state.lock();
        for card in state
            .rate_cards
            .iter_mut()
            .filter(|card| card.action_type == action_type)
        {
            card.active = false;
        }
        let card = CreditRateCard {
            id: Uuid::new_v4(),
            action_type: action_type.to_string(),
            credit_cost,
            vendor_cost,
            active: true,
            created_at: now,
        };
        state.rate_cards.push(card.clone());
        Ok(card)
    }

    async fn active_rate_cards(&self) -> StoreResult<Vec<CreditRateCard>> {
        let state = self.state.lock();
        let mut cards: Vec<_> = state
            .rate_cards
            .iter()
            .filter(|card| card.active)
            .cloned()
            .collect();
        cards.sort_by(|left, right| left.action_type.cmp(&right.action_type));
        Ok(cards)
    }

    async fn find_valve(
        &self,
        organization_id: i32,
        feature: FeatureKey,
    ) -> StoreResult<Option<FeatureValve>> {
        Ok(self
            .state
            .lock()
            .valves
            .get(&(organization_id, feature))
            .cloned())
    }

    async fn list_valves(&self, organization_id: i32) -> StoreResult<Vec<FeatureValve>> {
        let state = self.state.lock();
        let mut valves: Vec<_> = state
            .valves
            .values()
            .filter(|valve| valve.organization_id == organization_id)
            .cloned()
            .collect();
        valves.sort_by(|left, right| left.feature_key.as_str().cmp(right.feature_key.as_str()));
        Ok(valves)
    }

    async fn upsert_valve(
        &self,
        change: &ValveChange,
        now: DateTime<Utc>,
    ) -> StoreResult<FeatureValve> {
        let mut state = self.state.lock();
        let valve = state
            .valves
            .entry((change.organization_id, change.feature_key))
            .or_insert_with(|| FeatureValve {
                id: Uuid::new_v4(),
                organization_id: change.organization_id,
                feature_key: change.feature_key,
                is_active: true,
                daily_limit: None,
                daily_usage: 0,
                changed_by: None,
                changed_at: None,
                change_reason: None,
                reversion_message: None,
            });
        valve.is_active = change.is_active;
        valve.daily_limit = change.daily_limit;
        valve.changed_by = change.changed_by;
        valve.changed_at = Some(now);
        valve.change_reason = change.change_reason.clone();
        valve.reversion_message = change.reversion_message.clone();
        Ok(valve.clone())
    }

    async fn increment_valve_usage(
        &self,
        organization_id: i32,
        feature: FeatureKey,
        by: i64,
    ) -> StoreResult<Option<FeatureValve>> {
        let mut state = self.state.lock();
        Ok(state
            .valves
            .get_mut(&(organization_id, feature))
            .map(|valve| {
                valve.daily_usage += by;
                valve.clone()
            }))
    }

    async fn reset_valve_usage(&self) -> StoreResult<u64> {
        Ok(self.state.lock().reset_valve_usage())
    }

    async fn claim_sweep(&self, job: &str, period: &str, _now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state.lock();
        Ok(state.sweeps.insert((job.to_string(), period.to_string())))
    }

    async fn run_period_reset(
        &self,
        reset: PeriodReset,
        period: &str,
        _now: DateTime<Utc>,
    ) -> StoreResult<Option<u64>> {
        let mut state = self.state.lock();
        let claim = (reset.job().to_string(), period.to_string());
        if state.sweeps.contains(&claim) {
            return Ok(None);
        }
        let count = match reset {
            PeriodReset::DailyValveUsage => state.reset_valve_usage(),
            PeriodReset::MonthlyTopUpCounters => state.reset_auto_topup_counts(),
        };
        state.sweeps.insert(claim);
        Ok(Some(count))
    }
}
