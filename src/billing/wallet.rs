use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::error::{BillingError, BillingResult};
use super::models::{AutoTopUpSettings, CreditTransaction, CreditWallet, TransactionType, WalletTier};
use super::store::{BillingStore, TimeRange};
use crate::db::Metadata;

/// How a ledger write treats a debit that exceeds the available balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceGuard {
    /// Credits and zero-amount audit rows.
    None,
    /// Reject unless the balance covers the debit or a grace period is open.
    RequireFunds,
    /// Settle work that already ran: collect what the balance allows and record the rest.
    CapAtBalance,
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub transaction_type: TransactionType,
    /// Signed effect on the balance.
    pub amount: Decimal,
    pub action_type: Option<String>,
    pub description: String,
    pub metadata: Metadata,
    pub user_id: Option<i32>,
    pub guard: BalanceGuard,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub enum LedgerWrite {
    Applied(CreditTransaction),
    /// The idempotency key was already settled; nothing was written.
    Replayed(CreditTransaction),
    Rejected {
        required: Decimal,
        available: Decimal,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settlement {
    pub effect: Decimal,
    pub balance_after: Decimal,
    pub metadata: Metadata,
}

/// Resolves a ledger entry against the locked wallet row. Stores call this while
/// holding the wallet lock so the resulting balance never comes from a stale read.
pub(crate) fn settle(
    wallet: &CreditWallet,
    entry: &LedgerEntry,
    now: DateTime<Utc>,
) -> Result<Settlement, (Decimal, Decimal)> {
    let mut metadata = entry.metadata.clone();
    let mut effect = entry.amount;

    if entry.amount.is_sign_negative() && !entry.amount.is_zero() {
        let debit = -entry.amount;
        let covered = wallet.has_balance(debit) || wallet.is_in_grace_period(now);
        match entry.guard {
            BalanceGuard::None => {}
            BalanceGuard::RequireFunds if !covered => {
                return Err((debit, wallet.effective_balance()));
            }
            BalanceGuard::RequireFunds => {}
            BalanceGuard::CapAtBalance if !covered => {
                let collected = wallet.balance.max(Decimal::ZERO);
                metadata.insert("uncollected".into(), json!((debit - collected).to_string()));
                effect = -collected;
            }
            BalanceGuard::CapAtBalance => {}
        }
    }

    Ok(Settlement {
        effect,
        balance_after: wallet.balance + effect,
        metadata,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerAudit {
    pub organization_id: i32,
    pub stored_balance: Decimal,
    pub replayed_balance: Decimal,
    pub transactions: usize,
    pub consistent: bool,
}

// key: credit-wallet -> ledger operations
/// Every balance change goes through here and lands as exactly one transaction row.
#[derive(Clone)]
pub struct WalletLedger {
    store: Arc<dyn BillingStore>,
}

impl WalletLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub async fn wallet(&self, organization_id: i32) -> BillingResult<CreditWallet> {
        Ok(self.store.ensure_wallet(organization_id).await?)
    }

    pub async fn deduct(
        &self,
        organization_id: i32,
        amount: Decimal,
        description: impl Into<String>,
        metadata: Metadata,
        user_id: Option<i32>,
    ) -> BillingResult<CreditTransaction> {
        ensure_non_negative(amount)?;
        let action_type = metadata
            .get("action_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.write(
            organization_id,
            LedgerEntry {
                transaction_type: TransactionType::Usage,
                amount: -amount,
                action_type,
                description: description.into(),
                metadata,
                user_id,
                guard: BalanceGuard::RequireFunds,
                idempotency_key: None,
            },
        )
        .await
    }

    pub async fn add_credits(
        &self,
        organization_id: i32,
        amount: Decimal,
        description: impl Into<String>,
        metadata: Metadata,
        user_id: Option<i32>,
        transaction_type: TransactionType,
    ) -> BillingResult<CreditTransaction> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(format!(
                "credit grants must be positive, got {amount}"
            )));
        }
        self.write(
            organization_id,
            LedgerEntry {
                transaction_type,
                amount,
                action_type: None,
                description: description.into(),
                metadata,
                user_id,
                guard: BalanceGuard::None,
                idempotency_key: None,
            },
        )
        .await
    }

    /// Writes an arbitrary entry and converts store outcomes into billing errors.
    pub async fn write(
        &self,
        organization_id: i32,
        entry: LedgerEntry,
    ) -> BillingResult<CreditTransaction> {
        let transaction_type = entry.transaction_type;
        match self
            .store
            .apply_entry(organization_id, entry, Utc::now())
            .await?
        {
            LedgerWrite::Applied(transaction) => {
                info!(
                    organization_id,
                    transaction = %transaction.id,
                    kind = transaction_type.as_str(),
                    amount = %transaction.amount,
                    balance_after = %transaction.balance_after,
                    "credit ledger entry recorded"
                );
                Ok(transaction)
            }
            LedgerWrite::Replayed(transaction) => {
                info!(
                    organization_id,
                    transaction = %transaction.id,
                    "idempotency key already settled; ledger unchanged"
                );
                Ok(transaction)
            }
            LedgerWrite::Rejected {
                required,
                available,
            } => Err(BillingError::InsufficientCredits {
                required,
                available,
            }),
        }
    }

    pub async fn enable_grace_period(
        &self,
        organization_id: i32,
        hours: i64,
    ) -> BillingResult<CreditWallet> {
        let until = Utc::now() + Duration::hours(hours);
        let wallet = self
            .store
            .set_grace_period(organization_id, Some(until))
            .await?;
        warn!(organization_id, %until, "credit grace period opened");
        Ok(wallet)
    }

    pub async fn clear_grace_period(&self, organization_id: i32) -> BillingResult<CreditWallet> {
        Ok(self.store.set_grace_period(organization_id, None).await?)
    }

    pub async fn configure_auto_topup(
        &self,
        organization_id: i32,
        settings: &AutoTopUpSettings,
    ) -> BillingResult<CreditWallet> {
        Ok(self
            .store
            .save_auto_topup(organization_id, settings)
            .await?)
    }

    /// Counts a top-up against this month's limit. `None` when the limit is reached.
    pub async fn record_auto_topup(
        &self,
        organization_id: i32,
    ) -> BillingResult<Option<CreditWallet>> {
        Ok(self.store.record_auto_topup(organization_id).await?)
    }

    pub async fn release_auto_topup(&self, organization_id: i32) -> BillingResult<CreditWallet> {
        Ok(self.store.release_auto_topup(organization_id).await?)
    }

    /// Recomputes the tier from lifetime purchases. Tiers never move down automatically.
    pub async fn update_tier(&self, organization_id: i32) -> BillingResult<CreditWallet> {
        let wallet = self.store.ensure_wallet(organization_id).await?;
        let purchased = self.store.lifetime_purchased(organization_id).await?;
        let computed = WalletTier::from_lifetime_credits(purchased);
        if computed <= wallet.tier {
            return Ok(wallet);
        }
        info!(
            organization_id,
            from = wallet.tier.as_str(),
            to = computed.as_str(),
            "wallet tier upgraded"
        );
        Ok(self.store.set_tier(organization_id, computed).await?)
    }

    /// Replays the full ledger in creation order and compares it with the stored balance.
    pub async fn verify(&self, organization_id: i32) -> BillingResult<LedgerAudit> {
        let wallet = self.store.ensure_wallet(organization_id).await?;
        let transactions = self
            .store
            .transactions(organization_id, TimeRange::all())
            .await?;
        let replayed = replay(&transactions);
        Ok(LedgerAudit {
            organization_id,
            stored_balance: wallet.balance,
            replayed_balance: replayed,
            transactions: transactions.len(),
            consistent: replayed == wallet.balance,
        })
    }
}

/// Folds transaction effects in order.
pub fn replay(transactions: &[CreditTransaction]) -> Decimal {
    transactions
        .iter()
        .fold(Decimal::ZERO, |balance, transaction| balance + transaction.amount)
}

fn ensure_non_negative(amount: Decimal) -> BillingResult<()> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(BillingError::InvalidAmount(format!(
            "deductions must be non-negative, got {amount}"
        )));
    }
    Ok(())
}
