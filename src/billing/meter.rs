use std::future::Future;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::error::{BillingError, BillingResult, MeteredError};
use super::features::{feature_for, FeatureManager};
use super::models::{
    AutoTopUpSettings, BillableAction, CreditTransaction, MeteringBasis, TransactionType,
    WalletTier,
};
use super::pricing::PricingOracle;
use super::wallet::{BalanceGuard, LedgerEntry, WalletLedger};
use crate::config;
use crate::db::Metadata;

/// Resource consumption reported by a metered operation's result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasuredUsage {
    Tokens { input: u64, output: u64 },
    DurationSeconds(f64),
    Unmeasured,
}

impl MeasuredUsage {
    /// Billing units implied by the measurement, or `None` to keep the estimate.
    pub fn billing_units(&self) -> Option<Decimal> {
        match *self {
            MeasuredUsage::Tokens { input, output } => {
                let total = input.saturating_add(output);
                let units = (total + config::TOKENS_PER_BILLING_UNIT - 1)
                    / config::TOKENS_PER_BILLING_UNIT;
                Some(Decimal::from(units))
            }
            MeasuredUsage::DurationSeconds(seconds) if seconds.is_finite() => {
                let minutes = (seconds.max(0.0) / config::SECONDS_PER_BILLING_MINUTE).ceil();
                Decimal::from_f64(minutes)
            }
            MeasuredUsage::DurationSeconds(_) | MeasuredUsage::Unmeasured => None,
        }
    }

    pub fn basis(&self) -> Option<MeteringBasis> {
        match self {
            MeasuredUsage::Tokens { .. } => Some(MeteringBasis::Tokens),
            MeasuredUsage::DurationSeconds(_) => Some(MeteringBasis::Minutes),
            MeasuredUsage::Unmeasured => None,
        }
    }
}

/// Results of metered work expose what they actually consumed.
pub trait MeteredOutcome {
    fn measured_usage(&self) -> MeasuredUsage {
        MeasuredUsage::Unmeasured
    }
}

impl MeteredOutcome for () {}

impl MeteredOutcome for Value {
    /// Reads `usage.input_tokens`/`usage.output_tokens`, then `duration` or `duration_seconds`.
    fn measured_usage(&self) -> MeasuredUsage {
        if let Some(usage) = self.get("usage").filter(|usage| usage.is_object()) {
            let input = usage.get("input_tokens").and_then(Value::as_u64);
            let output = usage.get("output_tokens").and_then(Value::as_u64);
            if input.is_some() || output.is_some() {
                return MeasuredUsage::Tokens {
                    input: input.unwrap_or(0),
                    output: output.unwrap_or(0),
                };
            }
        }
        self.get("duration")
            .or_else(|| self.get("duration_seconds"))
            .and_then(Value::as_f64)
            .map(MeasuredUsage::DurationSeconds)
            .unwrap_or(MeasuredUsage::Unmeasured)
    }
}

#[derive(Debug, Clone)]
pub struct MeterRequest {
    pub organization_id: i32,
    pub action: BillableAction,
    pub estimated_units: Option<Decimal>,
    pub metadata: Metadata,
    pub user_id: Option<i32>,
    /// Settles at most once per organization; a replay returns the first transaction.
    pub idempotency_key: Option<String>,
}

impl MeterRequest {
    pub fn new(organization_id: i32, action: BillableAction) -> Self {
        Self {
            organization_id,
            action,
            estimated_units: None,
            metadata: Metadata::new(),
            user_id: None,
            idempotency_key: None,
        }
    }

    pub fn estimated_units(mut self, units: Decimal) -> Self {
        self.estimated_units = Some(units);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn user(mut self, user_id: i32) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub organization_id: i32,
    pub balance: Decimal,
    pub effective_balance: Decimal,
    pub tier: WalletTier,
    pub credits_per_dollar: Decimal,
    pub in_grace_period: bool,
    pub grace_period_until: Option<DateTime<Utc>>,
    pub auto_topup: AutoTopUpSettings,
    pub auto_topup_count_this_month: i32,
}

// key: credit-meter -> gate,estimate,execute,settle
#[derive(Clone)]
pub struct CreditMeter {
    ledger: WalletLedger,
    pricing: PricingOracle,
    features: FeatureManager,
}

impl CreditMeter {
    pub fn new(ledger: WalletLedger, pricing: PricingOracle, features: FeatureManager) -> Self {
        Self {
            ledger,
            pricing,
            features,
        }
    }

    pub fn ledger(&self) -> &WalletLedger {
        &self.ledger
    }

    pub fn pricing(&self) -> &PricingOracle {
        &self.pricing
    }

    pub fn features(&self) -> &FeatureManager {
        &self.features
    }

    /// Runs `work` only if the feature is open and the estimate is affordable, then bills
    /// what the result says it consumed. Failed work is never billed.
    pub async fn execute_with_credits<T, E, F, Fut>(
        &self,
        request: MeterRequest,
        work: F,
    ) -> Result<T, MeteredError<E>>
    where
        T: MeteredOutcome,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let MeterRequest {
            organization_id,
            action,
            estimated_units,
            mut metadata,
            user_id,
            idempotency_key,
        } = request;

        self.features.check(organization_id, action).await?;

        let estimated_units = estimated_units.unwrap_or(Decimal::ONE);
        let estimate = self.pricing.get_cost(action, estimated_units).await?;

        let wallet = self.ledger.wallet(organization_id).await?;
        if !wallet.has_balance(estimate) && !wallet.is_in_grace_period(Utc::now()) {
            return Err(BillingError::InsufficientCredits {
                required: estimate,
                available: wallet.effective_balance(),
            }
            .into());
        }

        let result = work().await.map_err(MeteredError::Operation)?;

        let measured = result.measured_usage();
        let basis = action.metering_basis();
        if let Some(reported) = measured.basis().filter(|reported| *reported != basis) {
            warn!(
                organization_id,
                action_type = action.as_str(),
                expected = basis.as_str(),
                reported = reported.as_str(),
                "metered result reported usage on an unexpected basis"
            );
        }
        let (units, cost) = match measured.billing_units() {
            Some(units) => (units, self.pricing.get_cost(action, units).await?),
            None => (estimated_units, estimate),
        };

        metadata.insert("action_type".into(), json!(action.as_str()));
        metadata.insert("units".into(), json!(units.to_string()));
        metadata.insert("metering_basis".into(), json!(basis.as_str()));
        metadata.insert("estimated_cost".into(), json!(estimate.to_string()));
        if let MeasuredUsage::Tokens { input, output } = measured {
            metadata.insert("input_tokens".into(), json!(input));
            metadata.insert("output_tokens".into(), json!(output));
        }

        let entry = LedgerEntry {
            transaction_type: TransactionType::Usage,
            amount: -cost,
            action_type: Some(action.as_str().to_string()),
            description: format!("{} usage", action.as_str()),
            metadata,
            user_id,
            guard: BalanceGuard::CapAtBalance,
            idempotency_key,
        };
        if let Err(err) = self.ledger.write(organization_id, entry).await {
            error!(
                organization_id,
                action_type = action.as_str(),
                %cost,
                error = %err,
                "failed to settle completed metered work"
            );
            return Err(err.into());
        }

        if let Err(err) = self
            .features
            .increment_usage(organization_id, feature_for(action), 1)
            .await
        {
            warn!(
                organization_id,
                action_type = action.as_str(),
                error = %err,
                "failed to count feature usage"
            );
        }

        Ok(result)
    }

    pub async fn can_afford(
        &self,
        organization_id: i32,
        action: BillableAction,
        units: Decimal,
    ) -> BillingResult<bool> {
        let cost = self.pricing.get_cost(action, units).await?;
        let wallet = self.ledger.wallet(organization_id).await?;
        Ok(wallet.has_balance(cost) || wallet.is_in_grace_period(Utc::now()))
    }

    pub async fn get_estimated_cost(
        &self,
        action: BillableAction,
        units: Decimal,
    ) -> BillingResult<Decimal> {
        self.pricing.get_cost(action, units).await
    }

    pub async fn get_balance(&self, organization_id: i32) -> BillingResult<BalanceSummary> {
        let wallet = self.ledger.wallet(organization_id).await?;
        Ok(BalanceSummary {
            organization_id,
            balance: wallet.balance,
            effective_balance: wallet.effective_balance(),
            tier: wallet.tier,
            credits_per_dollar: wallet.tier.credits_per_dollar(),
            in_grace_period: wallet.is_in_grace_period(Utc::now()),
            grace_period_until: wallet.grace_period_until,
            auto_topup: wallet.auto_topup_settings(),
            auto_topup_count_this_month: wallet.auto_topup_count_this_month,
        })
    }

    /// Grants purchased credits and re-evaluates the tier.
    pub async fn add_credits(
        &self,
        organization_id: i32,
        amount: Decimal,
        description: impl Into<String>,
        metadata: Metadata,
        user_id: Option<i32>,
    ) -> BillingResult<CreditTransaction> {
        let transaction = self
            .ledger
            .add_credits(
                organization_id,
                amount,
                description,
                metadata,
                user_id,
                TransactionType::Purchase,
            )
            .await?;
        self.ledger.update_tier(organization_id).await?;
        Ok(transaction)
    }

    pub async fn refund(
        &self,
        organization_id: i32,
        amount: Decimal,
        reason: impl Into<String>,
        metadata: Metadata,
        user_id: Option<i32>,
    ) -> BillingResult<CreditTransaction> {
        self.ledger
            .add_credits(
                organization_id,
                amount,
                reason,
                metadata,
                user_id,
                TransactionType::Refund,
            )
            .await
    }

    /// Signed manual correction. Negative adjustments obey the balance gate.
    pub async fn adjust(
        &self,
        organization_id: i32,
        amount: Decimal,
        reason: impl Into<String>,
        user_id: Option<i32>,
    ) -> BillingResult<CreditTransaction> {
        if amount.is_zero() {
            return Err(BillingError::InvalidAmount(
                "adjustments must move the balance".into(),
            ));
        }
        let guard = if amount.is_sign_negative() {
            BalanceGuard::RequireFunds
        } else {
            BalanceGuard::None
        };
        let transaction = self
            .ledger
            .write(
                organization_id,
                LedgerEntry {
                    transaction_type: TransactionType::Adjustment,
                    amount,
                    action_type: None,
                    description: reason.into(),
                    metadata: Metadata::new(),
                    user_id,
                    guard,
                    idempotency_key: None,
                },
            )
            .await?;
        info!(organization_id, %amount, "manual credit adjustment");
        Ok(transaction)
    }
}
