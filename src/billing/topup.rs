use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::adapters::{PaymentGateway, PaymentReceipt};
use super::error::{BillingError, BillingResult};
use super::models::{AutoTopUpSettings, CreditTransaction, CreditWallet, TransactionType};
use super::wallet::{BalanceGuard, LedgerEntry, WalletLedger};
use crate::config;
use crate::db::Metadata;
use crate::notifications::{dispatch, NotificationCategory, NotificationSink};
use crate::organizations::OrganizationDirectory;

/// Ledger writes attempted for one settled charge.
const CREDIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TopUpOutcome {
    NotNeeded,
    LimitReached,
    NoPaymentMethod,
    Succeeded {
        credits_added: Decimal,
        transaction: CreditTransaction,
    },
    Failed {
        reason: String,
        grace_until: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TopUpBatchSummary {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

// key: auto-topup -> threshold charges,monthly cap,grace on failure
#[derive(Clone)]
pub struct AutoTopUpService {
    ledger: WalletLedger,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn NotificationSink>,
    directory: Arc<dyn OrganizationDirectory>,
}

impl AutoTopUpService {
    pub fn new(
        ledger: WalletLedger,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationSink>,
        directory: Arc<dyn OrganizationDirectory>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            notifier,
            directory,
        }
    }

    pub async fn configure(
        &self,
        organization_id: i32,
        settings: AutoTopUpSettings,
    ) -> BillingResult<CreditWallet> {
        if settings.threshold.is_sign_negative() {
            return Err(BillingError::InvalidAmount(
                "auto top-up threshold must be non-negative".into(),
            ));
        }
        if settings.amount <= Decimal::ZERO {
            return Err(BillingError::InvalidAmount(
                "auto top-up amount must be positive".into(),
            ));
        }
        if settings.monthly_limit < 0 {
            return Err(BillingError::InvalidAmount(
                "auto top-up monthly limit must be non-negative".into(),
            ));
        }
        let wallet = self
            .ledger
            .configure_auto_topup(organization_id, &settings)
            .await?;
        info!(
            organization_id,
            enabled = settings.enabled,
            threshold = %settings.threshold,
            amount = %settings.amount,
            monthly_limit = settings.monthly_limit,
            "auto top-up configured"
        );
        Ok(wallet)
    }

    /// Charges the card on file when the balance sits at or under the threshold. The
    /// monthly slot is taken before the card is touched, so concurrent runs cannot
    /// exceed the limit; a slot is handed back when no charge went through.
    pub async fn process_if_needed(&self, organization_id: i32) -> BillingResult<TopUpOutcome> {
        let wallet = self.ledger.wallet(organization_id).await?;
        if !wallet.should_auto_top_up() {
            return Ok(TopUpOutcome::NotNeeded);
        }

        let Some(wallet) = self.ledger.record_auto_topup(organization_id).await? else {
            warn!(
                organization_id,
                count = wallet.auto_topup_count_this_month,
                limit = wallet.auto_topup_monthly_limit,
                "auto top-up monthly limit reached"
            );
            self.notify_admins(
                organization_id,
                "auto_topup_limit_reached",
                json!({
                    "balance": wallet.balance,
                    "monthly_limit": wallet.auto_topup_monthly_limit,
                }),
            )
            .await;
            return Ok(TopUpOutcome::LimitReached);
        };
        if !wallet.should_auto_top_up() {
            self.ledger.release_auto_topup(organization_id).await?;
            return Ok(TopUpOutcome::NotNeeded);
        }

        match self.gateway.has_payment_method(organization_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(organization_id, "auto top-up skipped: no payment method");
                self.ledger.release_auto_topup(organization_id).await?;
                return Ok(TopUpOutcome::NoPaymentMethod);
            }
            Err(err) => {
                warn!(organization_id, error = %err, "payment method lookup failed");
                self.ledger.release_auto_topup(organization_id).await?;
                return Ok(TopUpOutcome::NoPaymentMethod);
            }
        }

        let dollars = wallet.auto_topup_amount;
        match self.gateway.charge_customer(organization_id, dollars).await {
            Ok(receipt) => {
                let credits = wallet.tier.credits_for_dollars(dollars);
                let transaction = self
                    .credit_charge(&wallet, &receipt, credits)
                    .await?;
                self.ledger.clear_grace_period(organization_id).await?;
                self.ledger.update_tier(organization_id).await?;

                info!(organization_id, %credits, %dollars, "auto top-up succeeded");
                self.notify_admins(
                    organization_id,
                    "auto_topup_succeeded",
                    json!({
                        "dollars": dollars,
                        "credits_added": credits,
                        "balance": transaction.balance_after,
                    }),
                )
                .await;
                Ok(TopUpOutcome::Succeeded {
                    credits_added: credits,
                    transaction,
                })
            }
            Err(failure) => {
                self.ledger.release_auto_topup(organization_id).await?;
                let hours = *config::AUTO_TOPUP_GRACE_HOURS;
                let wallet = self.ledger.enable_grace_period(organization_id, hours).await?;
                warn!(
                    organization_id,
                    %dollars,
                    error_code = ?failure.error_code,
                    decline_code = ?failure.decline_code,
                    "auto top-up charge failed"
                );
                self.notify_admins(
                    organization_id,
                    "auto_topup_failed",
                    json!({
                        "dollars": dollars,
                        "reason": failure.message,
                        "decline_code": failure.decline_code,
                        "grace_period_until": wallet.grace_period_until,
                    }),
                )
                .await;
                Ok(TopUpOutcome::Failed {
                    reason: failure.message,
                    grace_until: wallet.grace_period_until,
                })
            }
        }
    }

    /// Books the credits for a settled charge. The charge id is the idempotency key,
    /// so a retried write lands exactly once.
    async fn credit_charge(
        &self,
        wallet: &CreditWallet,
        receipt: &PaymentReceipt,
        credits: Decimal,
    ) -> BillingResult<CreditTransaction> {
        let organization_id = wallet.organization_id;
        let dollars = wallet.auto_topup_amount;
        let mut metadata = Metadata::new();
        metadata.insert("source".into(), json!("auto_topup"));
        metadata.insert("charge_id".into(), json!(receipt.charge_id));
        metadata.insert("dollars".into(), json!(dollars.to_string()));
        metadata.insert("tier".into(), json!(wallet.tier.as_str()));
        let entry = LedgerEntry {
            transaction_type: TransactionType::Purchase,
            amount: credits,
            action_type: None,
            description: format!("Auto top-up: ${dollars}"),
            metadata,
            user_id: None,
            guard: BalanceGuard::None,
            idempotency_key: Some(format!("auto_topup:{}", receipt.charge_id)),
        };

        let mut attempt = 1;
        loop {
            match self.ledger.write(organization_id, entry.clone()).await {
                Ok(transaction) => return Ok(transaction),
                Err(err @ BillingError::Store(_)) if attempt < CREDIT_ATTEMPTS => {
                    warn!(
                        organization_id,
                        charge_id = %receipt.charge_id,
                        attempt,
                        error = %err,
                        "crediting auto top-up failed; retrying"
                    );
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        organization_id,
                        charge_id = %receipt.charge_id,
                        %dollars,
                        error = %err,
                        "auto top-up charged but credits were not recorded"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Runs every wallet that is enabled, at or under its threshold, and under its cap.
    /// One organization's failure never stops the batch.
    pub async fn process_all_pending(&self) -> BillingResult<TopUpBatchSummary> {
        let wallets = self.ledger.store().list_wallets().await?;
        let mut summary = TopUpBatchSummary::default();
        for wallet in wallets
            .iter()
            .filter(|wallet| wallet.should_auto_top_up() && wallet.can_auto_top_up())
        {
            summary.processed += 1;
            match self.process_if_needed(wallet.organization_id).await {
                Ok(TopUpOutcome::Succeeded { .. }) => summary.successful += 1,
                Ok(TopUpOutcome::Failed { .. }) => summary.failed += 1,
                Ok(_) => summary.skipped += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(
                        organization_id = wallet.organization_id,
                        error = %err,
                        "auto top-up processing failed"
                    );
                }
            }
        }
        info!(
            processed = summary.processed,
            successful = summary.successful,
            failed = summary.failed,
            skipped = summary.skipped,
            "auto top-up sweep finished"
        );
        Ok(summary)
    }

    async fn notify_admins(&self, organization_id: i32, event_key: &str, payload: Value) {
        let admins = match self.directory.admins(organization_id).await {
            Ok(admins) => admins,
            Err(err) => {
                warn!(organization_id, error = %err, "admin lookup failed");
                return;
            }
        };
        let mut payload = payload;
        if let Value::Object(map) = &mut payload {
            map.insert("organization_id".into(), json!(organization_id));
        }
        dispatch(
            self.notifier.as_ref(),
            &admins,
            NotificationCategory::Billing,
            event_key,
            &payload,
        )
        .await;
    }
}
