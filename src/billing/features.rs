use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info};

use super::error::{BillingError, BillingResult};
use super::models::{BillableAction, FeatureKey, FeatureValve, TransactionType, ValveChange};
use super::store::BillingStore;
use super::wallet::{BalanceGuard, LedgerEntry, WalletLedger};
use crate::db::Metadata;

const CREDITS_EXHAUSTED_REASON: &str = "credit balance exhausted";

/// Feature gating a billable action.
pub fn feature_for(action: BillableAction) -> FeatureKey {
    match action {
        BillableAction::AiAnalysis => FeatureKey::AiInsights,
        BillableAction::AiModeration => FeatureKey::ContentModeration,
        BillableAction::AiContentGeneration => FeatureKey::ContentGeneration,
        BillableAction::AiCourseGeneration => FeatureKey::MiniCourses,
        BillableAction::Transcription => FeatureKey::Transcription,
        BillableAction::Translation => FeatureKey::Translation,
        BillableAction::SmsDelivery => FeatureKey::SmsMessaging,
        BillableAction::WhatsappDelivery => FeatureKey::WhatsappMessaging,
        BillableAction::EmailDelivery => FeatureKey::EmailMessaging,
        BillableAction::ReportExport => FeatureKey::ReportExports,
    }
}

// key: feature-manager -> valves,daily quotas
#[derive(Clone)]
pub struct FeatureManager {
    ledger: WalletLedger,
}

impl FeatureManager {
    pub fn new(ledger: WalletLedger) -> Self {
        Self { ledger }
    }

    pub fn store(&self) -> Arc<dyn BillingStore> {
        self.ledger.store().clone()
    }

    pub async fn is_enabled(&self, organization_id: i32, action: BillableAction) -> BillingResult<bool> {
        match self.check(organization_id, action).await {
            Ok(()) => Ok(true),
            Err(BillingError::FeatureDisabled { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Fails with [`BillingError::FeatureDisabled`] when the action may not run right now.
    pub async fn check(&self, organization_id: i32, action: BillableAction) -> BillingResult<()> {
        let feature = feature_for(action);
        let wallet = self.ledger.wallet(organization_id).await?;
        if wallet.balance <= Decimal::ZERO && !wallet.is_in_grace_period(Utc::now()) {
            debug!(organization_id, feature = feature.as_str(), "blocked: no credits");
            return Err(BillingError::FeatureDisabled {
                feature: feature.as_str().to_string(),
                reversion_message: None,
                reason: Some(CREDITS_EXHAUSTED_REASON.to_string()),
            });
        }

        let Some(valve) = self
            .ledger
            .store()
            .find_valve(organization_id, feature)
            .await?
        else {
            return Ok(());
        };
        if valve.is_enabled() {
            return Ok(());
        }

        let reason = if !valve.is_active {
            valve.change_reason.clone()
        } else {
            valve
                .daily_limit
                .map(|limit| format!("daily limit of {limit} reached"))
        };
        Err(BillingError::FeatureDisabled {
            feature: feature.as_str().to_string(),
            reversion_message: valve.reversion_message,
            reason,
        })
    }

    /// Upserts the valve and writes a zero-amount adjustment so toggles show up in the ledger.
    pub async fn toggle_valve(&self, change: ValveChange) -> BillingResult<FeatureValve> {
        if matches!(change.daily_limit, Some(limit) if limit < 0) {
            return Err(BillingError::InvalidAmount(
                "daily limit must be non-negative".into(),
            ));
        }
        let valve = self
            .ledger
            .store()
            .upsert_valve(&change, Utc::now())
            .await?;

        let mut metadata = Metadata::new();
        metadata.insert("feature_key".into(), json!(change.feature_key.as_str()));
        metadata.insert("is_active".into(), json!(change.is_active));
        metadata.insert("daily_limit".into(), json!(change.daily_limit));
        if let Some(reason) = &change.change_reason {
            metadata.insert("change_reason".into(), json!(reason));
        }
        let verb = if change.is_active { "enabled" } else { "disabled" };
        self.ledger
            .write(
                change.organization_id,
                LedgerEntry {
                    transaction_type: TransactionType::Adjustment,
                    amount: Decimal::ZERO,
                    action_type: None,
                    description: format!("feature {} {verb}", change.feature_key.as_str()),
                    metadata,
                    user_id: change.changed_by,
                    guard: BalanceGuard::None,
                    idempotency_key: None,
                },
            )
            .await?;

        info!(
            organization_id = change.organization_id,
            feature = change.feature_key.as_str(),
            is_active = change.is_active,
            daily_limit = ?change.daily_limit,
            "feature valve updated"
        );
        Ok(valve)
    }

    /// Counts usage against a daily quota. Unlimited or missing valves are left untouched.
    pub async fn increment_usage(
        &self,
        organization_id: i32,
        feature: FeatureKey,
        by: i64,
    ) -> BillingResult<()> {
        let store = self.ledger.store();
        match store.find_valve(organization_id, feature).await? {
            Some(valve) if valve.daily_limit.is_some() => {
                store
                    .increment_valve_usage(organization_id, feature, by)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn reset_daily_limits(&self) -> BillingResult<u64> {
        let reset = self.ledger.store().reset_valve_usage().await?;
        info!(valves = reset, "daily feature usage reset");
        Ok(reset)
    }

    pub async fn valves(&self, organization_id: i32) -> BillingResult<Vec<FeatureValve>> {
        Ok(self.ledger.store().list_valves(organization_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::store::MemoryBillingStore;

    async fn funded_manager(balance: i64) -> FeatureManager {
        let ledger = WalletLedger::new(Arc::new(MemoryBillingStore::new()));
        if balance > 0 {
            ledger
                .add_credits(
                    1,
                    Decimal::from(balance),
                    "seed",
                    Metadata::new(),
                    None,
                    TransactionType::Purchase,
                )
                .await
                .unwrap();
        }
        FeatureManager::new(ledger)
    }

    fn change(is_active: bool, daily_limit: Option<i64>) -> ValveChange {
        ValveChange {
            organization_id: 1,
            feature_key: FeatureKey::AiInsights,
            is_active,
            daily_limit,
            changed_by: Some(7),
            change_reason: Some("budget review".into()),
            reversion_message: Some("Paused by your administrator".into()),
        }
    }

    #[tokio::test]
    async fn missing_valve_means_enabled() {
        let manager = funded_manager(10).await;
        assert!(manager.is_enabled(1, BillableAction::AiAnalysis).await.unwrap());
    }

    #[tokio::test]
    async fn empty_wallet_disables_everything() {
        let manager = funded_manager(0).await;
        let err = manager.check(1, BillableAction::EmailDelivery).await.unwrap_err();
        match err {
            BillingError::FeatureDisabled { feature, reason, .. } => {
                assert_eq!(feature, "email_messaging");
                assert_eq!(reason.as_deref(), Some(CREDITS_EXHAUSTED_REASON));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_valve_carries_reversion_message() {
        let manager = funded_manager(10).await;
        manager.toggle_valve(change(false, None)).await.unwrap();

        let err = manager.check(1, BillableAction::AiAnalysis).await.unwrap_err();
        match err {
            BillingError::FeatureDisabled {
                reversion_message,
                reason,
                ..
            } => {
                assert_eq!(reversion_message.as_deref(), Some("Paused by your administrator"));
                assert_eq!(reason.as_deref(), Some("budget review"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn toggling_writes_zero_amount_adjustment() {
        let manager = funded_manager(10).await;
        manager.toggle_valve(change(true, Some(5))).await.unwrap();

        let audit = manager.ledger.verify(1).await.unwrap();
        assert!(audit.consistent);
        assert_eq!(audit.transactions, 2);
        let latest = manager
            .ledger
            .store()
            .latest_transaction(1, TransactionType::Adjustment)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.amount, Decimal::ZERO);
        assert_eq!(latest.balance_after, Decimal::from(10));
    }

    #[tokio::test]
    async fn quota_blocks_until_daily_reset() {
        let manager = funded_manager(10).await;
        manager.toggle_valve(change(true, Some(2))).await.unwrap();
        manager.increment_usage(1, FeatureKey::AiInsights, 2).await.unwrap();
        assert!(!manager.is_enabled(1, BillableAction::AiAnalysis).await.unwrap());

        assert_eq!(manager.reset_daily_limits().await.unwrap(), 1);
        assert!(manager.is_enabled(1, BillableAction::AiAnalysis).await.unwrap());
    }
}
