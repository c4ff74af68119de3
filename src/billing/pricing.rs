use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::error::{BillingError, BillingResult};
use super::models::{BillableAction, CreditRateCard};
use super::store::BillingStore;

// key: pricing-oracle -> rate card lookup
#[derive(Clone)]
pub struct PricingOracle {
    store: Arc<dyn BillingStore>,
}

impl PricingOracle {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Credits owed for `units` of `action`, rounded up to a whole credit.
    /// Actions without an active rate are free.
    pub async fn get_cost(&self, action: BillableAction, units: Decimal) -> BillingResult<Decimal> {
        let Some(card) = self.store.active_rate_card(action.as_str()).await? else {
            debug!(action = action.as_str(), "no active rate card; pricing at zero");
            return Ok(Decimal::ZERO);
        };
        Ok(price(card.credit_cost, units))
    }

    pub async fn rate_cards(&self) -> BillingResult<Vec<CreditRateCard>> {
        Ok(self.store.active_rate_cards().await?)
    }

    /// Replaces the active rate for an action. Earlier rows stay for history.
    pub async fn publish_rate(
        &self,
        action: BillableAction,
        credit_cost: Decimal,
        vendor_cost: Decimal,
    ) -> BillingResult<CreditRateCard> {
        if credit_cost.is_sign_negative() || vendor_cost.is_sign_negative() {
            return Err(BillingError::InvalidAmount(
                "rate card costs must be non-negative".into(),
            ));
        }
        let card = self
            .store
            .publish_rate_card(action.as_str(), credit_cost, vendor_cost, Utc::now())
            .await?;
        info!(
            action = action.as_str(),
            credit_cost = %card.credit_cost,
            vendor_cost = %card.vendor_cost,
            "rate card published"
        );
        Ok(card)
    }
}

fn price(credit_cost: Decimal, units: Decimal) -> Decimal {
    let units = units.max(Decimal::ZERO);
    (credit_cost * units).ceil()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::store::MemoryBillingStore;

    #[test]
    fn price_rounds_up_to_whole_credits() {
        assert_eq!(price(Decimal::new(15, 1), Decimal::from(3)), Decimal::from(5));
        assert_eq!(price(Decimal::from(2), Decimal::from(4)), Decimal::from(8));
        assert_eq!(price(Decimal::from(2), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(price(Decimal::from(2), Decimal::from(-1)), Decimal::ZERO);
    }

    #[tokio::test]
    async fn missing_rate_card_costs_nothing() {
        let oracle = PricingOracle::new(Arc::new(MemoryBillingStore::new()));
        let cost = oracle
            .get_cost(BillableAction::AiAnalysis, Decimal::from(10))
            .await
            .unwrap();
        assert_eq!(cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn publishing_replaces_the_active_rate() {
        let oracle = PricingOracle::new(Arc::new(MemoryBillingStore::new()));
        oracle
            .publish_rate(BillableAction::SmsDelivery, Decimal::from(2), Decimal::new(1, 2))
            .await
            .unwrap();
        oracle
            .publish_rate(BillableAction::SmsDelivery, Decimal::from(3), Decimal::new(1, 2))
            .await
            .unwrap();

        let cost = oracle
            .get_cost(BillableAction::SmsDelivery, Decimal::from(2))
            .await
            .unwrap();
        assert_eq!(cost, Decimal::from(6));
        assert_eq!(oracle.rate_cards().await.unwrap().len(), 1);
    }
}
