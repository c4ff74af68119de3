use rust_decimal::Decimal;
use thiserror::Error;

use crate::db::StoreError;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("feature `{feature}` is disabled")]
    FeatureDisabled {
        feature: String,
        reversion_message: Option<String>,
        reason: Option<String>,
    },
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits {
        required: Decimal,
        available: Decimal,
    },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a metered call: either billing refused, or the caller's own work failed.
#[derive(Debug, Error)]
pub enum MeteredError<E> {
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("metered operation failed: {0}")]
    Operation(E),
}

impl<E> MeteredError<E> {
    pub fn billing(&self) -> Option<&BillingError> {
        match self {
            MeteredError::Billing(err) => Some(err),
            MeteredError::Operation(_) => None,
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
