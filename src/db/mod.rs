//! Postgres-backed implementations of the billing and moderation stores.

pub mod credit_ledger;
pub mod moderation_queue;

use serde_json::{Map, Value};
use thiserror::Error;

pub use credit_ledger::PgBillingStore;
pub use moderation_queue::PgModerationStore;

/// Opaque context bag attached to transactions, queue items and decisions.
pub type Metadata = Map<String, Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt `{table}` row: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("{0} not found")]
    NotFound(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn metadata_from_value(value: Option<Value>) -> Metadata {
    match value {
        Some(Value::Object(map)) => map,
        _ => Metadata::new(),
    }
}

pub(crate) fn corrupt(table: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table,
        detail: detail.into(),
    }
}
