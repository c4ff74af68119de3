pub mod adapters;
pub mod api;
pub mod error;
pub mod features;
pub mod meter;
pub mod models;
pub mod pricing;
pub mod scheduler;
pub mod store;
pub mod topup;
pub mod wallet;
pub mod watchdog;

pub use adapters::{
    HttpPaymentGateway, PaymentFailed, PaymentGateway, PaymentReceipt, UnconfiguredPaymentGateway,
};
pub use error::{BillingError, BillingResult, MeteredError};
pub use features::{feature_for, FeatureManager};
pub use meter::{BalanceSummary, CreditMeter, MeasuredUsage, MeterRequest, MeteredOutcome};
pub use models::{
    AutoTopUpSettings, BillableAction, CreditRateCard, CreditTransaction, CreditWallet,
    FeatureKey, FeatureValve, MeteringBasis, TransactionType, ValveChange, WalletTier,
};
pub use pricing::PricingOracle;
pub use scheduler::{spawn as spawn_billing_scheduler, BillingJobs};
pub use store::{BillingStore, MemoryBillingStore, PeriodReset, TimeRange};
pub use topup::{AutoTopUpService, TopUpBatchSummary, TopUpOutcome};
pub use wallet::{BalanceGuard, LedgerAudit, LedgerEntry, LedgerWrite, WalletLedger};
pub use watchdog::{AlertKind, UsageAlert, UsageWatchdog, WalletHealth, WatchdogSummary};
