use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config;
use crate::db::Metadata;

// key: billing-models -> wallets,transactions,rate cards,valves
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditWallet {
    pub id: Uuid,
    pub organization_id: i32,
    pub balance: Decimal,
    pub tier: WalletTier,
    pub grace_period_until: Option<DateTime<Utc>>,
    pub auto_topup_enabled: bool,
    pub auto_topup_threshold: Decimal,
    pub auto_topup_amount: Decimal,
    pub auto_topup_monthly_limit: i32,
    pub auto_topup_count_this_month: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CreditWallet {
    pub fn new(organization_id: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            balance: Decimal::ZERO,
            tier: WalletTier::Starter,
            grace_period_until: None,
            auto_topup_enabled: false,
            auto_topup_threshold: Decimal::from(config::DEFAULT_AUTO_TOPUP_THRESHOLD),
            auto_topup_amount: Decimal::from(config::DEFAULT_AUTO_TOPUP_AMOUNT_DOLLARS),
            auto_topup_monthly_limit: config::DEFAULT_AUTO_TOPUP_MONTHLY_LIMIT,
            auto_topup_count_this_month: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_balance(&self, cost: Decimal) -> bool {
        self.balance >= cost
    }

    pub fn is_in_grace_period(&self, now: DateTime<Utc>) -> bool {
        matches!(self.grace_period_until, Some(until) if until > now)
    }

    /// The grace period suspends the gate; it never inflates the number.
    pub fn effective_balance(&self) -> Decimal {
        self.balance
    }

    pub fn can_auto_top_up(&self) -> bool {
        self.auto_topup_count_this_month < self.auto_topup_monthly_limit
    }

    pub fn should_auto_top_up(&self) -> bool {
        self.auto_topup_enabled && self.balance <= self.auto_topup_threshold
    }

    pub fn auto_topup_settings(&self) -> AutoTopUpSettings {
        AutoTopUpSettings {
            enabled: self.auto_topup_enabled,
            threshold: self.auto_topup_threshold,
            amount: self.auto_topup_amount,
            monthly_limit: self.auto_topup_monthly_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoTopUpSettings {
    pub enabled: bool,
    /// Credits; a top-up triggers once the balance is at or under this value.
    pub threshold: Decimal,
    /// Dollars charged per top-up.
    pub amount: Decimal,
    pub monthly_limit: i32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WalletTier {
    Starter,
    Growth,
    Scale,
    Enterprise,
}

impl WalletTier {
    pub fn from_lifetime_credits(purchased: Decimal) -> Self {
        if purchased >= Decimal::from(config::TIER_ENTERPRISE_MIN_CREDITS) {
            WalletTier::Enterprise
        } else if purchased >= Decimal::from(config::TIER_SCALE_MIN_CREDITS) {
            WalletTier::Scale
        } else if purchased >= Decimal::from(config::TIER_GROWTH_MIN_CREDITS) {
            WalletTier::Growth
        } else {
            WalletTier::Starter
        }
    }

    pub fn credits_per_dollar(&self) -> Decimal {
        let rate = match self {
            WalletTier::Starter => config::STARTER_CREDITS_PER_DOLLAR,
            WalletTier::Growth => config::GROWTH_CREDITS_PER_DOLLAR,
            WalletTier::Scale => config::SCALE_CREDITS_PER_DOLLAR,
            WalletTier::Enterprise => config::ENTERPRISE_CREDITS_PER_DOLLAR,
        };
        Decimal::from(rate)
    }

    pub fn credits_for_dollars(&self, dollars: Decimal) -> Decimal {
        dollars * self.credits_per_dollar()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WalletTier::Starter => "starter",
            WalletTier::Growth => "growth",
            WalletTier::Scale => "scale",
            WalletTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "starter" => Some(Self::Starter),
            "growth" => Some(Self::Growth),
            "scale" => Some(Self::Scale),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Usage,
    Purchase,
    Refund,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Usage => "usage",
            TransactionType::Purchase => "purchase",
            TransactionType::Refund => "refund",
            TransactionType::Adjustment => "adjustment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "usage" => Some(Self::Usage),
            "purchase" => Some(Self::Purchase),
            "refund" => Some(Self::Refund),
            "adjustment" => Some(Self::Adjustment),
            _ => None,
        }
    }
}

/// Immutable ledger row. `amount` is the signed effect on the balance, so
/// `balance_after` always equals the previous row's `balance_after + amount`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub sequence: i64,
    pub organization_id: i32,
    pub wallet_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: Decimal,
    pub action_type: Option<String>,
    pub description: String,
    pub balance_after: Decimal,
    pub metadata: Metadata,
    pub user_id: Option<i32>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// Credits consumed by a usage row, as a positive number.
    pub fn consumed(&self) -> Decimal {
        match self.transaction_type {
            TransactionType::Usage => self.amount.abs(),
            _ => Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditRateCard {
    pub id: Uuid,
    pub action_type: String,
    /// Credits per unit (per 1000 tokens, per minute, or per call).
    pub credit_cost: Decimal,
    /// Dollars paid to the upstream vendor per unit, for margin reporting.
    pub vendor_cost: Decimal,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Billable operations. Rate cards are keyed by [`BillableAction::as_str`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BillableAction {
    AiAnalysis,
    AiModeration,
    AiContentGeneration,
    AiCourseGeneration,
    Transcription,
    Translation,
    SmsDelivery,
    WhatsappDelivery,
    EmailDelivery,
    ReportExport,
}

/// How a billable action measures consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeteringBasis {
    Tokens,
    Minutes,
    Units,
}

impl MeteringBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeteringBasis::Tokens => "tokens",
            MeteringBasis::Minutes => "minutes",
            MeteringBasis::Units => "units",
        }
    }
}

impl BillableAction {
    pub const ALL: [BillableAction; 10] = [
        BillableAction::AiAnalysis,
        BillableAction::AiModeration,
        BillableAction::AiContentGeneration,
        BillableAction::AiCourseGeneration,
        BillableAction::Transcription,
        BillableAction::Translation,
        BillableAction::SmsDelivery,
        BillableAction::WhatsappDelivery,
        BillableAction::EmailDelivery,
        BillableAction::ReportExport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BillableAction::AiAnalysis => "ai_analysis",
            BillableAction::AiModeration => "ai_moderation",
            BillableAction::AiContentGeneration => "ai_content_generation",
            BillableAction::AiCourseGeneration => "ai_course_generation",
            BillableAction::Transcription => "transcription",
            BillableAction::Translation => "translation",
            BillableAction::SmsDelivery => "sms_delivery",
            BillableAction::WhatsappDelivery => "whatsapp_delivery",
            BillableAction::EmailDelivery => "email_delivery",
            BillableAction::ReportExport => "report_export",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == value)
    }

    pub fn metering_basis(&self) -> MeteringBasis {
        match self {
            BillableAction::AiAnalysis
            | BillableAction::AiModeration
            | BillableAction::AiContentGeneration
            | BillableAction::AiCourseGeneration
            | BillableAction::Translation => MeteringBasis::Tokens,
            BillableAction::Transcription => MeteringBasis::Minutes,
            BillableAction::SmsDelivery
            | BillableAction::WhatsappDelivery
            | BillableAction::EmailDelivery
            | BillableAction::ReportExport => MeteringBasis::Units,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKey {
    AiInsights,
    ContentModeration,
    ContentGeneration,
    MiniCourses,
    Transcription,
    Translation,
    SmsMessaging,
    WhatsappMessaging,
    EmailMessaging,
    ReportExports,
}

impl FeatureKey {
    pub const ALL: [FeatureKey; 10] = [
        FeatureKey::AiInsights,
        FeatureKey::ContentModeration,
        FeatureKey::ContentGeneration,
        FeatureKey::MiniCourses,
        FeatureKey::Transcription,
        FeatureKey::Translation,
        FeatureKey::SmsMessaging,
        FeatureKey::WhatsappMessaging,
        FeatureKey::EmailMessaging,
        FeatureKey::ReportExports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKey::AiInsights => "ai_insights",
            FeatureKey::ContentModeration => "content_moderation",
            FeatureKey::ContentGeneration => "content_generation",
            FeatureKey::MiniCourses => "mini_courses",
            FeatureKey::Transcription => "transcription",
            FeatureKey::Translation => "translation",
            FeatureKey::SmsMessaging => "sms_messaging",
            FeatureKey::WhatsappMessaging => "whatsapp_messaging",
            FeatureKey::EmailMessaging => "email_messaging",
            FeatureKey::ReportExports => "report_exports",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|feature| feature.as_str() == value)
    }
}

/// Per-organization switch gating one feature. A missing row means enabled and unlimited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureValve {
    pub id: Uuid,
    pub organization_id: i32,
    pub feature_key: FeatureKey,
    pub is_active: bool,
    pub daily_limit: Option<i64>,
    pub daily_usage: i64,
    pub changed_by: Option<i32>,
    pub changed_at: Option<DateTime<Utc>>,
    pub change_reason: Option<String>,
    pub reversion_message: Option<String>,
}

impl FeatureValve {
    pub fn is_enabled(&self) -> bool {
        self.is_active && !self.quota_exhausted()
    }

    pub fn quota_exhausted(&self) -> bool {
        matches!(self.daily_limit, Some(limit) if self.daily_usage >= limit)
    }
}

/// Upsert payload for [`FeatureValve`]; counters are preserved on update.
#[derive(Debug, Clone)]
pub struct ValveChange {
    pub organization_id: i32,
    pub feature_key: FeatureKey,
    pub is_active: bool,
    pub daily_limit: Option<i64>,
    pub changed_by: Option<i32>,
    pub change_reason: Option<String>,
    pub reversion_message: Option<String>,
}
