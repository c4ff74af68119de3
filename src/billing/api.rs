use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::meter::BalanceSummary;
use super::models::{
    AutoTopUpSettings, BillableAction, CreditRateCard, CreditTransaction, CreditWallet,
    FeatureKey, FeatureValve, ValveChange,
};
use super::store::TimeRange;
use super::topup::TopUpOutcome;
use super::wallet::LedgerAudit;
use super::watchdog::{DailyUsage, UsageBreakdownEntry, WalletHealth};
use crate::db::Metadata;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::platform::Platform;

const DEFAULT_TREND_DAYS: i64 = 30;
const MAX_TREND_DAYS: i64 = 366;

// key: billing-api -> wallet,valve,usage endpoints
pub async fn get_balance(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<BalanceSummary>> {
    Ok(Json(platform.meter.get_balance(user.organization_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct EstimateQuery {
    pub action: String,
    pub units: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct EstimateResponse {
    pub action: BillableAction,
    pub units: Decimal,
    pub credits: Decimal,
    pub affordable: bool,
}

pub async fn estimate_cost(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Query(query): Query<EstimateQuery>,
) -> AppResult<Json<EstimateResponse>> {
    let action = parse_action(&query.action)?;
    let units = query.units.unwrap_or(Decimal::ONE);
    let credits = platform.meter.get_estimated_cost(action, units).await?;
    let affordable = platform
        .meter
        .can_afford(user.organization_id, action, units)
        .await?;
    Ok(Json(EstimateResponse {
        action,
        units,
        credits,
        affordable,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    pub amount: Decimal,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

pub async fn add_credits(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Json(payload): Json<CreditRequest>,
) -> AppResult<Json<CreditTransaction>> {
    user.require_admin()?;
    let transaction = platform
        .meter
        .add_credits(
            user.organization_id,
            payload.amount,
            payload
                .description
                .unwrap_or_else(|| "Credit purchase".to_string()),
            payload.metadata,
            Some(user.user_id),
        )
        .await?;
    Ok(Json(transaction))
}

pub async fn refund_credits(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Json(payload): Json<CreditRequest>,
) -> AppResult<Json<CreditTransaction>> {
    user.require_admin()?;
    let transaction = platform
        .meter
        .refund(
            user.organization_id,
            payload.amount,
            payload.description.unwrap_or_else(|| "Refund".to_string()),
            payload.metadata,
            Some(user.user_id),
        )
        .await?;
    Ok(Json(transaction))
}

#[derive(Debug, Deserialize)]
pub struct AdjustmentRequest {
    pub amount: Decimal,
    pub reason: String,
}

pub async fn adjust_credits(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Json(payload): Json<AdjustmentRequest>,
) -> AppResult<Json<CreditTransaction>> {
    user.require_admin()?;
    if payload.reason.trim().is_empty() {
        return Err(AppError::BadRequest("reason required".into()));
    }
    let transaction = platform
        .meter
        .adjust(
            user.organization_id,
            payload.amount,
            payload.reason,
            Some(user.user_id),
        )
        .await?;
    Ok(Json(transaction))
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl RangeQuery {
    fn range(&self) -> TimeRange {
        TimeRange {
            start: self.since,
            end: self.until,
        }
    }
}

pub async fn list_transactions(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Query(query): Query<RangeQuery>,
) -> AppResult<Json<Vec<CreditTransaction>>> {
    let transactions = platform
        .meter
        .ledger()
        .store()
        .transactions(user.organization_id, query.range())
        .await?;
    Ok(Json(transactions))
}

pub async fn verify_ledger(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<LedgerAudit>> {
    user.require_admin()?;
    Ok(Json(platform.meter.ledger().verify(user.organization_id).await?))
}

pub async fn configure_auto_topup(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Json(settings): Json<AutoTopUpSettings>,
) -> AppResult<Json<CreditWallet>> {
    user.require_admin()?;
    Ok(Json(
        platform
            .top_up
            .configure(user.organization_id, settings)
            .await?,
    ))
}

pub async fn run_auto_topup(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<TopUpOutcome>> {
    user.require_admin()?;
    Ok(Json(
        platform
            .top_up
            .process_if_needed(user.organization_id)
            .await?,
    ))
}

pub async fn list_valves(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<Vec<FeatureValve>>> {
    Ok(Json(
        platform
            .meter
            .features()
            .valves(user.organization_id)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct ValveRequest {
    pub is_active: bool,
    pub daily_limit: Option<i64>,
    pub change_reason: Option<String>,
    pub reversion_message: Option<String>,
}

pub async fn update_valve(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Path(feature): Path<String>,
    Json(payload): Json<ValveRequest>,
) -> AppResult<Json<FeatureValve>> {
    user.require_admin()?;
    let feature_key = FeatureKey::parse(&feature)
        .ok_or_else(|| AppError::BadRequest(format!("unknown feature `{feature}`")))?;
    let valve = platform
        .meter
        .features()
        .toggle_valve(ValveChange {
            organization_id: user.organization_id,
            feature_key,
            is_active: payload.is_active,
            daily_limit: payload.daily_limit,
            changed_by: Some(user.user_id),
            change_reason: payload.change_reason,
            reversion_message: payload.reversion_message,
        })
        .await?;
    Ok(Json(valve))
}

pub async fn list_rate_cards(
    Extension(platform): Extension<Platform>,
    _user: AuthUser,
) -> AppResult<Json<Vec<CreditRateCard>>> {
    Ok(Json(platform.meter.pricing().rate_cards().await?))
}

pub async fn wallet_health(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<WalletHealth>> {
    Ok(Json(
        platform
            .watchdog
            .check_health(user.organization_id, Utc::now())
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UsageReport {
    pub breakdown: Vec<UsageBreakdownEntry>,
    pub trend: Vec<DailyUsage>,
}

pub async fn usage_report(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Query(query): Query<UsageQuery>,
) -> AppResult<Json<UsageReport>> {
    let days = query
        .days
        .unwrap_or(DEFAULT_TREND_DAYS)
        .clamp(1, MAX_TREND_DAYS);
    let now = Utc::now();
    let breakdown = platform
        .watchdog
        .get_usage_breakdown(
            user.organization_id,
            TimeRange {
                start: Some(now - Duration::days(days)),
                end: None,
            },
        )
        .await?;
    let trend = platform
        .watchdog
        .get_daily_trend(user.organization_id, days, now)
        .await?;
    Ok(Json(UsageReport { breakdown, trend }))
}

fn parse_action(raw: &str) -> AppResult<BillableAction> {
    BillableAction::parse(raw)
        .ok_or_else(|| AppError::BadRequest(format!("unknown billable action `{raw}`")))
}
