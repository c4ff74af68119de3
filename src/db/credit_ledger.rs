use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{corrupt, metadata_from_value, StoreResult};
use crate::billing::models::{
    AutoTopUpSettings, CreditRateCard, CreditTransaction, CreditWallet, FeatureKey, FeatureValve,
    TransactionType, ValveChange, WalletTier,
};
use crate::billing::store::{BillingStore, PeriodReset, TimeRange};
use crate::billing::wallet::{settle, LedgerEntry, LedgerWrite};

const WALLET_COLUMNS: &str = r#"
    id, organization_id, balance, tier, grace_period_until, auto_topup_enabled,
    auto_topup_threshold, auto_topup_amount, auto_topup_monthly_limit,
    auto_topup_count_this_month, created_at, updated_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, sequence, organization_id, wallet_id, transaction_type, amount, action_type,
    description, balance_after, metadata, user_id, idempotency_key, created_at
"#;

const VALVE_COLUMNS: &str = r#"
    id, organization_id, feature_key, is_active, daily_limit, daily_usage, changed_by,
    changed_at, change_reason, reversion_message
"#;

// key: credit-ledger-store -> postgres wallets,transactions,rate cards,valves
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_wallet_if_missing(
        tx: &mut Transaction<'_, Postgres>,
        organization_id: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let wallet = CreditWallet::new(organization_id, now);
        sqlx::query(
            r#"
            INSERT INTO credit_wallets (
                id, organization_id, balance, tier, auto_topup_enabled, auto_topup_threshold,
                auto_topup_amount, auto_topup_monthly_limit, auto_topup_count_this_month,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $9)
            ON CONFLICT (organization_id) DO NOTHING
            "#,
        )
        .bind(wallet.id)
        .bind(organization_id)
        .bind(wallet.balance)
        .bind(wallet.tier.as_str())
        .bind(wallet.auto_topup_enabled)
        .bind(wallet.auto_topup_threshold)
        .bind(wallet.auto_topup_amount)
        .bind(wallet.auto_topup_monthly_limit)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }

    async fn update_wallet(
        &self,
        organization_id: i32,
        assignment: &str,
        bind: impl FnOnce(
            sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> StoreResult<CreditWallet> {
        let mut tx = self.pool.begin().await?;
        Self::insert_wallet_if_missing(&mut tx, organization_id, Utc::now()).await?;
        let sql = format!(
            "UPDATE credit_wallets SET {assignment}, updated_at = NOW() \
             WHERE organization_id = $1 RETURNING {WALLET_COLUMNS}"
        );
        let row = bind(sqlx::query(&sql).bind(organization_id))
            .fetch_one(&mut *tx)
            .await?;
        let wallet = wallet_from_row(&row)?;
        tx.commit().await?;
        Ok(wallet)
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn find_wallet(&self, organization_id: i32) -> StoreResult<Option<CreditWallet>> {
        let sql = format!("SELECT {WALLET_COLUMNS} FROM credit_wallets WHERE organization_id = $1");
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn ensure_wallet(&self, organization_id: i32) -> StoreResult<CreditWallet> {
        let mut tx = self.pool.begin().await?;
        Self::insert_wallet_if_missing(&mut tx, organization_id, Utc::now()).await?;
        let sql = format!("SELECT {WALLET_COLUMNS} FROM credit_wallets WHERE organization_id = $1");
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        wallet_from_row(&row)
    }

    async fn list_wallets(&self) -> StoreResult<Vec<CreditWallet>> {
        let sql = format!("SELECT {WALLET_COLUMNS} FROM credit_wallets ORDER BY organization_id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(wallet_from_row).collect()
    }

    async fn apply_entry(
        &self,
        organization_id: i32,
        entry: LedgerEntry,
        now: DateTime<Utc>,
    ) -> StoreResult<LedgerWrite> {
        let mut tx = self.pool.begin().await?;
        Self::insert_wallet_if_missing(&mut tx, organization_id, now).await?;

        let sql = format!(
            "SELECT {WALLET_COLUMNS} FROM credit_wallets WHERE organization_id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .fetch_one(&mut *tx)
            .await?;
        let wallet = wallet_from_row(&row)?;

        // Checked under the wallet lock so concurrent retries of one key serialize here.
        if let Some(key) = entry.idempotency_key.as_deref() {
            let sql = format!(
                "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
                 WHERE organization_id = $1 AND idempotency_key = $2"
            );
            let existing = sqlx::query(&sql)
                .bind(organization_id)
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(row) = existing {
                let transaction = transaction_from_row(&row)?;
                tx.commit().await?;
                return Ok(LedgerWrite::Replayed(transaction));
            }
        }

        let settlement = match settle(&wallet, &entry, now) {
            Ok(settlement) => settlement,
            Err((required, available)) => {
                tx.rollback().await?;
                return Ok(LedgerWrite::Rejected {
                    required,
                    available,
                });
            }
        };

        sqlx::query("UPDATE credit_wallets SET balance = $2, updated_at = $3 WHERE id = $1")
            .bind(wallet.id)
            .bind(settlement.balance_after)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            r#"
            INSERT INTO credit_transactions (
                id, organization_id, wallet_id, transaction_type, amount, action_type,
                description, balance_after, metadata, user_id, idempotency_key, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(organization_id)
            .bind(wallet.id)
            .bind(entry.transaction_type.as_str())
            .bind(settlement.effect)
            .bind(entry.action_type.as_deref())
            .bind(&entry.description)
            .bind(settlement.balance_after)
            .bind(Value::Object(settlement.metadata))
            .bind(entry.user_id)
            .bind(entry.idempotency_key.as_deref())
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        let transaction = transaction_from_row(&row)?;
        tx.commit().await?;
        Ok(LedgerWrite::Applied(transaction))
    }

    async fn set_grace_period(
        &self,
        organization_id: i32,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<CreditWallet> {
        self.update_wallet(organization_id, "grace_period_until = $2", |query| {
            query.bind(until)
        })
        .await
    }

    async fn save_auto_topup(
        &self,
        organization_id: i32,
        settings: &AutoTopUpSettings,
    ) -> StoreResult<CreditWallet> {
        let settings = settings.clone();
        self.update_wallet(
            organization_id,
            "auto_topup_enabled = $2, auto_topup_threshold = $3, auto_topup_amount = $4, \
             auto_topup_monthly_limit = $5",
            move |query| {
                query
                    .bind(settings.enabled)
                    .bind(settings.threshold)
                    .bind(settings.amount)
                    .bind(settings.monthly_limit)
            },
        )
        .await
    }

    async fn record_auto_topup(&self, organization_id: i32) -> StoreResult<Option<CreditWallet>> {
        let sql = format!(
            "UPDATE credit_wallets SET auto_topup_count_this_month = auto_topup_count_this_month + 1, \
             updated_at = NOW() \
             WHERE organization_id = $1 AND auto_topup_count_this_month < auto_topup_monthly_limit \
             RETURNING {WALLET_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn release_auto_topup(&self, organization_id: i32) -> StoreResult<CreditWallet> {
        self.update_wallet(
            organization_id,
            "auto_topup_count_this_month = GREATEST(auto_topup_count_this_month - 1, 0)",
            |query| query,
        )
        .await
    }

    async fn set_tier(&self, organization_id: i32, tier: WalletTier) -> StoreResult<CreditWallet> {
        self.update_wallet(organization_id, "tier = $2", move |query| {
            query.bind(tier.as_str())
        })
        .await
    }

    async fn lifetime_purchased(&self, organization_id: i32) -> StoreResult<Decimal> {
        let total: Decimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0) FROM credit_transactions \
             WHERE organization_id = $1 AND transaction_type = 'purchase'",
        )
        .bind(organization_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn transactions(
        &self,
        organization_id: i32,
        range: TimeRange,
    ) -> StoreResult<Vec<CreditTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE organization_id = $1 \
               AND ($2::timestamptz IS NULL OR created_at >= $2) \
               AND ($3::timestamptz IS NULL OR created_at < $3) \
             ORDER BY sequence"
        );
        let rows = sqlx::query(&sql)
            .bind(organization_id)
            .bind(range.start)
            .bind(range.end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn latest_transaction(
        &self,
        organization_id: i32,
        transaction_type: TransactionType,
    ) -> StoreResult<Option<CreditTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE organization_id = $1 AND transaction_type = $2 \
             ORDER BY sequence DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .bind(transaction_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn usage_by_organization(&self, range: TimeRange) -> StoreResult<Vec<(i32, Decimal)>> {
        let rows = sqlx::query(
            r#"
            SELECT organization_id, SUM(-amount) AS consumed
            FROM credit_transactions
            WHERE transaction_type = 'usage'
              AND ($1::timestamptz IS NULL OR created_at >= $1)
              AND ($2::timestamptz IS NULL OR created_at < $2)
            GROUP BY organization_id
            ORDER BY consumed DESC, organization_id
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("organization_id")?, row.try_get("consumed")?)))
            .collect()
    }

    async fn active_rate_card(&self, action_type: &str) -> StoreResult<Option<CreditRateCard>> {
        let row = sqlx::query(
            "SELECT id, action_type, credit_cost, vendor_cost, active, created_at \
             FROM credit_rate_cards WHERE action_type = $1 AND active",
        )
        .bind(action_type)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(rate_card_from_row).transpose()
    }

    async fn publish_rate_card(
        &self,
        action_type: &str,
        credit_cost: Decimal,
        vendor_cost: Decimal,
        now: DateTime<Utc>,
    ) -> StoreResult<CreditRateCard> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE credit_rate_cards SET active = FALSE WHERE action_type = $1 AND active")
            .bind(action_type)
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(
            r#"
            INSERT INTO credit_rate_cards (id, action_type, credit_cost, vendor_cost, active, created_at)
            VALUES ($1, $2, $3, $4, TRUE, $5)
            RETURNING id, action_type, credit_cost, vendor_cost, active, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(action_type)
        .bind(credit_cost)
        .bind(vendor_cost)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let card = rate_card_from_row(&row)?;
        tx.commit().await?;
        Ok(card)
    }

    async fn active_rate_cards(&self) -> StoreResult<Vec<CreditRateCard>> {
        let rows = sqlx::query(
            "SELECT id, action_type, credit_cost, vendor_cost, active, created_at \
             FROM credit_rate_cards WHERE active ORDER BY action_type",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rate_card_from_row).collect()
    }

    async fn find_valve(
        &self,
        organization_id: i32,
        feature: FeatureKey,
    ) -> StoreResult<Option<FeatureValve>> {
        let sql = format!(
            "SELECT {VALVE_COLUMNS} FROM feature_valves WHERE organization_id = $1 AND feature_key = $2"
        );
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .bind(feature.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(valve_from_row).transpose()
    }

    async fn list_valves(&self, organization_id: i32) -> StoreResult<Vec<FeatureValve>> {
        let sql = format!(
            "SELECT {VALVE_COLUMNS} FROM feature_valves WHERE organization_id = $1 ORDER BY feature_key"
        );
        let rows = sqlx::query(&sql)
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(valve_from_row).collect()
    }

    async fn upsert_valve(
        &self,
        change: &ValveChange,
        now: DateTime<Utc>,
    ) -> StoreResult<FeatureValve> {
        let sql = format!(
            r#"
            INSERT INTO feature_valves (
                id, organization_id, feature_key, is_active, daily_limit, daily_usage,
                changed_by, changed_at, change_reason, reversion_message
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $9)
            ON CONFLICT (organization_id, feature_key) DO UPDATE SET
                is_active = EXCLUDED.is_active,
                daily_limit = EXCLUDED.daily_limit,
                changed_by = EXCLUDED.changed_by,
                changed_at = EXCLUDED.changed_at,
                change_reason = EXCLUDED.change_reason,
                reversion_message = EXCLUDED.reversion_message
            RETURNING {VALVE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(change.organization_id)
            .bind(change.feature_key.as_str())
            .bind(change.is_active)
            .bind(change.daily_limit)
            .bind(change.changed_by)
            .bind(now)
            .bind(change.change_reason.as_deref())
            .bind(change.reversion_message.as_deref())
            .fetch_one(&self.pool)
            .await?;
        valve_from_row(&row)
    }

    async fn increment_valve_usage(
        &self,
        organization_id: i32,
        feature: FeatureKey,
        by: i64,
    ) -> StoreResult<Option<FeatureValve>> {
        let sql = format!(
            "UPDATE feature_valves SET daily_usage = daily_usage + $3 \
             WHERE organization_id = $1 AND feature_key = $2 RETURNING {VALVE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .bind(feature.as_str())
            .bind(by)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(valve_from_row).transpose()
    }

    async fn reset_valve_usage(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE feature_valves SET daily_usage = 0 WHERE daily_limit IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_sweep(&self, job: &str, period: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO scheduler_sweeps (job, period, claimed_at) VALUES ($1, $2, $3) \
             ON CONFLICT (job, period) DO NOTHING",
        )
        .bind(job)
        .bind(period)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn run_period_reset(
        &self,
        reset: PeriodReset,
        period: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<u64>> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "INSERT INTO scheduler_sweeps (job, period, claimed_at) VALUES ($1, $2, $3) \
             ON CONFLICT (job, period) DO NOTHING",
        )
        .bind(reset.job())
        .bind(period)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let sql = match reset {
            PeriodReset::DailyValveUsage => {
                "UPDATE feature_valves SET daily_usage = 0 WHERE daily_limit IS NOT NULL"
            }
            PeriodReset::MonthlyTopUpCounters => {
                "UPDATE credit_wallets SET auto_topup_count_this_month = 0, updated_at = NOW() \
                 WHERE auto_topup_count_this_month <> 0"
            }
        };
        let result = sqlx::query(sql).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(Some(result.rows_affected()))
    }
}

fn wallet_from_row(row: &PgRow) -> StoreResult<CreditWallet> {
    let tier: String = row.try_get("tier")?;
    Ok(CreditWallet {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        balance: row.try_get("balance")?,
        tier: WalletTier::parse(&tier)
            .ok_or_else(|| corrupt("credit_wallets", format!("unknown tier `{tier}`")))?,
        grace_period_until: row.try_get("grace_period_until")?,
        auto_topup_enabled: row.try_get("auto_topup_enabled")?,
        auto_topup_threshold: row.try_get("auto_topup_threshold")?,
        auto_topup_amount: row.try_get("auto_topup_amount")?,
        auto_topup_monthly_limit: row.try_get("auto_topup_monthly_limit")?,
        auto_topup_count_this_month: row.try_get("auto_topup_count_this_month")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> StoreResult<CreditTransaction> {
    let kind: String = row.try_get("transaction_type")?;
    Ok(CreditTransaction {
        id: row.try_get("id")?,
        sequence: row.try_get("sequence")?,
        organization_id: row.try_get("organization_id")?,
        wallet_id: row.try_get("wallet_id")?,
        transaction_type: TransactionType::parse(&kind).ok_or_else(|| {
            corrupt("credit_transactions", format!("unknown transaction type `{kind}`"))
        })?,
        amount: row.try_get("amount")?,
        action_type: row.try_get("action_type")?,
        description: row.try_get("description")?,
        balance_after: row.try_get("balance_after")?,
        metadata: metadata_from_value(row.try_get("metadata")?),
        user_id: row.try_get("user_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
    })
}

fn rate_card_from_row(row: &PgRow) -> StoreResult<CreditRateCard> {
    Ok(CreditRateCard {
        id: row.try_get("id")?,
        action_type: row.try_get("action_type")?,
        credit_cost: row.try_get("credit_cost")?,
        vendor_cost: row.try_get("vendor_cost")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn valve_from_row(row: &PgRow) -> StoreResult<FeatureValve> {
    let key: String = row.try_get("feature_key")?;
    Ok(FeatureValve {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        feature_key: FeatureKey::parse(&key)
            .ok_or_else(|| corrupt("feature_valves", format!("unknown feature `{key}`")))?,
        is_active: row.try_get("is_active")?,
        daily_limit: row.try_get("daily_limit")?,
        daily_usage: row.try_get("daily_usage")?,
        changed_by: row.try_get("changed_by")?,
        changed_at: row.try_get("changed_at")?,
        change_reason: row.try_get("change_reason")?,
        reversion_message: row.try_get("reversion_message")?,
    })
}
