use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use super::{corrupt, metadata_from_value, StoreResult};
use crate::moderation::models::{
    DecisionKind, ModerationDecision, ModerationQueueItem, ModerationResult, ModerationScores,
    ModerationStatus, ModerationTeamSetting, ModerationWorkflow, QueuePriority, QueueStatus,
    SlaPolicy,
};
use crate::moderation::store::{AssigneeFilter, ModerationStore, QueueFilter};

const RESULT_COLUMNS: &str = r#"
    id, organization_id, content_type, content_id, owner_id, overall_score,
    age_appropriateness_score, clinical_safety_score, cultural_sensitivity_score,
    accuracy_score, flags, recommendations, status, human_reviewed, reviewed_by,
    reviewed_at, created_at
"#;

const ITEM_COLUMNS: &str = r#"
    id, organization_id, moderation_result_id, workflow_id, status, priority, assigned_to,
    assigned_at, due_at, current_step_id, completed_at, metadata, created_at, updated_at
"#;

const DECISION_COLUMNS: &str = r#"
    id, queue_item_id, organization_id, user_id, decision, notes, field_changes,
    time_spent_seconds, created_at
"#;

const TEAM_COLUMNS: &str =
    "organization_id, user_id, is_available, current_load, specializations, updated_at";

const WORKFLOW_COLUMNS: &str = r#"
    id, organization_id, name, is_active, is_default, priority, content_types,
    trigger_conditions, graph, created_at
"#;

/// Queue ordering shared by listing and claiming.
const QUEUE_ORDER: &str = "priority_rank, due_at NULLS LAST, created_at";

// key: moderation-queue-store -> postgres results,queue items,decisions,team,workflows
#[derive(Clone)]
pub struct PgModerationStore {
    pool: PgPool,
}

impl PgModerationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn adjust_load(
        tx: &mut Transaction<'_, Postgres>,
        organization_id: i32,
        user_id: i32,
        delta: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO moderation_team_settings (
                organization_id, user_id, is_available, current_load, specializations, updated_at
            )
            VALUES ($1, $2, TRUE, GREATEST($3, 0), '{}', $4)
            ON CONFLICT (organization_id, user_id) DO UPDATE SET
                current_load = GREATEST(moderation_team_settings.current_load + $3, 0),
                updated_at = $4
            "#,
        )
        .bind(organization_id)
        .bind(user_id)
        .bind(delta)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ModerationStore for PgModerationStore {
    async fn insert_result(&self, result: &ModerationResult) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO moderation_results (
                id, organization_id, content_type, content_id, owner_id, overall_score,
                age_appropriateness_score, clinical_safety_score, cultural_sensitivity_score,
                accuracy_score, flags, recommendations, status, human_reviewed, reviewed_by,
                reviewed_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(result.id)
        .bind(result.organization_id)
        .bind(&result.content_type)
        .bind(result.content_id)
        .bind(result.owner_id)
        .bind(result.scores.overall_score)
        .bind(result.scores.age_appropriateness_score)
        .bind(result.scores.clinical_safety_score)
        .bind(result.scores.cultural_sensitivity_score)
        .bind(result.scores.accuracy_score)
        .bind(string_list(&result.scores.flags))
        .bind(string_list(&result.scores.recommendations))
        .bind(result.status.as_str())
        .bind(result.human_reviewed)
        .bind(result.reviewed_by)
        .bind(result.reviewed_at)
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_result(&self, id: Uuid) -> StoreResult<Option<ModerationResult>> {
        let sql = format!("SELECT {RESULT_COLUMNS} FROM moderation_results WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(result_from_row).transpose()
    }

    async fn update_result_status(
        &self,
        id: Uuid,
        status: ModerationStatus,
        reviewed_by: Option<i32>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationResult>> {
        let sql = format!(
            r#"
            UPDATE moderation_results SET
                status = $2,
                human_reviewed = human_reviewed OR $3::int IS NOT NULL,
                reviewed_by = COALESCE($3, reviewed_by),
                reviewed_at = CASE WHEN $3::int IS NULL THEN reviewed_at ELSE $4 END
            WHERE id = $1
            RETURNING {RESULT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(reviewed_by)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(result_from_row).transpose()
    }

    async fn insert_item(&self, item: &ModerationQueueItem) -> StoreResult<ModerationQueueItem> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO moderation_queue_items (
                id, organization_id, moderation_result_id, workflow_id, status, priority,
                priority_rank, assigned_to, assigned_at, due_at, current_step_id, completed_at,
                metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (moderation_result_id) DO NOTHING
            "#,
        )
        .bind(item.id)
        .bind(item.organization_id)
        .bind(item.moderation_result_id)
        .bind(item.workflow_id)
        .bind(item.status.as_str())
        .bind(item.priority.as_str())
        .bind(item.priority.rank())
        .bind(item.assigned_to)
        .bind(item.assigned_at)
        .bind(item.due_at)
        .bind(item.current_step_id.as_deref())
        .bind(item.completed_at)
        .bind(Value::Object(item.metadata.clone()))
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM moderation_queue_items WHERE moderation_result_id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(item.moderation_result_id)
            .fetch_one(&mut *tx)
            .await?;
        let stored = item_from_row(&row)?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn find_item(&self, id: Uuid) -> StoreResult<Option<ModerationQueueItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM moderation_queue_items WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn save_item(
        &self,
        item: &ModerationQueueItem,
        expected: QueueStatus,
    ) -> StoreResult<Option<ModerationQueueItem>> {
        let sql = format!(
            r#"
            UPDATE moderation_queue_items SET
                workflow_id = $2, status = $3, priority = $4, priority_rank = $5, due_at = $6,
                current_step_id = $7, metadata = $8, updated_at = $9
            WHERE id = $1
              AND status = $10
              AND (status <> 'completed' OR $3 = 'completed')
            RETURNING {ITEM_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(item.id)
            .bind(item.workflow_id)
            .bind(item.status.as_str())
            .bind(item.priority.as_str())
            .bind(item.priority.rank())
            .bind(item.due_at)
            .bind(item.current_step_id.as_deref())
            .bind(Value::Object(item.metadata.clone()))
            .bind(item.updated_at)
            .bind(expected.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn list_items(&self, filter: &QueueFilter) -> StoreResult<Vec<ModerationQueueItem>> {
        let statuses: Vec<String> = filter
            .statuses()
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {ITEM_COLUMNS} FROM moderation_queue_items WHERE organization_id = "
        ));
        builder.push_bind(filter.organization_id);
        builder.push(" AND status = ANY(");
        builder.push_bind(statuses);
        builder.push(")");
        match filter.assignee {
            AssigneeFilter::Any => {}
            AssigneeFilter::Unassigned => {
                builder.push(" AND assigned_to IS NULL");
            }
            AssigneeFilter::User(user_id) => {
                builder.push(" AND assigned_to = ");
                builder.push_bind(user_id);
            }
            AssigneeFilter::UserOrUnassigned(user_id) => {
                builder.push(" AND (assigned_to IS NULL OR assigned_to = ");
                builder.push_bind(user_id);
                builder.push(")");
            }
        }
        if let Some(priority) = filter.priority {
            builder.push(" AND priority = ");
            builder.push_bind(priority.as_str());
        }
        if let Some(since) = filter.completed_since {
            builder.push(" AND completed_at >= ");
            builder.push_bind(since);
        }
        builder.push(format!(" ORDER BY {QUEUE_ORDER}"));
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn assign_item(
        &self,
        item_id: Uuid,
        assignee: Option<i32>,
        expected_previous: Option<i32>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationQueueItem>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            r#"
            UPDATE moderation_queue_items SET
                assigned_to = $2,
                assigned_at = CASE WHEN $2::int IS NULL THEN NULL ELSE $4 END,
                updated_at = $4
            WHERE id = $1
              AND status <> 'completed'
              AND assigned_to IS NOT DISTINCT FROM $3
            RETURNING {ITEM_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(item_id)
            .bind(assignee)
            .bind(expected_previous)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let item = item_from_row(&row)?;

        if let Some(previous) = expected_previous {
            Self::adjust_load(&mut tx, item.organization_id, previous, -1, now).await?;
        }
        if let Some(next) = assignee {
            Self::adjust_load(&mut tx, item.organization_id, next, 1, now).await?;
        }
        tx.commit().await?;
        Ok(Some(item))
    }

    async fn claim_next(
        &self,
        organization_id: i32,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationQueueItem>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT id FROM moderation_queue_items \
             WHERE organization_id = $1 AND status = 'pending' AND assigned_to IS NULL \
             ORDER BY {QUEUE_ORDER} LIMIT 1 FOR UPDATE SKIP LOCKED"
        );
        let next: Option<Uuid> = sqlx::query_scalar(&sql)
            .bind(organization_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(next) = next else {
            tx.rollback().await?;
            return Ok(None);
        };

        let sql = format!(
            r#"
            UPDATE moderation_queue_items SET
                assigned_to = $2, assigned_at = $3, status = 'in_progress', updated_at = $3
            WHERE id = $1 AND assigned_to IS NULL
            RETURNING {ITEM_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(next)
            .bind(user_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let item = item_from_row(&row)?;
        Self::adjust_load(&mut tx, organization_id, user_id, 1, now).await?;
        tx.commit().await?;
        Ok(Some(item))
    }

    async fn complete_item(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationQueueItem>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            r#"
            UPDATE moderation_queue_items SET
                status = 'completed', completed_at = $2, updated_at = $2
            WHERE id = $1 AND status <> 'completed'
            RETURNING {ITEM_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(item_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let item = item_from_row(&row)?;
        if let Some(assignee) = item.assigned_to {
            Self::adjust_load(&mut tx, item.organization_id, assignee, -1, now).await?;
        }
        tx.commit().await?;
        Ok(Some(item))
    }

    async fn last_assigned_user(&self, organization_id: i32) -> StoreResult<Option<i32>> {
        let assignee: Option<Option<i32>> = sqlx::query_scalar(
            "SELECT assigned_to FROM moderation_queue_items \
             WHERE organization_id = $1 AND assigned_at IS NOT NULL \
             ORDER BY assigned_at DESC LIMIT 1",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(assignee.flatten())
    }

    async fn overdue_items(&self, now: DateTime<Utc>) -> StoreResult<Vec<ModerationQueueItem>> {
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM moderation_queue_items \
             WHERE status IN ('pending', 'in_progress') AND due_at < $1 \
             ORDER BY {QUEUE_ORDER}"
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn insert_decision(&self, decision: &ModerationDecision) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO moderation_decisions (
                id, queue_item_id, organization_id, user_id, decision, notes, field_changes,
                time_spent_seconds, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(decision.id)
        .bind(decision.queue_item_id)
        .bind(decision.organization_id)
        .bind(decision.user_id)
        .bind(decision.decision.as_str())
        .bind(decision.notes.as_deref())
        .bind(Value::Object(decision.field_changes.clone()))
        .bind(decision.time_spent_seconds)
        .bind(decision.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_decisions(
        &self,
        organization_id: i32,
        user_id: Option<i32>,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<ModerationDecision>> {
        let sql = format!(
            "SELECT {DECISION_COLUMNS} FROM moderation_decisions \
             WHERE organization_id = $1 \
               AND ($2::int IS NULL OR user_id = $2) \
               AND ($3::timestamptz IS NULL OR created_at >= $3) \
             ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(organization_id)
            .bind(user_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decision_from_row).collect()
    }

    async fn team(&self, organization_id: i32) -> StoreResult<Vec<ModerationTeamSetting>> {
        let sql = format!(
            "SELECT {TEAM_COLUMNS} FROM moderation_team_settings \
             WHERE organization_id = $1 ORDER BY user_id"
        );
        let rows = sqlx::query(&sql)
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(team_from_row).collect()
    }

    async fn find_team_member(
        &self,
        organization_id: i32,
        user_id: i32,
    ) -> StoreResult<Option<ModerationTeamSetting>> {
        let sql = format!(
            "SELECT {TEAM_COLUMNS} FROM moderation_team_settings \
             WHERE organization_id = $1 AND user_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(team_from_row).transpose()
    }

    async fn upsert_team_member(
        &self,
        organization_id: i32,
        user_id: i32,
        is_available: bool,
        specializations: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<ModerationTeamSetting> {
        let sql = format!(
            r#"
            INSERT INTO moderation_team_settings (
                organization_id, user_id, is_available, current_load, specializations, updated_at
            )
            VALUES ($1, $2, $3, 0, $4, $5)
            ON CONFLICT (organization_id, user_id) DO UPDATE SET
                is_available = EXCLUDED.is_available,
                specializations = EXCLUDED.specializations,
                updated_at = EXCLUDED.updated_at
            RETURNING {TEAM_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(organization_id)
            .bind(user_id)
            .bind(is_available)
            .bind(specializations.to_vec())
            .bind(now)
            .fetch_one(&self.pool)
            .await?;
        team_from_row(&row)
    }

    async fn list_workflows(&self, organization_id: i32) -> StoreResult<Vec<ModerationWorkflow>> {
        let sql = format!(
            "SELECT {WORKFLOW_COLUMNS} FROM moderation_workflows \
             WHERE organization_id = $1 ORDER BY priority DESC, created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(workflow_from_row).collect()
    }

    async fn find_workflow(&self, id: Uuid) -> StoreResult<Option<ModerationWorkflow>> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM moderation_workflows WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn save_workflow(&self, workflow: &ModerationWorkflow) -> StoreResult<()> {
        let trigger_conditions = serde_json::to_value(&workflow.trigger_conditions)
            .map_err(|err| corrupt("moderation_workflows", err.to_string()))?;
        let graph = serde_json::to_value(&workflow.graph)
            .map_err(|err| corrupt("moderation_workflows", err.to_string()))?;

        let mut tx = self.pool.begin().await?;
        if workflow.is_default {
            sqlx::query(
                "UPDATE moderation_workflows SET is_default = FALSE \
                 WHERE organization_id = $1 AND id <> $2 AND is_default",
            )
            .bind(workflow.organization_id)
            .bind(workflow.id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            r#"
            INSERT INTO moderation_workflows (
                id, organization_id, name, is_active, is_default, priority, content_types,
                trigger_conditions, graph, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                is_active = EXCLUDED.is_active,
                is_default = EXCLUDED.is_default,
                priority = EXCLUDED.priority,
                content_types = EXCLUDED.content_types,
                trigger_conditions = EXCLUDED.trigger_conditions,
                graph = EXCLUDED.graph
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.organization_id)
        .bind(&workflow.name)
        .bind(workflow.is_active)
        .bind(workflow.is_default)
        .bind(workflow.priority)
        .bind(workflow.content_types.clone())
        .bind(trigger_conditions)
        .bind(graph)
        .bind(workflow.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn sla_policy(&self, organization_id: i32) -> StoreResult<Option<SlaPolicy>> {
        let row = sqlx::query(
            "SELECT urgent_hours, high_hours, normal_hours, low_hours \
             FROM moderation_sla_policies WHERE organization_id = $1",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(SlaPolicy {
                urgent_hours: row.try_get("urgent_hours")?,
                high_hours: row.try_get("high_hours")?,
                normal_hours: row.try_get("normal_hours")?,
                low_hours: row.try_get("low_hours")?,
            })
        })
        .transpose()
    }

    async fn save_sla_policy(&self, organization_id: i32, policy: &SlaPolicy) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO moderation_sla_policies (
                organization_id, urgent_hours, high_hours, normal_hours, low_hours
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (organization_id) DO UPDATE SET
                urgent_hours = EXCLUDED.urgent_hours,
                high_hours = EXCLUDED.high_hours,
                normal_hours = EXCLUDED.normal_hours,
                low_hours = EXCLUDED.low_hours
            "#,
        )
        .bind(organization_id)
        .bind(policy.urgent_hours)
        .bind(policy.high_hours)
        .bind(policy.normal_hours)
        .bind(policy.low_hours)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn string_list(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

fn strings_from_value(table: &'static str, value: Option<Value>) -> StoreResult<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value).map_err(|err| corrupt(table, err.to_string())),
    }
}

fn result_from_row(row: &PgRow) -> StoreResult<ModerationResult> {
    let status: String = row.try_get("status")?;
    Ok(ModerationResult {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        content_type: row.try_get("content_type")?,
        content_id: row.try_get("content_id")?,
        owner_id: row.try_get("owner_id")?,
        scores: ModerationScores {
            overall_score: row.try_get("overall_score")?,
            age_appropriateness_score: row.try_get("age_appropriateness_score")?,
            clinical_safety_score: row.try_get("clinical_safety_score")?,
            cultural_sensitivity_score: row.try_get("cultural_sensitivity_score")?,
            accuracy_score: row.try_get("accuracy_score")?,
            flags: strings_from_value("moderation_results", row.try_get("flags")?)?,
            recommendations: strings_from_value(
                "moderation_results",
                row.try_get("recommendations")?,
            )?,
        },
        status: ModerationStatus::parse(&status).ok_or_else(|| {
            corrupt("moderation_results", format!("unknown status `{status}`"))
        })?,
        human_reviewed: row.try_get("human_reviewed")?,
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: row.try_get("reviewed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn item_from_row(row: &PgRow) -> StoreResult<ModerationQueueItem> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    Ok(ModerationQueueItem {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        moderation_result_id: row.try_get("moderation_result_id")?,
        workflow_id: row.try_get("workflow_id")?,
        status: QueueStatus::parse(&status).ok_or_else(|| {
            corrupt("moderation_queue_items", format!("unknown status `{status}`"))
        })?,
        priority: QueuePriority::parse(&priority).ok_or_else(|| {
            corrupt("moderation_queue_items", format!("unknown priority `{priority}`"))
        })?,
        assigned_to: row.try_get("assigned_to")?,
        assigned_at: row.try_get("assigned_at")?,
        due_at: row.try_get("due_at")?,
        current_step_id: row.try_get("current_step_id")?,
        completed_at: row.try_get("completed_at")?,
        metadata: metadata_from_value(row.try_get("metadata")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn decision_from_row(row: &PgRow) -> StoreResult<ModerationDecision> {
    let decision: String = row.try_get("decision")?;
    Ok(ModerationDecision {
        id: row.try_get("id")?,
        queue_item_id: row.try_get("queue_item_id")?,
        organization_id: row.try_get("organization_id")?,
        user_id: row.try_get("user_id")?,
        decision: DecisionKind::parse(&decision).ok_or_else(|| {
            corrupt("moderation_decisions", format!("unknown decision `{decision}`"))
        })?,
        notes: row.try_get("notes")?,
        field_changes: metadata_from_value(row.try_get("field_changes")?),
        time_spent_seconds: row.try_get("time_spent_seconds")?,
        created_at: row.try_get("created_at")?,
    })
}

fn team_from_row(row: &PgRow) -> StoreResult<ModerationTeamSetting> {
    Ok(ModerationTeamSetting {
        organization_id: row.try_get("organization_id")?,
        user_id: row.try_get("user_id")?,
        is_available: row.try_get("is_available")?,
        current_load: row.try_get("current_load")?,
        specializations: row.try_get("specializations")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn workflow_from_row(row: &PgRow) -> StoreResult<ModerationWorkflow> {
    let trigger_conditions: Value = row.try_get("trigger_conditions")?;
    let graph: Value = row.try_get("graph")?;
    Ok(ModerationWorkflow {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        name: row.try_get("name")?,
        is_active: row.try_get("is_active")?,
        is_default: row.try_get("is_default")?,
        priority: row.try_get("priority")?,
        content_types: row.try_get("content_types")?,
        trigger_conditions: serde_json::from_value(trigger_conditions)
            .map_err(|err| corrupt("moderation_workflows", err.to_string()))?,
        graph: serde_json::from_value(graph)
            .map_err(|err| corrupt("moderation_workflows", err.to_string()))?,
        created_at: row.try_get("created_at")?,
    })
}
