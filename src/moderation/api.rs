use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::graph::{TriggerCondition, WorkflowGraph};
use super::models::{
    ModerationQueueItem, ModerationResult, ModerationScores, ModerationTeamSetting,
    ModerationWorkflow, QueuePriority, SlaPolicy,
};
use super::queue::{
    DecisionInput, DecisionOutcome, EnqueuedItem, EscalationSummary, QueueStats, UserStats,
};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::platform::Platform;

const MAX_QUEUE_PAGE: usize = 200;

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub content_type: String,
    pub content_id: i64,
    pub owner_id: Option<i32>,
    pub scores: ModerationScores,
}

// key: moderation-api -> queue,decision,team,workflow endpoints
pub async fn enqueue(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Json(payload): Json<EnqueueRequest>,
) -> AppResult<Json<EnqueuedItem>> {
    user.require_admin()?;
    let now = Utc::now();
    let result = ModerationResult::new(
        user.organization_id,
        payload.content_type,
        payload.content_id,
        payload.owner_id,
        payload.scores,
        now,
    );
    Ok(Json(
        platform.moderation.enqueue_for_moderation(result, now).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueQuery {
    pub priority: Option<String>,
    pub limit: Option<usize>,
}

pub async fn my_queue(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Query(query): Query<QueueQuery>,
) -> AppResult<Json<Vec<ModerationQueueItem>>> {
    user.require_moderator()?;
    let priority = match query.priority.as_deref() {
        Some(raw) => Some(
            QueuePriority::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("unknown priority `{raw}`")))?,
        ),
        None => None,
    };
    let limit = query.limit.unwrap_or(50).min(MAX_QUEUE_PAGE);
    Ok(Json(
        platform
            .moderation
            .get_queue_for_user(user.organization_id, user.user_id, priority, Some(limit))
            .await?,
    ))
}

pub async fn next_item(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<Option<ModerationQueueItem>>> {
    user.require_moderator()?;
    Ok(Json(
        platform
            .moderation
            .get_next_item_for_user(user.organization_id, user.user_id, Utc::now())
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub user_id: i32,
}

pub async fn assign_item(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<AssignRequest>,
) -> AppResult<Json<ModerationQueueItem>> {
    user.require_supervisor()?;
    Ok(Json(
        platform
            .moderation
            .assign_to_user(user.organization_id, item_id, payload.user_id, Utc::now())
            .await?,
    ))
}

pub async fn reassign_item(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<AssignRequest>,
) -> AppResult<Json<ModerationQueueItem>> {
    user.require_supervisor()?;
    Ok(Json(
        platform
            .moderation
            .reassign(user.organization_id, item_id, payload.user_id, Utc::now())
            .await?,
    ))
}

pub async fn decide(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Path(item_id): Path<Uuid>,
    Json(payload): Json<DecisionInput>,
) -> AppResult<Json<DecisionOutcome>> {
    user.require_moderator()?;
    if payload.decision.is_none() {
        return Err(AppError::BadRequest("decision required".into()));
    }
    Ok(Json(
        platform
            .moderation
            .process_decision(
                user.organization_id,
                item_id,
                user.user_id,
                payload,
                Utc::now(),
            )
            .await?,
    ))
}

pub async fn queue_stats(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<QueueStats>> {
    user.require_moderator()?;
    Ok(Json(
        platform
            .moderation
            .get_queue_stats(user.organization_id, Utc::now())
            .await?,
    ))
}

pub async fn my_stats(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<UserStats>> {
    user.require_moderator()?;
    Ok(Json(
        platform
            .moderation
            .get_user_stats(user.organization_id, user.user_id, Utc::now())
            .await?,
    ))
}

pub async fn run_escalations(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<EscalationSummary>> {
    user.require_admin()?;
    Ok(Json(
        platform.moderation.escalate_overdue_items(Utc::now()).await?,
    ))
}

pub async fn list_team(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<Vec<ModerationTeamSetting>>> {
    user.require_supervisor()?;
    Ok(Json(platform.moderation.team(user.organization_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct TeamMemberRequest {
    pub is_available: bool,
    #[serde(default)]
    pub specializations: Vec<String>,
}

pub async fn update_team_member(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Path(member_id): Path<i32>,
    Json(payload): Json<TeamMemberRequest>,
) -> AppResult<Json<ModerationTeamSetting>> {
    if member_id != user.user_id {
        user.require_supervisor()?;
    } else {
        user.require_moderator()?;
    }
    Ok(Json(
        platform
            .moderation
            .update_team_member(
                user.organization_id,
                member_id,
                payload.is_available,
                payload.specializations,
                Utc::now(),
            )
            .await?,
    ))
}

pub async fn list_workflows(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<Vec<ModerationWorkflow>>> {
    user.require_supervisor()?;
    Ok(Json(
        platform
            .moderation
            .workflows()
            .list_workflows(user.organization_id)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct WorkflowRequest {
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub content_types: Vec<String>,
    #[serde(default)]
    pub trigger_conditions: Vec<TriggerCondition>,
    pub graph: WorkflowGraph,
}

fn default_active() -> bool {
    true
}

pub async fn save_workflow(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Json(payload): Json<WorkflowRequest>,
) -> AppResult<Json<ModerationWorkflow>> {
    user.require_admin()?;
    let workflows = platform.moderation.workflows();
    let created_at = match payload.id {
        Some(id) => {
            let existing = workflows
                .list_workflows(user.organization_id)
                .await?
                .into_iter()
                .find(|workflow| workflow.id == id)
                .ok_or(AppError::NotFound)?;
            existing.created_at
        }
        None => Utc::now(),
    };
    let workflow = ModerationWorkflow {
        id: payload.id.unwrap_or_else(Uuid::new_v4),
        organization_id: user.organization_id,
        name: payload.name,
        is_active: payload.is_active,
        is_default: payload.is_default,
        priority: payload.priority,
        content_types: payload.content_types,
        trigger_conditions: payload.trigger_conditions,
        graph: payload.graph,
        created_at,
    };
    workflows.save_workflow(&workflow).await?;
    Ok(Json(workflow))
}

pub async fn get_sla_policy(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
) -> AppResult<Json<SlaPolicy>> {
    user.require_moderator()?;
    Ok(Json(
        platform.moderation.sla_policy(user.organization_id).await?,
    ))
}

pub async fn update_sla_policy(
    Extension(platform): Extension<Platform>,
    user: AuthUser,
    Json(policy): Json<SlaPolicy>,
) -> AppResult<Json<SlaPolicy>> {
    user.require_admin()?;
    Ok(Json(
        platform
            .moderation
            .set_sla_policy(user.organization_id, policy)
            .await?,
    ))
}
