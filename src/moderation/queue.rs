use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::assignment::{AssignmentStrategy, ModerationAssignmentService};
use super::error::{ModerationError, ReviewResult};
use super::models::{
    DecisionKind, ModerationDecision, ModerationQueueItem, ModerationResult, ModerationTeamSetting,
    QueuePriority, QueueStatus, SlaPolicy,
};
use super::priority::derive_priority;
use super::store::{AssigneeFilter, ModerationStore, QueueFilter};
use super::workflow::{ModerationWorkflowService, WorkflowRun};
use crate::config;
use crate::db::Metadata;
use crate::notifications::{dispatch, NotificationCategory, NotificationSink};

#[derive(Debug, Clone, Serialize)]
pub struct EnqueuedItem {
    pub item: ModerationQueueItem,
    pub workflow: Option<WorkflowRun>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionInput {
    pub decision: Option<DecisionKind>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub field_changes: Metadata,
    /// Measured by the client; derived from the assignment time when absent.
    #[serde(default)]
    pub time_spent_seconds: Option<i64>,
}

impl DecisionInput {
    pub fn new(decision: DecisionKind) -> Self {
        Self {
            decision: Some(decision),
            ..Self::default()
        }
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub decision: ModerationDecision,
    pub item: ModerationQueueItem,
    pub workflow: Option<WorkflowRun>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct EscalationSummary {
    pub checked: usize,
    pub escalated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub escalated: usize,
    pub unassigned: usize,
    pub overdue: usize,
    pub by_priority: BTreeMap<String, usize>,
    pub completed_in_window: usize,
    /// Percentage of completed items in the window that met their due date.
    pub sla_compliance: f64,
    pub average_resolution_minutes: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserStats {
    pub user_id: i32,
    pub current_load: i32,
    pub open_items: usize,
    pub decisions: usize,
    pub decisions_by_kind: BTreeMap<String, usize>,
    pub average_time_spent_seconds: Option<f64>,
}

/// SLA compliance percentage for completed items; an empty window is fully compliant.
pub fn sla_compliance(completed: &[ModerationQueueItem]) -> f64 {
    if completed.is_empty() {
        return 100.0;
    }
    let met = completed.iter().filter(|item| item.met_sla()).count();
    let percentage = (met as f64 * 100.0) / completed.len() as f64;
    (percentage * 100.0).round() / 100.0
}

// key: moderation-queue -> enqueue,claim,decide,escalate,stats
#[derive(Clone)]
pub struct ModerationQueueService {
    store: Arc<dyn ModerationStore>,
    assignments: ModerationAssignmentService,
    workflows: ModerationWorkflowService,
    notifier: Arc<dyn NotificationSink>,
}

impl ModerationQueueService {
    pub fn new(
        store: Arc<dyn ModerationStore>,
        assignments: ModerationAssignmentService,
        workflows: ModerationWorkflowService,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            store,
            assignments,
            workflows,
            notifier,
        }
    }

    pub fn workflows(&self) -> &ModerationWorkflowService {
        &self.workflows
    }

    pub fn assignments(&self) -> &ModerationAssignmentService {
        &self.assignments
    }

    /// Stored policy, or the defaults when none is stored or the stored one is out of range.
    pub async fn sla_policy(&self, organization_id: i32) -> ReviewResult<SlaPolicy> {
        match self.store.sla_policy(organization_id).await? {
            Some(policy) if policy.is_valid() => Ok(policy),
            Some(policy) => {
                warn!(organization_id, ?policy, "stored sla policy out of range; using defaults");
                Ok(SlaPolicy::default())
            }
            None => Ok(SlaPolicy::default()),
        }
    }

    pub async fn set_sla_policy(&self, organization_id: i32, policy: SlaPolicy) -> ReviewResult<SlaPolicy> {
        if !policy.is_valid() {
            return Err(ModerationError::InvalidInput(format!(
                "sla hours must be between 1 and {} for every priority",
                config::MAX_SLA_HOURS
            )));
        }
        self.store.save_sla_policy(organization_id, &policy).await?;
        Ok(policy)
    }

    pub async fn team(&self, organization_id: i32) -> ReviewResult<Vec<ModerationTeamSetting>> {
        Ok(self.store.team(organization_id).await?)
    }

    pub async fn update_team_member(
        &self,
        organization_id: i32,
        user_id: i32,
        is_available: bool,
        specializations: Vec<String>,
        now: DateTime<Utc>,
    ) -> ReviewResult<ModerationTeamSetting> {
        Ok(self
            .store
            .upsert_team_member(organization_id, user_id, is_available, &specializations, now)
            .await?)
    }

    /// Queues a scored result for human review. Priority and due date come from the
    /// scores and the organization's SLA policy; routing comes from the matching
    /// workflow, or least-loaded assignment when none matches.
    pub async fn enqueue_for_moderation(
        &self,
        result: ModerationResult,
        now: DateTime<Utc>,
    ) -> ReviewResult<EnqueuedItem> {
        self.store.insert_result(&result).await?;

        let priority = derive_priority(&result.scores);
        let policy = self.sla_policy(result.organization_id).await?;
        let due_at = policy
            .due_at(priority, now)
            .map_err(ModerationError::InvalidInput)?;
        let candidate = ModerationQueueItem::new(
            result.organization_id,
            result.id,
            priority,
            Some(due_at),
            now,
        );
        let item = self.store.insert_item(&candidate).await?;
        if item.id != candidate.id {
            return Ok(EnqueuedItem {
                item,
                workflow: None,
            });
        }
        info!(
            item_id = %item.id,
            organization_id = item.organization_id,
            priority = priority.as_str(),
            content_type = %result.content_type,
            "content queued for moderation"
        );

        match self.workflows.select_workflow_for_content(&result).await? {
            Some(workflow) => {
                let run = self
                    .workflows
                    .execute_workflow(&workflow, &item, &result, now)
                    .await?;
                let item = run.item.clone();
                Ok(EnqueuedItem {
                    item,
                    workflow: Some(run),
                })
            }
            None => {
                let item = self
                    .assignments
                    .assign(&item, &AssignmentStrategy::LeastLoaded, now)
                    .await?
                    .unwrap_or(item);
                Ok(EnqueuedItem {
                    item,
                    workflow: None,
                })
            }
        }
    }

    /// Open items visible to the moderator: their own plus the unassigned pool.
    pub async fn get_queue_for_user(
        &self,
        organization_id: i32,
        user_id: i32,
        priority: Option<QueuePriority>,
        limit: Option<usize>,
    ) -> ReviewResult<Vec<ModerationQueueItem>> {
        let filter = QueueFilter {
            assignee: AssigneeFilter::UserOrUnassigned(user_id),
            priority,
            limit,
            ..QueueFilter::open(organization_id)
        };
        Ok(self.store.list_items(&filter).await?)
    }

    /// Pending work already routed to the moderator comes first; otherwise the next
    /// unassigned item is claimed atomically.
    pub async fn get_next_item_for_user(
        &self,
        organization_id: i32,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> ReviewResult<Option<ModerationQueueItem>> {
        let routed = self
            .store
            .list_items(&QueueFilter {
                statuses: vec![QueueStatus::Pending],
                assignee: AssigneeFilter::User(user_id),
                limit: Some(1),
                ..QueueFilter::open(organization_id)
            })
            .await?;
        if let Some(mut item) = routed.into_iter().next() {
            item.status = QueueStatus::InProgress;
            item.updated_at = now;
            if let Some(started) = self.store.save_item(&item, QueueStatus::Pending).await? {
                return Ok(Some(started));
            }
        }

        let claimed = self
            .store
            .claim_next(organization_id, user_id, now)
            .await?;
        if let Some(item) = &claimed {
            info!(item_id = %item.id, organization_id, user_id, "queue item claimed");
        }
        Ok(claimed)
    }

    pub async fn assign_to_user(
        &self,
        organization_id: i32,
        item_id: Uuid,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> ReviewResult<ModerationQueueItem> {
        self.require_item(organization_id, item_id).await?;
        let item = self.assignments.transfer(item_id, Some(user_id), now).await?;
        info!(%item_id, organization_id, user_id, "queue item assigned");
        Ok(item)
    }

    pub async fn reassign(
        &self,
        organization_id: i32,
        item_id: Uuid,
        new_user_id: i32,
        now: DateTime<Utc>,
    ) -> ReviewResult<ModerationQueueItem> {
        let current = self.require_item(organization_id, item_id).await?;
        let mut item = self
            .assignments
            .transfer(item_id, Some(new_user_id), now)
            .await?;
        if let Some(previous) = current.assigned_to.filter(|previous| *previous != new_user_id) {
            item.metadata.insert("reassigned_from".into(), json!(previous));
            item.metadata
                .insert("reassigned_at".into(), json!(now.to_rfc3339()));
            let status = item.status;
            item = self.transition(item, status).await?;
        }
        info!(
            %item_id,
            organization_id,
            from = ?current.assigned_to,
            to = new_user_id,
            "queue item reassigned"
        );
        Ok(item)
    }

    /// Records the moderator's decision and moves the item accordingly:
    /// approve/reject complete it, request_changes returns it to pending with the same
    /// assignee, escalate hands it to a supervisor, skip returns it to the pool.
    pub async fn process_decision(
        &self,
        organization_id: i32,
        item_id: Uuid,
        user_id: i32,
        input: DecisionInput,
        now: DateTime<Utc>,
    ) -> ReviewResult<DecisionOutcome> {
        let kind = input.decision.ok_or_else(|| {
            ModerationError::InvalidInput("decision is required".into())
        })?;
        let item = self.require_item(organization_id, item_id).await?;
        if !item.is_open() {
            return Err(ModerationError::ItemClosed(item_id));
        }

        let time_spent_seconds = input.time_spent_seconds.unwrap_or_else(|| {
            item.assigned_at
                .map(|assigned| (now - assigned).num_seconds().max(0))
                .unwrap_or(0)
        });
        let decision = ModerationDecision {
            id: Uuid::new_v4(),
            queue_item_id: item.id,
            organization_id,
            user_id,
            decision: kind,
            notes: input.notes.clone(),
            field_changes: input.field_changes,
            time_spent_seconds,
            created_at: now,
        };
        let updated = match kind {
            DecisionKind::Approve | DecisionKind::Reject => self
                .store
                .complete_item(item_id, now)
                .await?
                .ok_or(ModerationError::ItemClosed(item_id))?,
            DecisionKind::RequestChanges => {
                let mut pending = item.clone();
                pending.status = QueueStatus::Pending;
                pending.updated_at = now;
                self.transition(pending, item.status).await?
            }
            DecisionKind::Escalate => {
                let reason = input
                    .notes
                    .as_deref()
                    .unwrap_or("escalated by moderator");
                self.assignments.escalate(&item, reason, None, now).await?
            }
            DecisionKind::Skip => {
                let mut skipped = self.assignments.transfer(item_id, None, now).await?;
                if skipped.status == QueueStatus::InProgress {
                    skipped.status = QueueStatus::Pending;
                    skipped.updated_at = now;
                    skipped = self.transition(skipped, QueueStatus::InProgress).await?;
                }
                skipped
            }
        };
        self.store.insert_decision(&decision).await?;

        let mut owner = None;
        if let Some(status) = kind.result_status() {
            owner = self
                .store
                .update_result_status(item.moderation_result_id, status, Some(user_id), now)
                .await?
                .map(|result| (result.owner_id, result.content_type, result.content_id));
        }
        if let Some((Some(owner_id), content_type, content_id)) = owner {
            dispatch(
                self.notifier.as_ref(),
                &[owner_id],
                NotificationCategory::Moderation,
                &format!("moderation_{}", kind.as_str()),
                &json!({
                    "content_type": content_type,
                    "content_id": content_id,
                    "notes": input.notes,
                }),
            )
            .await;
        }

        info!(
            %item_id,
            organization_id,
            user_id,
            decision = kind.as_str(),
            "moderation decision recorded"
        );

        let workflow = if kind != DecisionKind::Skip && item.current_step_id.is_some() {
            self.workflows
                .handle_human_decision(item_id, kind, now)
                .await?
        } else {
            None
        };
        let item = match &workflow {
            Some(run) => run.item.clone(),
            None => updated,
        };
        Ok(DecisionOutcome {
            decision,
            item,
            workflow,
        })
    }

    /// Escalates every overdue item; one failure never stops the sweep.
    pub async fn escalate_overdue_items(&self, now: DateTime<Utc>) -> ReviewResult<EscalationSummary> {
        let overdue = self.store.overdue_items(now).await?;
        let mut summary = EscalationSummary {
            checked: overdue.len(),
            ..EscalationSummary::default()
        };
        for item in overdue {
            match self
                .assignments
                .escalate(&item, "sla deadline passed", None, now)
                .await
            {
                Ok(_) => summary.escalated += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(?err, item_id = %item.id, organization_id = item.organization_id, "failed to escalate overdue item");
                }
            }
        }
        if summary.checked > 0 {
            info!(
                checked = summary.checked,
                escalated = summary.escalated,
                failed = summary.failed,
                "overdue moderation sweep finished"
            );
        }
        Ok(summary)
    }

    pub async fn get_queue_stats(&self, organization_id: i32, now: DateTime<Utc>) -> ReviewResult<QueueStats> {
        let open = self
            .store
            .list_items(&QueueFilter::open(organization_id))
            .await?;
        let since = now - Duration::days(config::SLA_COMPLIANCE_WINDOW_DAYS);
        let completed = self
            .store
            .list_items(&QueueFilter::completed_since(organization_id, since))
            .await?;

        let count = |status: QueueStatus| open.iter().filter(|item| item.status == status).count();
        let mut by_priority: BTreeMap<String, usize> = QueuePriority::ALL
            .iter()
            .map(|priority| (priority.as_str().to_string(), 0))
            .collect();
        for item in &open {
            *by_priority
                .entry(item.priority.as_str().to_string())
                .or_default() += 1;
        }

        let resolution: Vec<f64> = completed
            .iter()
            .filter_map(|item| item.completed_at.map(|done| (done - item.created_at).num_seconds()))
            .map(|seconds| seconds as f64 / 60.0)
            .collect();
        let average_resolution_minutes = if resolution.is_empty() {
            None
        } else {
            Some(resolution.iter().sum::<f64>() / resolution.len() as f64)
        };

        Ok(QueueStats {
            pending: count(QueueStatus::Pending),
            in_progress: count(QueueStatus::InProgress),
            escalated: count(QueueStatus::Escalated),
            unassigned: open.iter().filter(|item| item.assigned_to.is_none()).count(),
            overdue: open.iter().filter(|item| item.is_overdue(now)).count(),
            by_priority,
            completed_in_window: completed.len(),
            sla_compliance: sla_compliance(&completed),
            average_resolution_minutes,
        })
    }

    pub async fn get_user_stats(
        &self,
        organization_id: i32,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> ReviewResult<UserStats> {
        let since = now - Duration::days(config::SLA_COMPLIANCE_WINDOW_DAYS);
        let decisions = self
            .store
            .list_decisions(organization_id, Some(user_id), Some(since))
            .await?;
        let open_items = self
            .store
            .list_items(&QueueFilter {
                assignee: AssigneeFilter::User(user_id),
                ..QueueFilter::open(organization_id)
            })
            .await?
            .len();
        let current_load = self
            .store
            .find_team_member(organization_id, user_id)
            .await?
            .map(|member| member.current_load)
            .unwrap_or(0);

        let mut decisions_by_kind = BTreeMap::new();
        for decision in &decisions {
            *decisions_by_kind
                .entry(decision.decision.as_str().to_string())
                .or_insert(0) += 1;
        }
        let average_time_spent_seconds = if decisions.is_empty() {
            None
        } else {
            let total: i64 = decisions.iter().map(|decision| decision.time_spent_seconds).sum();
            Some(total as f64 / decisions.len() as f64)
        };

        Ok(UserStats {
            user_id,
            current_load,
            open_items,
            decisions: decisions.len(),
            decisions_by_kind,
            average_time_spent_seconds,
        })
    }

    /// Saves `item` if its stored status is still `expected`; a miss means another
    /// writer moved the item first.
    async fn transition(
        &self,
        item: ModerationQueueItem,
        expected: QueueStatus,
    ) -> ReviewResult<ModerationQueueItem> {
        let item_id = item.id;
        self.store
            .save_item(&item, expected)
            .await?
            .ok_or(ModerationError::ItemClosed(item_id))
    }

    async fn require_item(&self, organization_id: i32, item_id: Uuid) -> ReviewResult<ModerationQueueItem> {
        match self.store.find_item(item_id).await? {
            Some(item) if item.organization_id == organization_id => Ok(item),
            _ => Err(ModerationError::ItemNotFound(item_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(due_offset_minutes: Option<i64>) -> ModerationQueueItem {
        let now = Utc::now();
        let mut item = ModerationQueueItem::new(
            1,
            Uuid::new_v4(),
            QueuePriority::Normal,
            due_offset_minutes.map(|offset| now + Duration::minutes(offset)),
            now - Duration::hours(1),
        );
        item.status = QueueStatus::Completed;
        item.completed_at = Some(now);
        item
    }

    #[test]
    fn compliance_is_share_of_on_time_completions() {
        let mut items: Vec<_> = (0..7).map(|_| completed(Some(30))).collect();
        items.extend((0..3).map(|_| completed(Some(-30))));
        assert_eq!(sla_compliance(&items), 70.0);
    }

    #[test]
    fn compliance_counts_undated_items_as_met() {
        let items = vec![completed(None), completed(Some(-5))];
        assert_eq!(sla_compliance(&items), 50.0);
        assert_eq!(sla_compliance(&[]), 100.0);
    }
}
