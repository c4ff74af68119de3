use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::models::{
    ModerationDecision, ModerationQueueItem, ModerationResult, ModerationStatus,
    ModerationTeamSetting, ModerationWorkflow, QueuePriority, QueueStatus, SlaPolicy,
};
use crate::db::StoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssigneeFilter {
    Any,
    Unassigned,
    User(i32),
    UserOrUnassigned(i32),
}

impl AssigneeFilter {
    pub fn accepts(&self, assigned_to: Option<i32>) -> bool {
        match (self, assigned_to) {
            (AssigneeFilter::Any, _) => true,
            (AssigneeFilter::Unassigned, None) => true,
            (AssigneeFilter::User(user), Some(assignee)) => *user == assignee,
            (AssigneeFilter::UserOrUnassigned(_), None) => true,
            (AssigneeFilter::UserOrUnassigned(user), Some(assignee)) => *user == assignee,
            _ => false,
        }
    }
}

/// Queue query. An empty status list means every open status.
#[derive(Debug, Clone)]
pub struct QueueFilter {
    pub organization_id: i32,
    pub statuses: Vec<QueueStatus>,
    pub assignee: AssigneeFilter,
    pub priority: Option<QueuePriority>,
    pub completed_since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl QueueFilter {
    pub fn open(organization_id: i32) -> Self {
        Self {
            organization_id,
            statuses: Vec::new(),
            assignee: AssigneeFilter::Any,
            priority: None,
            completed_since: None,
            limit: None,
        }
    }

    pub fn completed_since(organization_id: i32, since: DateTime<Utc>) -> Self {
        Self {
            statuses: vec![QueueStatus::Completed],
            completed_since: Some(since),
            ..Self::open(organization_id)
        }
    }

    pub fn statuses(&self) -> Vec<QueueStatus> {
        if self.statuses.is_empty() {
            vec![
                QueueStatus::Pending,
                QueueStatus::InProgress,
                QueueStatus::Escalated,
            ]
        } else {
            self.statuses.clone()
        }
    }

    pub fn accepts(&self, item: &ModerationQueueItem) -> bool {
        item.organization_id == self.organization_id
            && self.statuses().contains(&item.status)
            && self.assignee.accepts(item.assigned_to)
            && self.priority.map_or(true, |priority| item.priority == priority)
            && self.completed_since.map_or(true, |since| {
                matches!(item.completed_at, Some(completed) if completed >= since)
            })
    }
}

/// Queue order: priority, then earliest due date (undated last), then age.
pub fn queue_order(left: &ModerationQueueItem, right: &ModerationQueueItem) -> Ordering {
    left.priority
        .rank()
        .cmp(&right.priority.rank())
        .then_with(|| match (left.due_at, right.due_at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| left.created_at.cmp(&right.created_at))
}

/// Compare-and-set rule for [`ModerationStore::save_item`].
pub fn status_transition_allowed(
    stored: QueueStatus,
    expected: QueueStatus,
    next: QueueStatus,
) -> bool {
    stored == expected && (stored != QueueStatus::Completed || next == QueueStatus::Completed)
}

// key: moderation-store -> persistence seam for the review queue
#[async_trait]
pub trait ModerationStore: Send + Sync {
    async fn insert_result(&self, result: &ModerationResult) -> StoreResult<()>;
    async fn find_result(&self, id: Uuid) -> StoreResult<Option<ModerationResult>>;
    /// Records a status change; a reviewer marks the result as human reviewed.
    async fn update_result_status(
        &self,
        id: Uuid,
        status: ModerationStatus,
        reviewed_by: Option<i32>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationResult>>;

    /// Inserts the item unless one already exists for the same moderation result,
    /// in which case the existing item is returned.
    async fn insert_item(&self, item: &ModerationQueueItem) -> StoreResult<ModerationQueueItem>;
    async fn find_item(&self, id: Uuid) -> StoreResult<Option<ModerationQueueItem>>;
    /// Persists everything except the assignment columns and `completed_at`, which only
    /// move through [`ModerationStore::assign_item`], [`ModerationStore::claim_next`] and
    /// [`ModerationStore::complete_item`]. The write applies only while the stored status
    /// is still `expected` and never reopens a completed item; `None` reports a miss.
    async fn save_item(
        &self,
        item: &ModerationQueueItem,
        expected: QueueStatus,
    ) -> StoreResult<Option<ModerationQueueItem>>;
    async fn list_items(&self, filter: &QueueFilter) -> StoreResult<Vec<ModerationQueueItem>>;
    /// Moves an open item from `expected_previous` to `assignee`, adjusting both
    /// moderators' loads. Returns `None` when the item is closed or the current
    /// assignee no longer matches.
    async fn assign_item(
        &self,
        item_id: Uuid,
        assignee: Option<i32>,
        expected_previous: Option<i32>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationQueueItem>>;
    /// Atomically hands the next unassigned pending item to `user_id` and marks it in progress.
    async fn claim_next(
        &self,
        organization_id: i32,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationQueueItem>>;
    /// Completes an open item and releases its assignee's load.
    async fn complete_item(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationQueueItem>>;
    /// Assignee of the organization's most recently assigned item.
    async fn last_assigned_user(&self, organization_id: i32) -> StoreResult<Option<i32>>;
    /// Open, not yet escalated items past their due date, across organizations.
    async fn overdue_items(&self, now: DateTime<Utc>) -> StoreResult<Vec<ModerationQueueItem>>;

    async fn insert_decision(&self, decision: &ModerationDecision) -> StoreResult<()>;
    async fn list_decisions(
        &self,
        organization_id: i32,
        user_id: Option<i32>,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<ModerationDecision>>;

    async fn team(&self, organization_id: i32) -> StoreResult<Vec<ModerationTeamSetting>>;
    async fn find_team_member(
        &self,
        organization_id: i32,
        user_id: i32,
    ) -> StoreResult<Option<ModerationTeamSetting>>;
    /// Upserts availability and skills; the load counter is preserved.
    async fn upsert_team_member(
        &self,
        organization_id: i32,
        user_id: i32,
        is_available: bool,
        specializations: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<ModerationTeamSetting>;

    async fn list_workflows(&self, organization_id: i32) -> StoreResult<Vec<ModerationWorkflow>>;
    async fn find_workflow(&self, id: Uuid) -> StoreResult<Option<ModerationWorkflow>>;
    /// Upserts; saving a default workflow clears the flag on the organization's others.
    async fn save_workflow(&self, workflow: &ModerationWorkflow) -> StoreResult<()>;

    async fn sla_policy(&self, organization_id: i32) -> StoreResult<Option<SlaPolicy>>;
    async fn save_sla_policy(&self, organization_id: i32, policy: &SlaPolicy) -> StoreResult<()>;
}

#[derive(Default)]
struct ModerationState {
    results: HashMap<Uuid, ModerationResult>,
    items: HashMap<Uuid, ModerationQueueItem>,
    decisions: Vec<ModerationDecision>,
    team: HashMap<(i32, i32), ModerationTeamSetting>,
    workflows: HashMap<Uuid, ModerationWorkflow>,
    sla: HashMap<i32, SlaPolicy>,
}

impl ModerationState {
    fn adjust_load(&mut self, organization_id: i32, user_id: i32, delta: i32, now: DateTime<Utc>) {
        let member = self
            .team
            .entry((organization_id, user_id))
            .or_insert_with(|| ModerationTeamSetting {
                organization_id,
                user_id,
                is_available: true,
                current_load: 0,
                specializations: Vec::new(),
                updated_at: now,
            });
        member.current_load = (member.current_load + delta).max(0);
        member.updated_at = now;
    }
}

/// In-memory [`ModerationStore`]; one lock makes claims and load updates atomic.
#[derive(Default)]
pub struct MemoryModerationStore {
    state: Mutex<ModerationState>,
}

impl MemoryModerationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModerationStore for MemoryModerationStore {
    async fn insert_result(&self, result: &ModerationResult) -> StoreResult<()> {
        self.state.lock().results.insert(result.id, result.clone());
        Ok(())
    }

    async fn find_result(&self, id: Uuid) -> StoreResult<Option<ModerationResult>> {
        Ok(self.state.lock().results.get(&id).cloned())
    }

    async fn update_result_status(
        &self,
        id: Uuid,
        status: ModerationStatus,
        reviewed_by: Option<i32>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationResult>> {
        let mut state = self.state.lock();
        Ok(state.results.get_mut(&id).map(|result| {
            result.status = status;
            if let Some(reviewer) = reviewed_by {
                result.human_reviewed = true;
                result.reviewed_by = Some(reviewer);
                result.reviewed_at = Some(now);
            }
            result.clone()
        }))
    }

    async fn insert_item(&self, item: &ModerationQueueItem) -> StoreResult<ModerationQueueItem> {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .items
            .values()
            .find(|existing| existing.moderation_result_id == item.moderation_result_id)
        {
            return Ok(existing.clone());
        }
        state.items.insert(item.id, item.clone());
        Ok(item.clone())
    }

    async fn find_item(&self, id: Uuid) -> StoreResult<Option<ModerationQueueItem>> {
        Ok(self.state.lock().items.get(&id).cloned())
    }

    async fn save_item(
        &self,
        item: &ModerationQueueItem,
        expected: QueueStatus,
    ) -> StoreResult<Option<ModerationQueueItem>> {
        let mut state = self.state.lock();
        let Some(stored) = state.items.get_mut(&item.id) else {
            return Ok(None);
        };
        if !status_transition_allowed(stored.status, expected, item.status) {
            return Ok(None);
        }
        let assigned_to = stored.assigned_to;
        let assigned_at = stored.assigned_at;
        let completed_at = stored.completed_at;
        *stored = item.clone();
        stored.assigned_to = assigned_to;
        stored.assigned_at = assigned_at;
        stored.completed_at = completed_at;
        Ok(Some(stored.clone()))
    }

    async fn list_items(&self, filter: &QueueFilter) -> StoreResult<Vec<ModerationQueueItem>> {
        let state = self.state.lock();
        let mut items: Vec<_> = state
            .items
            .values()
            .filter(|item| filter.accepts(item))
            .cloned()
            .collect();
        items.sort_by(queue_order);
        if let Some(limit) = filter.limit {
            items.truncate(limit);
        }
        Ok(items)
    }

    async fn assign_item(
        &self,
        item_id: Uuid,
        assignee: Option<i32>,
        expected_previous: Option<i32>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationQueueItem>> {
        let mut state = self.state.lock();
        let Some(item) = state.items.get_mut(&item_id) else {
            return Ok(None);
        };
        if !item.is_open() || item.assigned_to != expected_previous {
            return Ok(None);
        }
        item.assigned_to = assignee;
        item.assigned_at = assignee.map(|_| now);
        item.updated_at = now;
        let updated = item.clone();

        if let Some(previous) = expected_previous {
            state.adjust_load(updated.organization_id, previous, -1, now);
        }
        if let Some(next) = assignee {
            state.adjust_load(updated.organization_id, next, 1, now);
        }
        Ok(Some(updated))
    }

    async fn claim_next(
        &self,
        organization_id: i32,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationQueueItem>> {
        let mut state = self.state.lock();
        let filter = QueueFilter {
            statuses: vec![QueueStatus::Pending],
            assignee: AssigneeFilter::Unassigned,
            ..QueueFilter::open(organization_id)
        };
        let next = state
            .items
            .values()
            .filter(|item| filter.accepts(item))
            .min_by(|left, right| queue_order(left, right))
            .map(|item| item.id);
        let Some(next) = next else {
            return Ok(None);
        };
        let claimed = match state.items.get_mut(&next) {
            Some(item) => {
                item.assigned_to = Some(user_id);
                item.assigned_at = Some(now);
                item.status = QueueStatus::InProgress;
                item.updated_at = now;
                item.clone()
            }
            None => return Ok(None),
        };
        state.adjust_load(organization_id, user_id, 1, now);
        Ok(Some(claimed))
    }

    async fn complete_item(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ModerationQueueItem>> {
        let mut state = self.state.lock();
        let Some(item) = state.items.get_mut(&item_id) else {
            return Ok(None);
        };
        if !item.is_open() {
            return Ok(None);
        }
        item.status = QueueStatus::Completed;
        item.completed_at = Some(now);
        item.updated_at = now;
        let completed = item.clone();
        if let Some(assignee) = completed.assigned_to {
            state.adjust_load(completed.organization_id, assignee, -1, now);
        }
        Ok(Some(completed))
    }

    async fn last_assigned_user(&self, organization_id: i32) -> StoreResult<Option<i32>> {
        let state = self.state.lock();
        Ok(state
            .items
            .values()
            .filter(|item| item.organization_id == organization_id && item.assigned_at.is_some())
            .max_by_key(|item| item.assigned_at)
            .and_then(|item| item.assigned_to))
    }

    async fn overdue_items(&self, now: DateTime<Utc>) -> StoreResult<Vec<ModerationQueueItem>> {
        let state = self.state.lock();
        let mut items: Vec<_> = state
            .items
            .values()
            .filter(|item| item.is_overdue(now))
            .cloned()
            .collect();
        items.sort_by(queue_order);
        Ok(items)
    }

    async fn insert_decision(&self, decision: &ModerationDecision) -> StoreResult<()> {
        self.state.lock().decisions.push(decision.clone());
        Ok(())
    }

    async fn list_decisions(
        &self,
        organization_id: i32,
        user_id: Option<i32>,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<ModerationDecision>> {
        let state = self.state.lock();
        Ok(state
            .decisions
            .iter()
            .filter(|decision| {
                decision.organization_id == organization_id
                    && user_id.map_or(true, |user| decision.user_id == user)
                    && since.map_or(true, |since| decision.created_at >= since)
            })
            .cloned()
            .collect())
    }

    async fn team(&self, organization_id: i32) -> StoreResult<Vec<ModerationTeamSetting>> {
        let state = self.state.lock();
        let mut team: Vec<_> = state
            .team
            .values()
            .filter(|member| member.organization_id == organization_id)
            .cloned()
            .collect();
        team.sort_by_key(|member| member.user_id);
        Ok(team)
    }

    async fn find_team_member(
        &self,
        organization_id: i32,
        user_id: i32,
    ) -> StoreResult<Option<ModerationTeamSetting>> {
        Ok(self
            .state
            .lock()
            .team
            .get(&(organization_id, user_id))
            .cloned())
    }

    async fn upsert_team_member(
        &self,
        organization_id: i32,
        user_id: i32,
        is_available: bool,
        specializations: &[String],
        now: DateTime<Utc>,
    ) -> StoreResult<ModerationTeamSetting> {
        let mut state = self.state.lock();
        let member = state
            .team
            .entry((organization_id, user_id))
            .or_insert_with(|| ModerationTeamSetting {
                organization_id,
                user_id,
                is_available,
                current_load: 0,
                specializations: Vec::new(),
                updated_at: now,
            });
        member.is_available = is_available;
        member.specializations = specializations.to_vec();
        member.updated_at = now;
        Ok(member.clone())
    }

    async fn list_workflows(&self, organization_id: i32) -> StoreResult<Vec<ModerationWorkflow>> {
        let state = self.state.lock();
        let mut workflows: Vec<_> = state
            .workflows
            .values()
            .filter(|workflow| workflow.organization_id == organization_id)
            .cloned()
            .collect();
        workflows.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then(left.created_at.cmp(&right.created_at))
        });
        Ok(workflows)
    }

    async fn find_workflow(&self, id: Uuid) -> StoreResult<Option<ModerationWorkflow>> {
        Ok(self.state.lock().workflows.get(&id).cloned())
    }

    async fn save_workflow(&self, workflow: &ModerationWorkflow) -> StoreResult<()> {
        let mut state = self.state.lock();
        if workflow.is_default {
            for other in state
                .workflows
                .values_mut()
                .filter(|other| other.organization_id == workflow.organization_id)
            {
                other.is_default = false;
            }
        }
        state.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn sla_policy(&self, organization_id: i32) -> StoreResult<Option<SlaPolicy>> {
        Ok(self.state.lock().sla.get(&organization_id).copied())
    }

    async fn save_sla_policy(&self, organization_id: i32, policy: &SlaPolicy) -> StoreResult<()> {
        self.state.lock().sla.insert(organization_id, *policy);
        Ok(())
    }
}
