use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::graph::{TriggerCondition, WorkflowGraph};
use crate::config;
use crate::db::Metadata;

/// AI scores for one piece of content, each in `0.0..=1.0`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModerationScores {
    pub overall_score: f64,
    pub age_appropriateness_score: f64,
    pub clinical_safety_score: f64,
    pub cultural_sensitivity_score: f64,
    pub accuracy_score: f64,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    Pending,
    Approved,
    Rejected,
    Flagged,
    ChangesRequested,
    Escalated,
}

impl ModerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationStatus::Pending => "pending",
            ModerationStatus::Approved => "approved",
            ModerationStatus::Rejected => "rejected",
            ModerationStatus::Flagged => "flagged",
            ModerationStatus::ChangesRequested => "changes_requested",
            ModerationStatus::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "flagged" => Some(Self::Flagged),
            "changes_requested" => Some(Self::ChangesRequested),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

// key: moderation-models -> results,queue items,decisions,team,workflows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModerationResult {
    pub id: Uuid,
    pub organization_id: i32,
    pub content_type: String,
    pub content_id: i64,
    pub owner_id: Option<i32>,
    pub scores: ModerationScores,
    pub status: ModerationStatus,
    pub human_reviewed: bool,
    pub reviewed_by: Option<i32>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ModerationResult {
    pub fn new(
        organization_id: i32,
        content_type: impl Into<String>,
        content_id: i64,
        owner_id: Option<i32>,
        scores: ModerationScores,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            content_type: content_type.into(),
            content_id,
            owner_id,
            scores,
            status: ModerationStatus::Pending,
            human_reviewed: false,
            reviewed_by: None,
            reviewed_at: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Completed,
    Escalated,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Completed => "completed",
            QueueStatus::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Urgent,
    High,
    Normal,
    Low,
}

impl QueuePriority {
    pub const ALL: [QueuePriority; 4] = [
        QueuePriority::Urgent,
        QueuePriority::High,
        QueuePriority::Normal,
        QueuePriority::Low,
    ];

    /// Sort key; urgent first.
    pub fn rank(&self) -> i16 {
        match self {
            QueuePriority::Urgent => 0,
            QueuePriority::High => 1,
            QueuePriority::Normal => 2,
            QueuePriority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePriority::Urgent => "urgent",
            QueuePriority::High => "high",
            QueuePriority::Normal => "normal",
            QueuePriority::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|priority| priority.as_str() == value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModerationQueueItem {
    pub id: Uuid,
    pub organization_id: i32,
    pub moderation_result_id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub status: QueueStatus,
    pub priority: QueuePriority,
    pub assigned_to: Option<i32>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    /// Workflow node the item is parked on.
    pub current_step_id: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModerationQueueItem {
    pub fn new(
        organization_id: i32,
        moderation_result_id: Uuid,
        priority: QueuePriority,
        due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            moderation_result_id,
            workflow_id: None,
            status: QueueStatus::Pending,
            priority,
            assigned_to: None,
            assigned_at: None,
            due_at,
            current_step_id: None,
            completed_at: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status != QueueStatus::Completed
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_open()
            && self.status != QueueStatus::Escalated
            && matches!(self.due_at, Some(due) if due < now)
    }

    /// Completed on time; items without a due date always count as compliant.
    pub fn met_sla(&self) -> bool {
        match (self.completed_at, self.due_at) {
            (Some(completed), Some(due)) => completed <= due,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Reject,
    RequestChanges,
    Escalate,
    Skip,
}

impl DecisionKind {
    pub const ALL: [DecisionKind; 5] = [
        DecisionKind::Approve,
        DecisionKind::Reject,
        DecisionKind::RequestChanges,
        DecisionKind::Escalate,
        DecisionKind::Skip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Approve => "approve",
            DecisionKind::Reject => "reject",
            DecisionKind::RequestChanges => "request_changes",
            DecisionKind::Escalate => "escalate",
            DecisionKind::Skip => "skip",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|decision| decision.as_str() == value)
    }

    /// Moderation result status reflecting the human override, if any.
    pub fn result_status(&self) -> Option<ModerationStatus> {
        match self {
            DecisionKind::Approve => Some(ModerationStatus::Approved),
            DecisionKind::Reject => Some(ModerationStatus::Rejected),
            DecisionKind::RequestChanges => Some(ModerationStatus::ChangesRequested),
            DecisionKind::Escalate => Some(ModerationStatus::Escalated),
            DecisionKind::Skip => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModerationDecision {
    pub id: Uuid,
    pub queue_item_id: Uuid,
    pub organization_id: i32,
    pub user_id: i32,
    pub decision: DecisionKind,
    pub notes: Option<String>,
    pub field_changes: Metadata,
    pub time_spent_seconds: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModerationTeamSetting {
    pub organization_id: i32,
    pub user_id: i32,
    pub is_available: bool,
    pub current_load: i32,
    pub specializations: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl ModerationTeamSetting {
    pub fn has_any_skill(&self, skills: &[String]) -> bool {
        skills
            .iter()
            .any(|skill| self.specializations.iter().any(|own| own == skill))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModerationWorkflow {
    pub id: Uuid,
    pub organization_id: i32,
    pub name: String,
    pub is_active: bool,
    pub is_default: bool,
    /// Higher wins when several workflows match.
    pub priority: i32,
    /// Content types this workflow handles; empty matches all.
    #[serde(default)]
    pub content_types: Vec<String>,
    #[serde(default)]
    pub trigger_conditions: Vec<TriggerCondition>,
    pub graph: WorkflowGraph,
    pub created_at: DateTime<Utc>,
}

impl ModerationWorkflow {
    pub fn handles(&self, content_type: &str) -> bool {
        self.content_types.is_empty() || self.content_types.iter().any(|kind| kind == content_type)
    }
}

/// Per-organization SLA targets in hours.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlaPolicy {
    pub urgent_hours: i64,
    pub high_hours: i64,
    pub normal_hours: i64,
    pub low_hours: i64,
}

impl Default for SlaPolicy {
    fn default() -> Self {
        Self {
            urgent_hours: config::DEFAULT_SLA_HOURS_URGENT,
            high_hours: config::DEFAULT_SLA_HOURS_HIGH,
            normal_hours: config::DEFAULT_SLA_HOURS_NORMAL,
            low_hours: config::DEFAULT_SLA_HOURS_LOW,
        }
    }
}

impl SlaPolicy {
    pub fn hours_for(&self, priority: QueuePriority) -> i64 {
        match priority {
            QueuePriority::Urgent => self.urgent_hours,
            QueuePriority::High => self.high_hours,
            QueuePriority::Normal => self.normal_hours,
            QueuePriority::Low => self.low_hours,
        }
    }

    pub fn due_at(&self, priority: QueuePriority, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
        sla_deadline(now, self.hours_for(priority))
    }

    pub fn is_valid(&self) -> bool {
        QueuePriority::ALL
            .iter()
            .all(|priority| sla_hours_in_range(self.hours_for(*priority)))
    }
}

pub fn sla_hours_in_range(hours: i64) -> bool {
    (1..=config::MAX_SLA_HOURS).contains(&hours)
}

/// `now` plus `hours`, refusing hours outside `1..=MAX_SLA_HOURS`.
pub fn sla_deadline(now: DateTime<Utc>, hours: i64) -> Result<DateTime<Utc>, String> {
    if !sla_hours_in_range(hours) {
        return Err(format!(
            "sla hours must be between 1 and {}, got {hours}",
            config::MAX_SLA_HOURS
        ));
    }
    now.checked_add_signed(Duration::hours(hours))
        .ok_or_else(|| format!("sla of {hours} hours overflows the calendar"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sla_compliance_treats_missing_due_date_as_met() {
        let now = Utc::now();
        let mut item =
            ModerationQueueItem::new(1, Uuid::new_v4(), QueuePriority::Normal, None, now);
        assert!(!item.met_sla());
        item.completed_at = Some(now);
        assert!(item.met_sla());
        item.due_at = Some(now - Duration::minutes(1));
        assert!(!item.met_sla());
        item.due_at = Some(now);
        assert!(item.met_sla());
    }

    #[test]
    fn overdue_excludes_escalated_and_completed() {
        let now = Utc::now();
        let mut item = ModerationQueueItem::new(
            1,
            Uuid::new_v4(),
            QueuePriority::High,
            Some(now - Duration::hours(1)),
            now,
        );
        assert!(item.is_overdue(now));
        item.status = QueueStatus::Escalated;
        assert!(!item.is_overdue(now));
        item.status = QueueStatus::Completed;
        assert!(!item.is_overdue(now));
    }

    #[test]
    fn default_sla_hours() {
        let policy = SlaPolicy::default();
        assert_eq!(policy.hours_for(QueuePriority::Urgent), 4);
        assert_eq!(policy.hours_for(QueuePriority::Low), 72);
        assert!(policy.is_valid());
    }

    #[test]
    fn sla_hours_are_bounded() {
        let now = Utc::now();
        let huge = SlaPolicy {
            urgent_hours: i64::MAX / 2,
            ..SlaPolicy::default()
        };
        assert!(!huge.is_valid());
        assert!(huge.due_at(QueuePriority::Urgent, now).is_err());
        assert!(!SlaPolicy { low_hours: 0, ..SlaPolicy::default() }.is_valid());

        assert_eq!(
            sla_deadline(now, config::MAX_SLA_HOURS).unwrap(),
            now + Duration::hours(config::MAX_SLA_HOURS)
        );
        assert!(sla_deadline(now, config::MAX_SLA_HOURS + 1).is_err());
        assert!(sla_deadline(now, -3).is_err());
    }
}
