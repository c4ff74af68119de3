//! Interprets stored workflow graphs against a queue item.
//!
//! Interpretation walks from the trigger node, evaluating condition nodes and following
//! edges, until it reaches a terminal node (auto approve/reject, escalate) or parks on a
//! `human_decision` node. A parked item resumes through
//! [`ModerationWorkflowService::handle_human_decision`] with the decision as branch label.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::assignment::ModerationAssignmentService;
use super::content::ContentRegistry;
use super::error::{ModerationError, ReviewResult};
use super::graph::{
    select_edge, AutoDecisionConfig, BranchValue, EscalateConfig, HumanDecisionConfig, NodeKind,
    RouteToModeratorConfig, WorkflowNode,
};
use super::models::{
    sla_deadline, DecisionKind, ModerationQueueItem, ModerationResult, ModerationStatus,
    ModerationWorkflow, QueueStatus, SlaPolicy,
};
use super::store::ModerationStore;
use crate::config;
use crate::notifications::{dispatch, NotificationCategory, NotificationSink};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    AwaitingDecision { node_id: String },
    AutoApproved,
    AutoRejected,
    Escalated,
    /// A decision closed the item before the workflow reached another review step.
    Closed,
    /// A non-terminal node had no outgoing edge.
    DeadEnd { node_id: String },
    StepLimitReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRun {
    pub workflow_id: Uuid,
    pub outcome: WorkflowOutcome,
    pub visited: Vec<String>,
    pub item: ModerationQueueItem,
}

enum Step {
    Continue(BranchValue),
    Stop(WorkflowOutcome),
}

// key: moderation-workflow -> graph selection,interpretation,resume after review
#[derive(Clone)]
pub struct ModerationWorkflowService {
    store: Arc<dyn ModerationStore>,
    assignments: ModerationAssignmentService,
    notifier: Arc<dyn NotificationSink>,
    content: ContentRegistry,
}

impl ModerationWorkflowService {
    pub fn new(
        store: Arc<dyn ModerationStore>,
        assignments: ModerationAssignmentService,
        notifier: Arc<dyn NotificationSink>,
        content: ContentRegistry,
    ) -> Self {
        Self {
            store,
            assignments,
            notifier,
            content,
        }
    }

    pub async fn save_workflow(&self, workflow: &ModerationWorkflow) -> ReviewResult<()> {
        workflow
            .graph
            .validate()
            .map_err(ModerationError::InvalidWorkflow)?;
        self.store.save_workflow(workflow).await?;
        info!(
            workflow_id = %workflow.id,
            organization_id = workflow.organization_id,
            is_default = workflow.is_default,
            "moderation workflow saved"
        );
        Ok(())
    }

    pub async fn list_workflows(&self, organization_id: i32) -> ReviewResult<Vec<ModerationWorkflow>> {
        Ok(self.store.list_workflows(organization_id).await?)
    }

    /// Highest-priority active workflow whose content types and trigger conditions
    /// match, else the organization's default.
    pub async fn select_workflow_for_content(
        &self,
        result: &ModerationResult,
    ) -> ReviewResult<Option<ModerationWorkflow>> {
        let workflows = self.store.list_workflows(result.organization_id).await?;

        let matched = workflows
            .iter()
            .filter(|workflow| workflow.is_active && workflow.handles(&result.content_type))
            .filter(|workflow| {
                workflow
                    .trigger_conditions
                    .iter()
                    .all(|condition| condition.matches(&result.scores))
            })
            .max_by(|left, right| {
                left.priority
                    .cmp(&right.priority)
                    .then(right.created_at.cmp(&left.created_at))
            });
        if let Some(workflow) = matched {
            return Ok(Some(workflow.clone()));
        }

        Ok(workflows
            .into_iter()
            .find(|workflow| workflow.is_default && workflow.is_active))
    }

    /// Runs `workflow` for the item from its start node.
    pub async fn execute_workflow(
        &self,
        workflow: &ModerationWorkflow,
        item: &ModerationQueueItem,
        result: &ModerationResult,
        now: DateTime<Utc>,
    ) -> ReviewResult<WorkflowRun> {
        let start = workflow.graph.start_node().ok_or_else(|| {
            ModerationError::InvalidWorkflow(format!("workflow {} has no nodes", workflow.id))
        })?;

        let mut item = item.clone();
        item.workflow_id = Some(workflow.id);
        item.current_step_id = None;
        item.updated_at = now;
        let status = item.status;
        self.persist(&mut item, status).await?;

        debug!(
            workflow_id = %workflow.id,
            item_id = %item.id,
            start = %start.id,
            "executing moderation workflow"
        );
        let start_id = start.id.clone();
        self.run_from(workflow, item, result, start_id, Vec::new(), now)
            .await
    }

    /// Resumes a parked item using the decision as the branch label. `None` when the
    /// item is not waiting on a workflow step.
    pub async fn handle_human_decision(
        &self,
        item_id: Uuid,
        decision: DecisionKind,
        now: DateTime<Utc>,
    ) -> ReviewResult<Option<WorkflowRun>> {
        let mut item = self
            .store
            .find_item(item_id)
            .await?
            .ok_or(ModerationError::ItemNotFound(item_id))?;
        let (Some(workflow_id), Some(step_id)) = (item.workflow_id, item.current_step_id.clone())
        else {
            return Ok(None);
        };
        let workflow = self
            .store
            .find_workflow(workflow_id)
            .await?
            .ok_or(ModerationError::WorkflowNotFound(workflow_id))?;
        let result = self
            .store
            .find_result(item.moderation_result_id)
            .await?
            .ok_or(ModerationError::ItemNotFound(item_id))?;

        item.current_step_id = None;
        item.updated_at = now;
        let status = item.status;
        self.persist(&mut item, status).await?;

        let edges = workflow.graph.outgoing(&step_id);
        let branch = BranchValue::Text(decision.as_str().to_string());
        let Some(edge) = select_edge(&edges, &branch) else {
            return Ok(Some(WorkflowRun {
                workflow_id,
                outcome: WorkflowOutcome::DeadEnd { node_id: step_id },
                visited: Vec::new(),
                item,
            }));
        };
        info!(
            %item_id,
            %workflow_id,
            from = %step_id,
            to = %edge.target,
            decision = decision.as_str(),
            "resuming moderation workflow"
        );
        let target = edge.target.clone();
        self.run_from(&workflow, item, &result, target, Vec::new(), now)
            .await
            .map(Some)
    }

    async fn run_from(
        &self,
        workflow: &ModerationWorkflow,
        mut item: ModerationQueueItem,
        result: &ModerationResult,
        mut node_id: String,
        mut visited: Vec<String>,
        now: DateTime<Utc>,
    ) -> ReviewResult<WorkflowRun> {
        while visited.len() < config::WORKFLOW_STEP_LIMIT {
            let node = workflow.graph.node(&node_id).ok_or_else(|| {
                ModerationError::InvalidWorkflow(format!("unknown node `{node_id}`"))
            })?;
            visited.push(node.id.clone());

            let branch = match self.execute_node(node, &mut item, result, now).await? {
                Step::Stop(outcome) => {
                    return Ok(WorkflowRun {
                        workflow_id: workflow.id,
                        outcome,
                        visited,
                        item,
                    })
                }
                Step::Continue(branch) => branch,
            };

            let edges = workflow.graph.outgoing(&node.id);
            let Some(edge) = select_edge(&edges, &branch) else {
                warn!(
                    workflow_id = %workflow.id,
                    item_id = %item.id,
                    node_id = %node.id,
                    "workflow stopped at node without outgoing edges"
                );
                return Ok(WorkflowRun {
                    workflow_id: workflow.id,
                    outcome: WorkflowOutcome::DeadEnd {
                        node_id: node.id.clone(),
                    },
                    visited,
                    item,
                });
            };
            node_id = edge.target.clone();
        }

        warn!(
            workflow_id = %workflow.id,
            item_id = %item.id,
            limit = config::WORKFLOW_STEP_LIMIT,
            "workflow step limit reached"
        );
        Ok(WorkflowRun {
            workflow_id: workflow.id,
            outcome: WorkflowOutcome::StepLimitReached,
            visited,
            item,
        })
    }

    async fn execute_node(
        &self,
        node: &WorkflowNode,
        item: &mut ModerationQueueItem,
        result: &ModerationResult,
        now: DateTime<Utc>,
    ) -> ReviewResult<Step> {
        let step = match &node.kind {
            NodeKind::Trigger(_) => Step::Continue(BranchValue::Nothing),
            NodeKind::AiScoreCondition(condition) => {
                let value = condition.score.read(&result.scores);
                Step::Continue(BranchValue::Bool(condition.comparison.holds(value)))
            }
            NodeKind::FlagCheck(check) => {
                let present = result.scores.flags.iter().any(|flag| flag == &check.flag);
                Step::Continue(BranchValue::Bool(present == check.has_flag))
            }
            NodeKind::RouteToModerator(route) => {
                Step::Continue(BranchValue::Bool(self.route(route, item, now).await))
            }
            NodeKind::HumanDecision(_) if !item.is_open() => Step::Stop(WorkflowOutcome::Closed),
            NodeKind::HumanDecision(decision) => {
                self.park(node, decision, item, now).await?;
                Step::Stop(WorkflowOutcome::AwaitingDecision {
                    node_id: node.id.clone(),
                })
            }
            NodeKind::AutoApprove(config) => {
                self.decide(config, ModerationStatus::Approved, item, result, now)
                    .await?;
                Step::Stop(WorkflowOutcome::AutoApproved)
            }
            NodeKind::AutoReject(config) => {
                self.decide(config, ModerationStatus::Rejected, item, result, now)
                    .await?;
                Step::Stop(WorkflowOutcome::AutoRejected)
            }
            NodeKind::Escalate(config) => {
                self.escalate(config, item, result, now).await?;
                Step::Stop(WorkflowOutcome::Escalated)
            }
        };
        Ok(step)
    }

    /// Assignment failures are a `false` branch, never an error.
    async fn route(
        &self,
        route: &RouteToModeratorConfig,
        item: &mut ModerationQueueItem,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(priority) = route.priority {
            if priority != item.priority {
                let policy = match self.store.sla_policy(item.organization_id).await {
                    Ok(policy) => policy.unwrap_or_default(),
                    Err(err) => {
                        warn!(?err, item_id = %item.id, "sla policy lookup failed");
                        SlaPolicy::default()
                    }
                };
                let due_at = match policy.due_at(priority, now) {
                    Ok(due_at) => due_at,
                    Err(err) => {
                        warn!(?err, item_id = %item.id, "routed priority has no valid due date");
                        return false;
                    }
                };
                item.priority = priority;
                item.due_at = Some(due_at);
                item.updated_at = now;
                let status = item.status;
                if let Err(err) = self.persist(item, status).await {
                    warn!(?err, item_id = %item.id, "failed to persist routed priority");
                    return false;
                }
            }
        }

        match self.assignments.assign(item, &route.strategy, now).await {
            Ok(Some(assigned)) => {
                *item = assigned;
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(?err, item_id = %item.id, strategy = ?route.strategy, "workflow routing failed");
                false
            }
        }
    }

    async fn park(
        &self,
        node: &WorkflowNode,
        decision: &HumanDecisionConfig,
        item: &mut ModerationQueueItem,
        now: DateTime<Utc>,
    ) -> ReviewResult<()> {
        if let Some(hours) = decision.sla_hours {
            item.due_at = Some(sla_deadline(now, hours).map_err(ModerationError::InvalidWorkflow)?);
        }
        let expected = item.status;
        item.status = QueueStatus::Pending;
        item.current_step_id = Some(node.id.clone());
        item.metadata.insert(
            "decision_options".into(),
            Value::Array(
                decision
                    .options
                    .iter()
                    .map(|option| Value::String(option.as_str().to_string()))
                    .collect(),
            ),
        );
        match &decision.instructions {
            Some(instructions) => {
                item.metadata
                    .insert("instructions".into(), Value::String(instructions.clone()));
            }
            None => {
                item.metadata.remove("instructions");
            }
        }
        item.updated_at = now;
        self.persist(item, expected).await
    }

    /// Writes the in-memory item back and refreshes it from the store.
    async fn persist(&self, item: &mut ModerationQueueItem, expected: QueueStatus) -> ReviewResult<()> {
        *item = self
            .store
            .save_item(item, expected)
            .await?
            .ok_or(ModerationError::ItemClosed(item.id))?;
        Ok(())
    }

    async fn decide(
        &self,
        config: &AutoDecisionConfig,
        status: ModerationStatus,
        item: &mut ModerationQueueItem,
        result: &ModerationResult,
        now: DateTime<Utc>,
    ) -> ReviewResult<()> {
        self.store
            .update_result_status(result.id, status, None, now)
            .await?;
        if let Some(completed) = self.store.complete_item(item.id, now).await? {
            *item = completed;
        }
        info!(
            item_id = %item.id,
            result_id = %result.id,
            status = status.as_str(),
            "workflow decided moderation result"
        );

        if config.notify_owner {
            if let Some(owner) = result.owner_id {
                let event_key = match status {
                    ModerationStatus::Approved => "content_approved",
                    _ => "content_rejected",
                };
                dispatch(
                    self.notifier.as_ref(),
                    &[owner],
                    NotificationCategory::Moderation,
                    event_key,
                    &json!({
                        "content_type": result.content_type,
                        "content_id": result.content_id,
                        "reason": config.reason,
                    }),
                )
                .await;
            }
        }

        if config.publish && status == ModerationStatus::Approved {
            if let Err(err) = self
                .content
                .publish(&result.content_type, result.content_id)
                .await
            {
                warn!(
                    ?err,
                    content_type = %result.content_type,
                    content_id = result.content_id,
                    "publishing approved content failed"
                );
            }
        }
        Ok(())
    }

    async fn escalate(
        &self,
        config: &EscalateConfig,
        item: &mut ModerationQueueItem,
        result: &ModerationResult,
        now: DateTime<Utc>,
    ) -> ReviewResult<()> {
        if !item.is_open() {
            return Ok(());
        }
        let reason = config.reason.as_deref().unwrap_or("escalated by workflow");
        *item = self
            .assignments
            .escalate(item, reason, config.priority, now)
            .await?;
        self.store
            .update_result_status(result.id, ModerationStatus::Escalated, None, now)
            .await?;
        Ok(())
    }
}
