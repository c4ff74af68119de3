//! Workflow graphs as stored data: typed node configurations, edges, and the pure
//! pieces of interpretation (condition checks and edge selection).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::assignment::AssignmentStrategy;
use super::models::{sla_hours_in_range, DecisionKind, ModerationScores, QueuePriority};
use crate::config;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoreField {
    Overall,
    AgeAppropriateness,
    ClinicalSafety,
    CulturalSensitivity,
    Accuracy,
}

impl ScoreField {
    pub fn read(&self, scores: &ModerationScores) -> f64 {
        match self {
            ScoreField::Overall => scores.overall_score,
            ScoreField::AgeAppropriateness => scores.age_appropriateness_score,
            ScoreField::ClinicalSafety => scores.clinical_safety_score,
            ScoreField::CulturalSensitivity => scores.cultural_sensitivity_score,
            ScoreField::Accuracy => scores.accuracy_score,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operator", rename_all = "snake_case")]
pub enum Comparison {
    Gte { threshold: f64 },
    Lte { threshold: f64 },
    Gt { threshold: f64 },
    Lt { threshold: f64 },
    /// Inclusive on both ends.
    Between { min: f64, max: f64 },
}

impl Comparison {
    pub fn holds(&self, value: f64) -> bool {
        match *self {
            Comparison::Gte { threshold } => value >= threshold,
            Comparison::Lte { threshold } => value <= threshold,
            Comparison::Gt { threshold } => value > threshold,
            Comparison::Lt { threshold } => value < threshold,
            Comparison::Between { min, max } => value >= min && value <= max,
        }
    }
}

/// Predicate a workflow requires of a moderation result before it is selected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum TriggerCondition {
    Score {
        score: ScoreField,
        #[serde(flatten)]
        comparison: Comparison,
    },
    HasFlag {
        flag: String,
    },
    MinFlagCount {
        count: usize,
    },
}

impl TriggerCondition {
    pub fn matches(&self, scores: &ModerationScores) -> bool {
        match self {
            TriggerCondition::Score { score, comparison } => comparison.holds(score.read(scores)),
            TriggerCondition::HasFlag { flag } => scores.flags.iter().any(|own| own == flag),
            TriggerCondition::MinFlagCount { count } => scores.flags.len() >= *count,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TriggerConfig {
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreConditionConfig {
    pub score: ScoreField,
    #[serde(flatten)]
    pub comparison: Comparison,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlagCheckConfig {
    pub flag: String,
    /// When false the node asks whether the flag is absent.
    #[serde(default = "default_true")]
    pub has_flag: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteToModeratorConfig {
    #[serde(flatten)]
    pub strategy: AssignmentStrategy,
    #[serde(default)]
    pub priority: Option<QueuePriority>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanDecisionConfig {
    #[serde(default)]
    pub sla_hours: Option<i64>,
    #[serde(default = "default_decision_options")]
    pub options: Vec<DecisionKind>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AutoDecisionConfig {
    #[serde(default)]
    pub notify_owner: bool,
    #[serde(default)]
    pub publish: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EscalateConfig {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub priority: Option<QueuePriority>,
}

fn default_true() -> bool {
    true
}

fn default_decision_options() -> Vec<DecisionKind> {
    vec![
        DecisionKind::Approve,
        DecisionKind::Reject,
        DecisionKind::RequestChanges,
        DecisionKind::Escalate,
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NodeKind {
    Trigger(TriggerConfig),
    AiScoreCondition(ScoreConditionConfig),
    FlagCheck(FlagCheckConfig),
    RouteToModerator(RouteToModeratorConfig),
    HumanDecision(HumanDecisionConfig),
    AutoApprove(AutoDecisionConfig),
    AutoReject(AutoDecisionConfig),
    Escalate(EscalateConfig),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Trigger(_) => "trigger",
            NodeKind::AiScoreCondition(_) => "ai_score_condition",
            NodeKind::FlagCheck(_) => "flag_check",
            NodeKind::RouteToModerator(_) => "route_to_moderator",
            NodeKind::HumanDecision(_) => "human_decision",
            NodeKind::AutoApprove(_) => "auto_approve",
            NodeKind::AutoReject(_) => "auto_reject",
            NodeKind::Escalate(_) => "escalate",
        }
    }
}

/// Stored as `{"id", "type", "data"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct WorkflowNode {
    pub id: String,
    pub kind: NodeKind,
}

#[derive(Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    data: Value,
}

impl TryFrom<RawNode> for WorkflowNode {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let data = match raw.data {
            Value::Null => json!({}),
            other => other,
        };
        let kind = serde_json::from_value(json!({"type": raw.node_type, "data": data}))
            .map_err(|err| format!("node `{}`: {err}", raw.id))?;
        Ok(WorkflowNode { id: raw.id, kind })
    }
}

impl From<WorkflowNode> for RawNode {
    fn from(node: WorkflowNode) -> Self {
        let node_type = node.kind.type_name().to_string();
        let data = match serde_json::to_value(&node.kind) {
            Ok(Value::Object(mut map)) => map.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        RawNode {
            id: node.id,
            node_type,
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEdge {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowGraph {
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

impl WorkflowGraph {
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// The first trigger node, else the first node.
    pub fn start_node(&self) -> Option<&WorkflowNode> {
        self.nodes
            .iter()
            .find(|node| matches!(node.kind, NodeKind::Trigger(_)))
            .or_else(|| self.nodes.first())
    }

    /// Outgoing edges in stored order.
    pub fn outgoing(&self, id: &str) -> Vec<&WorkflowEdge> {
        self.edges.iter().filter(|edge| edge.source == id).collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("workflow has no nodes".into());
        }
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(format!("duplicate node id `{}`", node.id));
            }
        }
        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !ids.contains(end.as_str()) {
                    return Err(format!("edge references unknown node `{end}`"));
                }
            }
        }
        for node in &self.nodes {
            if let NodeKind::HumanDecision(HumanDecisionConfig {
                sla_hours: Some(hours),
                ..
            }) = &node.kind
            {
                if !sla_hours_in_range(*hours) {
                    return Err(format!(
                        "node `{}` sla_hours must be between 1 and {}",
                        node.id,
                        config::MAX_SLA_HOURS
                    ));
                }
            }
        }
        Ok(())
    }
}

/// What a non-terminal node produced, used to choose the next edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchValue {
    Bool(bool),
    Text(String),
    Nothing,
}

/// One edge: take it. Otherwise prefer the edge whose label matches the branch value,
/// falling back to the first edge.
pub fn select_edge<'a>(edges: &[&'a WorkflowEdge], value: &BranchValue) -> Option<&'a WorkflowEdge> {
    if edges.len() == 1 {
        return edges.first().copied();
    }
    let wanted = match value {
        BranchValue::Bool(true) => Some("true"),
        BranchValue::Bool(false) => Some("false"),
        BranchValue::Text(text) => Some(text.as_str()),
        BranchValue::Nothing => None,
    };
    wanted
        .and_then(|label| {
            edges
                .iter()
                .copied()
                .find(|edge| edge.label.as_deref() == Some(label))
        })
        .or_else(|| edges.first().copied())
}
