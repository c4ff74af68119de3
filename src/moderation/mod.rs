pub mod api;
pub mod assignment;
pub mod content;
pub mod error;
pub mod graph;
pub mod models;
pub mod priority;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod workflow;

pub use assignment::{AssignmentStrategy, ModerationAssignmentService};
pub use content::{ContentRegistry, ContentSource, Moderatable};
pub use error::{ModerationError, ReviewResult};
pub use graph::{BranchValue, NodeKind, WorkflowEdge, WorkflowGraph, WorkflowNode};
pub use models::{
    DecisionKind, ModerationDecision, ModerationQueueItem, ModerationResult, ModerationScores,
    ModerationStatus, ModerationTeamSetting, ModerationWorkflow, QueuePriority, QueueStatus,
    SlaPolicy,
};
pub use priority::derive_priority;
pub use queue::{
    DecisionInput, DecisionOutcome, EnqueuedItem, EscalationSummary, ModerationQueueService,
    QueueStats, UserStats,
};
pub use scheduler::spawn as spawn_moderation_scheduler;
pub use store::{AssigneeFilter, MemoryModerationStore, ModerationStore, QueueFilter};
pub use workflow::{ModerationWorkflowService, WorkflowOutcome, WorkflowRun};
