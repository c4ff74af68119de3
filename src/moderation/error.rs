use thiserror::Error;
use uuid::Uuid;

use crate::db::StoreError;

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("queue item {0} not found")]
    ItemNotFound(Uuid),
    #[error("queue item {0} is already completed")]
    ItemClosed(Uuid),
    #[error("workflow {0} not found")]
    WorkflowNotFound(Uuid),
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ReviewResult<T> = Result<T, ModerationError>;
