use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::billing::BillingError;
use crate::db::StoreError;
use crate::moderation::ModerationError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error(transparent)]
    Moderation(#[from] ModerationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Message(String),
}

impl AppError {
    fn status_and_body(&self) -> (StatusCode, Value) {
        match self {
            AppError::Billing(BillingError::FeatureDisabled {
                feature,
                reversion_message,
                reason,
            }) => (
                StatusCode::FORBIDDEN,
                json!({
                    "error": "feature_disabled",
                    "message": self.to_string(),
                    "feature": feature,
                    "reversion_message": reversion_message,
                    "reason": reason,
                }),
            ),
            AppError::Billing(BillingError::InsufficientCredits {
                required,
                available,
            }) => (
                StatusCode::PAYMENT_REQUIRED,
                json!({
                    "error": "insufficient_credits",
                    "message": self.to_string(),
                    "required": required,
                    "available": available,
                }),
            ),
            AppError::Billing(BillingError::InvalidAmount(_)) => {
                (StatusCode::BAD_REQUEST, error_body("invalid_amount", self))
            }
            AppError::Moderation(
                ModerationError::ItemNotFound(_) | ModerationError::WorkflowNotFound(_),
            ) => (StatusCode::NOT_FOUND, error_body("not_found", self)),
            AppError::Moderation(ModerationError::ItemClosed(_)) => {
                (StatusCode::CONFLICT, error_body("item_closed", self))
            }
            AppError::Moderation(ModerationError::InvalidWorkflow(_)) => {
                (StatusCode::BAD_REQUEST, error_body("invalid_workflow", self))
            }
            AppError::Moderation(ModerationError::InvalidInput(_)) => {
                (StatusCode::BAD_REQUEST, error_body("bad_request", self))
            }
            AppError::NotFound => (StatusCode::NOT_FOUND, error_body("not_found", self)),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, error_body("unauthorized", self)),
            AppError::Forbidden => (StatusCode::FORBIDDEN, error_body("forbidden", self)),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, error_body("bad_request", self)),
            AppError::Billing(BillingError::Store(_))
            | AppError::Moderation(ModerationError::Store(_))
            | AppError::Store(_)
            | AppError::Message(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "internal", "message": "internal server error"}),
            ),
        }
    }
}

fn error_body(code: &str, err: &AppError) -> Value {
    json!({"error": code, "message": err.to_string()})
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(%status, error = %self, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
