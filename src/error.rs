use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::billing::errors::ConsumptionError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("insufficient credits: {0}")]
    PaymentRequired(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("{0}")]
    Message(String),
}

/// Out-of-credits conditions are client-visible 402s, not server faults.
impl From<ConsumptionError> for AppError {
    fn from(err: ConsumptionError) -> Self {
        match err {
            ConsumptionError::NoEligibleBalance | ConsumptionError::InsufficientBalance => {
                AppError::PaymentRequired(err.to_string())
            }
            ConsumptionError::OperationNotRetriable => AppError::Conflict(err.to_string()),
            ConsumptionError::InvalidAmount => AppError::BadRequest(err.to_string()),
            ConsumptionError::NotFound => AppError::NotFound,
            ConsumptionError::Db(err) => AppError::Db(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
