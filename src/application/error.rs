use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::application::media::{MediaDeletionReport, ObjectStoreError};
use crate::application::repos::RepoError;
use crate::broker::BrokerError;
use crate::cache::CacheError;
use crate::domain::error::DomainError;
use crate::infra::error::InfraError;

/// Process exit status when the broker is unreachable or drops a subscription (`EX_UNAVAILABLE`).
pub const EXIT_BROKER_UNAVAILABLE: i32 = 69;
/// Process exit status for every other startup failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Failure of a domain event handler. Any variant makes the consumer retry.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(
        "media cleanup incomplete: {} failed, {} succeeded",
        .0.failed.len(),
        .0.succeeded.len()
    )]
    MediaCleanup(MediaDeletionReport),
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Storage(#[from] ObjectStoreError),
    #[error("payload exceeds the upload limit")]
    PayloadTooLarge,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("missing authenticated user")]
    Unauthorized,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Status the binary exits with when this error aborts startup.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Broker(
                BrokerError::ConnectionExhausted { .. } | BrokerError::SubscriptionLost { .. },
            ) => EXIT_BROKER_UNAVAILABLE,
            _ => EXIT_FAILURE,
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Domain(DomainError::NotFound { .. }) | AppError::Repo(RepoError::NotFound) => {
                StatusCode::NOT_FOUND
            }
            AppError::Domain(DomainError::Validation { .. })
            | AppError::Repo(RepoError::InvalidInput { .. })
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Repo(RepoError::Duplicate { .. } | RepoError::Integrity { .. }) => {
                StatusCode::CONFLICT
            }
            AppError::Repo(RepoError::Timeout)
            | AppError::Infra(InfraError::Database { .. })
            | AppError::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Repo(RepoError::Persistence(_))
            | AppError::Infra(_)
            | AppError::Cache(_)
            | AppError::Storage(_)
            | AppError::Domain(DomainError::Invariant { .. })
            | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> String {
        match self {
            AppError::Domain(DomainError::Validation { message }) => message.clone(),
            AppError::Validation(message) => message.clone(),
            AppError::Domain(DomainError::NotFound { entity }) => {
                format!("{} not found", capitalize(entity))
            }
            AppError::Repo(RepoError::NotFound) => "Resource not found".to_string(),
            AppError::Repo(RepoError::InvalidInput { .. }) => "Invalid input".to_string(),
            AppError::Unauthorized => "Authentication required".to_string(),
            AppError::PayloadTooLarge => "File is too large".to_string(),
            AppError::Repo(RepoError::Duplicate { .. } | RepoError::Integrity { .. }) => {
                "Conflicting record".to_string()
            }
            AppError::Repo(RepoError::Timeout)
            | AppError::Infra(InfraError::Database { .. })
            | AppError::Broker(_) => "Service temporarily unavailable".to_string(),
            AppError::Infra(InfraError::Configuration { .. }) => {
                "Service misconfigured".to_string()
            }
            AppError::Repo(RepoError::Persistence(_))
            | AppError::Infra(_)
            | AppError::Cache(_)
            | AppError::Storage(_)
            | AppError::Domain(DomainError::Invariant { .. })
            | AppError::Unexpected(_) => "Internal Server Error".to_string(),
        }
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "success": false,
            "message": self.presentation_message(),
        });
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}
