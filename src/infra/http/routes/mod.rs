pub mod health;
pub mod media;
pub mod posts;
pub mod search;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};

use crate::application::error::AppError;

pub(super) fn json_rejection(err: JsonRejection) -> AppError {
    AppError::validation(err.body_text())
}

pub(super) fn path_rejection(err: PathRejection) -> AppError {
    AppError::validation(err.body_text())
}

pub(super) fn query_rejection(err: QueryRejection) -> AppError {
    AppError::validation(err.body_text())
}
