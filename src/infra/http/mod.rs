//! Thin HTTP surfaces for each service.

mod auth;
mod middleware;
mod routes;

pub use auth::{USER_ID_HEADER, UserId};
pub use routes::health::HealthState;
pub use routes::media::MediaState;
pub use routes::posts::PostsState;
pub use routes::search::SearchState;

use axum::{Router, middleware as axum_middleware};

use crate::application::error::ErrorReport;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sqlx::Error as SqlxError;

fn db_health_response(result: Result<(), SqlxError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

/// Router for the post service.
pub fn build_posts_router(posts: PostsState, health: HealthState) -> Router {
    finish(routes::posts::router(posts), health)
}

/// Router for the search service.
pub fn build_search_router(search: SearchState, health: HealthState) -> Router {
    finish(routes::search::router(search), health)
}

/// Router for the media service.
pub fn build_media_router(media: MediaState, health: HealthState) -> Router {
    finish(routes::media::router(media), health)
}

fn finish(service: Router, health: HealthState) -> Router {
    service
        .merge(routes::health::router(health))
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
