use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::error::AppError;
use crate::application::search::SearchService;
use crate::domain::entities::SearchDocument;
use crate::infra::http::UserId;

use super::query_rejection;

#[derive(Clone)]
pub struct SearchState {
    pub search: Arc<SearchService>,
}

pub(in crate::infra::http) fn router(state: SearchState) -> Router {
    Router::new()
        .route("/api/search/posts", get(search_posts))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    query: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchHit {
    post_id: Uuid,
    user_id: String,
    content: String,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

impl From<SearchDocument> for SearchHit {
    fn from(document: SearchDocument) -> Self {
        Self {
            post_id: document.post_id,
            user_id: document.user_id,
            content: document.content,
            created_at: document.created_at,
        }
    }
}

async fn search_posts(
    State(state): State<SearchState>,
    user: UserId,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Query(query) = query.map_err(query_rejection)?;
    let results = state
        .search
        .search(user.as_str(), query.query.as_deref().unwrap_or_default())
        .await?;

    Ok(Json(json!({
        "success": true,
        "count": results.len(),
        "results": results.into_iter().map(SearchHit::from).collect::<Vec<_>>(),
    })))
}
