use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::error::AppError;
use crate::application::posts::{CreatePostCommand, PostService};
use crate::domain::entities::PostRecord;
use crate::infra::http::UserId;

use super::{json_rejection, path_rejection, query_rejection};

#[derive(Clone)]
pub struct PostsState {
    pub posts: Arc<PostService>,
}

pub(in crate::infra::http) fn router(state: PostsState) -> Router {
    Router::new()
        .route("/api/posts", get(list_posts).post(create_post))
        .route("/api/posts/{id}", get(get_post).delete(delete_post))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PostView {
    id: Uuid,
    user_id: String,
    content: String,
    media_ids: Vec<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    created_at: OffsetDateTime,
}

impl From<PostRecord> for PostView {
    fn from(record: PostRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            content: record.content,
            media_ids: record.media_ids,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

async fn create_post(
    State(state): State<PostsState>,
    user: UserId,
    body: Result<Json<CreatePostCommand>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(command) = body.map_err(json_rejection)?;
    let post = state.posts.create_post(user.as_str(), command).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Post created successfully",
            "post": PostView::from(post),
        })),
    ))
}

async fn list_posts(
    State(state): State<PostsState>,
    _user: UserId,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Query(query) = query.map_err(query_rejection)?;
    let page = state.posts.list_posts(query.page, query.limit).await?;
    let total_pages = page.total_pages();

    Ok(Json(json!({
        "success": true,
        "posts": page.items.into_iter().map(PostView::from).collect::<Vec<_>>(),
        "currentPage": page.page,
        "totalPage": total_pages,
        "totalPosts": page.total,
    })))
}

async fn get_post(
    State(state): State<PostsState>,
    _user: UserId,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Path(id) = id.map_err(path_rejection)?;
    let post = state.posts.get_post(id).await?;

    Ok(Json(json!({
        "success": true,
        "post": PostView::from(post),
    })))
}

async fn delete_post(
    State(state): State<PostsState>,
    user: UserId,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Path(id) = id.map_err(path_rejection)?;
    state.posts.delete_post(user.as_str(), id).await?;

    Ok(Json(json!({
        "success": true,
        "message": "Post deleted successfully",
    })))
}
