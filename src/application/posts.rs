//! Post write and read paths, plus the post service's own event handler.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use ripple_events::{DomainEvent, PostCreated, PostDeleted};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::application::error::{AppError, HandlerError};
use crate::application::repos::{PostPage, PostsRepo};
use crate::broker::{EventHandler, EventPublisher};
use crate::cache::{CacheError, CacheKey, CacheLayer, KeyPattern};
use crate::domain::entities::PostRecord;
use crate::domain::error::DomainError;
use crate::domain::posts::{normalize_page, validate_content};

const METRIC_CACHE_DEGRADED: &str = "ripple_cache_degraded_total";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePostCommand {
    pub content: String,
    #[serde(default, rename = "mediaIds")]
    pub media_ids: Vec<Uuid>,
}

#[derive(Clone)]
pub struct PostService {
    repo: Arc<dyn PostsRepo>,
    cache: CacheLayer,
    publisher: EventPublisher,
}

impl PostService {
    pub fn new(repo: Arc<dyn PostsRepo>, cache: CacheLayer, publisher: EventPublisher) -> Self {
        Self {
            repo,
            cache,
            publisher,
        }
    }

    #[instrument(skip(self, command))]
    pub async fn create_post(
        &self,
        user_id: &str,
        command: CreatePostCommand,
    ) -> Result<PostRecord, AppError> {
        let content = validate_content(&command.content)?;
        let record = PostRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            content,
            media_ids: command.media_ids,
            created_at: OffsetDateTime::now_utc(),
        };

        self.repo.insert_post(&record).await?;
        self.invalidate_after_write(record.id).await;

        let event = DomainEvent::from(PostCreated {
            post_id: record.id,
            user_id: record.user_id.clone(),
            content: record.content.clone(),
            created_at: record.created_at,
        });
        self.announce(&event).await;

        info!(post_id = %record.id, "Post created");
        Ok(record)
    }

    pub async fn get_post(&self, id: Uuid) -> Result<PostRecord, AppError> {
        let repo = Arc::clone(&self.repo);
        self.cache
            .read_through(&CacheKey::Post(id), || async move { repo.find_post(id).await })
            .await?
            .ok_or_else(|| DomainError::not_found("post").into())
    }

    pub async fn list_posts(
        &self,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<PostPage, AppError> {
        let (page, limit) = normalize_page(page, limit);
        let repo = Arc::clone(&self.repo);
        let loaded = self
            .cache
            .read_through(&CacheKey::PostList { page, limit }, || async move {
                repo.list_posts(page, limit).await.map(Some)
            })
            .await?;
        loaded.ok_or_else(|| AppError::unexpected("post listing returned no page"))
    }

    /// Delete a post owned by `user_id`. Someone else's post reads as missing.
    #[instrument(skip(self))]
    pub async fn delete_post(&self, user_id: &str, id: Uuid) -> Result<PostRecord, AppError> {
        let removed = self
            .repo
            .delete_post(id, user_id)
            .await?
            .ok_or(DomainError::not_found("post"))?;
        self.invalidate_after_write(id).await;

        let event = DomainEvent::from(PostDeleted {
            post_id: removed.id,
            user_id: removed.user_id.clone(),
            media_ids: removed.media_ids.clone(),
        });
        self.announce(&event).await;

        info!(post_id = %id, "Post deleted");
        Ok(removed)
    }

    // The write is committed at this point; a cache failure must not turn it
    // into an error response.
    async fn invalidate_after_write(&self, id: Uuid) {
        if let Err(err) = invalidate_post_namespaces(&self.cache, id).await {
            counter!(METRIC_CACHE_DEGRADED, "op" => "invalidate").increment(1);
            warn!(post_id = %id, error = %err, "Post cache invalidation failed");
        }
    }

    async fn announce(&self, event: &DomainEvent) {
        if let Err(err) = self.publisher.publish_event(event).await {
            warn!(
                routing_key = event.routing_key(),
                post_id = %event.post_id(),
                error = %err,
                "Event not published after committed write"
            );
        }
    }
}

async fn invalidate_post_namespaces(cache: &CacheLayer, id: Uuid) -> Result<(), CacheError> {
    cache.invalidate_key(&CacheKey::Post(id)).await?;
    cache.invalidate_by_pattern(&KeyPattern::AllPostLists).await?;
    Ok(())
}

/// Clears post caches when any replica reports a write.
///
/// The write path already invalidates before returning; this repeats it for
/// other replicas and retries through the consumer when that attempt failed.
pub struct PostCacheInvalidator {
    cache: CacheLayer,
}

impl PostCacheInvalidator {
    pub fn new(cache: CacheLayer) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EventHandler<PostCreated> for PostCacheInvalidator {
    fn name(&self) -> &'static str {
        "post_cache_invalidator"
    }

    async fn handle(&self, event: &PostCreated) -> Result<(), HandlerError> {
        invalidate_post_namespaces(&self.cache, event.post_id).await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler<PostDeleted> for PostCacheInvalidator {
    fn name(&self) -> &'static str {
        "post_cache_invalidator"
    }

    async fn handle(&self, event: &PostDeleted) -> Result<(), HandlerError> {
        invalidate_post_namespaces(&self.cache, event.post_id).await?;
        Ok(())
    }
}
