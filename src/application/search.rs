//! Search read path and the indexer fed by post events.

use std::sync::Arc;

use async_trait::async_trait;
use ripple_events::{PostCreated, PostDeleted};
use tracing::{debug, info};

use crate::application::error::{AppError, HandlerError};
use crate::application::repos::SearchRepo;
use crate::broker::EventHandler;
use crate::cache::{CacheKey, CacheLayer, KeyPattern};
use crate::domain::entities::SearchDocument;

const MAX_QUERY_CHARS: usize = 200;
pub const DEFAULT_RESULT_LIMIT: u32 = 20;

#[derive(Clone)]
pub struct SearchService {
    repo: Arc<dyn SearchRepo>,
    cache: CacheLayer,
    result_limit: u32,
}

impl SearchService {
    pub fn new(repo: Arc<dyn SearchRepo>, cache: CacheLayer) -> Self {
        Self {
            repo,
            cache,
            result_limit: DEFAULT_RESULT_LIMIT,
        }
    }

    /// Search the caller's own posts. Results are cached per user and query.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
    ) -> Result<Vec<SearchDocument>, AppError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::validation("query must not be empty"));
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(AppError::validation(format!(
                "query must be at most {MAX_QUERY_CHARS} characters"
            )));
        }

        let key = CacheKey::Search {
            user_id: user_id.to_string(),
            query: query.to_string(),
        };
        let repo = Arc::clone(&self.repo);
        let limit = self.result_limit;
        let results = self
            .cache
            .read_through(&key, || async move {
                repo.search_documents(user_id, query, limit)
                    .await
                    .map(Some)
            })
            .await?;
        Ok(results.unwrap_or_default())
    }
}

/// Keeps the search index in step with post events.
pub struct SearchIndexer {
    repo: Arc<dyn SearchRepo>,
    cache: CacheLayer,
}

impl SearchIndexer {
    pub fn new(repo: Arc<dyn SearchRepo>, cache: CacheLayer) -> Self {
        Self { repo, cache }
    }

    async fn invalidate_user(&self, user_id: &str) -> Result<(), HandlerError> {
        self.cache
            .invalidate_by_pattern(&KeyPattern::UserSearches(user_id.to_string()))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventHandler<PostCreated> for SearchIndexer {
    fn name(&self) -> &'static str {
        "search_indexer_created"
    }

    async fn handle(&self, event: &PostCreated) -> Result<(), HandlerError> {
        let document = SearchDocument {
            post_id: event.post_id,
            user_id: event.user_id.clone(),
            content: event.content.clone(),
            created_at: event.created_at,
        };

        if self.repo.insert_document(&document).await? {
            info!(post_id = %event.post_id, user_id = %event.user_id, "Post indexed");
        } else {
            debug!(post_id = %event.post_id, "Post already indexed");
        }
        self.invalidate_user(&event.user_id).await
    }
}

#[async_trait]
impl EventHandler<PostDeleted> for SearchIndexer {
    fn name(&self) -> &'static str {
        "search_indexer_deleted"
    }

    async fn handle(&self, event: &PostDeleted) -> Result<(), HandlerError> {
        let removed = self
            .repo
            .delete_document(event.post_id, &event.user_id)
            .await?;
        info!(
            post_id = %event.post_id,
            user_id = %event.user_id,
            removed,
            "Post removed from index"
        );
        self.invalidate_user(&event.user_id).await
    }
}
