//! Repository traits describing persistence adapters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::entities::{MediaRecord, PostRecord, SearchDocument};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// One page of the newest-first post listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostPage {
    pub items: Vec<PostRecord>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

impl PostPage {
    pub fn total_pages(&self) -> u64 {
        if self.limit == 0 {
            0
        } else {
            self.total.div_ceil(u64::from(self.limit))
        }
    }
}

#[async_trait]
pub trait PostsRepo: Send + Sync {
    async fn insert_post(&self, record: &PostRecord) -> Result<(), RepoError>;

    async fn find_post(&self, id: Uuid) -> Result<Option<PostRecord>, RepoError>;

    /// `page` is 1-based.
    async fn list_posts(&self, page: u32, limit: u32) -> Result<PostPage, RepoError>;

    /// Delete the post only if `user_id` owns it, returning the removed row.
    async fn delete_post(&self, id: Uuid, user_id: &str) -> Result<Option<PostRecord>, RepoError>;
}

#[async_trait]
pub trait SearchRepo: Send + Sync {
    /// Insert a document. Returns `false` when one already exists for the post.
    async fn insert_document(&self, document: &SearchDocument) -> Result<bool, RepoError>;

    /// Returns whether a document was removed.
    async fn delete_document(&self, post_id: Uuid, user_id: &str) -> Result<bool, RepoError>;

    /// Best matches among `user_id`'s documents, most relevant first.
    async fn search_documents(
        &self,
        user_id: &str,
        query: &str,
        limit: u32,
    ) -> Result<Vec<SearchDocument>, RepoError>;
}

#[async_trait]
pub trait MediaRepo: Send + Sync {
    async fn insert_media(&self, record: &MediaRecord) -> Result<(), RepoError>;

    async fn find_media(&self, id: Uuid) -> Result<Option<MediaRecord>, RepoError>;

    /// Returns whether a record was removed.
    async fn delete_media(&self, id: Uuid) -> Result<bool, RepoError>;
}
