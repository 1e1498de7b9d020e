//! In-process repositories, used when no database URL is configured.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::application::repos::{MediaRepo, PostPage, PostsRepo, RepoError, SearchRepo};
use crate::domain::entities::{MediaRecord, PostRecord, SearchDocument};

#[derive(Clone, Default)]
pub struct InMemoryRepositories {
    posts: Arc<DashMap<Uuid, StoredPost>>,
    documents: Arc<DashMap<Uuid, SearchDocument>>,
    media: Arc<DashMap<Uuid, MediaRecord>>,
    sequence: Arc<AtomicU64>,
}

#[derive(Clone)]
struct StoredPost {
    seq: u64,
    record: PostRecord,
}

impl InMemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_count(&self) -> usize {
        self.posts.len()
    }

    pub fn search_document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn media_count(&self) -> usize {
        self.media.len()
    }
}

#[async_trait]
impl PostsRepo for InMemoryRepositories {
    async fn insert_post(&self, record: &PostRecord) -> Result<(), RepoError> {
        match self.posts.entry(record.id) {
            Entry::Occupied(_) => Err(RepoError::Duplicate {
                constraint: "posts_pkey".to_string(),
            }),
            Entry::Vacant(slot) => {
                let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
                slot.insert(StoredPost {
                    seq,
                    record: record.clone(),
                });
                Ok(())
            }
        }
    }

    async fn find_post(&self, id: Uuid) -> Result<Option<PostRecord>, RepoError> {
        Ok(self.posts.get(&id).map(|entry| entry.record.clone()))
    }

    async fn list_posts(&self, page: u32, limit: u32) -> Result<PostPage, RepoError> {
        let mut all: Vec<StoredPost> = self.posts.iter().map(|entry| entry.clone()).collect();
        all.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then(b.seq.cmp(&a.seq))
        });

        let total = all.len() as u64;
        let offset = (page.saturating_sub(1) as usize).saturating_mul(limit as usize);
        let items = all
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .map(|stored| stored.record)
            .collect();

        Ok(PostPage {
            items,
            page,
            limit,
            total,
        })
    }

    async fn delete_post(&self, id: Uuid, user_id: &str) -> Result<Option<PostRecord>, RepoError> {
        Ok(self
            .posts
            .remove_if(&id, |_, stored| stored.record.user_id == user_id)
            .map(|(_, stored)| stored.record))
    }
}

#[async_trait]
impl SearchRepo for InMemoryRepositories {
    async fn insert_document(&self, document: &SearchDocument) -> Result<bool, RepoError> {
        match self.documents.entry(document.post_id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(document.clone());
                Ok(true)
            }
        }
    }

    async fn delete_document(&self, post_id: Uuid, user_id: &str) -> Result<bool, RepoError> {
        Ok(self
            .documents
            .remove_if(&post_id, |_, document| document.user_id == user_id)
            .is_some())
    }

    async fn search_documents(
        &self,
        user_id: &str,
        query: &str,
        limit: u32,
    ) -> Result<Vec<SearchDocument>, RepoError> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, SearchDocument)> = self
            .documents
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .filter_map(|entry| {
                let words = tokenize(&entry.content);
                let score = terms
                    .iter()
                    .map(|term| words.iter().filter(|word| *word == term).count())
                    .sum::<usize>();
                // Every term must appear, as with `plainto_tsquery`.
                let all_present = terms.iter().all(|term| words.contains(term));
                (all_present && score > 0).then(|| (score, entry.clone()))
            })
            .collect();

        scored.sort_by(|(a_score, a), (b_score, b)| {
            b_score
                .cmp(a_score)
                .then(b.created_at.cmp(&a.created_at))
        });

        Ok(scored
            .into_iter()
            .take(limit as usize)
            .map(|(_, document)| document)
            .collect())
    }
}

#[async_trait]
impl MediaRepo for InMemoryRepositories {
    async fn insert_media(&self, record: &MediaRecord) -> Result<(), RepoError> {
        match self.media.entry(record.id) {
            Entry::Occupied(_) => Err(RepoError::Duplicate {
                constraint: "media_pkey".to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn find_media(&self, id: Uuid) -> Result<Option<MediaRecord>, RepoError> {
        Ok(self.media.get(&id).map(|entry| entry.clone()))
    }

    async fn delete_media(&self, id: Uuid) -> Result<bool, RepoError> {
        Ok(self.media.remove(&id).is_some())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}
