//! Media uploads and the cleanup of media owned by deleted posts.

use std::sync::Arc;

use async_trait::async_trait;
use ripple_events::PostDeleted;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::application::error::{AppError, HandlerError};
use crate::application::repos::MediaRepo;
use crate::broker::EventHandler;
use crate::domain::entities::MediaRecord;

const MAX_EXTENSION_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    Backend(String),
}

/// Blob storage holding the media bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `public_id`, replacing any previous object.
    async fn put_object(&self, public_id: &str, bytes: &[u8]) -> Result<(), ObjectStoreError>;

    /// Public URL of the object stored under `public_id`.
    fn object_url(&self, public_id: &str) -> String;

    /// Remove the object stored under `public_id`. A missing object is not an
    /// error.
    async fn delete_object(&self, public_id: &str) -> Result<(), ObjectStoreError>;
}

/// One file received by the upload endpoint.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub original_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Stores uploaded files and records them for later cleanup.
pub struct MediaUploadService {
    media: Arc<dyn MediaRepo>,
    objects: Arc<dyn ObjectStore>,
}

impl MediaUploadService {
    pub fn new(media: Arc<dyn MediaRepo>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { media, objects }
    }

    /// Write the object, then its record. A failed record write removes the
    /// object again so nothing is left that cleanup could never find.
    #[instrument(skip(self, upload), fields(original_name = %upload.original_name))]
    pub async fn upload(&self, user_id: &str, upload: MediaUpload) -> Result<MediaRecord, AppError> {
        if upload.bytes.is_empty() {
            return Err(AppError::validation("Uploaded file is empty"));
        }

        let id = Uuid::new_v4();
        let public_id = match file_extension(&upload.original_name) {
            Some(extension) => format!("{id}.{extension}"),
            None => id.to_string(),
        };
        self.objects.put_object(&public_id, &upload.bytes).await?;

        let record = MediaRecord {
            id,
            url: self.objects.object_url(&public_id),
            public_id,
            original_name: upload.original_name,
            mime_type: upload.mime_type,
            user_id: user_id.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };

        if let Err(err) = self.media.insert_media(&record).await {
            if let Err(cleanup) = self.objects.delete_object(&record.public_id).await {
                warn!(
                    public_id = %record.public_id,
                    error = %cleanup,
                    "Failed to remove object after its record was rejected"
                );
            }
            return Err(err.into());
        }

        info!(
            media_id = %record.id,
            public_id = %record.public_id,
            mime_type = %record.mime_type,
            size = upload.bytes.len(),
            "Media uploaded"
        );
        Ok(record)
    }
}

/// Lower-cased alphanumeric extension of an uploaded file name.
fn file_extension(name: &str) -> Option<String> {
    let (stem, extension) = name.rsplit_once('.')?;
    let valid = !stem.is_empty()
        && !extension.is_empty()
        && extension.len() <= MAX_EXTENSION_LEN
        && extension.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| extension.to_ascii_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaFailure {
    pub media_id: Uuid,
    pub error: String,
}

/// Per-item outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MediaDeletionReport {
    /// Object and record both removed.
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<MediaFailure>,
    /// Already gone, or owned by someone other than the post author.
    pub skipped: Vec<Uuid>,
}

impl MediaDeletionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct MediaCleanup {
    media: Arc<dyn MediaRepo>,
    objects: Arc<dyn ObjectStore>,
}

impl MediaCleanup {
    pub fn new(media: Arc<dyn MediaRepo>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { media, objects }
    }

    /// Delete every media item listed on the event, one at a time.
    ///
    /// The stored object goes first; its record is removed only afterwards, so
    /// a failed item is still found when the event is redelivered.
    pub async fn delete_post_media(&self, event: &PostDeleted) -> MediaDeletionReport {
        let mut report = MediaDeletionReport::default();

        for &media_id in &event.media_ids {
            match self.delete_one(media_id, &event.user_id).await {
                Ok(true) => report.succeeded.push(media_id),
                Ok(false) => report.skipped.push(media_id),
                Err(error) => {
                    warn!(
                        post_id = %event.post_id,
                        media_id = %media_id,
                        error = %error,
                        "Media deletion failed"
                    );
                    report.failed.push(MediaFailure { media_id, error });
                }
            }
        }

        info!(
            post_id = %event.post_id,
            user_id = %event.user_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Processed media deletion for post"
        );
        report
    }

    async fn delete_one(&self, media_id: Uuid, author: &str) -> Result<bool, String> {
        let Some(record) = self
            .media
            .find_media(media_id)
            .await
            .map_err(|err| err.to_string())?
        else {
            return Ok(false);
        };

        if record.user_id != author {
            warn!(
                media_id = %media_id,
                owner = %record.user_id,
                author,
                "Skipping media not owned by the post author"
            );
            return Ok(false);
        }

        self.objects
            .delete_object(&record.public_id)
            .await
            .map_err(|err| err.to_string())?;
        self.media
            .delete_media(media_id)
            .await
            .map_err(|err| err.to_string())?;

        info!(media_id = %media_id, public_id = %record.public_id, "Media deleted");
        Ok(true)
    }
}

#[async_trait]
impl EventHandler<PostDeleted> for MediaCleanup {
    fn name(&self) -> &'static str {
        "media_cleanup"
    }

    async fn handle(&self, event: &PostDeleted) -> Result<(), HandlerError> {
        let report = self.delete_post_media(event).await;
        if report.is_complete() {
            Ok(())
        } else {
            Err(HandlerError::MediaCleanup(report))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use time::OffsetDateTime;

    use super::*;
    use crate::application::repos::RepoError;
    use crate::infra::memory::InMemoryRepositories;

    /// Object store that fails for chosen keys and records deletions.
    #[derive(Default)]
    struct RecordingObjects {
        failing: Mutex<HashSet<String>>,
        stored: Mutex<Vec<String>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingObjects {
        async fn put_object(&self, public_id: &str, _bytes: &[u8]) -> Result<(), ObjectStoreError> {
            if self.failing.lock().expect("failing lock").contains(public_id) {
                return Err(ObjectStoreError::Backend("unavailable".to_string()));
            }
            self.stored
                .lock()
                .expect("stored lock")
                .push(public_id.to_string());
            Ok(())
        }

        fn object_url(&self, public_id: &str) -> String {
            format!("/media/{public_id}")
        }

        async fn delete_object(&self, public_id: &str) -> Result<(), ObjectStoreError> {
            if self.failing.lock().expect("failing lock").contains(public_id) {
                return Err(ObjectStoreError::Backend("unavailable".to_string()));
            }
            self.deleted
                .lock()
                .expect("deleted lock")
                .push(public_id.to_string());
            Ok(())
        }
    }

    fn media(id: Uuid, owner: &str) -> MediaRecord {
        MediaRecord {
            id,
            public_id: format!("obj-{id}"),
            original_name: "photo.png".to_string(),
            mime_type: "image/png".to_string(),
            user_id: owner.to_string(),
            url: format!("/media/obj-{id}"),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn deleted(ids: &[Uuid]) -> PostDeleted {
        PostDeleted {
            post_id: Uuid::new_v4(),
            user_id: "alice".to_string(),
            media_ids: ids.to_vec(),
        }
    }

    #[tokio::test]
    async fn retry_only_touches_failed_items() {
        let repos = Arc::new(InMemoryRepositories::new());
        let objects = Arc::new(RecordingObjects::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        repos.insert_media(&media(a, "alice")).await.expect("insert");
        repos.insert_media(&media(b, "alice")).await.expect("insert");
        objects
            .failing
            .lock()
            .expect("failing lock")
            .insert(format!("obj-{b}"));

        let cleanup = MediaCleanup::new(repos.clone(), objects.clone());
        let event = deleted(&[a, b]);

        let err = cleanup.handle(&event).await.expect_err("b fails");
        match err {
            HandlerError::MediaCleanup(report) => {
                assert_eq!(report.succeeded, vec![a]);
                assert_eq!(report.failed.len(), 1);
                assert_eq!(report.failed[0].media_id, b);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(repos.find_media(b).await.expect("find").is_some());

        objects.failing.lock().expect("failing lock").clear();
        cleanup.handle(&event).await.expect("retry succeeds");

        let deleted = objects.deleted.lock().expect("deleted lock").clone();
        assert_eq!(deleted, vec![format!("obj-{a}"), format!("obj-{b}")]);
        assert!(repos.find_media(b).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn foreign_and_missing_media_are_skipped() {
        let repos = Arc::new(InMemoryRepositories::new());
        let objects = Arc::new(RecordingObjects::default());
        let foreign = Uuid::new_v4();
        repos
            .insert_media(&media(foreign, "mallory"))
            .await
            .expect("insert");

        let cleanup = MediaCleanup::new(repos.clone(), objects.clone());
        let report = cleanup
            .delete_post_media(&deleted(&[foreign, Uuid::new_v4()]))
            .await;

        assert!(report.is_complete());
        assert!(report.succeeded.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert!(repos.find_media(foreign).await.expect("find").is_some());
    }

    /// Media repository that rejects every insert.
    struct RejectingMedia;

    #[async_trait]
    impl MediaRepo for RejectingMedia {
        async fn insert_media(&self, _record: &MediaRecord) -> Result<(), RepoError> {
            Err(RepoError::Timeout)
        }
        async fn find_media(&self, _id: Uuid) -> Result<Option<MediaRecord>, RepoError> {
            Ok(None)
        }
        async fn delete_media(&self, _id: Uuid) -> Result<bool, RepoError> {
            Ok(false)
        }
    }

    fn upload(name: &str, bytes: &[u8]) -> MediaUpload {
        MediaUpload {
            original_name: name.to_string(),
            mime_type: "image/png".to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn upload_stores_object_and_record() {
        let repos = Arc::new(InMemoryRepositories::new());
        let objects = Arc::new(RecordingObjects::default());
        let service = MediaUploadService::new(repos.clone(), objects.clone());

        let record = service
            .upload("alice", upload("Holiday.PNG", b"png"))
            .await
            .expect("upload");

        assert_eq!(record.public_id, format!("{}.png", record.id));
        assert_eq!(record.url, format!("/media/{}", record.public_id));
        assert_eq!(record.user_id, "alice");
        assert_eq!(
            repos.find_media(record.id).await.expect("find"),
            Some(record.clone())
        );
        assert_eq!(
            *objects.stored.lock().expect("stored lock"),
            vec![record.public_id]
        );
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let repos = Arc::new(InMemoryRepositories::new());
        let objects = Arc::new(RecordingObjects::default());
        let service = MediaUploadService::new(repos.clone(), objects.clone());

        let err = service
            .upload("alice", upload("empty.png", b""))
            .await
            .expect_err("empty");
        assert!(matches!(err, AppError::Validation(_)));
        assert!(objects.stored.lock().expect("stored lock").is_empty());
        assert_eq!(repos.media_count(), 0);
    }

    #[tokio::test]
    async fn rejected_record_removes_the_object() {
        let objects = Arc::new(RecordingObjects::default());
        let service = MediaUploadService::new(Arc::new(RejectingMedia), objects.clone());

        let err = service
            .upload("alice", upload("photo.png", b"png"))
            .await
            .expect_err("insert fails");
        assert!(matches!(err, AppError::Repo(RepoError::Timeout)));

        let stored = objects.stored.lock().expect("stored lock").clone();
        let deleted = objects.deleted.lock().expect("deleted lock").clone();
        assert_eq!(stored, deleted);
    }

    #[test]
    fn extensions_are_normalised_or_dropped() {
        assert_eq!(file_extension("a.JPG").as_deref(), Some("jpg"));
        assert_eq!(file_extension("archive.tar.gz").as_deref(), Some("gz"));
        assert_eq!(file_extension("noext"), None);
        assert_eq!(file_extension(".hidden"), None);
        assert_eq!(file_extension("evil.p/ng"), None);
        assert_eq!(file_extension("long.abcdefghij"), None);
    }
}
