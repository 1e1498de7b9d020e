//! Filesystem-backed media object storage.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::application::media::{ObjectStore, ObjectStoreError};

/// Path prefix under which the static file server exposes the media root.
const PUBLIC_PREFIX: &str = "/media";

/// Stores media objects as files below a root directory.
#[derive(Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the absolute filesystem path for a stored object.
    fn resolve(&self, public_id: &str) -> Result<PathBuf, ObjectStoreError> {
        let relative = Path::new(public_id);
        if public_id.is_empty()
            || relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(ObjectStoreError::InvalidKey(public_id.to_string()));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, public_id: &str, bytes: &[u8]) -> Result<(), ObjectStoreError> {
        let absolute = self.resolve(public_id)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(err) = fs::write(&absolute, bytes).await {
            let _ = fs::remove_file(&absolute).await;
            return Err(ObjectStoreError::Io(err));
        }
        Ok(())
    }

    fn object_url(&self, public_id: &str) -> String {
        format!("{PUBLIC_PREFIX}/{public_id}")
    }

    async fn delete_object(&self, public_id: &str) -> Result<(), ObjectStoreError> {
        let absolute = self.resolve(public_id)?;
        match fs::remove_file(&absolute).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }
}
