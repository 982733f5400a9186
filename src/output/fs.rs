//! Filesystem object store.
//!
//! Maps bucket keys to paths under a root directory. Suits single-host
//! deployments and local runs; production deployments point this interface
//! at real object storage.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{ObjectStore, OutputError};

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), OutputError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        tracing::debug!(path = %path.display(), "Stored output object");
        Ok(())
    }
}
