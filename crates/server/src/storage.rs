use std::path::{Component, Path, PathBuf};

use tokio::fs;

use crate::error::AppError;

/// Owned blob storage under the data directory. Used for side work like
/// pulling externally-referenced icons into files we control, served back
/// through signed URLs.
#[derive(Clone)]
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().join("blobs"),
        }
    }

    /// Reject absolute paths and traversal so a blob path from a URL can
    /// never read outside the store.
    fn resolve(&self, rel: &str) -> Result<PathBuf, AppError> {
        let rel_path = Path::new(rel);
        if rel_path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        }) {
            return Err(AppError::Validation(format!("invalid blob path: {rel}")));
        }
        Ok(self.base_path.join(rel_path))
    }

    /// Store bytes under `<category>/<name>`, returning the relative blob
    /// path for later retrieval.
    pub async fn put(&self, category: &str, name: &str, bytes: &[u8]) -> Result<String, AppError> {
        let rel = format!("{category}/{name}");
        let path = self.resolve(&rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(rel)
    }

    pub async fn get(&self, rel: &str) -> Result<Option<Vec<u8>>, AppError> {
        let path = self.resolve(rel)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path());

        let rel = store.put("icons", "a.png", b"png-bytes").await.unwrap();
        assert_eq!(rel, "icons/a.png");
        assert_eq!(store.get(&rel).await.unwrap().unwrap(), b"png-bytes");
        assert!(store.get("icons/missing.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path());
        assert!(store.get("../outside").await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
    }
}
