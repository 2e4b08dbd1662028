//! Filesystem-backed object store laid out as `<root>/<container>/<key>`.

use std::path::{Component, Path, PathBuf};

use docflow_shared::{DocflowError, Result};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// Metadata returned after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    /// Where the object landed on disk.
    pub path: PathBuf,
    /// Object size in bytes.
    pub size: usize,
    /// Hex SHA-256 of the object body.
    pub checksum: String,
    pub content_type: String,
}

/// Local blob store. Writes replace existing objects atomically.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` under `container/key`, replacing any previous object.
    pub async fn put(
        &self,
        container: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<PutReceipt> {
        let path = self.object_path(container, key)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DocflowError::Storage(format!("{}: {e}", parent.display())))?;
        }

        // Write to a sibling temp file, then rename over the target
        let tmp = path.with_file_name(format!(
            ".{}.{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::now_v7()
        ));
        let written = match tokio::fs::write(&tmp, bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &path)
                .await
                .map_err(|e| format!("{}: {e}", path.display())),
            Err(e) => Err(format!("{}: {e}", tmp.display())),
        };
        if let Err(message) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(DocflowError::Storage(message));
        }

        let checksum = format!("{:x}", Sha256::digest(bytes));
        debug!(path = %path.display(), size = bytes.len(), %checksum, "object written");

        Ok(PutReceipt {
            path,
            size: bytes.len(),
            checksum,
            content_type: content_type.to_string(),
        })
    }

    /// Read an object back. Returns `None` when it does not exist.
    pub async fn get(&self, container: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(container, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DocflowError::Storage(format!("{}: {e}", path.display()))),
        }
    }

    /// Resolve `container/key` to a path under the root, rejecting escapes.
    fn object_path(&self, container: &str, key: &str) -> Result<PathBuf> {
        validate_location(container, key)?;
        Ok(self.root.join(container).join(key))
    }
}

/// Check that `container/key` names an object inside a store root.
///
/// The container is a single path segment; the key is a non-empty relative
/// path made only of normal components (no `..`, `.`, or leading `/`).
pub fn validate_location(container: &str, key: &str) -> Result<()> {
    validate_segment("container", container)?;
    if key.is_empty() {
        return Err(DocflowError::validation("object key must not be empty"));
    }
    if !Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(DocflowError::validation(format!(
            "object key '{key}' must be a relative path without '..'"
        )));
    }
    Ok(())
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.contains('/') || value.contains('\\') || value == "." || value == ".." {
        return Err(DocflowError::validation(format!("invalid {what} name '{value}'")));
    }
    Ok(())
}
