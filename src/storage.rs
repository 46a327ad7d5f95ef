//! Storage gateway over any [`object_store::ObjectStore`].
//!
//! Every write the pipeline makes goes through [`StorageGateway::put`] with
//! `upsert = true`, so a retried job overwrites its own objects at the same
//! deterministic keys (see [`crate::paths`]) instead of duplicating them.

use crate::error::StorageError;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutMode, PutOptions, PutPayload,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Per-write options.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub content_type: &'static str,
    pub cache_control: Option<String>,
    /// Overwrite an existing object instead of failing with
    /// [`StorageError::AlreadyExists`].
    pub upsert: bool,
}

impl PutRequest {
    /// Upsert with the content type inferred from `path`'s extension.
    pub fn for_path(path: &str, cache_control: &str) -> Self {
        Self {
            content_type: content_type_for(path),
            cache_control: Some(format!("max-age={cache_control}")),
            upsert: true,
        }
    }
}

/// `Content-Type` for an object key, by extension.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "dzi" | "xml" => "application/xml",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Path-keyed blob access for the pipeline.
#[derive(Clone)]
pub struct StorageGateway {
    store: Arc<dyn ObjectStore>,
    /// `LocalFileSystem` rejects writes that carry attributes.
    supports_attributes: bool,
}

impl std::fmt::Debug for StorageGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageGateway")
            .field("store", &self.store.to_string())
            .field("supports_attributes", &self.supports_attributes)
            .finish()
    }
}

impl StorageGateway {
    /// Wrap an arbitrary backend (S3, GCS, Azure, ...). These all persist
    /// content type and cache control.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            supports_attributes: true,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    /// A directory-backed store rooted at `root`, created if missing.
    pub fn local(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StorageError::LocalIo {
            path: root.clone(),
            source,
        })?;
        let fs = LocalFileSystem::new_with_prefix(&root).map_err(|e| StorageError::Upload {
            path: root.display().to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            store: Arc::new(fs),
            supports_attributes: false,
        })
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn put(&self, path: &str, bytes: Bytes, req: PutRequest) -> Result<(), StorageError> {
        let mut attributes = Attributes::new();
        if self.supports_attributes {
            attributes.insert(Attribute::ContentType, AttributeValue::from(req.content_type));
            if let Some(cc) = req.cache_control {
                attributes.insert(Attribute::CacheControl, AttributeValue::from(cc));
            }
        }
        let opts = PutOptions {
            mode: if req.upsert {
                PutMode::Overwrite
            } else {
                PutMode::Create
            },
            attributes,
            ..Default::default()
        };

        let size = bytes.len();
        self.store
            .put_opts(&StorePath::from(path), PutPayload::from(bytes), opts)
            .await
            .map_err(|e| match e {
                object_store::Error::AlreadyExists { .. } => StorageError::AlreadyExists {
                    path: path.to_string(),
                },
                other => StorageError::Upload {
                    path: path.to_string(),
                    detail: other.to_string(),
                },
            })?;
        debug!(path, size, "stored object");
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Bytes, StorageError> {
        let result = self
            .store
            .get(&StorePath::from(path))
            .await
            .map_err(|e| match e {
                object_store::Error::NotFound { .. } => StorageError::NotFound {
                    path: path.to_string(),
                },
                other => StorageError::Download {
                    path: path.to_string(),
                    detail: other.to_string(),
                },
            })?;
        result.bytes().await.map_err(|e| StorageError::Download {
            path: path.to_string(),
            detail: e.to_string(),
        })
    }

    /// Every key under `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix_path = StorePath::from(prefix);
        let mut keys: Vec<String> = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .map_err(|e| StorageError::Download {
                path: prefix.to_string(),
                detail: e.to_string(),
            })?;
        keys.sort();
        Ok(keys)
    }

    /// Upload every file below `local_dir` to `{remote_prefix}/{relative path}`,
    /// at most `concurrency` uploads in flight. Returns the number of objects
    /// written. The first failed upload aborts the rest.
    pub async fn upload_tree(
        &self,
        local_dir: &Path,
        remote_prefix: &str,
        concurrency: usize,
        cache_control: &str,
    ) -> Result<usize, StorageError> {
        let files = collect_files(local_dir).await?;
        let total = files.len();

        stream::iter(files.into_iter().map(|(local, relative)| {
            let key = format!("{}/{}", remote_prefix.trim_end_matches('/'), relative);
            async move {
                let bytes = tokio::fs::read(&local)
                    .await
                    .map_err(|source| StorageError::LocalIo {
                        path: local.clone(),
                        source,
                    })?;
                let req = PutRequest::for_path(&key, cache_control);
                self.put(&key, Bytes::from(bytes), req).await
            }
        }))
        .buffer_unordered(concurrency.max(1))
        .try_collect::<Vec<()>>()
        .await?;

        debug!(prefix = remote_prefix, files = total, "uploaded tree");
        Ok(total)
    }
}

/// Regular files under `root` paired with their `/`-joined relative path.
async fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>, StorageError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StorageError::LocalIo { path, source }
    };

    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(io_err(&dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(io_err(&path))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push((path, relative));
            }
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for("p/plan.pdf"), "application/pdf");
        assert_eq!(content_type_for("p/previews/a-page1.png"), "image/png");
        assert_eq!(content_type_for("t/a_files/3/0_0.JPEG"), "image/jpeg");
        assert_eq!(content_type_for("t/a.dzi"), "application/xml");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn upsert_overwrites_and_create_refuses() {
        let gw = StorageGateway::in_memory();
        let req = PutRequest::for_path("p/plan.pdf", "31536000");
        gw.put("p/plan.pdf", Bytes::from_static(b"one"), req.clone()).await.unwrap();
        gw.put("p/plan.pdf", Bytes::from_static(b"two"), req.clone()).await.unwrap();
        assert_eq!(gw.get("p/plan.pdf").await.unwrap(), Bytes::from_static(b"two"));

        let create = PutRequest { upsert: false, ..req };
        let err = gw
            .put("p/plan.pdf", Bytes::from_static(b"three"), create)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let gw = StorageGateway::in_memory();
        let err = gw.get("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn upload_tree_mirrors_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("0")).unwrap();
        std::fs::create_dir_all(dir.path().join("1")).unwrap();
        std::fs::write(dir.path().join("0/0_0.jpeg"), b"a").unwrap();
        std::fs::write(dir.path().join("1/0_0.jpeg"), b"b").unwrap();
        std::fs::write(dir.path().join("1/1_0.jpeg"), b"c").unwrap();

        let gw = StorageGateway::in_memory();
        let n = gw
            .upload_tree(dir.path(), "p/tiles/plan-page1_files", 2, "31536000")
            .await
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(
            gw.list("p/tiles").await.unwrap(),
            vec![
                "p/tiles/plan-page1_files/0/0_0.jpeg",
                "p/tiles/plan-page1_files/1/0_0.jpeg",
                "p/tiles/plan-page1_files/1/1_0.jpeg",
            ]
        );
    }

    #[tokio::test]
    async fn local_store_accepts_writes_without_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let gw = StorageGateway::local(dir.path().join("out")).unwrap();
        gw.put(
            "p/previews/a-page1.png",
            Bytes::from_static(b"png"),
            PutRequest::for_path("p/previews/a-page1.png", "31536000"),
        )
        .await
        .unwrap();
        assert!(dir.path().join("out/p/previews/a-page1.png").exists());
    }
}
