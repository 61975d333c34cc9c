use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Key/value blob store addressed by slash-separated relative paths.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
    /// Lists the entries directly under `prefix`, returned as paths relative to the store root.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct NativeStorage {
    root: PathBuf,
}

impl NativeStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Write-then-rename so a crash never leaves a half-written snapshot.
        let tmp = full.with_extension("tmp");
        tokio::fs::write(&tmp, content)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &full).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        if tokio::fs::try_exists(&full).await? {
            if full.is_dir() {
                tokio::fs::remove_dir_all(&full).await?;
            } else {
                tokio::fs::remove_file(&full).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir_path = self.resolve(prefix);
        let mut entries = Vec::new();

        if dir_path.is_dir() {
            let mut dir = tokio::fs::read_dir(&dir_path).await?;
            while let Some(entry) = dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if prefix.is_empty() {
                    entries.push(name);
                } else {
                    entries.push(format!("{}/{}", prefix.trim_end_matches('/'), name));
                }
            }
        }

        entries.sort();
        Ok(entries)
    }
}

/// Wraps another store so that no call waits longer than `timeout`. A stalled
/// backend surfaces as an ordinary storage error.
pub struct BoundedStorage {
    inner: Arc<dyn Storage>,
    timeout: Duration,
}

impl BoundedStorage {
    pub fn new(inner: Arc<dyn Storage>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T, F>(&self, op: &str, path: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "storage {} of {} timed out after {:?}",
                op,
                path,
                self.timeout
            )),
        }
    }
}

#[async_trait]
impl Storage for BoundedStorage {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.bounded("read", path, self.inner.read(path)).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        self.bounded("write", path, self.inner.write(path, content)).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.bounded("delete", path, self.inner.delete(path)).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.bounded("exists", path, self.inner.exists(path)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.bounded("list", prefix, self.inner.list(prefix)).await
    }
}
