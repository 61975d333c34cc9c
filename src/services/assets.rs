use crate::core::io::Storage;
use crate::core::state::AssetRef;
use crate::services::image::ImageData;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Where generated and uploaded images live. References are opaque to callers.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Stores `image` under `scope` (normally the run id) and returns where it went.
    async fn put(&self, scope: &str, image: &ImageData) -> Result<AssetRef>;
    async fn get(&self, asset: &AssetRef) -> Result<ImageData>;
}

pub struct StorageAssetStore {
    storage: Arc<dyn Storage>,
}

impl StorageAssetStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

fn mime_for(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

#[async_trait]
impl AssetStore for StorageAssetStore {
    async fn put(&self, scope: &str, image: &ImageData) -> Result<AssetRef> {
        let path = format!("assets/{}/{}.{}", scope, Uuid::new_v4(), image.extension());
        self.storage
            .write(&path, &image.bytes)
            .await
            .with_context(|| format!("Failed to store asset {}", path))?;
        Ok(AssetRef(path))
    }

    async fn get(&self, asset: &AssetRef) -> Result<ImageData> {
        let bytes = self
            .storage
            .read(&asset.0)
            .await
            .with_context(|| format!("Failed to load asset {}", asset))?;
        Ok(ImageData {
            bytes,
            mime: mime_for(&asset.0).to_string(),
        })
    }
}
