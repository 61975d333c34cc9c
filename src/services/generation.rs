use crate::core::error::{PipelineError, Result};
use crate::core::state::AssetRef;
use crate::services::assets::AssetStore;
use crate::services::image::{ImageClient, ImageConfig, ImageData, ImageOptions};
use log::{debug, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageResult {
    pub asset: AssetRef,
    pub used_references: bool,
}

/// Produces one stored image per call.
///
/// With references available and conditioning enabled, one reference-conditioned
/// attempt is made; if it fails or is skipped, exactly one prompt-only attempt
/// follows. No other retries, so a unit costs at most two upstream calls.
pub struct GenerationAdapter {
    image: Arc<dyn ImageClient>,
    assets: Arc<dyn AssetStore>,
    options: ImageOptions,
    timeout: Duration,
    storage_timeout: Duration,
    reference_conditioning: bool,
}

const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(30);

impl GenerationAdapter {
    pub fn new(
        image: Arc<dyn ImageClient>,
        assets: Arc<dyn AssetStore>,
        config: &ImageConfig,
    ) -> Self {
        Self {
            image,
            assets,
            options: config.options(),
            timeout: config.timeout(),
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
            reference_conditioning: config.reference_conditioning,
        }
    }

    pub fn with_storage_timeout(mut self, timeout: Duration) -> Self {
        self.storage_timeout = timeout;
        self
    }

    /// Stores an image that did not come from the image service.
    pub async fn store(&self, scope: &str, image: &ImageData) -> Result<AssetRef> {
        self.stored(self.assets.put(scope, image)).await
    }

    /// Generates an image for `prompt` and stores it under `scope`.
    pub async fn generate(
        &self,
        scope: &str,
        prompt: &str,
        references: &[AssetRef],
    ) -> Result<ImageResult> {
        let (image, used_references) =
            match self.try_reference_conditioned(prompt, references).await {
                Some(image) => (image, true),
                None => (self.try_standard(prompt).await?, false),
            };

        let asset = self.store(scope, &image).await?;
        debug!("Stored image {} (references: {})", asset, used_references);
        Ok(ImageResult {
            asset,
            used_references,
        })
    }

    /// `None` when conditioning is off, there is nothing to condition on, or the attempt failed.
    async fn try_reference_conditioned(
        &self,
        prompt: &str,
        references: &[AssetRef],
    ) -> Option<ImageData> {
        if !self.reference_conditioning || references.is_empty() {
            return None;
        }

        let mut images = Vec::with_capacity(references.len());
        for asset in references {
            match self.stored(self.assets.get(asset)).await {
                Ok(image) => images.push(image),
                Err(e) => {
                    warn!("Reference {} unavailable, using prompt only: {}", asset, e);
                    return None;
                }
            }
        }

        let attempt = self.bounded(
            self.image
                .generate_image_with_references(prompt, &images, &self.options),
        );
        match attempt.await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!("Reference-conditioned generation failed, falling back: {}", e);
                None
            }
        }
    }

    async fn try_standard(&self, prompt: &str) -> Result<ImageData> {
        self.bounded(self.image.generate_image(prompt, &self.options))
            .await
    }

    /// Asset store calls share one bound; a timeout counts as a persistence failure.
    async fn stored<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.storage_timeout, call).await {
            Ok(result) => result.map_err(PipelineError::persistence),
            Err(_) => Err(PipelineError::persistence(format!(
                "asset store timed out after {:?}",
                self.storage_timeout
            ))),
        }
    }

    async fn bounded<F>(&self, call: F) -> Result<ImageData>
    where
        F: Future<Output = anyhow::Result<ImageData>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(image)) => Ok(image),
            Ok(Err(e)) => Err(PipelineError::upstream("image", e)),
            Err(_) => Err(PipelineError::upstream(
                "image",
                format!("timed out after {}s", self.timeout.as_secs()),
            )),
        }
    }
}
