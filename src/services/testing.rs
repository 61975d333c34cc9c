//! Mocks and fixtures shared by the service tests.

use crate::core::config::PipelineConfig;
use crate::core::io::{BoundedStorage, NativeStorage, Storage};
use crate::core::registry::RunRegistry;
use crate::core::state::{renumber_pages, Character, CharacterRole, Page, Phase, Run};
use crate::services::assets::{AssetStore, StorageAssetStore};
use crate::services::drafts::DraftStore;
use crate::services::generation::GenerationAdapter;
use crate::services::image::{ImageClient, ImageConfig, ImageData, ImageOptions};
use crate::services::llm::LlmClient;
use crate::services::phases::PhaseHandlers;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A backend whose calls never complete.
#[derive(Debug, Default)]
pub struct StalledStorage;

#[async_trait]
impl Storage for StalledStorage {
    async fn read(&self, _path: &str) -> Result<Vec<u8>> {
        std::future::pending().await
    }
    async fn write(&self, _path: &str, _content: &[u8]) -> Result<()> {
        std::future::pending().await
    }
    async fn delete(&self, _path: &str) -> Result<()> {
        std::future::pending().await
    }
    async fn exists(&self, _path: &str) -> Result<bool> {
        std::future::pending().await
    }
    async fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        std::future::pending().await
    }
}

/// A stalled backend behind a 50ms bound.
pub fn stalled_storage() -> Arc<dyn Storage> {
    Arc::new(BoundedStorage::new(Arc::new(StalledStorage), Duration::from_millis(50)))
}

/// Answers the three text prompts with a small fixed story.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    pub calls: Mutex<Vec<String>>,
    pub fail: Mutex<bool>,
}

impl ScriptedLlm {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn requested_pages(prompt: &str) -> Option<usize> {
    prompt
        .split("exactly ")
        .nth(1)?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, _system: &str, user: &str) -> Result<String> {
        self.calls.lock().unwrap().push(user.to_string());
        if *self.fail.lock().unwrap() {
            bail!("model overloaded");
        }

        if user.contains("illustration style") {
            let style = json!({"style": "soft watercolor", "rationale": "gentle bedtime story"});
            return Ok(style.to_string());
        }
        if user.contains("List every character") {
            return Ok(json!({
                "characters": [
                    {
                        "name": "Mia",
                        "role": "main",
                        "description": "A curious girl who loves lanterns.",
                        "visual_identity": {
                            "species": "girl",
                            "coloring": {"hair": "red curly", "eyes": "green"},
                            "outfit": {"top": "yellow raincoat"},
                            "distinguishing_features": ["freckles"]
                        }
                    },
                    {"name": "Otto", "role": "supporting", "description": "A sleepy grey otter."}
                ]
            })
            .to_string());
        }
        if let Some(n) = requested_pages(user) {
            let pages: Vec<_> = (1..=n)
                .map(|i| {
                    json!({
                        "text": format!("Page {} text.", i),
                        "image_description": format!("scene #{}.", i),
                        "action": "walking",
                        "emotion": "curious",
                        "characters_in_scene": ["Mia"]
                    })
                })
                .collect();
            return Ok(json!({
                "title": "Mia and the Lantern",
                "summary": "Mia follows a lantern through the woods.",
                "pages": pages
            })
            .to_string());
        }
        bail!("unexpected prompt: {}", user)
    }
}

/// Counts calls and can be told to fail on matching prompts.
#[derive(Default)]
pub struct FakeImageClient {
    pub plain_calls: Mutex<usize>,
    pub reference_calls: Mutex<usize>,
    pub prompts: Mutex<Vec<String>>,
    pub fail_prompts_containing: Option<String>,
    pub fail_references: bool,
    /// Invoked with the running total of calls after each call is counted.
    pub on_call: Option<Box<dyn Fn(usize) + Send + Sync>>,
}

impl fmt::Debug for FakeImageClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeImageClient")
            .field("plain_calls", &self.plain_calls)
            .field("reference_calls", &self.reference_calls)
            .finish()
    }
}

impl FakeImageClient {
    pub fn total_calls(&self) -> usize {
        *self.plain_calls.lock().unwrap() + *self.reference_calls.lock().unwrap()
    }

    fn record(&self, prompt: &str) -> Result<()> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(hook) = &self.on_call {
            hook(self.total_calls());
        }
        if let Some(needle) = &self.fail_prompts_containing {
            if prompt.contains(needle.as_str()) {
                bail!("image rejected");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ImageClient for FakeImageClient {
    async fn generate_image(&self, prompt: &str, _options: &ImageOptions) -> Result<ImageData> {
        *self.plain_calls.lock().unwrap() += 1;
        self.record(prompt)?;
        Ok(ImageData::png(prompt.as_bytes().to_vec()))
    }

    async fn generate_image_with_references(
        &self,
        prompt: &str,
        _references: &[ImageData],
        _options: &ImageOptions,
    ) -> Result<ImageData> {
        *self.reference_calls.lock().unwrap() += 1;
        if self.fail_references {
            bail!("edits endpoint unavailable");
        }
        self.record(prompt)?;
        Ok(ImageData::png(prompt.as_bytes().to_vec()))
    }
}

pub fn image_config() -> ImageConfig {
    serde_yaml::from_str("api_key: test\n").unwrap()
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub storage: Arc<dyn Storage>,
    pub assets: Arc<dyn AssetStore>,
    pub registry: Arc<RunRegistry>,
    pub drafts: Arc<DraftStore>,
    pub handlers: Arc<PhaseHandlers>,
    pub llm: Arc<ScriptedLlm>,
    pub image: Arc<FakeImageClient>,
}

pub fn fixture() -> Fixture {
    fixture_with(FakeImageClient::default(), PipelineConfig::default())
}

pub fn fixture_with(image: FakeImageClient, pipeline: PipelineConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new(dir.path()));
    fixture_on(dir, storage, image, pipeline)
}

/// Same collaborators as [`fixture_with`], over a caller-chosen store.
pub fn fixture_on(
    dir: tempfile::TempDir,
    storage: Arc<dyn Storage>,
    image: FakeImageClient,
    pipeline: PipelineConfig,
) -> Fixture {
    let assets: Arc<dyn AssetStore> = Arc::new(StorageAssetStore::new(storage.clone()));
    let image = Arc::new(image);
    let llm = Arc::new(ScriptedLlm::default());
    let generator = Arc::new(
        GenerationAdapter::new(image.clone(), assets.clone(), &image_config())
            .with_storage_timeout(Duration::from_millis(200)),
    );
    let drafts = Arc::new(DraftStore::new(storage.clone()));
    let handlers = Arc::new(PhaseHandlers::new(
        llm.clone(),
        generator,
        drafts.clone(),
        pipeline,
        Duration::from_secs(5),
    ));
    Fixture {
        dir,
        storage,
        assets,
        registry: Arc::new(RunRegistry::new()),
        drafts,
        handlers,
        llm,
        image,
    }
}

/// A run parked at `phase` with `pages` numbered pages featuring Mia.
pub fn run_with_pages(id: &str, phase: Phase, pages: usize) -> Run {
    let mut run = Run::new(id, "Mia follows a lantern.", Some("ana".into()));
    run.phase = phase;
    run.status = phase.resting_status();
    run.title = Some("Mia and the Lantern".into());
    run.summary = Some("Mia follows a lantern through the woods.".into());
    let mut mia = Character::new("Mia", CharacterRole::Main);
    mia.consistency_tag = Some("girl, red curly hair, yellow raincoat".into());
    run.characters = vec![mia];
    run.pages = renumber_pages(
        (1..=pages)
            .map(|i| {
                let mut page = Page::new(format!("Page {} text.", i), format!("scene #{}.", i));
                page.characters_in_scene = vec!["Mia".into()];
                page
            })
            .collect(),
    );
    run
}
