use crate::core::config::{AvatarMode, Config};
use crate::core::error::{PipelineError, Result};
use crate::core::io::{BoundedStorage, NativeStorage, Storage};
use crate::core::registry::RunRegistry;
use crate::core::state::{Phase, PhaseResult, Run, VisualIdentity};
use crate::services::assets::{AssetStore, StorageAssetStore};
use crate::services::batch::{BatchExecutor, BatchHandle, BatchRequest, BatchStore};
use crate::services::drafts::{BookStore, DraftStore, DraftSummary};
use crate::services::generation::GenerationAdapter;
use crate::services::image::{create_image_client, ImageClient, ImageData};
use crate::services::llm::{create_llm, LlmClient};
use crate::services::phases::PhaseHandlers;
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Operator edits applied between automatic steps.
#[derive(Debug, Clone)]
pub enum Edit {
    PageText { page_number: usize, text: String },
    ImageDescription { page_number: usize, description: String },
    AddPage { position: usize, text: String, image_description: String },
    DeletePage(usize),
    ApprovePage(usize),
    ApproveAllPages,
    RefineCharacter { name: String, identity: VisualIdentity },
    SubmitAvatar { name: String, image: ImageData },
    ChangePageCount(usize),
    /// Reopen a finished (or in-review) book with every approval cleared.
    ReopenForEditing,
}

/// A single illustration that can be redrawn on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Page(usize),
    Cover,
}

/// Entry point for every operation the operator can trigger.
pub struct Pipeline {
    registry: Arc<RunRegistry>,
    handlers: Arc<PhaseHandlers>,
    drafts: Arc<DraftStore>,
    books: BookStore,
    batches: Arc<BatchStore>,
    executor: Arc<BatchExecutor>,
    active: Mutex<HashMap<String, BatchHandle>>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        llm: Arc<dyn LlmClient>,
        image: Arc<dyn ImageClient>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let storage_timeout = config.pipeline.storage_timeout();
        let storage: Arc<dyn Storage> = Arc::new(BoundedStorage::new(storage, storage_timeout));
        let assets: Arc<dyn AssetStore> = Arc::new(StorageAssetStore::new(storage.clone()));
        let generator = Arc::new(
            GenerationAdapter::new(image, assets, &config.image)
                .with_storage_timeout(storage_timeout),
        );
        let drafts = Arc::new(DraftStore::new(storage.clone()));
        let handlers = Arc::new(PhaseHandlers::new(
            llm,
            generator,
            drafts.clone(),
            config.pipeline.clone(),
            config.llm.timeout(),
        ));
        let registry = Arc::new(RunRegistry::new());
        let batches = Arc::new(BatchStore::new(storage.clone()));
        let executor = Arc::new(BatchExecutor::new(
            handlers.clone(),
            registry.clone(),
            batches.clone(),
        ));

        Self {
            registry,
            handlers,
            drafts,
            books: BookStore::new(storage),
            batches,
            executor,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Builds the configured clients and a filesystem store under `data_folder`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let llm: Arc<dyn LlmClient> = Arc::from(create_llm(&config.llm)?);
        let image: Arc<dyn ImageClient> = Arc::from(create_image_client(&config.image)?);
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new(&config.data_folder));
        Ok(Self::new(config, llm, image, storage))
    }

    pub async fn create_run(&self, story: &str, owner: Option<String>) -> Result<Run> {
        if story.trim().is_empty() {
            return Err(PipelineError::validation("story is empty"));
        }
        let run = Run::new(Uuid::new_v4().to_string(), story.trim(), owner);
        self.registry.put(run.clone()).await;
        self.drafts.save(&run).await;
        info!("Created run {}", run.id);
        Ok(run)
    }

    /// Runs the next automatic step for the run's current phase and returns the
    /// updated run. Review phases move on when this is called.
    pub async fn advance(&self, run_id: &str) -> Result<Run> {
        let mut run = self.registry.lock(run_id).await?;
        let h = &self.handlers;
        let phase = run.phase;
        match phase {
            Phase::StoryInput => h.select_art_style(&mut run).await?,
            Phase::ArtStyleSelection if run.art_style.is_none() => {
                h.select_art_style(&mut run).await?
            }
            Phase::ArtStyleSelection => h.extract_characters(&mut run).await?,
            Phase::CharacterExtraction if run.progress < 100 => {
                h.extract_characters(&mut run).await?
            }
            Phase::CharacterExtraction | Phase::AvatarGeneration => {
                h.generate_avatars(&mut run).await?
            }
            Phase::AwaitingAvatarInput => {
                let missing = run.characters.iter().any(|c| c.avatar.is_none());
                if missing && h.pipeline_config().avatar_mode == AvatarMode::Auto {
                    h.generate_avatars(&mut run).await?;
                } else {
                    h.approve_avatars(&mut run).await?;
                    h.generate_pages(&mut run).await?;
                }
            }
            Phase::AwaitingApproval => {
                h.approve_avatars(&mut run).await?;
                h.generate_pages(&mut run).await?;
            }
            Phase::PageGeneration => h.generate_pages(&mut run).await?,
            Phase::AwaitingPromptReview => h.approve_prompts(&mut run).await?,
            Phase::IllustrationGeneration => h.generate_illustrations(&mut run).await?,
            Phase::CoverGeneration => h.generate_cover(&mut run).await?,
            Phase::AwaitingPageReview | Phase::Complete => {
                return Err(PipelineError::validation(format!(
                    "run {} is in {}; finalize or edit it instead",
                    run.id, run.phase
                )))
            }
        }
        Ok(run.clone())
    }

    pub async fn edit(&self, run_id: &str, edit: Edit) -> Result<Run> {
        if matches!(edit, Edit::ReopenForEditing) && !self.registry.contains(run_id) {
            let book = self.books.load(run_id).await?;
            self.registry.put(book).await;
        }

        let mut run = self.registry.lock(run_id).await?;
        let h = &self.handlers;
        match edit {
            Edit::PageText { page_number, text } => h.edit_page(&mut run, page_number, text).await?,
            Edit::ImageDescription {
                page_number,
                description,
            } => h.edit_image_description(&mut run, page_number, description).await?,
            Edit::AddPage {
                position,
                text,
                image_description,
            } => h.add_page(&mut run, position, text, image_description).await?,
            Edit::DeletePage(n) => h.delete_page(&mut run, n).await?,
            Edit::ApprovePage(n) => h.approve_page(&mut run, n).await?,
            Edit::ApproveAllPages => h.approve_all_pages(&mut run).await?,
            Edit::RefineCharacter { name, identity } => {
                h.refine_character(&mut run, &name, identity).await?
            }
            Edit::SubmitAvatar { name, image } => h.submit_avatar(&mut run, &name, image).await?,
            Edit::ChangePageCount(count) => h.regenerate_with_page_count(&mut run, count).await?,
            Edit::ReopenForEditing => h.edit_saved_story(&mut run).await?,
        }
        Ok(run.clone())
    }

    pub async fn regenerate_unit(&self, run_id: &str, unit: Unit) -> Result<Run> {
        let mut run = self.registry.lock(run_id).await?;
        match unit {
            Unit::Page(n) => self.handlers.regenerate_page(&mut run, n).await?,
            Unit::Cover => self.handlers.regenerate_cover(&mut run).await?,
        };
        Ok(run.clone())
    }

    /// Starts a background illustration batch. At most one batch per run may be
    /// pending or processing.
    pub async fn create_batch(&self, run_id: &str) -> Result<BatchHandle> {
        let run = self.registry.get(run_id)?;
        let mut active = self.active.lock().await;
        active.retain(|_, handle| !handle.status().status.is_terminal());
        if active.values().any(|handle| handle.run_id() == run_id) {
            return Err(PipelineError::validation(format!(
                "run {} already has a batch in progress",
                run_id
            )));
        }

        let request = BatchRequest::new(&run);
        self.batches.save(&request).await;
        let handle = self.executor.spawn(request);
        info!("Batch {} queued for run {}", handle.id(), run_id);
        active.insert(handle.id().to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn cancel_batch(&self, batch_id: &str) -> Result<BatchRequest> {
        let active = self.active.lock().await;
        match active.get(batch_id) {
            Some(handle) => {
                handle.cancel();
                Ok(handle.status())
            }
            None => self.batches.load(batch_id).await,
        }
    }

    pub fn run_status(&self, run_id: &str) -> Result<Run> {
        self.registry.get(run_id)
    }

    pub async fn batch_status(&self, batch_id: &str) -> Result<BatchRequest> {
        if let Some(handle) = self.active.lock().await.get(batch_id) {
            return Ok(handle.status());
        }
        self.batches.load(batch_id).await
    }

    /// Completes review, writes the book and drops the draft and the in-memory
    /// run. Returns where the book was written. The run is left untouched if
    /// writing fails. Reopening loads it back from the library.
    pub async fn finalize(&self, run_id: &str) -> Result<String> {
        let mut run = self.registry.lock(run_id).await?;
        if run.pages.iter().any(|p| !p.is_illustrated()) {
            return Err(PipelineError::validation(format!(
                "run {} still has pages without illustrations",
                run_id
            )));
        }
        let completed = run.advance(PhaseResult::Completed)?;
        let location = self.books.publish(&completed).await?;
        run.set(completed);
        self.drafts.delete(run_id).await;
        self.registry.remove(run_id);
        info!("Finalized run {} as {}", run_id, location);
        Ok(location)
    }

    /// Restores a run from its draft, replacing whatever is in memory.
    pub async fn resume_draft(&self, run_id: &str) -> Result<Run> {
        let draft = self.drafts.load(run_id).await?;
        self.registry.put(draft.run.clone()).await;
        info!(
            "Resumed run {} at {} (step {})",
            run_id, draft.run.phase, draft.current_step
        );
        Ok(draft.run)
    }

    pub async fn list_drafts(&self, owner: Option<&str>) -> Result<Vec<DraftSummary>> {
        self.drafts.list_by_owner(owner).await
    }

    pub async fn load_book(&self, run_id: &str) -> Result<Run> {
        self.books.load(run_id).await
    }
}
