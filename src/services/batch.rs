use crate::core::error::{PipelineError, Result};
use crate::core::io::Storage;
use crate::core::registry::{RunGuard, RunRegistry};
use crate::core::state::{Phase, PhaseResult, Run, RunId, RunStatus};
use crate::services::phases::{PhaseHandlers, UnitOutcome};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
        )
    }
}

fn check_cancelled(cancel: &watch::Receiver<bool>) -> Result<()> {
    if *cancel.borrow() {
        return Err(PipelineError::Cancelled);
    }
    Ok(())
}

/// Persisted record of one bulk illustration pass over a run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BatchRequest {
    pub id: String,
    pub run_id: RunId,
    pub total_units: usize,
    /// Units generated or found already illustrated.
    pub completed_units: usize,
    /// Labels of units that failed, e.g. `page 3` or `cover`.
    #[serde(default)]
    pub failed_units: Vec<String>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl BatchRequest {
    pub fn new(run: &Run) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            total_units: run.pages.len() + usize::from(run.cover_needed()),
            completed_units: 0,
            failed_units: Vec::new(),
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_message: None,
        }
    }
}

/// Batch records under `batches/`. Saves are best-effort like drafts.
pub struct BatchStore {
    storage: Arc<dyn Storage>,
}

fn batch_path(id: &str) -> String {
    format!("batches/{}.json", id)
}

impl BatchStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn save(&self, request: &BatchRequest) {
        let result = match serde_json::to_vec_pretty(request) {
            Ok(content) => self.storage.write(&batch_path(&request.id), &content).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Saving batch {} failed: {:#}", request.id, e);
        }
    }

    pub async fn load(&self, id: &str) -> Result<BatchRequest> {
        let path = batch_path(id);
        if !self.storage.exists(&path).await.map_err(PipelineError::persistence)? {
            return Err(PipelineError::not_found("batch", id));
        }
        let bytes = self.storage.read(&path).await.map_err(PipelineError::persistence)?;
        serde_json::from_slice(&bytes).map_err(PipelineError::persistence)
    }
}

/// Handle to a running batch. Cloning shares the same batch.
#[derive(Clone)]
pub struct BatchHandle {
    id: String,
    run_id: RunId,
    cancel: Arc<watch::Sender<bool>>,
    status: watch::Receiver<BatchRequest>,
}

impl BatchHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Asks the batch to stop. Takes effect before the next unit starts; a unit
    /// already in flight runs to completion.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn status(&self) -> BatchRequest {
        self.status.borrow().clone()
    }

    /// Waits for a terminal status and returns the final record.
    pub async fn wait(&self) -> BatchRequest {
        let mut status = self.status.clone();
        let finished = status
            .wait_for(|b| b.status.is_terminal())
            .await
            .map(|b| b.clone());
        match finished {
            Ok(request) => request,
            // The executor went away without finishing; report what it last published.
            Err(_) => status.borrow().clone(),
        }
    }
}

pub struct BatchExecutor {
    handlers: Arc<PhaseHandlers>,
    registry: Arc<RunRegistry>,
    store: Arc<BatchStore>,
}

impl BatchExecutor {
    pub fn new(
        handlers: Arc<PhaseHandlers>,
        registry: Arc<RunRegistry>,
        store: Arc<BatchStore>,
    ) -> Self {
        Self {
            handlers,
            registry,
            store,
        }
    }

    /// Starts `request` in the background.
    pub fn spawn(self: &Arc<Self>, request: BatchRequest) -> BatchHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(request.clone());
        let handle = BatchHandle {
            id: request.id.clone(),
            run_id: request.run_id.clone(),
            cancel: Arc::new(cancel_tx),
            status: status_rx,
        };

        let executor = self.clone();
        tokio::spawn(async move {
            executor.execute(request, cancel_rx, status_tx).await;
        });
        handle
    }

    async fn publish(&self, request: &BatchRequest, status: &watch::Sender<BatchRequest>) {
        self.store.save(request).await;
        status.send_replace(request.clone());
    }

    async fn fail_early(
        &self,
        mut request: BatchRequest,
        err: PipelineError,
        status: &watch::Sender<BatchRequest>,
    ) -> BatchRequest {
        warn!("Batch {} for run {} failed: {}", request.id, request.run_id, err);
        request.status = BatchStatus::Failed;
        request.error_message = Some(err.to_string());
        request.finished_at = Some(Utc::now());
        self.publish(&request, status).await;
        request
    }

    fn check_runnable(run: &RunGuard) -> Result<()> {
        if run.status == RunStatus::Error {
            return Err(PipelineError::validation(format!(
                "run {} is in error state",
                run.id
            )));
        }
        if run.pages.is_empty() {
            return Err(PipelineError::validation(format!("run {} has no pages", run.id)));
        }
        if !matches!(
            run.phase,
            Phase::IllustrationGeneration | Phase::CoverGeneration | Phase::AwaitingPageReview
        ) {
            return Err(PipelineError::validation(format!(
                "batch illustration not accepted during {}",
                run.phase
            )));
        }
        Ok(())
    }

    /// Page units in ascending order, then the cover. Unit failures are recorded
    /// on `request`; the only error returned is `Cancelled`.
    async fn run_units(
        &self,
        run: &mut RunGuard,
        request: &mut BatchRequest,
        cancel: &watch::Receiver<bool>,
        status: &watch::Sender<BatchRequest>,
    ) -> Result<()> {
        let drafts = self.handlers.drafts();
        let mut page_numbers: Vec<usize> = run.pages.iter().map(|p| p.page_number).collect();
        page_numbers.sort_unstable();

        for page_number in page_numbers {
            check_cancelled(cancel)?;
            match self.handlers.ensure_illustrated(run, page_number, false).await {
                Ok(UnitOutcome::Skipped) | Ok(UnitOutcome::Generated { .. }) => {
                    request.completed_units += 1;
                }
                Err(e) => {
                    warn!(
                        "Batch {}: page {} of run {} failed: {}",
                        request.id, page_number, request.run_id, e
                    );
                    request.failed_units.push(format!("page {}", page_number));
                }
            }
            drafts.save(run).await;
            self.publish(request, status).await;
        }

        if run.phase == Phase::IllustrationGeneration {
            let cover_needed = run.cover_needed();
            match run.advance(PhaseResult::IllustrationsSettled { cover_needed }) {
                Ok(next) => run.set(next),
                Err(e) => warn!("Batch {}: could not settle illustrations: {}", request.id, e),
            }
        }

        if run.cover_needed() {
            check_cancelled(cancel)?;
            match self.handlers.ensure_cover(run, false).await {
                Ok(_) => request.completed_units += 1,
                Err(e) => {
                    warn!("Batch {}: cover of run {} failed: {}", request.id, request.run_id, e);
                    request.failed_units.push("cover".to_string());
                }
            }
            drafts.save(run).await;
        }
        Ok(())
    }

    /// Runs every unit of `request` in page order, then the cover. Holds the run
    /// lock throughout, so no other operation interleaves with the batch.
    pub async fn execute(
        &self,
        mut request: BatchRequest,
        cancel: watch::Receiver<bool>,
        status: watch::Sender<BatchRequest>,
    ) -> BatchRequest {
        let mut run = match self.registry.lock(&request.run_id).await {
            Ok(run) => run,
            Err(e) => return self.fail_early(request, e, &status).await,
        };
        if let Err(e) = Self::check_runnable(&run) {
            return self.fail_early(request, e, &status).await;
        }
        // Pages may have changed between queueing and taking the lock.
        request.total_units = run.pages.len() + usize::from(run.cover_needed());

        request.status = BatchStatus::Processing;
        request.started_at = Some(Utc::now());
        self.publish(&request, &status).await;
        info!(
            "Batch {} started for run {} ({} units)",
            request.id, request.run_id, request.total_units
        );

        let outcome = self.run_units(&mut run, &mut request, &cancel, &status).await;
        request.status = match outcome {
            Err(PipelineError::Cancelled) => BatchStatus::Cancelled,
            _ => BatchStatus::Completed,
        };
        if !request.failed_units.is_empty() {
            request.error_message = Some(format!(
                "{} unit(s) failed: {}",
                request.failed_units.len(),
                request.failed_units.join(", ")
            ));
        }
        request.finished_at = Some(Utc::now());
        self.handlers.drafts().save(&run).await;
        self.publish(&request, &status).await;
        info!(
            "Batch {} {:?}: {}/{} units",
            request.id, request.status, request.completed_units, request.total_units
        );
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PipelineConfig;
    use crate::core::state::{AssetRef, Cover, Illustration};
    use crate::services::testing::{
        fixture, fixture_on, fixture_with, run_with_pages, stalled_storage, FakeImageClient,
        Fixture,
    };
    use std::time::Duration;

    fn executor(fx: &Fixture) -> Arc<BatchExecutor> {
        Arc::new(BatchExecutor::new(
            fx.handlers.clone(),
            fx.registry.clone(),
            Arc::new(BatchStore::new(fx.storage.clone())),
        ))
    }

    fn illustrated() -> Illustration {
        Illustration {
            asset: AssetRef("assets/run-1/existing.png".into()),
            used_references: false,
            regenerated: false,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_full_batch_settles_into_review() {
        let fx = fixture();
        let run = run_with_pages("run-1", Phase::IllustrationGeneration, 3);
        let request = BatchRequest::new(&run);
        assert_eq!(request.total_units, 4);
        fx.registry.put(run).await;

        let handle = executor(&fx).spawn(request);
        let done = handle.wait().await;
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.completed_units, 4);
        assert!(done.error_message.is_none());

        let run = fx.registry.get("run-1").unwrap();
        assert_eq!(run.phase, Phase::AwaitingPageReview);
        assert_eq!(run.illustrated_count(), 3);
        assert!(!run.cover_needed());

        let stored = BatchStore::new(fx.storage.clone()).load(handle.id()).await.unwrap();
        assert_eq!(stored, done);
        let draft = fx.drafts.load("run-1").await.unwrap();
        assert_eq!(draft.run, run);
    }

    #[tokio::test]
    async fn test_cancel_after_three_units() {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let trigger = cancel_tx.clone();
        let image = FakeImageClient {
            on_call: Some(Box::new(move |calls| {
                if calls == 3 {
                    trigger.send_replace(true);
                }
            })),
            ..Default::default()
        };
        let fx = fixture_with(image, PipelineConfig::default());
        let run = run_with_pages("run-1", Phase::IllustrationGeneration, 5);
        let request = BatchRequest::new(&run);
        assert_eq!(request.total_units, 6);
        fx.registry.put(run).await;

        let (status_tx, status_rx) = watch::channel(request.clone());
        let done = executor(&fx).execute(request, cancel_rx, status_tx).await;

        assert_eq!(done.status, BatchStatus::Cancelled);
        assert_eq!(done.completed_units, 3);
        assert_eq!(fx.image.total_calls(), 3);
        assert_eq!(status_rx.borrow().status, BatchStatus::Cancelled);

        let run = fx.registry.get("run-1").unwrap();
        assert_eq!(run.illustrated_count(), 3);
        assert_eq!(run.phase, Phase::IllustrationGeneration);
        assert!(run.cover.is_none());
    }

    #[tokio::test]
    async fn test_rerun_skips_illustrated_pages() {
        let fx = fixture();
        let mut run = run_with_pages("run-1", Phase::AwaitingPageReview, 5);
        run.pages[0].illustration = Some(illustrated());
        run.pages[3].illustration = Some(illustrated());
        run.cover = Some(Cover {
            title: "t".into(),
            summary: "s".into(),
            image_description: "d".into(),
            characters_in_scene: vec![],
            illustration: Some(illustrated()),
            approved: false,
        });
        let request = BatchRequest::new(&run);
        assert_eq!(request.total_units, 5);
        fx.registry.put(run).await;

        let done = executor(&fx).spawn(request).wait().await;
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.completed_units, 5);
        assert_eq!(fx.image.total_calls(), 3);
        let prompts = fx.image.prompts.lock().unwrap().clone();
        assert!(prompts.iter().all(|p| !p.contains("scene #1.") && !p.contains("scene #4.")));

        // A second pass has nothing left to do.
        let run = fx.registry.get("run-1").unwrap();
        executor(&fx).spawn(BatchRequest::new(&run)).wait().await;
        assert_eq!(fx.image.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_unit_failure_does_not_abort_batch() {
        let image = FakeImageClient {
            fail_prompts_containing: Some("scene #2.".into()),
            ..Default::default()
        };
        let fx = fixture_with(image, PipelineConfig::default());
        let run = run_with_pages("run-1", Phase::IllustrationGeneration, 3);
        fx.registry.put(run.clone()).await;

        let done = executor(&fx).spawn(BatchRequest::new(&run)).wait().await;
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.completed_units, 3);
        assert_eq!(done.failed_units, vec!["page 2".to_string()]);
        assert!(done.error_message.unwrap().contains("page 2"));

        let run = fx.registry.get("run-1").unwrap();
        assert_eq!(run.status, RunStatus::AwaitingInput);
        assert!(!run.page(2).unwrap().is_illustrated());
        assert_eq!(run.phase, Phase::AwaitingPageReview);
    }

    #[tokio::test]
    async fn test_unknown_run_fails_before_any_unit() {
        let fx = fixture();
        let run = run_with_pages("ghost", Phase::IllustrationGeneration, 2);
        let done = executor(&fx).spawn(BatchRequest::new(&run)).wait().await;
        assert_eq!(done.status, BatchStatus::Failed);
        assert!(done.error_message.unwrap().contains("not found"));
        assert_eq!(fx.image.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_handle_cancel_before_start() {
        let fx = fixture();
        let run = run_with_pages("run-1", Phase::IllustrationGeneration, 2);
        fx.registry.put(run.clone()).await;

        // Hold the run so the batch cannot start before the cancel lands.
        let guard = fx.registry.lock("run-1").await.unwrap();
        let handle = executor(&fx).spawn(BatchRequest::new(&run));
        handle.cancel();
        drop(guard);

        let done = handle.wait().await;
        assert_eq!(done.status, BatchStatus::Cancelled);
        assert_eq!(done.completed_units, 0);
        assert_eq!(fx.image.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_total_units_follow_pages_at_start() {
        let fx = fixture();
        let queued = run_with_pages("run-1", Phase::IllustrationGeneration, 2);
        let request = BatchRequest::new(&queued);
        assert_eq!(request.total_units, 3);
        fx.registry
            .put(run_with_pages("run-1", Phase::IllustrationGeneration, 4))
            .await;

        let done = executor(&fx).spawn(request).wait().await;
        assert_eq!(done.total_units, 5);
        assert_eq!(done.completed_units, 5);
    }

    #[tokio::test]
    async fn test_stalled_storage_fails_units_and_releases_run() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture_on(
            dir,
            stalled_storage(),
            FakeImageClient::default(),
            PipelineConfig::default(),
        );
        let run = run_with_pages("run-1", Phase::IllustrationGeneration, 2);
        let request = BatchRequest::new(&run);
        fx.registry.put(run).await;

        let handle = executor(&fx).spawn(request);
        let done = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("batch stalled on storage");
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.completed_units, 0);
        assert_eq!(done.failed_units, vec!["page 1", "page 2", "cover"]);

        let run = tokio::time::timeout(Duration::from_secs(1), fx.registry.lock("run-1"))
            .await
            .expect("run lock still held")
            .unwrap();
        assert_eq!(run.illustrated_count(), 0);
    }
}
