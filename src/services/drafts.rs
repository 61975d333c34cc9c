use crate::core::error::{PipelineError, Result};
use crate::core::io::Storage;
use crate::core::state::{Phase, Run, RunId, RunStatus};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Step shown to the operator for a phase. Derived, never stored independently.
pub fn current_step(phase: Phase) -> u8 {
    match phase {
        Phase::StoryInput => 0,
        Phase::ArtStyleSelection | Phase::CharacterExtraction => 1,
        Phase::AwaitingAvatarInput | Phase::AvatarGeneration | Phase::AwaitingApproval => 2,
        Phase::PageGeneration
        | Phase::AwaitingPromptReview
        | Phase::IllustrationGeneration
        | Phase::CoverGeneration
        | Phase::AwaitingPageReview
        | Phase::Complete => 3,
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Draft {
    pub run_id: RunId,
    #[serde(default)]
    pub owner: Option<String>,
    pub current_step: u8,
    pub saved_at: DateTime<Utc>,
    pub run: Run,
}

impl Draft {
    pub fn of(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            owner: run.owner.clone(),
            current_step: current_step(run.phase),
            saved_at: Utc::now(),
            run: run.clone(),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DraftSummary {
    pub run_id: RunId,
    pub owner: Option<String>,
    pub title: Option<String>,
    pub phase: Phase,
    pub status: RunStatus,
    pub current_step: u8,
    pub saved_at: DateTime<Utc>,
}

impl From<&Draft> for DraftSummary {
    fn from(draft: &Draft) -> Self {
        Self {
            run_id: draft.run_id.clone(),
            owner: draft.owner.clone(),
            title: draft.run.title.clone(),
            phase: draft.run.phase,
            status: draft.run.status,
            current_step: draft.current_step,
            saved_at: draft.saved_at,
        }
    }
}

fn draft_path(run_id: &str) -> String {
    format!("drafts/{}.json", run_id)
}

/// Best-effort snapshots of in-progress runs under `drafts/`.
pub struct DraftStore {
    storage: Arc<dyn Storage>,
}

impl DraftStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Upserts the draft for `run`. A failed save is logged and reported as
    /// `false`; it never fails the operation that triggered it.
    pub async fn save(&self, run: &Run) -> bool {
        match self.try_save(run).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Draft save for run {} failed: {}", run.id, e);
                false
            }
        }
    }

    async fn try_save(&self, run: &Run) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(&Draft::of(run)).map_err(PipelineError::persistence)?;
        self.storage
            .write(&draft_path(&run.id), &content)
            .await
            .map_err(PipelineError::persistence)
    }

    /// Loads a draft. `current_step` is recomputed from the stored phase.
    pub async fn load(&self, run_id: &str) -> Result<Draft> {
        let path = draft_path(run_id);
        if !self.storage.exists(&path).await.map_err(PipelineError::persistence)? {
            return Err(PipelineError::not_found("draft", run_id));
        }
        let bytes = self.storage.read(&path).await.map_err(PipelineError::persistence)?;
        let mut draft: Draft = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::persistence(format!("corrupt draft {}: {}", path, e)))?;
        draft.current_step = current_step(draft.run.phase);
        Ok(draft)
    }

    pub async fn delete(&self, run_id: &str) {
        if let Err(e) = self.storage.delete(&draft_path(run_id)).await {
            warn!("Draft delete for run {} failed: {:#}", run_id, e);
        }
    }

    /// Summaries of the drafts belonging to `owner`, or every draft when `owner` is `None`.
    /// Newest first. Unreadable drafts are skipped.
    pub async fn list_by_owner(&self, owner: Option<&str>) -> Result<Vec<DraftSummary>> {
        let entries = self
            .storage
            .list("drafts")
            .await
            .map_err(PipelineError::persistence)?;

        let mut summaries = Vec::new();
        for path in entries.iter().filter(|p| p.ends_with(".json")) {
            let draft: Draft = match self.storage.read(path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("Skipping unreadable draft {}: {}", path, e);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("Skipping unreadable draft {}: {:#}", path, e);
                    continue;
                }
            };
            if owner.is_none() || draft.owner.as_deref() == owner {
                let mut summary = DraftSummary::from(&draft);
                summary.current_step = current_step(draft.run.phase);
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(summaries)
    }
}

/// Completed books. Each revision of a run is written once and never overwritten.
pub struct BookStore {
    storage: Arc<dyn Storage>,
}

fn book_path(run_id: &str, revision: u32) -> String {
    format!("books/{}/v{}.json", run_id, revision)
}

impl BookStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Writes the completed run. Publishing the same revision twice is rejected.
    pub async fn publish(&self, run: &Run) -> Result<String> {
        if run.phase != Phase::Complete {
            return Err(PipelineError::validation(format!(
                "run {} is not complete (phase {})",
                run.id, run.phase
            )));
        }
        let path = book_path(&run.id, run.revision);
        if self.storage.exists(&path).await.map_err(PipelineError::persistence)? {
            return Err(PipelineError::validation(format!(
                "run {} revision {} is already published",
                run.id, run.revision
            )));
        }
        let content = serde_json::to_vec_pretty(run).map_err(PipelineError::persistence)?;
        self.storage
            .write(&path, &content)
            .await
            .map_err(PipelineError::persistence)?;
        info!("Published {}", path);
        Ok(path)
    }

    pub async fn revisions(&self, run_id: &str) -> Result<Vec<u32>> {
        let entries = self
            .storage
            .list(&format!("books/{}", run_id))
            .await
            .map_err(PipelineError::persistence)?;
        let mut revisions: Vec<u32> = entries
            .iter()
            .filter_map(|p| p.rsplit('/').next())
            .filter_map(|name| name.strip_prefix('v')?.strip_suffix(".json")?.parse().ok())
            .collect();
        revisions.sort_unstable();
        Ok(revisions)
    }

    /// Latest published revision of a book.
    pub async fn load(&self, run_id: &str) -> Result<Run> {
        let latest = self
            .revisions(run_id)
            .await?
            .pop()
            .ok_or_else(|| PipelineError::not_found("book", run_id))?;
        let bytes = self
            .storage
            .read(&book_path(run_id, latest))
            .await
            .map_err(PipelineError::persistence)?;
        serde_json::from_slice(&bytes).map_err(PipelineError::persistence)
    }
}
