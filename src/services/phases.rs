use crate::core::config::{AvatarMode, PipelineConfig};
use crate::core::error::{PipelineError, Result};
use crate::core::registry::RunGuard;
use crate::core::state::{
    ArtStyleDecision, AssetRef, AvatarAsset, Character, Cover, CharacterRole, Illustration, Page,
    Phase, PhaseResult, Run, VisualIdentity,
};
use crate::services::consistency::{render_consistency_tag, select_scene_characters};
use crate::services::drafts::DraftStore;
use crate::services::generation::GenerationAdapter;
use crate::services::image::ImageData;
use crate::services::llm::{generate_structured, LlmClient};
use crate::services::prompts::{self, CharactersReply, PagesReply, JSON_SYSTEM};
use crate::utils::text::{clamp_page_count, estimate_page_count};
use chrono::Utc;
use futures_util::StreamExt;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

/// What happened to one illustration unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Already illustrated; no upstream call was made.
    Skipped,
    Generated { used_references: bool },
}

/// One handler per pipeline step. Every handler works on a locked run and
/// saves a draft when its step completes.
///
/// Text and image faults move the run into the error state and are returned to
/// the caller. Validation, lookup and storage errors leave the run as it was.
pub struct PhaseHandlers {
    llm: Arc<dyn LlmClient>,
    generator: Arc<GenerationAdapter>,
    drafts: Arc<DraftStore>,
    pipeline: PipelineConfig,
    llm_timeout: Duration,
}

fn apply(run: &mut RunGuard, result: PhaseResult) -> Result<()> {
    let next = run.advance(result)?;
    run.set(next);
    Ok(())
}

fn begin(run: &mut RunGuard, phase: Phase) -> Result<()> {
    apply(run, PhaseResult::Begin(phase))
}

/// Avatars of the characters a scene is drawn with.
fn scene_references(characters: &[Character], names: &[String]) -> Vec<AssetRef> {
    select_scene_characters(characters, names)
        .into_iter()
        .filter_map(|c| c.avatar.as_ref().map(|a| a.asset.clone()))
        .collect()
}

fn character_from_reply(reply: prompts::CharacterReply) -> Character {
    let mut character = Character::new(reply.name.trim(), reply.role);
    character.description = reply.description;
    if let Some(identity) = reply.visual_identity.filter(|i| !i.is_empty()) {
        character.consistency_tag = Some(render_consistency_tag(&identity));
        character.visual_identity = Some(identity);
    }
    character
}

fn default_cover(run: &Run) -> Cover {
    let title = run.title.clone().unwrap_or_else(|| "Untitled".to_string());
    let summary = run.summary.clone().unwrap_or_default();
    let image_description = if summary.is_empty() {
        run.pages
            .first()
            .map(|p| p.image_description.clone())
            .unwrap_or_default()
    } else {
        summary.clone()
    };
    Cover {
        title,
        summary,
        image_description,
        characters_in_scene: run
            .characters
            .iter()
            .filter(|c| c.role == CharacterRole::Main)
            .map(|c| c.name.clone())
            .collect(),
        illustration: None,
        approved: false,
    }
}

impl PhaseHandlers {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        generator: Arc<GenerationAdapter>,
        drafts: Arc<DraftStore>,
        pipeline: PipelineConfig,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            generator,
            drafts,
            pipeline,
            llm_timeout,
        }
    }

    pub fn pipeline_config(&self) -> &PipelineConfig {
        &self.pipeline
    }

    pub fn drafts(&self) -> &Arc<DraftStore> {
        &self.drafts
    }

    async fn checkpoint(&self, run: &RunGuard) {
        self.drafts.save(run).await;
    }

    /// Records a fault on the run and hands the error back. The draft is left at
    /// the last good state so it can be resumed.
    fn settle<T>(&self, run: &mut RunGuard, outcome: Result<T>) -> Result<T> {
        if let Err(e) = &outcome {
            if e.is_upstream() {
                error!("Run {} failed during {}: {}", run.id, run.phase, e);
                match run.advance(PhaseResult::Failed(e.to_string())) {
                    Ok(failed) => run.set(failed),
                    Err(already) => warn!("Run {} not marked failed: {}", run.id, already),
                }
            }
        }
        outcome
    }

    pub async fn select_art_style(&self, run: &mut RunGuard) -> Result<()> {
        let outcome = self.art_style(run).await;
        self.settle(run, outcome)
    }

    async fn art_style(&self, run: &mut RunGuard) -> Result<()> {
        begin(run, Phase::ArtStyleSelection)?;
        let decision: ArtStyleDecision = generate_structured(
            self.llm.as_ref(),
            JSON_SYSTEM,
            &prompts::art_style_prompt(&run.story),
            self.llm_timeout,
        )
        .await?;
        if decision.style.trim().is_empty() {
            return Err(PipelineError::upstream("text", "empty art style"));
        }
        info!("Run {}: art style {}", run.id, decision.style);
        apply(run, PhaseResult::ArtStyleSelected(decision))?;
        self.checkpoint(run).await;
        Ok(())
    }

    pub async fn extract_characters(&self, run: &mut RunGuard) -> Result<()> {
        let outcome = self.characters(run).await;
        self.settle(run, outcome)
    }

    async fn characters(&self, run: &mut RunGuard) -> Result<()> {
        begin(run, Phase::CharacterExtraction)?;
        let reply: CharactersReply = generate_structured(
            self.llm.as_ref(),
            JSON_SYSTEM,
            &prompts::characters_prompt(&run.story, &run.characters),
            self.llm_timeout,
        )
        .await?;

        let characters: Vec<Character> = reply
            .characters
            .into_iter()
            .filter(|c| !c.name.trim().is_empty())
            .map(character_from_reply)
            .collect();
        info!("Run {}: {} characters", run.id, characters.len());

        apply(
            run,
            PhaseResult::CharactersExtracted {
                characters,
                await_avatars: self.pipeline.avatar_mode == AvatarMode::UserProvided,
            },
        )?;
        self.checkpoint(run).await;
        Ok(())
    }

    /// Generates avatars for every character that has none, a few at a time.
    /// A character whose avatar fails is logged and left without one; later
    /// images then fall back to prompt-only generation for it.
    pub async fn generate_avatars(&self, run: &mut RunGuard) -> Result<()> {
        let outcome = self.avatars(run).await;
        self.settle(run, outcome)
    }

    async fn avatars(&self, run: &mut RunGuard) -> Result<()> {
        begin(run, Phase::AvatarGeneration)?;

        let jobs: Vec<(String, String)> = run
            .characters
            .iter()
            .filter(|c| c.avatar.is_none())
            .map(|c| (c.name.clone(), prompts::avatar_prompt(c, run.art_style.as_ref())))
            .collect();
        let run_id = run.id.clone();
        let generator = &self.generator;

        let mut results = futures_util::stream::iter(jobs)
            .map(|(name, prompt)| {
                let run_id = run_id.clone();
                async move {
                    let result = generator.generate(&run_id, &prompt, &[]).await;
                    (name, result)
                }
            })
            .buffer_unordered(self.pipeline.avatar_concurrency.max(1));

        let mut failures = 0usize;
        while let Some((name, result)) = results.next().await {
            match result {
                Ok(image) => apply(
                    run,
                    PhaseResult::AvatarReady {
                        name,
                        avatar: AvatarAsset {
                            asset: image.asset,
                            generated: true,
                            customized: false,
                            has_reference_image: false,
                        },
                    },
                )?,
                Err(e) => {
                    warn!("Run {}: avatar for {} failed: {}", run_id, name, e);
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            warn!("Run {}: {} avatars missing", run_id, failures);
        }

        apply(run, PhaseResult::AvatarsSettled)?;
        self.checkpoint(run).await;
        Ok(())
    }

    /// Stores an operator-supplied avatar for one character.
    pub async fn submit_avatar(
        &self,
        run: &mut RunGuard,
        name: &str,
        image: ImageData,
    ) -> Result<()> {
        let outcome = self.store_avatar(run, name, image).await;
        self.settle(run, outcome)
    }

    async fn store_avatar(&self, run: &mut RunGuard, name: &str, image: ImageData) -> Result<()> {
        if run.character(name).is_none() {
            return Err(PipelineError::not_found("character", name));
        }
        if image.bytes.is_empty() {
            return Err(PipelineError::validation("avatar image is empty"));
        }
        // Reject before storing anything if the phase does not accept avatars.
        let pending = AvatarAsset {
            asset: AssetRef(String::new()),
            generated: false,
            customized: true,
            has_reference_image: true,
        };
        run.advance(PhaseResult::AvatarReady {
            name: name.to_string(),
            avatar: pending.clone(),
        })?;

        let asset = self.generator.store(&run.id, &image).await?;
        apply(
            run,
            PhaseResult::AvatarReady {
                name: name.to_string(),
                avatar: AvatarAsset { asset, ..pending },
            },
        )?;
        self.checkpoint(run).await;
        Ok(())
    }

    /// Accepts the cast as it stands and moves on to page generation.
    pub async fn approve_avatars(&self, run: &mut RunGuard) -> Result<()> {
        begin(run, Phase::PageGeneration)?;
        self.checkpoint(run).await;
        Ok(())
    }

    pub async fn generate_pages(&self, run: &mut RunGuard) -> Result<()> {
        let outcome = self.pages(run).await;
        self.settle(run, outcome)
    }

    async fn pages(&self, run: &mut RunGuard) -> Result<()> {
        begin(run, Phase::PageGeneration)?;
        let page_count = match run.target_page_count {
            Some(n) => clamp_page_count(n, &self.pipeline),
            None => estimate_page_count(&run.story, &self.pipeline),
        };

        let reply: PagesReply = generate_structured(
            self.llm.as_ref(),
            JSON_SYSTEM,
            &prompts::pages_prompt(&run.story, page_count, run.art_style.as_ref(), &run.characters),
            self.llm_timeout,
        )
        .await?;
        if reply.pages.is_empty() {
            return Err(PipelineError::upstream("text", "page breakdown contained no pages"));
        }
        if reply.pages.len() != page_count {
            warn!(
                "Run {}: asked for {} pages, got {}",
                run.id,
                page_count,
                reply.pages.len()
            );
        }

        let pages: Vec<Page> = reply.pages.into_iter().map(Page::from).collect();
        apply(
            run,
            PhaseResult::PagesGenerated {
                title: reply.title,
                summary: reply.summary,
                pages,
            },
        )?;
        self.checkpoint(run).await;
        Ok(())
    }

    pub async fn approve_prompts(&self, run: &mut RunGuard) -> Result<()> {
        apply(run, PhaseResult::PromptsApproved)?;
        self.checkpoint(run).await;
        Ok(())
    }

    /// Makes sure one page has an illustration. Shared by the interactive path and
    /// the batch executor: an illustrated page is skipped without an upstream call
    /// unless `force` is set. Errors are returned as-is; callers decide how fatal
    /// they are.
    pub async fn ensure_illustrated(
        &self,
        run: &mut RunGuard,
        page_number: usize,
        force: bool,
    ) -> Result<UnitOutcome> {
        let page = run
            .page(page_number)
            .ok_or_else(|| PipelineError::not_found("page", page_number.to_string()))?;
        if page.is_illustrated() && !force {
            return Ok(UnitOutcome::Skipped);
        }

        let prompt = prompts::page_prompt(
            page,
            &run.characters,
            run.art_style.as_ref(),
            self.pipeline.scene_description_limit,
        );
        let references = scene_references(&run.characters, &page.characters_in_scene);
        let image = self.generator.generate(&run.id, &prompt, &references).await?;

        apply(
            run,
            PhaseResult::IllustrationReady {
                page_number,
                illustration: Illustration {
                    asset: image.asset,
                    used_references: image.used_references,
                    regenerated: force,
                    generated_at: Utc::now(),
                },
            },
        )?;
        self.checkpoint(run).await;
        Ok(UnitOutcome::Generated {
            used_references: image.used_references,
        })
    }

    /// Cover counterpart of [`PhaseHandlers::ensure_illustrated`].
    pub async fn ensure_cover(&self, run: &mut RunGuard, force: bool) -> Result<UnitOutcome> {
        if !run.cover_needed() && !force {
            return Ok(UnitOutcome::Skipped);
        }
        let cover = run.cover.clone().unwrap_or_else(|| default_cover(run));
        let prompt = prompts::cover_prompt(
            &cover,
            &run.characters,
            run.art_style.as_ref(),
            self.pipeline.scene_description_limit,
        );
        let references = scene_references(&run.characters, &cover.characters_in_scene);
        let image = self.generator.generate(&run.id, &prompt, &references).await?;

        let regenerated = cover.illustration.is_some();
        apply(
            run,
            PhaseResult::CoverReady(Cover {
                illustration: Some(Illustration {
                    asset: image.asset,
                    used_references: image.used_references,
                    regenerated,
                    generated_at: Utc::now(),
                }),
                approved: false,
                ..cover
            }),
        )?;
        self.checkpoint(run).await;
        Ok(UnitOutcome::Generated {
            used_references: image.used_references,
        })
    }

    /// Interactive, all-at-once illustration of every page. The first failure
    /// stops the step; the batch executor is the forgiving alternative.
    pub async fn generate_illustrations(&self, run: &mut RunGuard) -> Result<()> {
        let outcome = self.illustrations(run).await;
        self.settle(run, outcome)
    }

    async fn illustrations(&self, run: &mut RunGuard) -> Result<()> {
        begin(run, Phase::IllustrationGeneration)?;
        let numbers: Vec<usize> = run.pages.iter().map(|p| p.page_number).collect();
        for page_number in numbers {
            self.ensure_illustrated(run, page_number, false).await?;
        }
        let cover_needed = run.cover_needed();
        apply(run, PhaseResult::IllustrationsSettled { cover_needed })?;
        self.checkpoint(run).await;
        Ok(())
    }

    pub async fn generate_cover(&self, run: &mut RunGuard) -> Result<()> {
        let outcome = self.cover(run).await;
        self.settle(run, outcome)
    }

    async fn cover(&self, run: &mut RunGuard) -> Result<()> {
        if run.phase != Phase::CoverGeneration {
            return Err(PipelineError::validation(format!(
                "cover generation not accepted during {}",
                run.phase
            )));
        }
        if self.ensure_cover(run, false).await? == UnitOutcome::Skipped {
            if let Some(cover) = run.cover.clone() {
                apply(run, PhaseResult::CoverReady(cover))?;
                self.checkpoint(run).await;
            }
        }
        Ok(())
    }

    pub async fn edit_page(
        &self,
        run: &mut RunGuard,
        page_number: usize,
        text: String,
    ) -> Result<()> {
        apply(
            run,
            PhaseResult::PageEdited {
                page_number,
                text: Some(text),
                image_description: None,
            },
        )?;
        self.checkpoint(run).await;
        Ok(())
    }

    /// Replaces the scene description the illustration is drawn from.
    pub async fn edit_image_description(
        &self,
        run: &mut RunGuard,
        page_number: usize,
        description: String,
    ) -> Result<()> {
        if description.trim().is_empty() {
            return Err(PipelineError::validation("image description is empty"));
        }
        apply(
            run,
            PhaseResult::PageEdited {
                page_number,
                text: None,
                image_description: Some(description),
            },
        )?;
        self.checkpoint(run).await;
        Ok(())
    }

    /// Inserts a page so that it becomes page `position + 1`.
    pub async fn add_page(
        &self,
        run: &mut RunGuard,
        position: usize,
        text: String,
        image_description: String,
    ) -> Result<()> {
        let mut page = Page::new(text, image_description);
        page.characters_in_scene = run
            .characters
            .iter()
            .filter(|c| c.role == CharacterRole::Main)
            .map(|c| c.name.clone())
            .collect();
        apply(run, PhaseResult::PageAdded { position, page })?;
        self.checkpoint(run).await;
        Ok(())
    }

    pub async fn delete_page(&self, run: &mut RunGuard, page_number: usize) -> Result<()> {
        apply(run, PhaseResult::PageDeleted(page_number))?;
        self.checkpoint(run).await;
        Ok(())
    }

    pub async fn approve_page(&self, run: &mut RunGuard, page_number: usize) -> Result<()> {
        apply(run, PhaseResult::PageApproved(page_number))?;
        self.checkpoint(run).await;
        Ok(())
    }

    pub async fn approve_all_pages(&self, run: &mut RunGuard) -> Result<()> {
        apply(run, PhaseResult::AllPagesApproved)?;
        self.checkpoint(run).await;
        Ok(())
    }

    /// Draws a fresh illustration for one page during review.
    pub async fn regenerate_page(
        &self,
        run: &mut RunGuard,
        page_number: usize,
    ) -> Result<UnitOutcome> {
        if run.phase != Phase::AwaitingPageReview {
            return Err(PipelineError::validation(format!(
                "pages can only be regenerated during review, not {}",
                run.phase
            )));
        }
        let outcome = self.ensure_illustrated(run, page_number, true).await;
        self.settle(run, outcome)
    }

    pub async fn regenerate_cover(&self, run: &mut RunGuard) -> Result<UnitOutcome> {
        if run.phase != Phase::AwaitingPageReview {
            return Err(PipelineError::validation(format!(
                "the cover can only be regenerated during review, not {}",
                run.phase
            )));
        }
        let outcome = self.ensure_cover(run, true).await;
        self.settle(run, outcome)
    }

    /// Reopens a completed book, or restarts review, with every approval cleared.
    pub async fn edit_saved_story(&self, run: &mut RunGuard) -> Result<()> {
        apply(run, PhaseResult::SavedStoryReopened)?;
        self.checkpoint(run).await;
        Ok(())
    }

    /// Discards the pages and breaks the story down again into `count` pages.
    pub async fn regenerate_with_page_count(&self, run: &mut RunGuard, count: usize) -> Result<()> {
        let count = clamp_page_count(count, &self.pipeline);
        apply(run, PhaseResult::PageCountChanged(count))?;
        self.checkpoint(run).await;
        self.generate_pages(run).await
    }

    /// The one way to change a character's look once it is set.
    pub async fn refine_character(
        &self,
        run: &mut RunGuard,
        name: &str,
        identity: VisualIdentity,
    ) -> Result<()> {
        if identity.is_empty() {
            return Err(PipelineError::validation("refined identity has no attributes"));
        }
        let consistency_tag = render_consistency_tag(&identity);
        apply(
            run,
            PhaseResult::CharacterRefined {
                name: name.to_string(),
                identity,
                consistency_tag,
            },
        )?;
        self.checkpoint(run).await;
        Ok(())
    }

    pub async fn finish_review(&self, run: &mut RunGuard) -> Result<()> {
        apply(run, PhaseResult::Completed)
    }
}
