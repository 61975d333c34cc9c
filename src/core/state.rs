use crate::core::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type RunId = String;

/// Opaque location returned by the asset store. Stored and echoed, never parsed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct AssetRef(pub String);

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    StoryInput,
    ArtStyleSelection,
    CharacterExtraction,
    AwaitingAvatarInput,
    AvatarGeneration,
    AwaitingApproval,
    PageGeneration,
    AwaitingPromptReview,
    IllustrationGeneration,
    CoverGeneration,
    AwaitingPageReview,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::StoryInput => "story_input",
            Phase::ArtStyleSelection => "art_style_selection",
            Phase::CharacterExtraction => "character_extraction",
            Phase::AwaitingAvatarInput => "awaiting_avatar_input",
            Phase::AvatarGeneration => "avatar_generation",
            Phase::AwaitingApproval => "awaiting_approval",
            Phase::PageGeneration => "page_generation",
            Phase::AwaitingPromptReview => "awaiting_prompt_review",
            Phase::IllustrationGeneration => "illustration_generation",
            Phase::CoverGeneration => "cover_generation",
            Phase::AwaitingPageReview => "awaiting_page_review",
            Phase::Complete => "complete",
        }
    }

    /// Phases reachable by a normal forward step. Both avatar paths
    /// (generate-then-approve, operator-supplied) meet at `PageGeneration`.
    pub fn successors(&self) -> &'static [Phase] {
        match self {
            Phase::StoryInput => &[Phase::ArtStyleSelection],
            Phase::ArtStyleSelection => &[Phase::CharacterExtraction],
            Phase::CharacterExtraction => &[Phase::AwaitingAvatarInput, Phase::AvatarGeneration],
            Phase::AwaitingAvatarInput => &[Phase::AvatarGeneration, Phase::PageGeneration],
            Phase::AvatarGeneration => &[Phase::AwaitingApproval],
            Phase::AwaitingApproval => &[Phase::PageGeneration],
            Phase::PageGeneration => &[Phase::AwaitingPromptReview],
            Phase::AwaitingPromptReview => &[Phase::IllustrationGeneration],
            Phase::IllustrationGeneration => &[Phase::CoverGeneration, Phase::AwaitingPageReview],
            Phase::CoverGeneration => &[Phase::AwaitingPageReview],
            Phase::AwaitingPageReview => &[Phase::Complete],
            Phase::Complete => &[],
        }
    }

    pub fn can_advance_to(&self, next: Phase) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_awaiting_input(&self) -> bool {
        matches!(
            self,
            Phase::StoryInput
                | Phase::AwaitingAvatarInput
                | Phase::AwaitingApproval
                | Phase::AwaitingPromptReview
                | Phase::AwaitingPageReview
        )
    }

    /// Status a run settles into once work in this phase is done.
    pub fn resting_status(&self) -> RunStatus {
        match self {
            Phase::Complete => RunStatus::Complete,
            p if p.is_awaiting_input() => RunStatus::AwaitingInput,
            _ => RunStatus::Running,
        }
    }

    fn at_or_after_pages(&self) -> bool {
        matches!(
            self,
            Phase::PageGeneration
                | Phase::AwaitingPromptReview
                | Phase::IllustrationGeneration
                | Phase::CoverGeneration
                | Phase::AwaitingPageReview
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    AwaitingInput,
    Error,
    Complete,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ArtStyleDecision {
    pub style: String,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CharacterRole {
    Main,
    #[default]
    Supporting,
    Minor,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Coloring {
    #[serde(default)]
    pub hair: Option<String>,
    #[serde(default)]
    pub skin: Option<String>,
    #[serde(default)]
    pub eyes: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Outfit {
    #[serde(default)]
    pub top: Option<String>,
    #[serde(default)]
    pub bottom: Option<String>,
    #[serde(default)]
    pub accessories: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct VisualIdentity {
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub age_appearance: Option<String>,
    #[serde(default)]
    pub coloring: Coloring,
    #[serde(default)]
    pub outfit: Outfit,
    #[serde(default)]
    pub distinguishing_features: Vec<String>,
}

impl VisualIdentity {
    pub fn is_empty(&self) -> bool {
        *self == VisualIdentity::default()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AvatarAsset {
    pub asset: AssetRef,
    pub generated: bool,
    pub customized: bool,
    pub has_reference_image: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Character {
    pub name: String,
    pub role: CharacterRole,
    /// Raw text the extraction step returned for this character.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub visual_identity: Option<VisualIdentity>,
    #[serde(default)]
    pub consistency_tag: Option<String>,
    #[serde(default)]
    pub avatar: Option<AvatarAsset>,
}

impl Character {
    pub fn new(name: impl Into<String>, role: CharacterRole) -> Self {
        Self {
            name: name.into(),
            role,
            description: String::new(),
            visual_identity: None,
            consistency_tag: None,
            avatar: None,
        }
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.trim().to_lowercase() == name.trim().to_lowercase()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Illustration {
    pub asset: AssetRef,
    pub used_references: bool,
    #[serde(default)]
    pub regenerated: bool,
    pub generated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub page_number: usize,
    pub text: String,
    pub image_description: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub characters_in_scene: Vec<String>,
    #[serde(default)]
    pub illustration: Option<Illustration>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub has_custom_description: bool,
}

impl Page {
    pub fn new(text: impl Into<String>, image_description: impl Into<String>) -> Self {
        Self {
            page_number: 0,
            text: text.into(),
            image_description: image_description.into(),
            action: None,
            emotion: None,
            characters_in_scene: Vec::new(),
            illustration: None,
            approved: false,
            has_custom_description: false,
        }
    }

    pub fn is_illustrated(&self) -> bool {
        self.illustration.is_some()
    }

    fn reset_illustration(&mut self) {
        self.illustration = None;
        self.approved = false;
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Cover {
    pub title: String,
    pub summary: String,
    pub image_description: String,
    #[serde(default)]
    pub characters_in_scene: Vec<String>,
    #[serde(default)]
    pub illustration: Option<Illustration>,
    #[serde(default)]
    pub approved: bool,
}

/// One generation session. Mutated only through [`Run::advance`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Run {
    pub id: RunId,
    #[serde(default)]
    pub owner: Option<String>,
    pub phase: Phase,
    pub status: RunStatus,
    pub progress: u8,
    pub story: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub art_style: Option<ArtStyleDecision>,
    /// Page count requested by the operator; `None` means estimate from the story.
    #[serde(default)]
    pub target_page_count: Option<usize>,
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub cover: Option<Cover>,
    #[serde(default)]
    pub error: Option<String>,
    /// Bumped each time a completed book is reopened for editing.
    #[serde(default)]
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one unit of pipeline work, applied with [`Run::advance`].
#[derive(Clone, Debug)]
pub enum PhaseResult {
    Begin(Phase),
    Progress(u8),
    ArtStyleSelected(ArtStyleDecision),
    CharactersExtracted { characters: Vec<Character>, await_avatars: bool },
    AvatarReady { name: String, avatar: AvatarAsset },
    AvatarsSettled,
    PagesGenerated { title: Option<String>, summary: Option<String>, pages: Vec<Page> },
    PromptsApproved,
    IllustrationReady { page_number: usize, illustration: Illustration },
    IllustrationsSettled { cover_needed: bool },
    CoverReady(Cover),
    PageEdited { page_number: usize, text: Option<String>, image_description: Option<String> },
    PageAdded { position: usize, page: Page },
    PageDeleted(usize),
    PageApproved(usize),
    AllPagesApproved,
    CharacterRefined { name: String, identity: VisualIdentity, consistency_tag: String },
    SavedStoryReopened,
    PageCountChanged(usize),
    Completed,
    Failed(String),
}

impl PhaseResult {
    fn label(&self) -> &'static str {
        match self {
            PhaseResult::Begin(_) => "begin",
            PhaseResult::Progress(_) => "progress",
            PhaseResult::ArtStyleSelected(_) => "art style",
            PhaseResult::CharactersExtracted { .. } => "characters",
            PhaseResult::AvatarReady { .. } => "avatar",
            PhaseResult::AvatarsSettled => "avatars settled",
            PhaseResult::PagesGenerated { .. } => "pages",
            PhaseResult::PromptsApproved => "prompt approval",
            PhaseResult::IllustrationReady { .. } => "illustration",
            PhaseResult::IllustrationsSettled { .. } => "illustrations settled",
            PhaseResult::CoverReady(_) => "cover",
            PhaseResult::PageEdited { .. } => "page edit",
            PhaseResult::PageAdded { .. } => "page add",
            PhaseResult::PageDeleted(_) => "page delete",
            PhaseResult::PageApproved(_) => "page approval",
            PhaseResult::AllPagesApproved => "approve all",
            PhaseResult::CharacterRefined { .. } => "character refine",
            PhaseResult::SavedStoryReopened => "reopen",
            PhaseResult::PageCountChanged(_) => "page count",
            PhaseResult::Completed => "complete",
            PhaseResult::Failed(_) => "failure",
        }
    }
}

impl Run {
    pub fn new(id: impl Into<RunId>, story: impl Into<String>, owner: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner,
            phase: Phase::StoryInput,
            status: RunStatus::AwaitingInput,
            progress: 0,
            story: story.into(),
            title: None,
            summary: None,
            art_style: None,
            target_page_count: None,
            characters: Vec::new(),
            pages: Vec::new(),
            cover: None,
            error: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn character(&self, name: &str) -> Option<&Character> {
        self.characters.iter().find(|c| c.matches_name(name))
    }

    pub fn page(&self, page_number: usize) -> Option<&Page> {
        self.pages.iter().find(|p| p.page_number == page_number)
    }

    pub fn cover_needed(&self) -> bool {
        self.cover.as_ref().map_or(true, |c| c.illustration.is_none())
    }

    pub fn illustrated_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_illustrated()).count()
    }

    /// Applies a phase result and returns the new run value. `self` is left untouched,
    /// so a rejected result leaves the caller's run exactly as it was.
    pub fn advance(&self, result: PhaseResult) -> Result<Run> {
        if self.status == RunStatus::Error {
            return Err(PipelineError::validation(format!(
                "run {} is in error state; resume its draft to continue",
                self.id
            )));
        }

        let mut next = self.clone();
        let label = result.label();
        let is_begin = matches!(result, PhaseResult::Begin(_));

        match result {
            PhaseResult::Begin(phase) => {
                if phase != self.phase {
                    self.require_transition(phase)?;
                    next.phase = phase;
                    next.progress = 0;
                }
                next.status = if phase.is_awaiting_input() {
                    RunStatus::AwaitingInput
                } else {
                    RunStatus::Running
                };
            }
            PhaseResult::Progress(p) => {
                next.progress = next.progress.max(p.min(100));
            }
            PhaseResult::ArtStyleSelected(decision) => {
                self.require_phase(label, &[Phase::ArtStyleSelection])?;
                next.art_style = Some(decision);
                next.progress = 100;
            }
            PhaseResult::CharactersExtracted {
                characters,
                await_avatars,
            } => {
                self.require_phase(label, &[Phase::CharacterExtraction])?;
                next.characters = merge_characters(&self.characters, characters)?;
                next.progress = 100;
                if await_avatars {
                    next.phase = Phase::AwaitingAvatarInput;
                }
            }
            PhaseResult::AvatarReady { name, avatar } => {
                self.require_phase(
                    label,
                    &[
                        Phase::AwaitingAvatarInput,
                        Phase::AvatarGeneration,
                        Phase::AwaitingApproval,
                    ],
                )?;
                let slot = next
                    .characters
                    .iter_mut()
                    .find(|c| c.matches_name(&name))
                    .ok_or_else(|| PipelineError::not_found("character", name.clone()))?;
                *slot = apply_avatar_result(slot, avatar);
                if next.phase == Phase::AvatarGeneration && !next.characters.is_empty() {
                    let done = next.characters.iter().filter(|c| c.avatar.is_some()).count();
                    next.progress = next
                        .progress
                        .max((done * 100 / next.characters.len()) as u8);
                }
            }
            PhaseResult::AvatarsSettled => {
                self.require_phase(label, &[Phase::AvatarGeneration])?;
                next.phase = Phase::AwaitingApproval;
                next.progress = 100;
            }
            PhaseResult::PagesGenerated {
                title,
                summary,
                pages,
            } => {
                self.require_phase(label, &[Phase::PageGeneration])?;
                if pages.is_empty() {
                    return Err(PipelineError::validation("page generation produced no pages"));
                }
                next.pages = renumber_pages(pages);
                if title.is_some() {
                    next.title = title;
                }
                if summary.is_some() {
                    next.summary = summary;
                }
                next.phase = Phase::AwaitingPromptReview;
                next.progress = 100;
            }
            PhaseResult::PromptsApproved => {
                self.require_phase(label, &[Phase::AwaitingPromptReview])?;
                next.phase = Phase::IllustrationGeneration;
                next.progress = 0;
            }
            PhaseResult::IllustrationReady {
                page_number,
                illustration,
            } => {
                self.require_phase(
                    label,
                    &[
                        Phase::IllustrationGeneration,
                        Phase::CoverGeneration,
                        Phase::AwaitingPageReview,
                    ],
                )?;
                let page = next
                    .pages
                    .iter_mut()
                    .find(|p| p.page_number == page_number)
                    .ok_or_else(|| PipelineError::not_found("page", page_number.to_string()))?;
                *page = apply_illustration(page, illustration);
                if next.phase == Phase::IllustrationGeneration {
                    let pct = next.illustrated_count() * 100 / next.pages.len();
                    next.progress = next.progress.max(pct as u8);
                }
            }
            PhaseResult::IllustrationsSettled { cover_needed } => {
                self.require_phase(label, &[Phase::IllustrationGeneration])?;
                next.phase = if cover_needed {
                    Phase::CoverGeneration
                } else {
                    Phase::AwaitingPageReview
                };
                next.progress = if cover_needed { 0 } else { 100 };
            }
            PhaseResult::CoverReady(cover) => {
                self.require_phase(
                    label,
                    &[
                        Phase::IllustrationGeneration,
                        Phase::CoverGeneration,
                        Phase::AwaitingPageReview,
                    ],
                )?;
                next.cover = Some(cover);
                if next.phase == Phase::CoverGeneration {
                    next.phase = Phase::AwaitingPageReview;
                    next.progress = 100;
                }
            }
            PhaseResult::PageEdited {
                page_number,
                text,
                image_description,
            } => {
                self.require_page_editing(label)?;
                let page = next
                    .pages
                    .iter_mut()
                    .find(|p| p.page_number == page_number)
                    .ok_or_else(|| PipelineError::not_found("page", page_number.to_string()))?;
                if let Some(text) = text {
                    page.text = text;
                }
                if let Some(desc) = image_description {
                    page.image_description = desc;
                    page.has_custom_description = true;
                }
                page.reset_illustration();
            }
            PhaseResult::PageAdded { position, page } => {
                self.require_page_editing(label)?;
                if position > next.pages.len() {
                    return Err(PipelineError::validation(format!(
                        "cannot insert page at position {} of {}",
                        position,
                        next.pages.len()
                    )));
                }
                let mut page = page;
                page.reset_illustration();
                next.pages.insert(position, page);
                next.pages = renumber_pages(std::mem::take(&mut next.pages));
            }
            PhaseResult::PageDeleted(page_number) => {
                self.require_page_editing(label)?;
                let idx = next
                    .pages
                    .iter()
                    .position(|p| p.page_number == page_number)
                    .ok_or_else(|| PipelineError::not_found("page", page_number.to_string()))?;
                if next.pages.len() == 1 {
                    return Err(PipelineError::validation("cannot delete the only page"));
                }
                next.pages.remove(idx);
                next.pages = renumber_pages(std::mem::take(&mut next.pages));
            }
            PhaseResult::PageApproved(page_number) => {
                self.require_phase(label, &[Phase::AwaitingPageReview])?;
                let page = next
                    .pages
                    .iter_mut()
                    .find(|p| p.page_number == page_number)
                    .ok_or_else(|| PipelineError::not_found("page", page_number.to_string()))?;
                if !page.is_illustrated() {
                    return Err(PipelineError::validation(format!(
                        "page {} has no illustration to approve",
                        page_number
                    )));
                }
                page.approved = true;
            }
            PhaseResult::AllPagesApproved => {
                self.require_phase(label, &[Phase::AwaitingPageReview])?;
                for page in next.pages.iter_mut().filter(|p| p.is_illustrated()) {
                    page.approved = true;
                }
                if let Some(cover) = next.cover.as_mut() {
                    cover.approved = cover.illustration.is_some();
                }
            }
            PhaseResult::CharacterRefined {
                name,
                identity,
                consistency_tag,
            } => {
                if self.phase == Phase::Complete {
                    return Err(PipelineError::validation(
                        "cannot refine characters of a completed run",
                    ));
                }
                let slot = next
                    .characters
                    .iter_mut()
                    .find(|c| c.matches_name(&name))
                    .ok_or_else(|| PipelineError::not_found("character", name.clone()))?;
                slot.visual_identity = Some(identity);
                slot.consistency_tag = Some(consistency_tag);
            }
            PhaseResult::SavedStoryReopened => {
                self.require_phase(label, &[Phase::Complete, Phase::AwaitingPageReview])?;
                if self.phase == Phase::Complete {
                    next.revision += 1;
                }
                next.phase = Phase::AwaitingPageReview;
                for page in next.pages.iter_mut() {
                    page.approved = false;
                }
                if let Some(cover) = next.cover.as_mut() {
                    cover.approved = false;
                }
                next.progress = 100;
            }
            PhaseResult::PageCountChanged(count) => {
                if !self.phase.at_or_after_pages() {
                    return Err(PipelineError::validation(format!(
                        "cannot change page count during {}",
                        self.phase
                    )));
                }
                if count == 0 {
                    return Err(PipelineError::validation("page count must be at least 1"));
                }
                next.target_page_count = Some(count);
                next.pages.clear();
                next.phase = Phase::PageGeneration;
                next.progress = 0;
            }
            PhaseResult::Completed => {
                self.require_phase(label, &[Phase::AwaitingPageReview])?;
                next.phase = Phase::Complete;
                next.progress = 100;
            }
            PhaseResult::Failed(message) => {
                next.status = RunStatus::Error;
                next.error = Some(message);
                next.updated_at = Utc::now();
                return Ok(next);
            }
        }

        if !is_begin {
            next.status = next.phase.resting_status();
        }
        next.error = None;
        next.updated_at = Utc::now();
        Ok(next)
    }

    fn require_transition(&self, to: Phase) -> Result<()> {
        if self.phase.can_advance_to(to) {
            Ok(())
        } else {
            Err(PipelineError::validation(format!(
                "illegal transition {} -> {}",
                self.phase, to
            )))
        }
    }

    fn require_phase(&self, what: &str, allowed: &[Phase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(PipelineError::validation(format!(
                "{} not accepted during {}",
                what, self.phase
            )))
        }
    }

    fn require_page_editing(&self, what: &str) -> Result<()> {
        self.require_phase(
            what,
            &[Phase::AwaitingPromptReview, Phase::AwaitingPageReview],
        )
    }
}

/// Merges freshly extracted characters into the existing cast. Characters already
/// known keep their identity, tag and avatar; only gaps are filled in.
fn merge_characters(existing: &[Character], extracted: Vec<Character>) -> Result<Vec<Character>> {
    let mut merged = existing.to_vec();
    for incoming in extracted {
        if incoming.name.trim().is_empty() {
            return Err(PipelineError::validation("character with empty name"));
        }
        match merged.iter_mut().find(|c| c.matches_name(&incoming.name)) {
            Some(known) => {
                if known.visual_identity.is_none() && known.consistency_tag.is_none() {
                    known.visual_identity = incoming.visual_identity;
                    known.consistency_tag = incoming.consistency_tag;
                }
                if known.description.is_empty() {
                    known.description = incoming.description;
                }
            }
            None => merged.push(incoming),
        }
    }
    Ok(merged)
}

pub fn apply_avatar_result(character: &Character, avatar: AvatarAsset) -> Character {
    Character {
        avatar: Some(avatar),
        ..character.clone()
    }
}

pub fn apply_illustration(page: &Page, illustration: Illustration) -> Page {
    let regenerated = page.illustration.is_some() || illustration.regenerated;
    Page {
        illustration: Some(Illustration {
            regenerated,
            ..illustration
        }),
        approved: false,
        ..page.clone()
    }
}

/// Renumbers pages 1..=n in their current order.
pub fn renumber_pages(mut pages: Vec<Page>) -> Vec<Page> {
    for (i, page) in pages.iter_mut().enumerate() {
        page.page_number = i + 1;
    }
    pages
}
