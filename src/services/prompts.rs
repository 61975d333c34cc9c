//! Prompt text for the text and image models, and the JSON shapes the text
//! prompts ask for.

use crate::core::state::{ArtStyleDecision, Character, CharacterRole, Cover, Page, VisualIdentity};
use crate::services::consistency::{cap_scene_description, consistency_block, render_detailed};
use crate::utils::text::truncate_chars;
use serde::Deserialize;

/// Stories longer than this are cut before being sent to the text model.
const STORY_PROMPT_CHARS: usize = 12000;

pub const JSON_SYSTEM: &str =
    "You are a children's picture book editor. Reply with a single valid JSON object and nothing else.";

#[derive(Deserialize, Debug)]
pub struct CharactersReply {
    #[serde(default)]
    pub characters: Vec<CharacterReply>,
}

#[derive(Deserialize, Debug)]
pub struct CharacterReply {
    pub name: String,
    #[serde(default)]
    pub role: CharacterRole,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub visual_identity: Option<VisualIdentity>,
}

#[derive(Deserialize, Debug)]
pub struct PagesReply {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub pages: Vec<PageReply>,
}

#[derive(Deserialize, Debug)]
pub struct PageReply {
    pub text: String,
    pub image_description: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub characters_in_scene: Vec<String>,
}

impl From<PageReply> for Page {
    fn from(reply: PageReply) -> Self {
        let mut page = Page::new(reply.text, reply.image_description);
        page.action = reply.action;
        page.emotion = reply.emotion;
        page.characters_in_scene = reply.characters_in_scene;
        page
    }
}

fn story_excerpt(story: &str) -> String {
    truncate_chars(story.trim(), STORY_PROMPT_CHARS)
}

pub fn art_style_prompt(story: &str) -> String {
    format!(
        "Choose one illustration style for a picture book of the story below. \
         Consider the audience age, mood and setting.\n\
         Return: {{ \"style\": \"...\", \"rationale\": \"...\" }}\n\nStory:\n{}",
        story_excerpt(story)
    )
}

pub fn characters_prompt(story: &str, known: &[Character]) -> String {
    let known_names = known
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "List every character who should appear in the illustrations.\n\
         Already known characters (reuse these exact names): [{}]\n\
         role is one of main, supporting, minor.\n\
         Describe each character's fixed appearance so an illustrator can draw them the same way every time.\n\
         Return: {{ \"characters\": [ {{ \"name\": \"...\", \"role\": \"main\", \"description\": \"...\", \
         \"visual_identity\": {{ \"species\": \"...\", \"age_appearance\": \"...\", \
         \"coloring\": {{ \"hair\": \"...\", \"skin\": \"...\", \"eyes\": \"...\" }}, \
         \"outfit\": {{ \"top\": \"...\", \"bottom\": \"...\", \"accessories\": [] }}, \
         \"distinguishing_features\": [] }} }} ] }}\n\nStory:\n{}",
        known_names,
        story_excerpt(story)
    )
}

pub fn pages_prompt(
    story: &str,
    page_count: usize,
    style: Option<&ArtStyleDecision>,
    characters: &[Character],
) -> String {
    let cast = characters
        .iter()
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let style = style.map(|s| s.style.as_str()).unwrap_or("unspecified");
    format!(
        "Split the story into exactly {} picture book pages.\n\
         Art style: {}\n\
         Characters: [{}]\n\
         For each page give the text printed on it, an image_description of the scene \
         (setting, composition, lighting), the action, the emotion, and the names of the \
         characters visible in the scene. Also give a title and a one-sentence summary.\n\
         Return: {{ \"title\": \"...\", \"summary\": \"...\", \"pages\": [ {{ \"text\": \"...\", \
         \"image_description\": \"...\", \"action\": \"...\", \"emotion\": \"...\", \
         \"characters_in_scene\": [\"...\"] }} ] }}\n\nStory:\n{}",
        page_count,
        style,
        cast,
        story_excerpt(story)
    )
}

fn style_line(style: Option<&ArtStyleDecision>) -> String {
    match style {
        Some(s) => format!("Art style: {}.", s.style),
        None => "Art style: warm children's book illustration.".to_string(),
    }
}

pub fn avatar_prompt(character: &Character, style: Option<&ArtStyleDecision>) -> String {
    format!(
        "{}\nCharacter reference sheet, full body, plain background, single character.\n{}",
        style_line(style),
        render_detailed(character)
    )
}

fn scene_text(description: &str, action: Option<&str>, emotion: Option<&str>) -> String {
    let mut scene = description.trim().to_string();
    if let Some(action) = action.filter(|a| !a.trim().is_empty()) {
        scene.push_str(&format!(" Action: {}.", action.trim()));
    }
    if let Some(emotion) = emotion.filter(|e| !e.trim().is_empty()) {
        scene.push_str(&format!(" Mood: {}.", emotion.trim()));
    }
    scene
}

fn assemble(style: Option<&ArtStyleDecision>, block: &str, scene: &str) -> String {
    if block.is_empty() {
        format!("{}\nScene: {}", style_line(style), scene)
    } else {
        format!(
            "{}\nCharacters (draw exactly as described):\n{}\nScene: {}",
            style_line(style),
            block,
            scene
        )
    }
}

/// Illustration prompt for a page. Only the scene part is capped; the
/// character block is always sent whole.
pub fn page_prompt(
    page: &Page,
    characters: &[Character],
    style: Option<&ArtStyleDecision>,
    scene_limit: usize,
) -> String {
    let block = consistency_block(characters, &page.characters_in_scene);
    let scene = cap_scene_description(
        &scene_text(&page.image_description, page.action.as_deref(), page.emotion.as_deref()),
        scene_limit,
    );
    assemble(style, &block, &scene)
}

pub fn cover_prompt(
    cover: &Cover,
    characters: &[Character],
    style: Option<&ArtStyleDecision>,
    scene_limit: usize,
) -> String {
    let block = consistency_block(characters, &cover.characters_in_scene);
    let scene = cap_scene_description(
        &format!("Book cover for \"{}\". {}", cover.title, cover.image_description),
        scene_limit,
    );
    assemble(style, &block, &scene)
}
