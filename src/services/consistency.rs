//! Text descriptors that keep a character looking the same across image calls.
//!
//! The image service has no memory between requests, so every avatar, page and
//! cover prompt carries a rendering of the characters in the scene. Rendering is
//! a pure function of the stored [`Character`], which makes the output identical
//! for as long as the character is not explicitly refined.

use crate::core::state::{Character, CharacterRole, VisualIdentity};
use crate::utils::text::truncate_chars;

/// Raw extraction text is cut to this many characters when nothing better exists.
const RAW_DESCRIPTION_CHARS: usize = 90;
const MAX_FEATURES: usize = 2;
const TAG_MAX_WORDS: usize = 20;
/// Scenes with more characters than this use the concise one-line form.
const CONCISE_THRESHOLD: usize = 3;

/// Characters named in a scene, in cast order. Falls back to the main
/// characters when no name matches; empty when there are none either.
pub fn select_scene_characters<'a>(
    characters: &'a [Character],
    names: &[String],
) -> Vec<&'a Character> {
    let named: Vec<&Character> = characters
        .iter()
        .filter(|c| names.iter().any(|n| c.matches_name(n)))
        .collect();
    if !named.is_empty() {
        return named;
    }
    characters
        .iter()
        .filter(|c| c.role == CharacterRole::Main)
        .collect()
}

fn identity_parts(identity: &VisualIdentity) -> Vec<String> {
    let mut parts = Vec::new();
    if let Some(hair) = &identity.coloring.hair {
        parts.push(format!("{} hair", hair));
    }
    if let Some(skin) = &identity.coloring.skin {
        parts.push(format!("{} skin", skin));
    }
    if let Some(eyes) = &identity.coloring.eyes {
        parts.push(format!("{} eyes", eyes));
    }
    parts.extend(
        identity
            .distinguishing_features
            .iter()
            .take(MAX_FEATURES)
            .cloned(),
    );
    if let Some(top) = &identity.outfit.top {
        parts.push(format!("wearing {}", top));
    }
    parts
}

/// One full line for a character: structured identity, else its tag, else
/// the start of its raw description.
pub fn render_detailed(character: &Character) -> String {
    let body = character
        .visual_identity
        .as_ref()
        .map(identity_parts)
        .filter(|parts| !parts.is_empty())
        .map(|parts| parts.join(", "))
        .or_else(|| character.consistency_tag.clone())
        .unwrap_or_else(|| truncate_chars(character.description.trim(), RAW_DESCRIPTION_CHARS));
    format!("{}: {}", character.name, body)
}

/// Hair and outfit only.
pub fn render_concise(character: &Character) -> String {
    let mut parts = Vec::new();
    if let Some(identity) = &character.visual_identity {
        if let Some(hair) = &identity.coloring.hair {
            parts.push(format!("{} hair", hair));
        }
        if let Some(top) = &identity.outfit.top {
            parts.push(top.clone());
        }
    }
    if parts.is_empty() {
        return render_detailed(character);
    }
    format!("{}: {}", character.name, parts.join(", "))
}

/// The block prepended to every scene prompt. Empty when the scene carries no
/// consistency constraint.
pub fn consistency_block(characters: &[Character], names: &[String]) -> String {
    let selected = select_scene_characters(characters, names);
    let render: fn(&Character) -> String = if selected.len() > CONCISE_THRESHOLD {
        render_concise
    } else {
        render_detailed
    };
    selected.into_iter().map(render).collect::<Vec<_>>().join("\n")
}

/// Short tag stored on the character after extraction or refinement.
pub fn render_consistency_tag(identity: &VisualIdentity) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(age) = &identity.age_appearance {
        parts.push(age.clone());
    }
    if let Some(species) = &identity.species {
        parts.push(species.clone());
    }
    if let Some(hair) = &identity.coloring.hair {
        parts.push(format!("{} hair", hair));
    }
    if let Some(eyes) = &identity.coloring.eyes {
        parts.push(format!("{} eyes", eyes));
    }
    if let Some(top) = &identity.outfit.top {
        parts.push(top.clone());
    }
    if let Some(feature) = identity.distinguishing_features.first() {
        parts.push(feature.clone());
    }

    let joined = parts.join(", ");
    let words: Vec<&str> = joined.split_whitespace().collect();
    if words.len() <= TAG_MAX_WORDS {
        joined
    } else {
        words[..TAG_MAX_WORDS]
            .join(" ")
            .trim_end_matches(',')
            .to_string()
    }
}

/// Caps the scene part of a prompt at `limit` characters, preferring to cut
/// at a word boundary. The result never exceeds `limit`.
pub fn cap_scene_description(text: &str, limit: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= limit {
        return text.to_string();
    }
    if limit == 0 {
        return String::new();
    }

    let head = truncate_chars(text, limit - 1);
    let cut = match head.rfind(char::is_whitespace) {
        Some(idx) if head[..idx].chars().count() >= limit / 2 => &head[..idx],
        _ => head.as_str(),
    };
    format!("{}…", cut.trim_end_matches(|c: char| c.is_whitespace() || c == ','))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{Coloring, Outfit};

    fn mia() -> Character {
        let mut c = Character::new("Mia", CharacterRole::Main);
        c.visual_identity = Some(VisualIdentity {
            species: Some("girl".into()),
            age_appearance: Some("seven-year-old".into()),
            coloring: Coloring {
                hair: Some("red curly".into()),
                skin: Some("freckled".into()),
                eyes: Some("green".into()),
            },
            outfit: Outfit {
                top: Some("yellow raincoat".into()),
                bottom: Some("blue boots".into()),
                accessories: vec![],
            },
            distinguishing_features: vec!["gap tooth".into(), "star pin".into(), "scarf".into()],
        });
        c
    }

    fn otto() -> Character {
        let mut c = Character::new("Otto", CharacterRole::Supporting);
        c.consistency_tag = Some("small grey otter, striped scarf".into());
        c
    }

    #[test]
    fn test_detailed_uses_identity_and_caps_features() {
        let line = render_detailed(&mia());
        assert_eq!(
            line,
            "Mia: red curly hair, freckled skin, green eyes, gap tooth, star pin, wearing yellow raincoat"
        );
    }

    #[test]
    fn test_detailed_falls_back_to_tag_then_description() {
        assert_eq!(render_detailed(&otto()), "Otto: small grey otter, striped scarf");

        let mut raw = Character::new("Gran", CharacterRole::Minor);
        raw.description = "x".repeat(200);
        assert_eq!(render_detailed(&raw), format!("Gran: {}", "x".repeat(90)));
    }

    #[test]
    fn test_rendering_is_stable() {
        let cast = vec![mia(), otto()];
        let names = vec!["otto".to_string(), "MIA".to_string()];
        let first = consistency_block(&cast, &names);
        let second = consistency_block(&cast, &names);
        assert_eq!(first, second);
        assert!(first.starts_with("Mia:"));
    }

    #[test]
    fn test_unmatched_names_fall_back_to_main_characters() {
        let cast = vec![mia(), otto()];
        let selected = select_scene_characters(&cast, &["Stranger".to_string()]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "Mia");

        let no_main = vec![otto()];
        assert!(consistency_block(&no_main, &["Stranger".to_string()]).is_empty());
    }

    #[test]
    fn test_crowded_scene_uses_concise_lines() {
        let mut cast = vec![mia(), otto()];
        for name in ["A", "B"] {
            let mut c = Character::new(name, CharacterRole::Minor);
            c.consistency_tag = Some(format!("{} tag", name));
            cast.push(c);
        }
        let names: Vec<String> = cast.iter().map(|c| c.name.clone()).collect();
        let block = consistency_block(&cast, &names);
        assert!(block.contains("Mia: red curly hair, yellow raincoat"));
        assert!(block.contains("A: A tag"));
    }

    #[test]
    fn test_tag_is_bounded() {
        let tag = render_consistency_tag(&mia().visual_identity.unwrap());
        assert_eq!(
            tag,
            "seven-year-old, girl, red curly hair, green eyes, yellow raincoat, gap tooth"
        );

        let mut long = VisualIdentity::default();
        long.distinguishing_features = vec!["very ".repeat(30)];
        assert!(render_consistency_tag(&long).split_whitespace().count() <= 20);
    }

    #[test]
    fn test_cap_scene_description() {
        assert_eq!(cap_scene_description("short scene", 550), "short scene");

        let long = "the fox runs through the tall grass ".repeat(30);
        let capped = cap_scene_description(&long, 100);
        assert!(capped.chars().count() <= 100);
        assert!(capped.ends_with('…'));
        assert!(!capped.contains(" …"));
    }
}
