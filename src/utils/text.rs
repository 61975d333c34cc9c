use crate::core::config::PipelineConfig;

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Picks a page count for a story: one page per `words_per_page` words,
/// clamped to the configured bounds.
pub fn estimate_page_count(story: &str, cfg: &PipelineConfig) -> usize {
    let words = word_count(story);
    let per_page = cfg.words_per_page.max(1);
    let raw = words.div_ceil(per_page);
    raw.clamp(cfg.min_pages, cfg.max_pages)
}

pub fn clamp_page_count(requested: usize, cfg: &PipelineConfig) -> usize {
    requested.clamp(cfg.min_pages, cfg.max_pages)
}

/// Takes the first `max_chars` characters, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        text.chars().take(max_chars).collect()
    } else {
        text.to_string()
    }
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}
