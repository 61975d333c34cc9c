use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::services::image::ImageConfig;
use crate::services::llm::LlmConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_data")]
    pub data_folder: String,

    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    pub image: ImageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// How avatars are obtained before page generation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AvatarMode {
    /// Generate an avatar for every character, then ask for approval.
    #[default]
    Auto,
    /// Stop after extraction and wait for the operator to supply avatars.
    UserProvided,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_min_pages")]
    pub min_pages: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_words_per_page")]
    pub words_per_page: usize,
    /// Upper bound, in characters, for the scene part of an illustration prompt.
    #[serde(default = "default_scene_description_limit")]
    pub scene_description_limit: usize,
    #[serde(default)]
    pub avatar_mode: AvatarMode,
    #[serde(default = "default_avatar_concurrency")]
    pub avatar_concurrency: usize,
    /// Bound on every draft, batch, book and asset storage call.
    #[serde(default = "default_storage_timeout_seconds")]
    pub storage_timeout_seconds: u64,
}

impl PipelineConfig {
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_seconds.max(1))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_pages: default_min_pages(),
            max_pages: default_max_pages(),
            words_per_page: default_words_per_page(),
            scene_description_limit: default_scene_description_limit(),
            avatar_mode: AvatarMode::default(),
            avatar_concurrency: default_avatar_concurrency(),
            storage_timeout_seconds: default_storage_timeout_seconds(),
        }
    }
}

fn default_data() -> String {
    "data".to_string()
}
fn default_min_pages() -> usize {
    4
}
fn default_max_pages() -> usize {
    20
}
fn default_words_per_page() -> usize {
    40
}
fn default_scene_description_limit() -> usize {
    550
}
fn default_avatar_concurrency() -> usize {
    3
}
fn default_storage_timeout_seconds() -> u64 {
    30
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.min_pages == 0 {
            anyhow::bail!("pipeline.min_pages must be at least 1");
        }
        if p.min_pages > p.max_pages {
            anyhow::bail!(
                "pipeline.min_pages ({}) exceeds pipeline.max_pages ({})",
                p.min_pages,
                p.max_pages
            );
        }
        if p.words_per_page == 0 {
            anyhow::bail!("pipeline.words_per_page must be at least 1");
        }
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.data_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
llm:
  provider: ollama
  ollama:
    base_url: http://localhost:11434
    model: llama3
image:
  api_key: sk-test
"#;

    #[test]
    fn test_defaults_applied() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(&path, MINIMAL)?;

        let config = Config::load_from(&path)?;
        assert_eq!(config.data_folder, "data");
        assert_eq!(config.pipeline.min_pages, 4);
        assert_eq!(config.pipeline.max_pages, 20);
        assert_eq!(config.pipeline.scene_description_limit, 550);
        assert_eq!(config.pipeline.avatar_mode, AvatarMode::Auto);
        assert_eq!(config.image.model, "gpt-image-1");
        assert!(config.image.reference_conditioning);
        assert_eq!(config.llm.request_timeout_seconds, 120);
        assert_eq!(config.pipeline.storage_timeout(), Duration::from_secs(30));
        Ok(())
    }

    #[test]
    fn test_rejects_inverted_page_bounds() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        let content = format!("{}pipeline:\n  min_pages: 10\n  max_pages: 5\n", MINIMAL);
        fs::write(&path, content)?;

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load_from(Path::new("/nonexistent/config.yml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
