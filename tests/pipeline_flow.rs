use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use story2picturebook::core::config::Config;
use story2picturebook::core::io::{NativeStorage, Storage};
use story2picturebook::core::state::{Phase, RunStatus};
use story2picturebook::services::batch::BatchStatus;
use story2picturebook::services::image::{ImageClient, ImageData, ImageOptions};
use story2picturebook::services::llm::LlmClient;
use story2picturebook::services::workflow::{Edit, Pipeline};

const STORY: &str = "Pip the hedgehog could not sleep. He walked to the pond and met a frog \
named Lulu who sang him a song about the moon until the stars came out.";

#[derive(Debug, Default)]
struct StoryLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for StoryLlm {
    async fn chat(&self, _system: &str, user: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if user.contains("illustration style") {
            return Ok(json!({"style": "pastel crayon", "rationale": "bedtime"}).to_string());
        }
        if user.contains("List every character") {
            return Ok(json!({
                "characters": [
                    {
                        "name": "Pip",
                        "role": "main",
                        "description": "A small hedgehog.",
                        "visual_identity": {
                            "species": "hedgehog",
                            "coloring": {"eyes": "black"},
                            "outfit": {"top": "striped scarf"}
                        }
                    },
                    {"name": "Lulu", "role": "supporting", "description": "A green frog who sings."}
                ]
            })
            .to_string());
        }
        if let Some(n) = user
            .split("exactly ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse::<usize>().ok())
        {
            let pages: Vec<_> = (1..=n)
                .map(|i| {
                    json!({
                        "text": format!("Part {}.", i),
                        "image_description": format!("Pip by the pond, moment {}.", i),
                        "characters_in_scene": ["Pip", "Lulu"]
                    })
                })
                .collect();
            let reply = json!({
                "title": "Pip Can't Sleep",
                "summary": "A frog sings Pip to sleep.",
                "pages": pages
            });
            return Ok(reply.to_string());
        }
        bail!("unexpected prompt")
    }
}

#[derive(Debug, Default)]
struct CountingImages {
    plain: AtomicUsize,
    referenced: AtomicUsize,
}

#[async_trait]
impl ImageClient for CountingImages {
    async fn generate_image(&self, prompt: &str, _options: &ImageOptions) -> Result<ImageData> {
        self.plain.fetch_add(1, Ordering::SeqCst);
        Ok(ImageData::png(prompt.as_bytes().to_vec()))
    }

    async fn generate_image_with_references(
        &self,
        prompt: &str,
        references: &[ImageData],
        _options: &ImageOptions,
    ) -> Result<ImageData> {
        assert!(!references.is_empty());
        self.referenced.fetch_add(1, Ordering::SeqCst);
        Ok(ImageData::png(prompt.as_bytes().to_vec()))
    }
}

fn config(avatar_mode: &str) -> Config {
    let yaml = format!(
        "unattended: true\n\
         llm:\n  provider: ollama\n  ollama:\n    base_url: http://localhost:11434\n    model: test\n\
         image:\n  api_key: test\n\
         pipeline:\n  avatar_mode: {}\n",
        avatar_mode
    );
    serde_yaml::from_str(&yaml).unwrap()
}

struct Harness {
    dir: tempfile::TempDir,
    llm: Arc<StoryLlm>,
    images: Arc<CountingImages>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            llm: Arc::new(StoryLlm::default()),
            images: Arc::new(CountingImages::default()),
        }
    }

    fn pipeline(&self, avatar_mode: &str) -> Pipeline {
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new(self.dir.path()));
        Pipeline::new(&config(avatar_mode), self.llm.clone(), self.images.clone(), storage)
    }
}

#[tokio::test]
async fn test_story_becomes_a_published_book() {
    let h = Harness::new();
    let pipeline = h.pipeline("auto");
    let run = pipeline.create_run(STORY, Some("sam".into())).await.unwrap();

    let mut current = run.clone();
    while current.phase != Phase::AwaitingPromptReview {
        current = pipeline.advance(&run.id).await.unwrap();
    }
    assert_eq!(current.title.as_deref(), Some("Pip Can't Sleep"));
    assert_eq!(current.characters.len(), 2);
    assert!(current.characters.iter().all(|c| c.avatar.is_some()));
    assert_eq!(h.images.plain.load(Ordering::SeqCst), 2);

    pipeline.advance(&run.id).await.unwrap();
    let handle = pipeline.create_batch(&run.id).await.unwrap();
    let done = handle.wait().await;
    assert_eq!(done.status, BatchStatus::Completed);
    assert_eq!(done.completed_units, done.total_units);
    assert!(done.failed_units.is_empty());

    let reviewed = pipeline.run_status(&run.id).unwrap();
    assert_eq!(reviewed.phase, Phase::AwaitingPageReview);
    let pages = reviewed.pages.len();
    assert!(reviewed.pages.iter().all(|p| p.illustration.as_ref().unwrap().used_references));
    assert_eq!(h.images.referenced.load(Ordering::SeqCst), pages + 1);

    let location = pipeline.finalize(&run.id).await.unwrap();
    assert!(h.dir.path().join(&location).exists());
    assert!(h.dir.path().join("assets").join(&run.id).is_dir());

    let book = pipeline.load_book(&run.id).await.unwrap();
    assert_eq!(book.status, RunStatus::Complete);
    assert_eq!(book.pages.len(), pages);
    assert!(pipeline.list_drafts(Some("sam")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_draft_survives_restart() {
    let h = Harness::new();
    let run_id = {
        let pipeline = h.pipeline("user_provided");
        let run = pipeline.create_run(STORY, Some("sam".into())).await.unwrap();
        pipeline.advance(&run.id).await.unwrap();
        let extracted = pipeline.advance(&run.id).await.unwrap();
        assert_eq!(extracted.phase, Phase::AwaitingAvatarInput);
        run.id
    };

    let pipeline = h.pipeline("user_provided");
    let drafts = pipeline.list_drafts(Some("sam")).await.unwrap();
    assert_eq!(drafts.len(), 1);
    assert_eq!(drafts[0].phase, Phase::AwaitingAvatarInput);

    let resumed = pipeline.resume_draft(&run_id).await.unwrap();
    assert_eq!(resumed.characters.len(), 2);
    assert_eq!(resumed.art_style.unwrap().style, "pastel crayon");

    pipeline
        .edit(
            &run_id,
            Edit::SubmitAvatar {
                name: "Pip".into(),
                image: ImageData::png(vec![1, 2, 3]),
            },
        )
        .await
        .unwrap();
    let paged = pipeline.advance(&run_id).await.unwrap();
    assert_eq!(paged.phase, Phase::AwaitingPromptReview);
    assert_eq!(h.images.plain.load(Ordering::SeqCst), 0);
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let h = Harness::new();
    let pipeline = h.pipeline("auto");
    assert!(pipeline.advance("missing").await.is_err());
    assert!(pipeline.resume_draft("missing").await.is_err());
    assert!(pipeline.create_run("   ", None).await.is_err());
}
