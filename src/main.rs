use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, Select, Text};
use log::warn;
use std::fs;
use std::path::Path;
use std::time::Duration;
use story2picturebook::core::config::Config;
use story2picturebook::core::error::{PipelineError, Result as PipelineResult};
use story2picturebook::core::state::{Phase, Run, RunStatus};
use story2picturebook::services::batch::{BatchRequest, BatchStatus};
use story2picturebook::services::image::ImageData;
use story2picturebook::services::workflow::{Edit, Pipeline, Unit};

enum Start {
    Story(String),
    Resume(String),
    Pick,
}

fn parse_args() -> Result<Start> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => Ok(Start::Pick),
        [flag, id] if flag == "--resume" => Ok(Start::Resume(id.clone())),
        [path] if !path.starts_with("--") => Ok(Start::Story(path.clone())),
        _ => bail!("usage: story2picturebook <story.txt> | --resume <run_id>"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with llm and image settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let pipeline = Pipeline::from_config(&config)?;
    let owner = std::env::var("USER").ok();

    let run = match parse_args()? {
        Start::Story(path) => {
            let story =
                fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
            pipeline.create_run(&story, owner).await?
        }
        Start::Resume(id) => pipeline.resume_draft(&id).await?,
        Start::Pick => match pick_draft(&pipeline, owner.as_deref()).await? {
            Some(run) => run,
            None => return Ok(()),
        },
    };

    drive(&pipeline, &config, run).await
}

async fn pick_draft(pipeline: &Pipeline, owner: Option<&str>) -> Result<Option<Run>> {
    let drafts = pipeline.list_drafts(owner).await?;
    if drafts.is_empty() {
        println!("No saved drafts. Pass a story file to start a new book.");
        return Ok(None);
    }
    let labels: Vec<String> = drafts
        .iter()
        .map(|d| {
            format!(
                "{} | {} | step {} | {}",
                d.run_id,
                d.title.as_deref().unwrap_or("untitled"),
                d.current_step,
                d.saved_at.format("%Y-%m-%d %H:%M")
            )
        })
        .collect();
    let choice = Select::new("Resume which draft?", labels.clone()).prompt()?;
    let index = labels.iter().position(|l| *l == choice).unwrap_or(0);
    Ok(Some(pipeline.resume_draft(&drafts[index].run_id).await?))
}

fn confirm(config: &Config, question: &str) -> Result<bool> {
    if config.unattended {
        return Ok(true);
    }
    Ok(Confirm::new(question).with_default(true).prompt()?)
}

async fn drive(pipeline: &Pipeline, config: &Config, mut run: Run) -> Result<()> {
    loop {
        println!("[{}] {} ({}%)", run.id, run.phase, run.progress);
        let step = match run.phase {
            Phase::Complete => {
                println!("Run {} is complete.", run.id);
                return Ok(());
            }
            Phase::AwaitingAvatarInput if !config.unattended => {
                collect_avatars(pipeline, &run).await?;
                pipeline.advance(&run.id).await
            }
            Phase::AwaitingApproval => {
                if !confirm(config, "Avatars are ready. Continue to page generation?")? {
                    break;
                }
                pipeline.advance(&run.id).await
            }
            Phase::AwaitingPromptReview => {
                for page in &run.pages {
                    println!("  {:>2}. {}", page.page_number, page.image_description);
                }
                if !confirm(config, "Illustrate these pages?")? {
                    break;
                }
                pipeline.advance(&run.id).await
            }
            Phase::IllustrationGeneration => match illustrate(pipeline, &run.id).await {
                Ok(Some(next)) => Ok(next),
                Ok(None) => break,
                Err(e) => Err(e),
            },
            Phase::AwaitingPageReview => {
                retry_missing(pipeline, config, &run).await?;
                let current = pipeline.run_status(&run.id)?;
                run = if current.status == RunStatus::Error {
                    pipeline.resume_draft(&run.id).await?
                } else {
                    current
                };
                if run.pages.iter().any(|p| !p.is_illustrated()) {
                    println!("Some pages still have no illustration.");
                    break;
                }
                if !confirm(config, "Finalize the book?")? {
                    break;
                }
                let location = pipeline.finalize(&run.id).await?;
                println!("Book written to {}", location);
                return Ok(());
            }
            _ => pipeline.advance(&run.id).await,
        };

        run = match step {
            Ok(next) => next,
            Err(e) => {
                let current = pipeline.run_status(&run.id)?;
                if current.status != RunStatus::Error {
                    return Err(e.into());
                }
                eprintln!("Step failed: {}", e);
                if config.unattended || !confirm(config, "Retry from the last saved draft?")? {
                    return Err(e.into());
                }
                pipeline.resume_draft(&run.id).await?
            }
        };
    }

    println!("Stopped. Resume later with --resume {}", run.id);
    Ok(())
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

async fn collect_avatars(pipeline: &Pipeline, run: &Run) -> Result<()> {
    for character in run.characters.iter().filter(|c| c.avatar.is_none()) {
        let question = format!("Image file for {} (blank to skip):", character.name);
        let answer = Text::new(&question).prompt()?;
        let answer = answer.trim();
        if answer.is_empty() {
            continue;
        }
        let path = Path::new(answer);
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping avatar for {}: {}", character.name, e);
                continue;
            }
        };
        let image = ImageData {
            bytes,
            mime: mime_for(path).to_string(),
        };
        pipeline
            .edit(
                &run.id,
                Edit::SubmitAvatar {
                    name: character.name.clone(),
                    image,
                },
            )
            .await?;
    }
    Ok(())
}

/// Runs the batch with a progress bar. `None` when the operator cancelled it.
async fn illustrate(pipeline: &Pipeline, run_id: &str) -> PipelineResult<Option<Run>> {
    let handle = pipeline.create_batch(run_id).await?;
    let first = handle.status();

    let pb = ProgressBar::new(first.total_units as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let finished: BatchRequest = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                pb.println("Cancelling after the current illustration...");
                handle.cancel();
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
        let status = handle.status();
        pb.set_position((status.completed_units + status.failed_units.len()) as u64);
        if status.status.is_terminal() {
            break handle.wait().await;
        }
    };
    pb.finish_and_clear();

    println!(
        "Batch {:?}: {}/{} illustrated",
        finished.status, finished.completed_units, finished.total_units
    );
    for unit in &finished.failed_units {
        println!("  failed: {}", unit);
    }
    if let Some(message) = &finished.error_message {
        println!("  {}", message);
    }
    match finished.status {
        BatchStatus::Cancelled => return Ok(None),
        BatchStatus::Failed => {
            return Err(PipelineError::validation(
                finished.error_message.unwrap_or_else(|| "batch failed".to_string()),
            ))
        }
        _ => {}
    }
    pipeline.run_status(run_id).map(Some)
}

async fn retry_missing(pipeline: &Pipeline, config: &Config, run: &Run) -> Result<()> {
    let missing: Vec<usize> = run
        .pages
        .iter()
        .filter(|p| !p.is_illustrated())
        .map(|p| p.page_number)
        .collect();
    for page_number in missing {
        if confirm(config, &format!("Page {} has no illustration. Try again?", page_number))? {
            if let Err(e) = pipeline.regenerate_unit(&run.id, Unit::Page(page_number)).await {
                eprintln!("Page {} failed again: {}", page_number, e);
            }
        }
    }
    if run.cover_needed() && confirm(config, "The cover has no illustration. Try again?")? {
        if let Err(e) = pipeline.regenerate_unit(&run.id, Unit::Cover).await {
            eprintln!("Cover failed again: {}", e);
        }
    }
    Ok(())
}
