use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use log::debug;
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use url::Url;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_provider")]
    pub provider: String, // "openai"
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_size")]
    pub size: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Send previously generated avatars along with page and cover prompts.
    #[serde(default = "default_true")]
    pub reference_conditioning: bool,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-image-1".to_string()
}
fn default_size() -> String {
    "1024x1024".to_string()
}
fn default_request_timeout() -> u64 {
    180
}
fn default_true() -> bool {
    true
}

impl ImageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn options(&self) -> ImageOptions {
        ImageOptions {
            size: self.size.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOptions {
    pub size: String,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self { size: default_size() }
    }
}

/// Raw image bytes plus their MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime: String,
}

impl ImageData {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime: "image/png".to_string(),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.mime.as_str() {
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

#[async_trait]
pub trait ImageClient: Send + Sync + Debug {
    async fn generate_image(&self, prompt: &str, options: &ImageOptions) -> Result<ImageData>;

    /// Same as [`ImageClient::generate_image`] but biased toward the look of `references`.
    async fn generate_image_with_references(
        &self,
        prompt: &str,
        references: &[ImageData],
        options: &ImageOptions,
    ) -> Result<ImageData>;
}

pub fn create_image_client(config: &ImageConfig) -> Result<Box<dyn ImageClient>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiImageClient::new(
            &config.api_key,
            &config.model,
            config.base_url.as_deref(),
        )?)),
        _ => Err(anyhow!("Unknown image provider: {}", config.provider)),
    }
}

#[derive(Debug)]
pub struct OpenAiImageClient {
    api_key: String,
    model: String,
    base_url: Url,
    client: Client,
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    size: &'a str,
    n: u32,
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
    url: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

enum ImagePayload {
    Inline(Vec<u8>),
    Remote(String),
}

impl ImagesResponse {
    fn into_payload(self) -> Result<ImagePayload> {
        if let Some(err) = self.error {
            return Err(anyhow!("Image API returned error: {}", err.message));
        }
        let first = self
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Image API returned no images"))?;

        if let Some(b64) = first.b64_json {
            let bytes = STANDARD
                .decode(b64.trim())
                .context("Image API returned invalid base64")?;
            return Ok(ImagePayload::Inline(bytes));
        }
        first
            .url
            .map(ImagePayload::Remote)
            .ok_or_else(|| anyhow!("Image API response has neither b64_json nor url"))
    }
}

impl OpenAiImageClient {
    pub fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Result<Self> {
        // A trailing slash keeps `join` from dropping the last path segment.
        let base = format!(
            "{}/",
            base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
        );
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: Url::parse(&base)
                .with_context(|| format!("Invalid image base_url {}", base))?,
            client: Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn read_response(&self, resp: reqwest::Response) -> Result<ImageData> {
        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await?;
            return Err(anyhow!("Image API error ({}): {}", status, error_text));
        }

        let body = resp.text().await?;
        let parsed: ImagesResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("Failed to parse image response: {}", e))?;

        match parsed.into_payload()? {
            ImagePayload::Inline(bytes) => Ok(ImageData::png(bytes)),
            ImagePayload::Remote(url) => {
                debug!("Downloading generated image from {}", url);
                let resp = self.client.get(&url).send().await?;
                if !resp.status().is_success() {
                    return Err(anyhow!("Image download failed: {}", resp.status()));
                }
                let mime = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("image/png")
                    .to_string();
                let bytes = resp.bytes().await?;
                Ok(ImageData {
                    bytes: bytes.to_vec(),
                    mime,
                })
            }
        }
    }
}

#[async_trait]
impl ImageClient for OpenAiImageClient {
    async fn generate_image(&self, prompt: &str, options: &ImageOptions) -> Result<ImageData> {
        let url = self.endpoint("images/generations")?;
        let body = GenerationRequest {
            model: &self.model,
            prompt,
            size: &options.size,
            n: 1,
        };

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send image generation request")?;
        self.read_response(resp).await
    }

    async fn generate_image_with_references(
        &self,
        prompt: &str,
        references: &[ImageData],
        options: &ImageOptions,
    ) -> Result<ImageData> {
        if references.is_empty() {
            return Err(anyhow!("reference-conditioned generation needs at least one image"));
        }
        let url = self.endpoint("images/edits")?;

        let mut form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("prompt", prompt.to_string())
            .text("size", options.size.clone())
            .text("n", "1");
        for (i, reference) in references.iter().enumerate() {
            let part = multipart::Part::bytes(reference.bytes.clone())
                .file_name(format!("reference_{}.{}", i, reference.extension()))
                .mime_str(&reference.mime)
                .context("Invalid mime type")?;
            form = form.part("image[]", part);
        }

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("Failed to send image edit request")?;
        self.read_response(resp).await
    }
}
