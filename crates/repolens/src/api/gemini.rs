//! Async HTTP client for the Gemini generative language API.

use super::classify::{error_for_status, preview};
use super::client::{Generation, LlmClient, LlmFuture, UsageInfo};
use crate::{DEFAULT_MODEL, Error, PromptPart, Result, Role};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Generation requests may take minutes for large prompts.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

// ── Request types ──────────────────────────────────────────────────

#[derive(Serialize, Debug)]
pub(crate) struct Content {
    pub role: &'static str,
    pub parts: Vec<TextPart>,
}

#[derive(Serialize, Deserialize, Debug)]
pub(crate) struct TextPart {
    #[serde(default)]
    pub text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    pub max_output_tokens: u32,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateRequest {
    pub contents: Vec<Content>,
    pub generation_config: GenerationConfig,
}

#[derive(Serialize, Debug)]
struct CountTokensRequest {
    contents: Vec<Content>,
}

/// Gemini has no system role in `contents`; system text travels as a user
/// part, which is also how the instructions are framed by the assembler.
fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Model => "model",
        Role::User | Role::System => "user",
    }
}

pub(crate) fn to_contents(parts: &[PromptPart]) -> Vec<Content> {
    parts
        .iter()
        .map(|p| Content {
            role: wire_role(p.role),
            parts: vec![TextPart {
                text: p.text.clone(),
            }],
        })
        .collect()
}

// ── Response types ─────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub usage_metadata: Option<UsageMetadata>,
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Candidate {
    pub content: Option<CandidateContent>,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<TextPart>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsageMetadata {
    pub prompt_token_count: Option<u32>,
    pub candidates_token_count: Option<u32>,
    pub total_token_count: Option<u32>,
}

impl From<UsageMetadata> for UsageInfo {
    fn from(u: UsageMetadata) -> Self {
        UsageInfo {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PromptFeedback {
    pub block_reason: Option<String>,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate.
    pub(crate) fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn finish_reason(&self) -> Option<String> {
        self.candidates.first().and_then(|c| c.finish_reason.clone())
    }

    pub(crate) fn block_reason(&self) -> Option<String> {
        self.prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.clone())
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CountTokensResponse {
    total_tokens: usize,
}

#[derive(Deserialize, Debug)]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for the Gemini API.
///
/// The API key and model can be swapped at runtime (`configure`,
/// [`set_model`](LlmClient::set_model)); [`cancel`](LlmClient::cancel) aborts the
/// request currently awaiting a response.
pub struct GeminiClient {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
    api_key: RwLock<Option<String>>,
    model: RwLock<String>,
    cancel: Notify,
}

impl GeminiClient {
    /// Create a client with the given API key and the default model.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = Self::unconfigured()?;
        client.configure(&api_key.into())?;
        Ok(client)
    }

    /// Create a client without credentials. Every remote call fails with
    /// [`Error::Configuration`] until [`configure`](LlmClient::configure) is
    /// called.
    pub fn unconfigured() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("repolens/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: GEMINI_API_BASE.to_string(),
            api_key: RwLock::new(None),
            model: RwLock::new(DEFAULT_MODEL.to_string()),
            cancel: Notify::new(),
        })
    }

    /// Point the client at a different API root (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn model(&self) -> String {
        self.model.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn key(&self) -> Result<String> {
        self.api_key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::Configuration("Gemini API key is not set".into()))
    }

    pub(crate) fn method_url(&self, method: &str) -> String {
        format!("{}/models/{}:{method}", self.base_url, self.model())
    }

    /// Run `fut`, resolving to `Error::Cancelled` if [`cancel`](LlmClient::cancel)
    /// is called while it is pending.
    pub(crate) async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let notified = self.cancel.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        tokio::select! {
            res = fut => res,
            _ = &mut notified => {
                info!("Gemini request cancelled");
                Err(Error::Cancelled)
            }
        }
    }

    async fn post_json<B: Serialize>(&self, url: &str, body: &B) -> Result<String> {
        let key = self.key()?;
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(error_for_status("Gemini API", status.as_u16(), &text));
        }
        Ok(text)
    }

    async fn generate_inner(
        &self,
        parts: &[PromptPart],
        max_output_tokens: u32,
    ) -> Result<Generation> {
        let body = GenerateRequest {
            contents: to_contents(parts),
            generation_config: GenerationConfig { max_output_tokens },
        };
        debug!(
            "LLM request: model={}, parts={}, max_output_tokens={}",
            self.model(),
            parts.len(),
            max_output_tokens
        );
        let start = Instant::now();
        let text = self.post_json(&self.method_url("generateContent"), &body).await?;
        debug!(
            "LLM response in {:.1}s ({} bytes)",
            start.elapsed().as_secs_f64(),
            text.len()
        );

        let parsed: GenerateResponse = serde_json::from_str(&text)?;
        if let Some(ref usage) = parsed.usage_metadata {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_token_count.unwrap_or(0),
                usage.candidates_token_count.unwrap_or(0),
                usage.total_token_count.unwrap_or(0),
            );
        }

        let reply = parsed.text();
        if reply.is_empty() {
            let reason = parsed
                .block_reason()
                .or_else(|| parsed.finish_reason())
                .unwrap_or_else(|| "unknown".into());
            warn!("Gemini returned no text (reason: {reason})");
            return Err(Error::Api(format!("generation stopped, reason: {reason}")));
        }

        Ok(Generation {
            text: reply,
            finish_reason: parsed.finish_reason(),
            usage: parsed.usage_metadata.map(Into::into),
        })
    }
}

impl LlmClient for GeminiClient {
    fn configure(&self, api_key: &str) -> Result<()> {
        let key = api_key.trim();
        if key.is_empty() {
            return Err(Error::Configuration("Gemini API key is empty".into()));
        }
        *self.api_key.write().unwrap_or_else(|e| e.into_inner()) = Some(key.to_string());
        Ok(())
    }

    fn set_model(&self, model: &str) {
        info!("Gemini model set to {model}");
        *self.model.write().unwrap_or_else(|e| e.into_inner()) = model.to_string();
    }

    fn is_configured(&self) -> bool {
        self.api_key
            .read()
            .map(|k| k.is_some())
            .unwrap_or(false)
    }

    fn list_models(&self) -> LlmFuture<'_, Vec<String>> {
        Box::pin(async move {
            let key = self.key()?;
            let resp = self
                .client
                .get(format!("{}/models", self.base_url))
                .header("x-goog-api-key", key)
                .send()
                .await?;
            let status = resp.status();
            let text = resp.text().await?;
            if !status.is_success() {
                return Err(error_for_status("Gemini API", status.as_u16(), &text));
            }
            let parsed: ListModelsResponse = serde_json::from_str(&text)?;
            let models: Vec<String> = parsed
                .models
                .into_iter()
                .filter(|m| {
                    m.supported_generation_methods
                        .iter()
                        .any(|g| g == "generateContent")
                })
                .map(|m| match m.name.strip_prefix("models/") {
                    Some(short) => short.to_string(),
                    None => m.name.clone(),
                })
                .collect();
            debug!("Gemini lists {} generation models", models.len());
            Ok(models)
        })
    }

    fn count_tokens<'a>(&'a self, parts: &'a [PromptPart]) -> LlmFuture<'a, usize> {
        Box::pin(async move {
            let body = CountTokensRequest {
                contents: to_contents(parts),
            };
            let text = self
                .post_json(&self.method_url("countTokens"), &body)
                .await
                .map_err(|e| Error::CountingUnavailable(e.to_string()))?;
            let parsed: CountTokensResponse = serde_json::from_str(&text).map_err(|e| {
                Error::CountingUnavailable(format!(
                    "unparseable countTokens reply ({e}): {}",
                    preview(&text, 200)
                ))
            })?;
            Ok(parsed.total_tokens)
        })
    }

    fn generate<'a>(
        &'a self,
        parts: &'a [PromptPart],
        max_output_tokens: u32,
    ) -> LlmFuture<'a, Generation> {
        Box::pin(self.cancellable(self.generate_inner(parts, max_output_tokens)))
    }

    fn generate_stream<'a>(
        &'a self,
        parts: &'a [PromptPart],
        max_output_tokens: u32,
        on_chunk: &'a (dyn Fn(&str) + Send + Sync),
    ) -> LlmFuture<'a, Generation> {
        Box::pin(self.cancellable(self.stream_generate(parts, max_output_tokens, on_chunk)))
    }

    fn cancel(&self) {
        self.cancel.notify_waiters();
    }
}
