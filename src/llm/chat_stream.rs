use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;

use crate::error::{RagError, Result};
use crate::models::{ChatMessage, ModelParameters};
use crate::store::{ModelEndpoint, ProviderKind};

/// Raw response body of a streaming completion. Dropping it closes the
/// connection to the provider.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Everything the provider needs for one completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub parameters: ModelParameters,
}

/// Opens a streaming completion and hands back the undecoded bytes.
/// Frame decoding is the relay's job, so any transport that yields the
/// provider's byte stream can sit behind this trait.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn open(&self, endpoint: &ModelEndpoint, request: &CompletionRequest) -> Result<ByteStream>;
}

/// Streams chat completions from Ollama or an OpenAI-compatible API.
#[derive(Clone)]
pub struct HttpCompletionProvider {
    client: reqwest::Client,
}

impl HttpCompletionProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpCompletionProvider {
    /// The streaming POST for `request`. It carries no total timeout: a long
    /// completion may stream for as long as bytes keep arriving, and stalls
    /// are caught by the relay's idle timeout.
    fn build_request(&self, endpoint: &ModelEndpoint, request: &CompletionRequest) -> Result<reqwest::Request> {
        let (url, body) = match endpoint.provider_kind {
            ProviderKind::Ollama => (
                format!("{}/api/chat", endpoint.endpoint.trim_end_matches('/')),
                serde_json::to_value(ollama_body(&endpoint.model_name, request)),
            ),
            ProviderKind::OpenAi => (
                format!("{}/v1/chat/completions", endpoint.endpoint.trim_end_matches('/')),
                serde_json::to_value(openai_body(&endpoint.model_name, request)),
            ),
        };
        let body = body.map_err(|e| RagError::config(format!("Failed to encode chat request: {e}")))?;

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = endpoint.credential.as_deref() {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        builder
            .build()
            .map_err(|e| RagError::config(format!("Invalid chat request for {url}: {e}")))
    }
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn open(&self, endpoint: &ModelEndpoint, request: &CompletionRequest) -> Result<ByteStream> {
        let resp = self.client.execute(self.build_request(endpoint, request)?).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let message = format!("{} chat API returned {status}: {body}", endpoint.provider_kind);
            return Err(
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    RagError::transient(message)
                } else {
                    RagError::terminal(message)
                },
            );
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| RagError::transient(format!("Stream read error: {e}"))));
        Ok(Box::pin(stream))
    }
}

fn no_stops(stop: &&[String]) -> bool {
    stop.is_empty()
}

// ─── Ollama ──────────────────────────────────────────────

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaOptions<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>,
}

#[derive(Serialize)]
struct OllamaOptions<'a> {
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    num_predict: u32,
    #[serde(skip_serializing_if = "no_stops")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

fn ollama_body<'a>(model: &'a str, request: &'a CompletionRequest) -> OllamaChatRequest<'a> {
    let p = &request.parameters;
    OllamaChatRequest {
        model,
        messages: &request.messages,
        stream: true,
        options: OllamaOptions {
            temperature: p.temperature,
            top_p: p.top_p,
            frequency_penalty: p.frequency_penalty,
            presence_penalty: p.presence_penalty,
            num_predict: p.max_tokens,
            stop: &p.stop_sequences,
            seed: p.seed,
        },
        format: p.json_mode.then_some("json"),
    }
}

// ─── OpenAI-compatible ───────────────────────────────────

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "no_stops")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

fn openai_body<'a>(model: &'a str, request: &'a CompletionRequest) -> OpenAiChatRequest<'a> {
    let p = &request.parameters;
    OpenAiChatRequest {
        model,
        messages: &request.messages,
        stream: true,
        temperature: p.temperature,
        top_p: p.top_p,
        frequency_penalty: p.frequency_penalty,
        presence_penalty: p.presence_penalty,
        max_tokens: p.max_tokens,
        stop: &p.stop_sequences,
        seed: p.seed,
        response_format: p.json_mode.then_some(ResponseFormat {
            kind: "json_object",
        }),
    }
}
