use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{RagError, Result};
use crate::llm::retry::RetryPolicy;

/// Maximum characters to send per text to the embedding API.
/// Chunks are normally far smaller; this only guards against oversized
/// queries tripping a provider's context limit.
const MAX_EMBED_CHARS: usize = 8_000;

/// Whole-request limit for one embedding batch.
const EMBED_TIMEOUT: Duration = Duration::from_secs(120);

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed every text or fail as a whole. A partial result is never
    /// returned.
    async fn embed_batch(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Generate embedding for a single text.
    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(model, &[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::terminal("no embedding returned"))
    }
}

/// Truncate `text` to at most `MAX_EMBED_CHARS`, splitting on a UTF-8 char boundary.
fn truncate_for_embedding(text: &str) -> &str {
    match text.char_indices().nth(MAX_EMBED_CHARS) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Check that a provider answered every input with vectors of one dimension.
pub fn validate_batch(expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected {
        return Err(RagError::terminal(format!(
            "embedding provider returned {} vectors for {expected} inputs",
            vectors.len()
        )));
    }
    if let Some(first) = vectors.first() {
        if first.is_empty() {
            return Err(RagError::terminal("embedding provider returned an empty vector"));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != first.len()) {
            return Err(RagError::terminal(format!(
                "embedding provider returned mixed dimensions ({} and {})",
                first.len(),
                bad.len()
            )));
        }
    }
    Ok(())
}

/// Classify a non-success HTTP status: rate limits and server errors are
/// worth retrying, everything else is terminal.
fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> RagError {
    let message = format!("{provider} embed API returned {status}: {body}");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        RagError::transient(message)
    } else {
        RagError::terminal(message)
    }
}

/// Embedder backed by Ollama or an OpenAI-compatible HTTP API.
#[derive(Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: LlmConfig,
    retry: RetryPolicy,
}

impl HttpEmbedder {
    pub fn new(client: reqwest::Client, config: LlmConfig, retry: RetryPolicy) -> Self {
        Self {
            client,
            config,
            retry,
        }
    }

    fn batch_size(&self) -> usize {
        match self.config.provider.as_str() {
            "ollama" => 32,
            _ => 64,
        }
    }

    async fn request(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self.config.provider.as_str() {
            "ollama" => self.embed_ollama(model, texts).await,
            "openai" => self.embed_openai(model, texts).await,
            other => Err(RagError::config(format!("Unknown LLM provider: {other}"))),
        }
    }

    // ─── Ollama ──────────────────────────────────────────

    async fn embed_ollama(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.config.base_url);
        let req = OllamaEmbedRequest {
            model: model.to_string(),
            input: texts.to_vec(),
            truncate: true,
        };

        let resp = self
            .client
            .post(&url)
            .timeout(EMBED_TIMEOUT)
            .json(&req)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error("Ollama", status, &body));
        }

        let body: OllamaEmbedResponse = resp
            .json()
            .await
            .map_err(|e| RagError::terminal(format!("Failed to parse Ollama embed response: {e}")))?;
        Ok(body.embeddings)
    }

    // ─── OpenAI-compatible ───────────────────────────────

    async fn embed_openai(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.config.base_url);
        let api_key = self.config.api_key.as_deref().unwrap_or_default();
        let req = OpenAiEmbedRequest {
            model: model.to_string(),
            input: texts.to_vec(),
        };

        let resp = self
            .client
            .post(&url)
            .timeout(EMBED_TIMEOUT)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&req)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error("OpenAI", status, &body));
        }

        let body: OpenAiEmbedResponse = resp
            .json()
            .await
            .map_err(|e| RagError::terminal(format!("Failed to parse OpenAI embed response: {e}")))?;

        let mut data = body.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let truncated: Vec<String> = texts
            .iter()
            .map(|t| truncate_for_embedding(t).to_string())
            .collect();

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in truncated.chunks(self.batch_size()) {
            let vectors = self
                .retry
                .run("embedding request", || self.request(model, batch))
                .await?;
            validate_batch(batch.len(), &vectors)?;
            all_embeddings.extend(vectors);
        }

        validate_batch(texts.len(), &all_embeddings)?;
        Ok(all_embeddings)
    }
}

#[derive(Serialize)]
struct OllamaEmbedRequest {
    model: String,
    input: Vec<String>,
    /// Ask Ollama to silently truncate inputs that exceed the model's context
    /// length instead of returning a 400 error.
    truncate: bool,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct OpenAiEmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedData>,
}

#[derive(Deserialize)]
struct OpenAiEmbedData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Serve a fake Ollama `/api/embed` that fails the first `failures` calls
    /// with the given status.
    async fn fake_ollama(failures: u32, status: StatusCode) -> (String, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let app = Router::new()
            .route(
                "/api/embed",
                post(
                    move |State(calls): State<Arc<AtomicU32>>,
                          Json(body): Json<serde_json::Value>| async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n < failures {
                            return Err(status);
                        }
                        let count = body["input"].as_array().map(|a| a.len()).unwrap_or(0);
                        let embeddings: Vec<Vec<f32>> = (0..count).map(|i| vec![i as f32, 1.0]).collect();
                        Ok(Json(serde_json::json!({ "embeddings": embeddings })))
                    },
                ),
            )
            .with_state(calls.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), calls)
    }

    fn embedder(base_url: String) -> HttpEmbedder {
        HttpEmbedder::new(
            reqwest::Client::new(),
            LlmConfig {
                base_url,
                ..LlmConfig::default()
            },
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let long = "é".repeat(MAX_EMBED_CHARS + 10);
        let t = truncate_for_embedding(&long);
        assert_eq!(t.chars().count(), MAX_EMBED_CHARS);
        assert_eq!(truncate_for_embedding("short"), "short");
    }

    #[test]
    fn test_validate_batch() {
        assert!(validate_batch(2, &[vec![1.0], vec![2.0]]).is_ok());
        assert!(validate_batch(3, &[vec![1.0], vec![2.0]]).is_err());
        assert!(validate_batch(2, &[vec![1.0], vec![2.0, 3.0]]).is_err());
        assert!(validate_batch(1, &[vec![]]).is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(status_error("x", reqwest::StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(status_error("x", reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!status_error("x", reqwest::StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (url, calls) = fake_ollama(2, StatusCode::SERVICE_UNAVAILABLE).await;
        let vectors = embedder(url)
            .embed_batch("nomic-embed-text", &["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_failure_aborts_batch() {
        let (url, calls) = fake_ollama(u32::MAX, StatusCode::INTERNAL_SERVER_ERROR).await;
        let err = embedder(url)
            .embed_batch("nomic-embed-text", &["a".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Provider { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (url, calls) = fake_ollama(u32::MAX, StatusCode::BAD_REQUEST).await;
        let result = embedder(url).embed("nomic-embed-text", "a").await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
