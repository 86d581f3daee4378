//! Gemini-style Provider Adapter
//!
//! Streams from the Google Generative Language API.
//!
//! # Wire Format
//!
//! `POST {base_url}/models/{model}:streamGenerateContent?alt=sse` with the
//! key in the `x-goog-api-key` header. Conversation turns go in `contents`
//! with roles `user` and `model`; the system prompt goes in
//! `systemInstruction`. Each SSE payload is a `GenerateContentResponse`
//! whose text is split across `candidates[0].content.parts[].text`. The
//! final chunk carries a `finishReason`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::stream::{spawn_stream_pump, ChunkParser, Framing, ParsedChunk, PumpSettings};
use super::traits::{ConversationContext, ProviderAdapter, ProviderError};
use crate::cancel::CancelToken;
use crate::messages::{MessageRole, TokenEvent};

/// Default public endpoint
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini streaming backend
#[derive(Clone)]
pub struct GeminiAdapter {
    name: String,
    base_url: String,
    api_key: String,
    http_client: reqwest::Client,
    settings: PumpSettings,
}

impl GeminiAdapter {
    /// Create an adapter against the public Gemini endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_base_url("gemini", GEMINI_BASE_URL, api_key)
    }

    /// Create an adapter for a custom endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_base_url(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http_client,
            settings: PumpSettings::default(),
        })
    }

    /// Override read timeout and channel buffer
    #[must_use]
    pub fn with_settings(mut self, settings: PumpSettings) -> Self {
        self.settings = settings;
        self
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/models/{model}:streamGenerateContent?alt=sse",
            self.base_url
        )
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    /// Build the request body
    fn build_body(context: &ConversationContext) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = context
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| {
                let role = match m.role {
                    MessageRole::Assistant => "model",
                    _ => "user",
                };
                serde_json::json!({
                    "role": role,
                    "parts": [{ "text": m.content }],
                })
            })
            .collect();

        let mut body = serde_json::json!({ "contents": contents });
        if let Some(ref system) = context.system {
            body["systemInstruction"] = serde_json::json!({
                "parts": [{ "text": system }],
            });
        }

        let mut generation = serde_json::Map::new();
        if let Some(temperature) = context.temperature {
            generation.insert("temperature".to_string(), serde_json::json!(temperature));
        }
        if let Some(max_tokens) = context.max_tokens {
            generation.insert("maxOutputTokens".to_string(), serde_json::json!(max_tokens));
        }
        if !generation.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation);
        }
        body
    }
}

impl std::fmt::Debug for GeminiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiAdapter")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Parser for `GenerateContentResponse` chunks
#[derive(Debug, Default)]
pub(crate) struct GeminiChunkParser;

impl ChunkParser for GeminiChunkParser {
    fn parse(&mut self, payload: &str) -> Result<ParsedChunk, ProviderError> {
        let data: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| ProviderError::Malformed(format!("invalid chunk JSON: {e}")))?;

        if let Some(message) = data
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return Err(ProviderError::Stream(message.to_string()));
        }

        if let Some(reason) = data
            .get("promptFeedback")
            .and_then(|f| f.get("blockReason"))
            .and_then(|r| r.as_str())
        {
            return Err(ProviderError::Stream(format!("prompt blocked: {reason}")));
        }

        let Some(candidate) = data
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return Ok(ParsedChunk::default());
        };

        let text: String = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let done = candidate
            .get("finishReason")
            .and_then(|r| r.as_str())
            .is_some_and(|r| !r.is_empty() && r != "FINISH_REASON_UNSPECIFIED");

        Ok(ParsedChunk {
            text: (!text.is_empty()).then_some(text),
            done,
        })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.models_url())
            .header("x-goog-api-key", &self.api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|r| r.status().is_success())
    }

    async fn open_stream(
        &self,
        context: &ConversationContext,
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<TokenEvent>, ProviderError> {
        let body = Self::build_body(context);
        tracing::debug!(
            adapter = %self.name,
            model = %context.model,
            messages = context.messages.len(),
            "Opening Gemini stream"
        );

        let request = self
            .http_client
            .post(self.stream_url(&context.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.send(TokenEvent::cancelled()).await;
                return Ok(rx);
            }
            response = request => response.map_err(|e| ProviderError::from_reqwest(&e))?,
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        Ok(spawn_stream_pump(
            self.name.clone(),
            response,
            Framing::Sse,
            GeminiChunkParser,
            cancel,
            self.settings,
        ))
    }
}
