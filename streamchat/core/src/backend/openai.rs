//! OpenAI-style Provider Adapter
//!
//! Streams from any endpoint speaking the OpenAI chat completions protocol.
//!
//! # Wire Format
//!
//! `POST {base_url}/chat/completions` with `"stream": true` answers with
//! server-sent events. Each `data:` payload is a JSON chunk whose text lives
//! at `choices[0].delta.content`; the literal payload `[DONE]` ends the
//! stream.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::stream::{spawn_stream_pump, ChunkParser, Framing, ParsedChunk, PumpSettings};
use super::traits::{ConversationContext, ProviderAdapter, ProviderError};
use crate::cancel::CancelToken;
use crate::messages::{MessageRole, TokenEvent};

/// Default public endpoint
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI chat completions backend
#[derive(Clone)]
pub struct OpenAiAdapter {
    name: String,
    base_url: String,
    api_key: String,
    http_client: reqwest::Client,
    settings: PumpSettings,
}

impl OpenAiAdapter {
    /// Create an adapter against the public OpenAI endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_base_url("openai", OPENAI_BASE_URL, api_key)
    }

    /// Create an adapter for any OpenAI-compatible endpoint
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

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    /// Build the request body
    fn build_body(context: &ConversationContext) -> serde_json::Value {
        let mut messages = Vec::with_capacity(context.messages.len() + 1);
        if let Some(ref system) = context.system {
            messages.push(serde_json::json!({
                "role": MessageRole::System.as_str(),
                "content": system,
            }));
        }
        for message in &context.messages {
            messages.push(serde_json::json!({
                "role": message.role.as_str(),
                "content": message.content,
            }));
        }

        let mut body = serde_json::json!({
            "model": context.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(temperature) = context.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = context.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }
}

impl std::fmt::Debug for OpenAiAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdapter")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Parser for chat completion chunks
#[derive(Debug, Default)]
pub(crate) struct OpenAiChunkParser;

impl ChunkParser for OpenAiChunkParser {
    fn parse(&mut self, payload: &str) -> Result<ParsedChunk, ProviderError> {
        if payload.trim() == "[DONE]" {
            return Ok(ParsedChunk::done());
        }

        let data: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| ProviderError::Malformed(format!("invalid chunk JSON: {e}")))?;

        if let Some(message) = data
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return Err(ProviderError::Stream(message.to_string()));
        }

        let Some(choice) = data
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            // Usage-only and keep-alive chunks carry no choices
            return Ok(ParsedChunk::default());
        };

        let text = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
            .map(String::from);

        Ok(ParsedChunk { text, done: false })
    }

    fn requires_done_marker(&self) -> bool {
        true
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.models_url())
            .bearer_auth(&self.api_key)
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
            "Opening chat completions stream"
        );

        let request = self
            .http_client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
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
            OpenAiChunkParser,
            cancel,
            self.settings,
        ))
    }
}
