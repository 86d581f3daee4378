//! Ollama Provider Adapter
//!
//! Streams from a local Ollama server.
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions with message history (NDJSON stream)
//! - `/api/tags` - List installed models (used for health checks)
//!
//! Each NDJSON line carries `message.content`; the final line has
//! `"done": true`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::stream::{spawn_stream_pump, ChunkParser, Framing, ParsedChunk, PumpSettings};
use super::traits::{ConversationContext, ProviderAdapter, ProviderError};
use crate::cancel::CancelToken;
use crate::messages::TokenEvent;

/// Ollama backend client
#[derive(Clone, Debug)]
pub struct OllamaAdapter {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// HTTP client
    http_client: reqwest::Client,
    settings: PumpSettings,
}

impl OllamaAdapter {
    /// Create a new Ollama adapter
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::Connect(e.to_string()))?;

        Ok(Self {
            host: host.into(),
            port,
            http_client,
            // Local models can take a while to load before the first token
            settings: PumpSettings {
                read_timeout: Duration::from_secs(120),
                ..PumpSettings::default()
            },
        })
    }

    /// Create from `OLLAMA_HOST` / `OLLAMA_PORT`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_env() -> Result<Self, ProviderError> {
        let host = std::env::var("OLLAMA_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);

        Self::new(host, port)
    }

    /// Override read timeout and channel buffer
    #[must_use]
    pub fn with_settings(mut self, settings: PumpSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Build the request body
    fn build_body(context: &ConversationContext) -> serde_json::Value {
        let mut messages = Vec::with_capacity(context.messages.len() + 1);
        if let Some(ref system) = context.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
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

        let mut options = serde_json::Map::new();
        if let Some(temperature) = context.temperature {
            options.insert("temperature".to_string(), serde_json::json!(temperature));
        }
        if let Some(max_tokens) = context.max_tokens {
            options.insert("num_predict".to_string(), serde_json::json!(max_tokens));
        }
        if !options.is_empty() {
            body["options"] = serde_json::Value::Object(options);
        }
        body
    }
}

/// Parser for `/api/chat` NDJSON lines
#[derive(Debug, Default)]
pub(crate) struct OllamaChunkParser;

impl ChunkParser for OllamaChunkParser {
    fn parse(&mut self, payload: &str) -> Result<ParsedChunk, ProviderError> {
        let data: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| ProviderError::Malformed(format!("invalid NDJSON line: {e}")))?;

        if let Some(error) = data.get("error").and_then(|e| e.as_str()) {
            return Err(ProviderError::Stream(error.to_string()));
        }

        let text = data
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(String::from);

        let done = data
            .get("done")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        Ok(ParsedChunk { text, done })
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }

    async fn open_stream(
        &self,
        context: &ConversationContext,
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<TokenEvent>, ProviderError> {
        let body = Self::build_body(context);
        tracing::debug!(model = %context.model, url = %self.chat_url(), "Opening Ollama stream");

        let request = self.http_client.post(self.chat_url()).json(&body).send();

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.send(TokenEvent::cancelled()).await;
                return Ok(rx);
            }
            response = request => response.map_err(|e| ProviderError::from_reqwest(&e))?,
        };

        // Check for HTTP errors
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        Ok(spawn_stream_pump(
            self.name().to_string(),
            response,
            Framing::Ndjson,
            OllamaChunkParser,
            cancel,
            self.settings,
        ))
    }
}
