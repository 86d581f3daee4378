//! Shared streaming plumbing for HTTP providers
//!
//! HTTP adapters differ only in how a request is built and how one payload
//! is interpreted. Reading the body, splitting it into payloads (SSE events
//! or NDJSON lines), honoring cancellation and read timeouts, and emitting
//! the terminal event all happen here.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::ProviderError;
use crate::cancel::CancelToken;
use crate::messages::TokenEvent;

/// How a response body is divided into payloads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// Server-sent events; payload is the joined `data:` lines of an event
    Sse,
    /// Newline-delimited JSON; payload is one non-empty line
    Ndjson,
}

/// Incremental splitter for a streamed body
#[derive(Debug)]
pub struct PayloadDecoder {
    framing: Framing,
    buffer: String,
    /// Trailing bytes of a UTF-8 sequence split across chunks
    partial: Vec<u8>,
}

impl PayloadDecoder {
    /// Create a decoder for the given framing
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: String::new(),
            partial: Vec::new(),
        }
    }

    /// Feed raw bytes from the network
    pub fn push(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        let mut complete = match std::str::from_utf8(&self.partial) {
            Ok(_) => self.partial.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.partial.len(),
        };
        // Hold back a trailing CR until we know whether LF follows
        if complete > 0 && self.partial[complete - 1] == b'\r' {
            complete -= 1;
        }
        let chunk: Vec<u8> = self.partial.drain(..complete).collect();
        let text = String::from_utf8_lossy(&chunk);
        if text.contains('\r') {
            self.buffer.push_str(&text.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(&text);
        }
    }

    /// Next complete payload, if one is buffered
    pub fn next_payload(&mut self) -> Option<String> {
        loop {
            let (record, rest_at) = match self.framing {
                Framing::Sse => {
                    let pos = self.buffer.find("\n\n")?;
                    (self.buffer[..pos].to_string(), pos + 2)
                }
                Framing::Ndjson => {
                    let pos = self.buffer.find('\n')?;
                    (self.buffer[..pos].to_string(), pos + 1)
                }
            };
            self.buffer.drain(..rest_at);

            if let Some(payload) = self.extract(&record) {
                return Some(payload);
            }
        }
    }

    /// Payload left in the buffer when the body ends without a delimiter
    pub fn finish(&mut self) -> Option<String> {
        let mut record = std::mem::take(&mut self.buffer);
        let tail = std::mem::take(&mut self.partial);
        record.push_str(&String::from_utf8_lossy(&tail));
        self.extract(&record)
    }

    fn extract(&self, record: &str) -> Option<String> {
        match self.framing {
            Framing::Ndjson => {
                let line = record.trim();
                (!line.is_empty()).then(|| line.to_string())
            }
            Framing::Sse => {
                let data: Vec<&str> = record
                    .lines()
                    .filter_map(|line| line.strip_prefix("data:"))
                    .map(|value| value.strip_prefix(' ').unwrap_or(value))
                    .collect();
                (!data.is_empty()).then(|| data.join("\n"))
            }
        }
    }
}

/// Interpretation of one payload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedChunk {
    /// Text to emit, if any
    pub text: Option<String>,
    /// Whether the provider signaled the end of the reply
    pub done: bool,
}

impl ParsedChunk {
    /// Chunk carrying text
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            done: false,
        }
    }

    /// End-of-reply chunk
    #[must_use]
    pub fn done() -> Self {
        Self {
            text: None,
            done: true,
        }
    }
}

/// Provider-specific payload interpretation
pub trait ChunkParser: Send + 'static {
    /// Parse a single payload
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Malformed`] (or a provider-reported error)
    /// when the payload cannot be used.
    fn parse(&mut self, payload: &str) -> Result<ParsedChunk, ProviderError>;

    /// Whether a body that closes without a done payload is truncated
    ///
    /// Protocols that end with an explicit marker return `true`; for them a
    /// clean close after output is reported as a stream failure.
    fn requires_done_marker(&self) -> bool {
        false
    }
}

/// Knobs shared by every HTTP stream
#[derive(Clone, Copy, Debug)]
pub struct PumpSettings {
    /// Longest wait for the next body chunk
    pub read_timeout: Duration,
    /// Capacity of the event channel
    pub buffer: usize,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            buffer: 64,
        }
    }
}

/// Drive a streaming HTTP response into a [`TokenEvent`] channel
///
/// The spawned task ends after sending exactly one terminal event, or as
/// soon as the receiver is dropped.
pub fn spawn_stream_pump<P: ChunkParser>(
    adapter: String,
    response: reqwest::Response,
    framing: Framing,
    mut parser: P,
    cancel: CancelToken,
    settings: PumpSettings,
) -> mpsc::Receiver<TokenEvent> {
    let (tx, rx) = mpsc::channel(settings.buffer.max(1));

    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut decoder = PayloadDecoder::new(framing);
        let mut emitted = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(adapter = %adapter, emitted = emitted, "Stream cancelled");
                    let _ = tx.send(TokenEvent::cancelled()).await;
                    return;
                }
                next = tokio::time::timeout(settings.read_timeout, body.next()) => next,
            };

            let bytes = match next {
                Err(_) => {
                    tracing::warn!(adapter = %adapter, emitted = emitted, "Provider read timed out");
                    let _ = tx.send(ProviderError::Timeout.into_event(emitted > 0)).await;
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let err = ProviderError::from_reqwest(&e);
                    tracing::warn!(adapter = %adapter, error = %err, "Provider stream failed");
                    let _ = tx.send(err.into_event(emitted > 0)).await;
                    return;
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            decoder.push(&bytes);
            while let Some(payload) = decoder.next_payload() {
                match relay_payload(&payload, &mut parser, &cancel, &tx, &mut emitted).await {
                    Flow::Continue => {}
                    Flow::Stop => return,
                }
            }
        }

        // Body ended; an unterminated trailing payload is still usable
        if let Some(payload) = decoder.finish() {
            if let Flow::Stop =
                relay_payload(&payload, &mut parser, &cancel, &tx, &mut emitted).await
            {
                return;
            }
        }

        if emitted > 0 && parser.requires_done_marker() {
            tracing::warn!(adapter = %adapter, emitted = emitted, "Stream closed before done marker");
            let err = ProviderError::Stream("stream closed before completion marker".to_string());
            let _ = tx.send(err.into_event(true)).await;
        } else if emitted > 0 {
            let _ = tx.send(TokenEvent::End).await;
        } else {
            let err = ProviderError::Stream("stream closed before any output".to_string());
            let _ = tx.send(err.into_event(false)).await;
        }
    });

    rx
}

enum Flow {
    Continue,
    Stop,
}

async fn relay_payload<P: ChunkParser>(
    payload: &str,
    parser: &mut P,
    cancel: &CancelToken,
    tx: &mpsc::Sender<TokenEvent>,
    emitted: &mut usize,
) -> Flow {
    if cancel.is_cancelled() {
        let _ = tx.send(TokenEvent::cancelled()).await;
        return Flow::Stop;
    }

    match parser.parse(payload) {
        Ok(chunk) => {
            if let Some(text) = chunk.text.filter(|t| !t.is_empty()) {
                *emitted += 1;
                if tx.send(TokenEvent::Fragment { text }).await.is_err() {
                    // Receiver dropped, stop streaming
                    return Flow::Stop;
                }
            }
            if chunk.done {
                let _ = tx.send(TokenEvent::End).await;
                return Flow::Stop;
            }
            Flow::Continue
        }
        Err(e) => {
            let _ = tx.send(e.into_event(*emitted > 0)).await;
            Flow::Stop
        }
    }
}
