//! Scripted Provider Adapter
//!
//! A deterministic in-process provider. It replays a fixed script of
//! fragments, delays and failures, or echoes the last user message back
//! word by word. Used for offline development and throughout the tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{ConversationContext, ProviderAdapter, ProviderError};
use crate::cancel::CancelToken;
use crate::messages::{MessageRole, TokenEvent};

/// One step of a script
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Emit a fragment
    Fragment(String),
    /// Pause before the next step (cut short by cancellation)
    Delay(Duration),
    /// Wait until cancelled
    Hang,
    /// Fail mid-stream
    Fail(ProviderError),
    /// End the stream successfully
    End,
}

#[derive(Clone, Debug)]
enum Behavior {
    /// Fail when opening, before any output
    Refuse(ProviderError),
    /// Replay steps; closing without a terminal step models an abrupt hangup
    Steps(Vec<ScriptStep>),
    /// Echo the last user message word by word
    Echo,
}

/// Adapter that replays a script
#[derive(Debug)]
pub struct ScriptedAdapter {
    name: String,
    behavior: Behavior,
    opened: AtomicUsize,
    last_context: Mutex<Option<ConversationContext>>,
}

impl ScriptedAdapter {
    /// Create an adapter with an empty script
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: Behavior::Steps(Vec::new()),
            opened: AtomicUsize::new(0),
            last_context: Mutex::new(None),
        }
    }

    /// Adapter that streams `fragments` then ends
    pub fn replying(name: impl Into<String>, fragments: &[&str]) -> Self {
        fragments
            .iter()
            .fold(Self::new(name), |adapter, f| adapter.fragment(*f))
            .end()
    }

    /// Adapter whose `open_stream` always fails
    pub fn refusing(name: impl Into<String>, error: ProviderError) -> Self {
        Self {
            behavior: Behavior::Refuse(error),
            ..Self::new(name)
        }
    }

    /// Adapter that echoes the last user message
    pub fn echo(name: impl Into<String>) -> Self {
        Self {
            behavior: Behavior::Echo,
            ..Self::new(name)
        }
    }

    fn push(mut self, step: ScriptStep) -> Self {
        if let Behavior::Steps(ref mut steps) = self.behavior {
            steps.push(step);
        } else {
            self.behavior = Behavior::Steps(vec![step]);
        }
        self
    }

    /// Append a fragment step
    #[must_use]
    pub fn fragment(self, text: impl Into<String>) -> Self {
        self.push(ScriptStep::Fragment(text.into()))
    }

    /// Append a delay step
    #[must_use]
    pub fn delay(self, delay: Duration) -> Self {
        self.push(ScriptStep::Delay(delay))
    }

    /// Append a step that waits for cancellation
    #[must_use]
    pub fn hang(self) -> Self {
        self.push(ScriptStep::Hang)
    }

    /// Append a mid-stream failure
    #[must_use]
    pub fn fail(self, error: ProviderError) -> Self {
        self.push(ScriptStep::Fail(error))
    }

    /// Append a successful end
    #[must_use]
    pub fn end(self) -> Self {
        self.push(ScriptStep::End)
    }

    /// How many times `open_stream` was called
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Context passed to the most recent `open_stream`
    #[must_use]
    pub fn last_context(&self) -> Option<ConversationContext> {
        self.last_context.lock().clone()
    }

    fn echo_steps(context: &ConversationContext) -> Vec<ScriptStep> {
        let text = context
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let mut steps: Vec<ScriptStep> = text
            .split_inclusive(' ')
            .map(|word| ScriptStep::Fragment(word.to_string()))
            .collect();
        steps.push(ScriptStep::End);
        steps
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> bool {
        !matches!(self.behavior, Behavior::Refuse(_))
    }

    async fn open_stream(
        &self,
        context: &ConversationContext,
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<TokenEvent>, ProviderError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.last_context.lock() = Some(context.clone());

        let steps = match &self.behavior {
            Behavior::Refuse(error) => return Err(error.clone()),
            Behavior::Steps(steps) => steps.clone(),
            Behavior::Echo => Self::echo_steps(context),
        };

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut emitted = 0usize;
            for step in steps {
                if cancel.is_cancelled() {
                    let _ = tx.send(TokenEvent::cancelled()).await;
                    return;
                }
                match step {
                    ScriptStep::Fragment(text) => {
                        emitted += 1;
                        if tx.send(TokenEvent::Fragment { text }).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::Delay(delay) => {
                        let _ = tokio::time::timeout(delay, cancel.cancelled()).await;
                    }
                    ScriptStep::Hang => cancel.cancelled().await,
                    ScriptStep::Fail(error) => {
                        let _ = tx.send(error.into_event(emitted > 0)).await;
                        return;
                    }
                    ScriptStep::End => {
                        let _ = tx.send(TokenEvent::End).await;
                        return;
                    }
                }
            }
            if cancel.is_cancelled() {
                let _ = tx.send(TokenEvent::cancelled()).await;
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use crate::error::ErrorKind;
    use pretty_assertions::assert_eq;

    async fn collect(mut rx: mpsc::Receiver<TokenEvent>) -> Vec<TokenEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_replying_script() {
        let adapter = ScriptedAdapter::replying("s", &["Hel", "lo"]);
        let rx = adapter
            .open_stream(&ConversationContext::new("m"), CancelToken::detached())
            .await
            .unwrap();
        assert_eq!(
            collect(rx).await,
            vec![
                TokenEvent::fragment("Hel"),
                TokenEvent::fragment("lo"),
                TokenEvent::End
            ]
        );
        assert_eq!(adapter.open_count(), 1);
    }

    #[tokio::test]
    async fn test_refusing_counts_open() {
        let adapter = ScriptedAdapter::refusing("down", ProviderError::Connect("refused".into()));
        let err = adapter
            .open_stream(&ConversationContext::new("m"), CancelToken::detached())
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Connect("refused".into()));
        assert_eq!(adapter.open_count(), 1);
        assert!(!adapter.health_check().await);
    }

    #[tokio::test]
    async fn test_failure_after_output_is_interrupted() {
        let adapter = ScriptedAdapter::new("s")
            .fragment("a")
            .fail(ProviderError::Stream("reset".into()));
        let rx = adapter
            .open_stream(&ConversationContext::new("m"), CancelToken::detached())
            .await
            .unwrap();
        let events = collect(rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            TokenEvent::Error { kind: ErrorKind::ProviderInterrupted, .. }
        ));
    }

    #[tokio::test]
    async fn test_hang_until_cancelled() {
        let adapter = ScriptedAdapter::new("s").fragment("a").hang().fragment("never");
        let cancel = CancelToken::detached();
        let mut rx = adapter
            .open_stream(&ConversationContext::new("m"), cancel.clone())
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(TokenEvent::fragment("a")));
        cancel.cancel(CancelReason::Cancelled);
        assert_eq!(rx.recv().await, Some(TokenEvent::cancelled()));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_echo_splits_words() {
        let adapter = ScriptedAdapter::echo("echo");
        let ctx = ConversationContext::new("echo")
            .with_message(MessageRole::User, "first")
            .with_message(MessageRole::Assistant, "ignored")
            .with_message(MessageRole::User, "hi there");
        let rx = adapter.open_stream(&ctx, CancelToken::detached()).await.unwrap();
        assert_eq!(
            collect(rx).await,
            vec![
                TokenEvent::fragment("hi "),
                TokenEvent::fragment("there"),
                TokenEvent::End
            ]
        );
        assert_eq!(adapter.last_context(), Some(ctx));
    }
}
