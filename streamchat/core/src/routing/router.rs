//! Model Router
//!
//! Resolves a requested model name to its fallback chain and drives the
//! chain for one request. Fallback happens only before the first fragment:
//! once a target has produced output the router commits to it, and any
//! later failure ends the stream with a `ProviderInterrupted` marker.
//!
//! The router holds only the static model table. Per-request state lives in
//! the spawned routing task.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::fallback::{FallbackAttempts, FallbackChain, RouteTarget, RouterBuildError};
use crate::backend::{ConversationContext, ProviderAdapter};
use crate::cancel::CancelToken;
use crate::error::{ChatError, ErrorKind};
use crate::messages::{ModelInfo, TokenEvent};

/// Default maximum chain depth (primary plus fallbacks)
pub const DEFAULT_MAX_FALLBACK_DEPTH: usize = 4;

/// Default capacity of the routed event channel
const DEFAULT_STREAM_BUFFER: usize = 64;

// ============================================================================
// Routed Stream
// ============================================================================

/// Lazy, ordered event sequence for one routed request
///
/// Ends with exactly one terminal event unless the router task was torn
/// down by cancellation before it could send one.
pub struct RoutedStream {
    events: ReceiverStream<TokenEvent>,
    requested: String,
    served: Arc<Mutex<String>>,
}

impl RoutedStream {
    /// Next event, or `None` once the sequence is exhausted
    pub async fn recv(&mut self) -> Option<TokenEvent> {
        self.events.next().await
    }

    /// Model name as requested
    #[must_use]
    pub fn requested_model(&self) -> &str {
        &self.requested
    }

    /// Upstream model of the target that produced output
    ///
    /// Before any target commits this is the primary target's model.
    #[must_use]
    pub fn served_model(&self) -> String {
        self.served.lock().clone()
    }
}

impl Stream for RoutedStream {
    type Item = TokenEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl std::fmt::Debug for RoutedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedStream")
            .field("requested", &self.requested)
            .field("served", &*self.served.lock())
            .finish_non_exhaustive()
    }
}

/// Reachability of one routed adapter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHealth {
    /// Adapter name
    pub adapter: String,
    /// Whether the adapter answered its health check
    pub healthy: bool,
}

// ============================================================================
// Router
// ============================================================================

/// Static model table plus fallback ordering
#[derive(Clone, Debug)]
pub struct ModelRouter {
    routes: HashMap<String, FallbackChain>,
    default_model: Option<String>,
    stream_buffer: usize,
}

impl ModelRouter {
    /// Start building a router
    #[must_use]
    pub fn builder() -> ModelRouterBuilder {
        ModelRouterBuilder::default()
    }

    /// Default model used when a request names none
    #[must_use]
    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    /// Whether a model is routable
    #[must_use]
    pub fn contains(&self, model: &str) -> bool {
        self.routes.contains_key(model)
    }

    /// Known models with their primary provider, sorted by model name
    #[must_use]
    pub fn list_models(&self) -> Vec<ModelInfo> {
        let mut models: Vec<ModelInfo> = self
            .routes
            .values()
            .map(|chain| ModelInfo {
                model: chain.model.clone(),
                provider: chain
                    .primary()
                    .map(|t| t.adapter.name().to_string())
                    .unwrap_or_default(),
            })
            .collect();
        models.sort();
        models
    }

    /// Run every routed adapter's health check concurrently
    ///
    /// Each adapter is checked once even when it serves several models.
    /// Results are sorted by adapter name.
    pub async fn health(&self) -> Vec<ProviderHealth> {
        let mut adapters: BTreeMap<&str, &Arc<dyn ProviderAdapter>> = BTreeMap::new();
        for target in self.routes.values().flat_map(|chain| chain.targets.iter()) {
            adapters
                .entry(target.adapter.name())
                .or_insert(&target.adapter);
        }

        let checks = adapters.into_iter().map(|(name, adapter)| async move {
            let healthy = adapter.health_check().await;
            if !healthy {
                tracing::warn!(adapter = %name, "Provider health check failed");
            }
            ProviderHealth {
                adapter: name.to_string(),
                healthy,
            }
        });
        futures::future::join_all(checks).await
    }

    /// Resolve a requested model (or the default) to its chain
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownModel`] if there is no route.
    pub fn resolve(&self, model: Option<&str>) -> Result<&FallbackChain, ChatError> {
        let name = model
            .or(self.default_model.as_deref())
            .unwrap_or_default();
        self.routes.get(name).ok_or_else(|| ChatError::UnknownModel {
            model: name.to_string(),
        })
    }

    /// Stream a reply for `model`
    ///
    /// Unknown models fail immediately without contacting any adapter.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::UnknownModel`] if there is no route.
    pub fn stream(
        &self,
        model: &str,
        context: &ConversationContext,
        cancel: CancelToken,
    ) -> Result<RoutedStream, ChatError> {
        let chain = self.resolve(Some(model))?.clone();
        let served = Arc::new(Mutex::new(
            chain
                .primary()
                .map(|t| t.model.clone())
                .unwrap_or_else(|| chain.model.clone()),
        ));

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        tokio::spawn(drive_chain(
            chain,
            context.clone(),
            cancel,
            tx,
            Arc::clone(&served),
        ));

        Ok(RoutedStream {
            events: ReceiverStream::new(rx),
            requested: model.to_string(),
            served,
        })
    }
}

/// Forward one event unless cancelled first; `false` means stop
async fn forward(tx: &mpsc::Sender<TokenEvent>, cancel: &CancelToken, event: TokenEvent) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

/// Run the fallback chain for one request
async fn drive_chain(
    chain: FallbackChain,
    context: ConversationContext,
    cancel: CancelToken,
    tx: mpsc::Sender<TokenEvent>,
    served: Arc<Mutex<String>>,
) {
    let mut attempts = FallbackAttempts::new();

    for (index, target) in chain.targets.iter().enumerate() {
        if cancel.is_cancelled() {
            let _ = tx.send(TokenEvent::cancelled()).await;
            return;
        }

        if index > 0 {
            tracing::warn!(
                model = %chain.model,
                target = %target.label(),
                attempt = index + 1,
                "Primary target unavailable, attempting fallback"
            );
        }

        let upstream = context.for_model(&target.model);
        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = tx.send(TokenEvent::cancelled()).await;
                return;
            }
            opened = target.adapter.open_stream(&upstream, cancel.clone()) => opened,
        };

        let mut rx = match opened {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(target = %target.label(), error = %e, "Target failed to open");
                attempts.record(target, e.to_string());
                continue;
            }
        };

        let first = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = tx.send(TokenEvent::cancelled()).await;
                return;
            }
            first = rx.recv() => first,
        };

        match first {
            Some(TokenEvent::Fragment { text }) => {
                commit(&chain, target, &served);
                if forward(&tx, &cancel, TokenEvent::Fragment { text }).await {
                    relay_committed(target, rx, &tx, &cancel).await;
                }
                return;
            }
            Some(TokenEvent::End) => {
                commit(&chain, target, &served);
                let _ = tx.send(TokenEvent::End).await;
                return;
            }
            Some(TokenEvent::Error {
                kind: ErrorKind::Cancelled,
                ..
            }) => {
                let _ = tx.send(TokenEvent::cancelled()).await;
                return;
            }
            Some(TokenEvent::Error { message, .. }) => {
                tracing::warn!(target = %target.label(), error = %message, "Target failed before output");
                attempts.record(target, message);
            }
            None => {
                attempts.record(target, "stream closed before any output");
            }
        }
    }

    tracing::warn!(
        model = %chain.model,
        attempts = attempts.count(),
        "All route targets failed"
    );
    let _ = tx
        .send(TokenEvent::error(
            ErrorKind::ProviderUnavailable,
            attempts.summary(),
        ))
        .await;
}

fn commit(chain: &FallbackChain, target: &RouteTarget, served: &Mutex<String>) {
    tracing::debug!(model = %chain.model, target = %target.label(), "Route committed");
    *served.lock() = target.model.clone();
}

/// Relay the remainder of a committed stream; no fallback from here on
async fn relay_committed(
    target: &RouteTarget,
    mut rx: mpsc::Receiver<TokenEvent>,
    tx: &mpsc::Sender<TokenEvent>,
    cancel: &CancelToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = tx.send(TokenEvent::cancelled()).await;
                return;
            }
            next = rx.recv() => next,
        };

        match next {
            Some(TokenEvent::Fragment { text }) => {
                if !forward(tx, cancel, TokenEvent::Fragment { text }).await {
                    return;
                }
            }
            Some(TokenEvent::End) => {
                let _ = tx.send(TokenEvent::End).await;
                return;
            }
            Some(TokenEvent::Error {
                kind: ErrorKind::Cancelled,
                ..
            }) => {
                let _ = tx.send(TokenEvent::cancelled()).await;
                return;
            }
            Some(TokenEvent::Error { message, .. }) => {
                tracing::warn!(target = %target.label(), error = %message, "Target interrupted after output");
                let _ = tx
                    .send(TokenEvent::error(ErrorKind::ProviderInterrupted, message))
                    .await;
                return;
            }
            None => {
                tracing::warn!(target = %target.label(), "Target closed without a terminal event");
                let _ = tx
                    .send(TokenEvent::error(
                        ErrorKind::ProviderInterrupted,
                        "stream closed unexpectedly",
                    ))
                    .await;
                return;
            }
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`ModelRouter`]
#[derive(Default)]
pub struct ModelRouterBuilder {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    routes: Vec<(String, String, String)>,
    default_model: Option<String>,
    max_fallback_depth: Option<usize>,
    stream_buffer: Option<usize>,
}

impl ModelRouterBuilder {
    /// Register an adapter under its own name
    #[must_use]
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.name().to_string(), adapter);
        self
    }

    /// Route `model` to `adapter` under the same upstream name
    ///
    /// The first target added for a model is its primary.
    #[must_use]
    pub fn route(self, model: &str, adapter: &str) -> Self {
        self.target(model, adapter, model)
    }

    /// Add a target for `model` served by `adapter` as `upstream_model`
    #[must_use]
    pub fn target(mut self, model: &str, adapter: &str, upstream_model: &str) -> Self {
        self.routes.push((
            model.to_string(),
            adapter.to_string(),
            upstream_model.to_string(),
        ));
        self
    }

    /// Set the default model
    #[must_use]
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Set the maximum chain depth
    #[must_use]
    pub fn max_fallback_depth(mut self, depth: usize) -> Self {
        self.max_fallback_depth = Some(depth);
        self
    }

    /// Set the routed channel capacity
    #[must_use]
    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = Some(buffer);
        self
    }

    /// Assemble and validate the router
    ///
    /// # Errors
    ///
    /// Returns an error for unknown adapters, invalid chains or a default
    /// model without a route.
    pub fn build(self) -> Result<ModelRouter, RouterBuildError> {
        let max_depth = self.max_fallback_depth.unwrap_or(DEFAULT_MAX_FALLBACK_DEPTH);
        let mut routes: HashMap<String, FallbackChain> = HashMap::new();

        for (model, adapter_name, upstream) in self.routes {
            let adapter = self
                .adapters
                .get(&adapter_name)
                .cloned()
                .ok_or(RouterBuildError::UnknownAdapter { name: adapter_name })?;
            let chain = routes
                .entry(model.clone())
                .or_insert_with(|| FallbackChain::new(model));
            chain.targets.push(RouteTarget::new(adapter, upstream));
        }

        for chain in routes.values() {
            chain.validate(max_depth)?;
        }

        if let Some(ref model) = self.default_model {
            if !routes.contains_key(model) {
                return Err(RouterBuildError::UnknownDefaultModel {
                    model: model.clone(),
                });
            }
        }

        tracing::info!(
            models = routes.len(),
            default_model = ?self.default_model,
            "Model router ready"
        );

        Ok(ModelRouter {
            routes,
            default_model: self.default_model,
            stream_buffer: self.stream_buffer.unwrap_or(DEFAULT_STREAM_BUFFER).max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ProviderError, ScriptedAdapter};
    use crate::cancel::CancelReason;
    use pretty_assertions::assert_eq;

    async fn collect(mut stream: RoutedStream) -> Vec<TokenEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_list_models_sorted() {
        let router = ModelRouter::builder()
            .adapter(Arc::new(ScriptedAdapter::new("openai")))
            .adapter(Arc::new(ScriptedAdapter::new("gemini")))
            .route("gpt-4o", "openai")
            .route("gemini-1.5-flash", "gemini")
            .route("gpt-4o-mini", "openai")
            .build()
            .unwrap();

        let names: Vec<String> = router.list_models().into_iter().map(|m| m.model).collect();
        assert_eq!(names, vec!["gemini-1.5-flash", "gpt-4o", "gpt-4o-mini"]);
        assert_eq!(router.list_models()[0].provider, "gemini");
    }

    #[tokio::test]
    async fn test_health_checks_each_adapter_once() {
        let up = Arc::new(ScriptedAdapter::replying("up", &["ok"]));
        let down = Arc::new(ScriptedAdapter::refusing(
            "down",
            ProviderError::Connect("refused".to_string()),
        ));
        let router = ModelRouter::builder()
            .adapter(up)
            .adapter(down)
            .route("a", "up")
            .route("b", "up")
            .target("b", "down", "b-fallback")
            .build()
            .unwrap();

        assert_eq!(
            router.health().await,
            vec![
                ProviderHealth {
                    adapter: "down".to_string(),
                    healthy: false,
                },
                ProviderHealth {
                    adapter: "up".to_string(),
                    healthy: true,
                },
            ]
        );
    }

    #[test]
    fn test_build_rejects_unknown_adapter() {
        let err = ModelRouter::builder()
            .route("gpt-4o", "openai")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            RouterBuildError::UnknownAdapter {
                name: "openai".to_string()
            }
        );
    }

    #[test]
    fn test_build_rejects_unrouted_default() {
        let err = ModelRouter::builder()
            .adapter(Arc::new(ScriptedAdapter::new("openai")))
            .route("gpt-4o", "openai")
            .default_model("gpt-4o-mini")
            .build()
            .unwrap_err();
        assert!(matches!(err, RouterBuildError::UnknownDefaultModel { .. }));
    }

    #[test]
    fn test_resolve_uses_default() {
        let router = ModelRouter::builder()
            .adapter(Arc::new(ScriptedAdapter::new("openai")))
            .route("gpt-4o-mini", "openai")
            .default_model("gpt-4o-mini")
            .build()
            .unwrap();

        assert_eq!(router.resolve(None).unwrap().model, "gpt-4o-mini");
        assert!(matches!(
            router.resolve(Some("nope")),
            Err(ChatError::UnknownModel { model }) if model == "nope"
        ));
    }

    #[tokio::test]
    async fn test_served_model_tracks_fallback() {
        let router = ModelRouter::builder()
            .adapter(Arc::new(ScriptedAdapter::refusing(
                "openai",
                ProviderError::Auth { status: 401 },
            )))
            .adapter(Arc::new(ScriptedAdapter::replying("gemini", &["ok"])))
            .route("gpt-4o", "openai")
            .target("gpt-4o", "gemini", "gemini-1.5-flash")
            .build()
            .unwrap();

        let mut stream = router
            .stream("gpt-4o", &ConversationContext::new("gpt-4o"), CancelToken::detached())
            .unwrap();
        assert_eq!(stream.recv().await, Some(TokenEvent::fragment("ok")));
        assert_eq!(stream.served_model(), "gemini-1.5-flash");
        assert_eq!(stream.requested_model(), "gpt-4o");
        assert_eq!(stream.recv().await, Some(TokenEvent::End));
    }

    #[tokio::test]
    async fn test_empty_completion_is_not_a_failure() {
        let primary = Arc::new(ScriptedAdapter::new("a").end());
        let secondary = Arc::new(ScriptedAdapter::replying("b", &["unused"]));
        let router = ModelRouter::builder()
            .adapter(primary)
            .adapter(secondary.clone())
            .route("m", "a")
            .route("m", "b")
            .build()
            .unwrap();

        let events = collect(
            router
                .stream("m", &ConversationContext::new("m"), CancelToken::detached())
                .unwrap(),
        )
        .await;
        assert_eq!(events, vec![TokenEvent::End]);
        assert_eq!(secondary.open_count(), 0);
    }

    #[tokio::test]
    async fn test_close_before_output_falls_back() {
        // Script without a terminal step: the channel just closes
        let primary = Arc::new(ScriptedAdapter::new("a"));
        let router = ModelRouter::builder()
            .adapter(primary.clone())
            .adapter(Arc::new(ScriptedAdapter::replying("b", &["fine"])))
            .route("m", "a")
            .route("m", "b")
            .build()
            .unwrap();

        let events = collect(
            router
                .stream("m", &ConversationContext::new("m"), CancelToken::detached())
                .unwrap(),
        )
        .await;
        assert_eq!(events, vec![TokenEvent::fragment("fine"), TokenEvent::End]);
        assert_eq!(primary.open_count(), 1);
    }

    #[tokio::test]
    async fn test_all_targets_fail() {
        let router = ModelRouter::builder()
            .adapter(Arc::new(ScriptedAdapter::refusing(
                "a",
                ProviderError::Connect("refused".into()),
            )))
            .adapter(Arc::new(
                ScriptedAdapter::new("b").fail(ProviderError::Http {
                    status: 503,
                    body: "busy".into(),
                }),
            ))
            .route("m", "a")
            .route("m", "b")
            .build()
            .unwrap();

        let events = collect(
            router
                .stream("m", &ConversationContext::new("m"), CancelToken::detached())
                .unwrap(),
        )
        .await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            TokenEvent::Error { kind, message } => {
                assert_eq!(*kind, ErrorKind::ProviderUnavailable);
                assert!(message.contains("a:m (Connection failed: refused)"));
                assert!(message.contains("b:m (HTTP 503: busy)"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let router = ModelRouter::builder()
            .adapter(Arc::new(ScriptedAdapter::new("a").fragment("x").hang()))
            .route("m", "a")
            .build()
            .unwrap();

        let cancel = CancelToken::detached();
        let mut stream = router
            .stream("m", &ConversationContext::new("m"), cancel.clone())
            .unwrap();
        assert_eq!(stream.recv().await, Some(TokenEvent::fragment("x")));

        cancel.cancel(CancelReason::Cancelled);
        assert_eq!(stream.recv().await, Some(TokenEvent::cancelled()));
        assert_eq!(stream.recv().await, None);
    }
}
