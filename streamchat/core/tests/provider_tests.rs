//! HTTP provider integration tests
//!
//! Each test serves a canned streaming response from a local TCP listener
//! and then stalls, which exercises framing, read timeouts and cancellation
//! without reaching a real provider.

use std::net::SocketAddr;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use streamchat_core::backend::{OllamaAdapter, OpenAiAdapter, PumpSettings};
use streamchat_core::{
    CancelReason, CancelToken, ConversationContext, ErrorKind, MessageRole, ProviderAdapter,
    ProviderError, TokenEvent,
};

// =============================================================================
// Canned Server
// =============================================================================

/// Serve one response: status line, headers, then `chunks`, then stall
async fn serve_once(
    status: &'static str,
    content_type: &'static str,
    chunks: Vec<String>,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request_head(&mut stream).await;

        let head = format!(
            "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ntransfer-encoding: chunked\r\n\r\n"
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        for chunk in chunks {
            let framed = format!("{:x}\r\n{chunk}\r\n", chunk.len());
            stream.write_all(framed.as_bytes()).await.unwrap();
        }
        stream.flush().await.unwrap();

        // Keep the connection open without sending anything else
        std::future::pending::<()>().await;
        drop(stream);
    });

    addr
}

async fn read_request_head(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            return;
        }
        buf.push(byte[0]);
    }
}

fn settings(read_timeout: Duration) -> PumpSettings {
    PumpSettings {
        read_timeout,
        buffer: 16,
    }
}

fn context(model: &str) -> ConversationContext {
    ConversationContext::new(model)
        .with_system("be brief")
        .with_message(MessageRole::User, "hello")
}

async fn next(rx: &mut mpsc::Receiver<TokenEvent>) -> TokenEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within timeout")
        .expect("stream open")
}

fn sse(json: &str) -> String {
    format!("data: {json}\n\n")
}

// =============================================================================
// OpenAI-style SSE
// =============================================================================

#[tokio::test]
async fn test_openai_stream_to_done() {
    let addr = serve_once(
        "200 OK",
        "text/event-stream",
        vec![
            sse(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            sse(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#),
            sse(r#"{"choices":[{"delta":{"content":"lo"}}]}"#),
            sse("[DONE]"),
        ],
    )
    .await;
    let adapter = OpenAiAdapter::with_base_url("openai", format!("http://{addr}/v1"), "sk-test")
        .unwrap()
        .with_settings(settings(Duration::from_secs(5)));

    let mut rx = adapter
        .open_stream(&context("gpt-4o-mini"), CancelToken::detached())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, TokenEvent::fragment("Hel"));
    assert_eq!(next(&mut rx).await, TokenEvent::fragment("lo"));
    assert_eq!(next(&mut rx).await, TokenEvent::End);
}

#[tokio::test]
async fn test_stall_after_output_is_interrupted() {
    let addr = serve_once(
        "200 OK",
        "text/event-stream",
        vec![sse(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#)],
    )
    .await;
    let adapter = OpenAiAdapter::with_base_url("openai", format!("http://{addr}/v1"), "sk-test")
        .unwrap()
        .with_settings(settings(Duration::from_millis(200)));

    let mut rx = adapter
        .open_stream(&context("gpt-4o-mini"), CancelToken::detached())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, TokenEvent::fragment("Hel"));
    match next(&mut rx).await {
        TokenEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::ProviderInterrupted),
        other => panic!("expected timeout error, got {other:?}"),
    }
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_close_without_done_is_interrupted() {
    let addr = serve_once(
        "200 OK",
        "text/event-stream",
        vec![
            sse(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#),
            String::new(),
        ],
    )
    .await;
    let adapter = OpenAiAdapter::with_base_url("openai", format!("http://{addr}/v1"), "sk-test")
        .unwrap()
        .with_settings(settings(Duration::from_secs(5)));

    let mut rx = adapter
        .open_stream(&context("gpt-4o-mini"), CancelToken::detached())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, TokenEvent::fragment("Hel"));
    match next(&mut rx).await {
        TokenEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::ProviderInterrupted),
        other => panic!("truncated body must not end cleanly, got {other:?}"),
    }
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_stall_before_output_is_unavailable() {
    let addr = serve_once("200 OK", "text/event-stream", Vec::new()).await;
    let adapter = OpenAiAdapter::with_base_url("openai", format!("http://{addr}/v1"), "sk-test")
        .unwrap()
        .with_settings(settings(Duration::from_millis(200)));

    let mut rx = adapter
        .open_stream(&context("gpt-4o-mini"), CancelToken::detached())
        .await
        .unwrap();

    match next(&mut rx).await {
        TokenEvent::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::ProviderUnavailable);
            assert_eq!(message, ProviderError::Timeout.to_string());
        }
        other => panic!("expected timeout error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_while_waiting_for_data() {
    let addr = serve_once(
        "200 OK",
        "text/event-stream",
        vec![sse(r#"{"choices":[{"delta":{"content":"partial"}}]}"#)],
    )
    .await;
    let adapter = OpenAiAdapter::with_base_url("openai", format!("http://{addr}/v1"), "sk-test")
        .unwrap()
        .with_settings(settings(Duration::from_secs(30)));
    let cancel = CancelToken::detached();

    let mut rx = adapter
        .open_stream(&context("gpt-4o-mini"), cancel.clone())
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await, TokenEvent::fragment("partial"));

    assert!(cancel.cancel(CancelReason::Cancelled));
    assert_eq!(next(&mut rx).await, TokenEvent::cancelled());
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_auth_failure_rejects_open() {
    let addr = serve_once(
        "401 Unauthorized",
        "application/json",
        vec![r#"{"error":{"message":"bad key"}}"#.to_string(), String::new()],
    )
    .await;
    let adapter = OpenAiAdapter::with_base_url("openai", format!("http://{addr}/v1"), "sk-bad")
        .unwrap()
        .with_settings(settings(Duration::from_secs(5)));

    let result = adapter
        .open_stream(&context("gpt-4o-mini"), CancelToken::detached())
        .await;
    assert!(matches!(result, Err(ProviderError::Auth { status: 401 })));
}

// =============================================================================
// Ollama NDJSON
// =============================================================================

#[tokio::test]
async fn test_ollama_ndjson_stream() {
    let addr = serve_once(
        "200 OK",
        "application/x-ndjson",
        vec![
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hi \"},\"done\":false}\n".to_string(),
            "{\"message\":{\"role\":\"assistant\",\"content\":\"there\"},\"done\":false}\n{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n".to_string(),
        ],
    )
    .await;
    let adapter = OllamaAdapter::new("127.0.0.1", addr.port())
        .unwrap()
        .with_settings(settings(Duration::from_secs(5)));

    let mut rx = adapter
        .open_stream(&context("llama3.2"), CancelToken::detached())
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, TokenEvent::fragment("Hi "));
    assert_eq!(next(&mut rx).await, TokenEvent::fragment("there"));
    assert_eq!(next(&mut rx).await, TokenEvent::End);
}
