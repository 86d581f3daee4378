//! Unix Socket Chat Server
//!
//! This module provides the core server loop for the StreamChat daemon:
//! - Accepts connections on a Unix socket (owner-only permissions)
//! - Rejects peers running as a different user (`SO_PEERCRED`)
//! - Spawns one handler task per connection
//! - Spawns one task per `send`, so a connection can stream several
//!   sessions and still answer `cancel`/`history` while tokens flow
//! - Stops accepting on the shutdown signal and aborts live connections
//!
//! # Wire Protocol
//!
//! One JSON object per line in each direction:
//!
//! ```text
//! client: {"type":"send","session_id":"s1","message":"Hello"}
//! server: {"type":"started","session_id":"s1","model":"gpt-4o-mini"}
//! server: {"type":"token","session_id":"s1","token":"Hi"}
//! client: {"type":"ping"}
//! server: {"type":"pong"}
//! client: {"type":"health"}
//! server: {"type":"health","health":{"status":"ok","providers":[...],"models":[...],"sessions":1}}
//! server: {"type":"token","session_id":"s1","token":" there"}
//! server: {"type":"done","session_id":"s1","model":"gpt-4o-mini","total_length":8}
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

use streamchat_core::transport::{ClientFrame, FrameSink, ServerFrame};
use streamchat_core::{
    CallerKey, ChatError, ChatRequest, ErrorKind, SessionId, SessionManager, StreamOutcome,
};

/// Connection state tracking
struct ConnectionState {
    /// Accept time
    connected_at: std::time::Instant,
    /// Client uid, when the platform reports one
    peer_uid: Option<u32>,
    /// Aborts the connection task on shutdown
    abort_handle: tokio::task::AbortHandle,
}

/// Accept-loop limits
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Connections beyond this are dropped on accept
    pub max_connections: usize,
    /// Per-connection outbound frame capacity
    pub connection_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            connection_channel_capacity: 256,
        }
    }
}

/// Chat server listening on a Unix socket
pub struct DaemonServer {
    /// Socket file clients connect to
    socket_path: PathBuf,
    /// Shared session manager
    manager: Arc<SessionManager>,
    /// Server configuration
    server_config: ServerConfig,
    /// Bookkeeping for one live client connection
    connection_states: Arc<DashMap<u64, ConnectionState>>,
    /// Source of connection ids
    next_conn_id: AtomicU64,
}

impl DaemonServer {
    /// Server bound to `socket_path` once [`DaemonServer::run`] starts
    pub fn new(socket_path: PathBuf, manager: Arc<SessionManager>) -> Self {
        Self {
            socket_path,
            manager,
            server_config: ServerConfig::default(),
            connection_states: Arc::new(DashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Uid of the process on the other end of `stream`
    #[cfg(target_os = "linux")]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let fd = stream.as_raw_fd();
        // SAFETY: ucred is plain old data; zeroed is a valid value
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        #[allow(clippy::cast_possible_truncation)]
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: fd is a live socket owned by `stream`; cred and len are valid for writes
        let result = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if result == 0 {
            Some(cred.uid)
        } else {
            None
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn get_peer_uid(stream: &UnixStream) -> Option<u32> {
        stream.peer_cred().ok().map(|cred| cred.uid())
    }

    /// Create the socket directory and clear a stale socket file
    fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Cannot create socket directory {parent:?}"))?;
                info!(path = ?parent, "Socket directory created");
            }
        }

        if self.socket_path.exists() {
            warn!(path = ?self.socket_path, "Stale socket file found, replacing it");
            fs::remove_file(&self.socket_path).with_context(|| {
                format!("Cannot clear stale socket {:?}", self.socket_path)
            })?;
        }

        Ok(())
    }

    /// Run the accept loop until `shutdown` flips to `true`
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.prepare_socket()?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Cannot listen on {:?}", self.socket_path))?;

        // Owner-only access
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        info!(path = ?self.socket_path, "Chat server listening");

        // SAFETY: getuid has no preconditions
        let our_uid = unsafe { libc::getuid() };

        loop {
            let accepted = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown signal received, no longer accepting clients");
                        break;
                    }
                    continue;
                }
                accepted = listener.accept() => accepted,
            };

            let stream = match accepted {
                Ok((stream, _addr)) => stream,
                Err(e) => {
                    error!(error = %e, "Could not accept client");
                    continue;
                }
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!(
                    max = self.server_config.max_connections,
                    "Too many clients, dropping new connection"
                );
                drop(stream);
                continue;
            }

            // Only our own user (or root) may connect
            let peer_uid = Self::get_peer_uid(&stream);
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Refusing client owned by another user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            info!(
                conn_id = conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let manager = Arc::clone(&self.manager);
            let connection_states = Arc::clone(&self.connection_states);
            let capacity = self.server_config.connection_channel_capacity;
            let task_handle = tokio::spawn(
                async move {
                    let peer = Peer::from_uid(peer_uid);
                    if let Err(e) = serve_connection(manager, stream, peer, capacity).await {
                        warn!(error = %e, "Connection ended with error");
                    }
                    connection_states.remove(&conn_id);
                    info!(
                        active_connections = connection_states.len(),
                        "Client connection closed"
                    );
                }
                .instrument(tracing::info_span!("connection", conn_id)),
            );

            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: std::time::Instant::now(),
                    peer_uid,
                    abort_handle: task_handle.abort_handle(),
                },
            );
            // The handler may have finished before it was tracked
            if task_handle.is_finished() {
                self.connection_states.remove(&conn_id);
            }
        }

        self.shutdown()
    }

    /// Graceful shutdown
    fn shutdown(&mut self) -> Result<()> {
        info!(
            connections = self.connection_states.len(),
            "Closing client connections"
        );

        let conn_ids: Vec<u64> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, conn_state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id = conn_id,
                    peer_uid = ?conn_state.peer_uid,
                    uptime_secs = conn_state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                conn_state.abort_handle.abort();
            }
        }

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)
                .with_context(|| format!("Cannot remove socket file {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Removed socket file");
        }

        info!("Chat server stopped");
        Ok(())
    }

    /// Live client connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}

// ============================================================================
// Connection Handling
// ============================================================================

/// Identity of the process on the other end of a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Caller key used when a send carries no `api_key`
    pub caller: CallerKey,
}

impl Peer {
    /// Peer identified by its uid, or an anonymous peer
    pub fn from_uid(uid: Option<u32>) -> Self {
        let key = uid.map_or_else(|| "uid:unknown".to_string(), |uid| format!("uid:{uid}"));
        Self {
            caller: CallerKey::new(key),
        }
    }
}

/// Serve one connection until the client closes it
///
/// A single writer task owns the write half; request handlers and send
/// tasks queue [`ServerFrame`]s to it. When the client goes away the queue
/// closes, which in-flight sends observe as a disconnect.
pub async fn serve_connection(
    manager: Arc<SessionManager>,
    stream: UnixStream,
    peer: Peer,
    capacity: usize,
) -> Result<()> {
    debug!("Connection handler started");

    let (read_half, mut write_half) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<ServerFrame>(capacity.max(1));

    let writer = tokio::spawn(
        async move {
            while let Some(frame) = frame_rx.recv().await {
                let line = match frame.to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    debug!(error = %e, "Write failed, client gone");
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let mut lines = BufReader::new(read_half).lines();
    let read_result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Client disconnected (EOF)");
                break Ok(());
            }
            Err(e) => break Err(e).context("Read error"),
        };
        if line.trim().is_empty() {
            continue;
        }

        match ClientFrame::parse(&line) {
            Ok(frame) => {
                if !handle_frame(&manager, &peer, frame, &frame_tx).await {
                    debug!("Writer gone, closing connection");
                    break Ok(());
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to decode client frame");
                if frame_tx
                    .send(ServerFrame::protocol_error(format!("invalid frame: {e}")))
                    .await
                    .is_err()
                {
                    break Ok(());
                }
            }
        }
    };

    // The writer drains until every in-flight send has dropped its sender
    drop(frame_tx);
    if let Err(e) = writer.await {
        warn!(error = %e, "Writer task failed");
    }
    read_result
}

/// Handle one client frame; returns `false` once the writer is gone
async fn handle_frame(
    manager: &Arc<SessionManager>,
    peer: &Peer,
    frame: ClientFrame,
    frame_tx: &mpsc::Sender<ServerFrame>,
) -> bool {
    let reply = match frame {
        ClientFrame::Send {
            session_id,
            message,
            model,
            api_key,
            temperature,
            max_tokens,
        } => {
            let session_id = session_id.unwrap_or_default();
            let caller = api_key
                .as_deref()
                .and_then(CallerKey::from_authorization)
                .unwrap_or_else(|| peer.caller.clone());
            let label = model
                .clone()
                .or_else(|| manager.router().default_model().map(str::to_string))
                .unwrap_or_default();

            let started = ServerFrame::Started {
                session_id: session_id.clone(),
                model: label.clone(),
            };
            if frame_tx.send(started).await.is_err() {
                return false;
            }

            let mut request = ChatRequest::new(message).with_session(session_id.clone());
            if let Some(model) = model {
                request = request.with_model(model);
            }
            request.temperature = temperature;
            request.max_tokens = max_tokens;
            spawn_send(Arc::clone(manager), caller, request, label, frame_tx.clone());
            return true;
        }
        ClientFrame::Cancel { session_id } => match manager.cancel(&session_id).await {
            Ok(cancelled) => ServerFrame::Cancelled {
                session_id,
                cancelled,
            },
            Err(e) => ServerFrame::from_error(Some(session_id), &e),
        },
        ClientFrame::History { session_id, limit } => {
            match manager.get_history(&session_id, limit).await {
                Ok(turns) => ServerFrame::History { session_id, turns },
                Err(e) => ServerFrame::from_error(Some(session_id), &e),
            }
        }
        ClientFrame::Delete { session_id } => match manager.delete_session(&session_id).await {
            Ok(()) => ServerFrame::Deleted { session_id },
            Err(e) => ServerFrame::from_error(Some(session_id), &e),
        },
        ClientFrame::Sessions => ServerFrame::Sessions {
            sessions: manager.list_sessions().await,
        },
        ClientFrame::Models => ServerFrame::Models {
            models: manager.list_models(),
        },
        ClientFrame::Health => ServerFrame::Health {
            health: manager.health().await,
        },
        ClientFrame::Ping => ServerFrame::Pong,
    };

    frame_tx.send(reply).await.is_ok()
}

/// Run one send in its own task, streaming frames to the connection
fn spawn_send(
    manager: Arc<SessionManager>,
    caller: CallerKey,
    request: ChatRequest,
    model: String,
    frame_tx: mpsc::Sender<ServerFrame>,
) {
    let session_id = request.session_id.clone().unwrap_or_default();
    let span = tracing::debug_span!("send", session_id = %session_id);

    tokio::spawn(
        async move {
            let sink = FrameSink::new(session_id.clone(), model, frame_tx.clone());
            let outcome = manager.send(&caller, request, &sink).await;

            let frame = match outcome {
                Ok(StreamOutcome::Superseded { by }) => Some(superseded_frame(session_id, by.0)),
                Ok(_) => None,
                // Errors raised before streaming never reached the sink
                Err(e) if e.is_pre_stream() || matches!(e, ChatError::History(_)) => {
                    Some(ServerFrame::from_error(Some(session_id), &e))
                }
                Err(e) => {
                    debug!(error = %e, "Send failed after streaming began");
                    None
                }
            };

            if let Some(frame) = frame {
                let _ = frame_tx.send(frame).await;
            }
        }
        .instrument(span),
    );
}

fn superseded_frame(session_id: SessionId, by: u64) -> ServerFrame {
    ServerFrame::Error {
        session_id: Some(session_id),
        kind: ErrorKind::Cancelled.as_str().to_string(),
        message: format!("superseded by generation {by}"),
        retry_after_seconds: None,
    }
}
