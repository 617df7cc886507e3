//! Connection listener
//!
//! Accepts simulator clients, owns the set of live sessions and drives one
//! Session per connection. Each connection runs on its own task; the only
//! state shared with the forwarding plane is behind the relay bridge.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use super::connection::{Connection, ConnectionError};
use super::ListenerConfig;
use crate::protocol::{chunk, Message, BANNER_CAPACITY};
use crate::relay::{RelayHandle, SessionId};
use crate::session::{Session, SessionOutcome, SessionState};
use crate::topology::TopologyStore;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Stand-in for "no timeout" in the select loop
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

#[derive(Clone)]
struct SessionEntry {
    addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
}

/// The listening server
pub struct Server {
    config: ListenerConfig,
    store: Arc<dyn TopologyStore>,
    relay: RelayHandle,
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
    next_session_id: Arc<AtomicU64>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    running: Arc<RwLock<bool>>,
}

impl Server {
    pub fn new(config: ListenerConfig, store: Arc<dyn TopologyStore>, relay: RelayHandle) -> Self {
        Self {
            config,
            store,
            relay,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_session_id: Arc::new(AtomicU64::new(1)),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Bind and start accepting; returns the bound address
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        let sessions = self.sessions.clone();
        let store = self.store.clone();
        let relay = self.relay.clone();
        let next_id = self.next_session_id.clone();
        let auth_timeout = self.config.auth_timeout;
        let running = self.running.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                let id = next_id.fetch_add(1, Ordering::Relaxed);
                                tracing::info!("Session {}: connection from {}", id, addr);

                                let sessions = sessions.clone();
                                let store = store.clone();
                                let relay = relay.clone();

                                tokio::spawn(async move {
                                    handle_client(
                                        stream,
                                        addr,
                                        id,
                                        auth_timeout,
                                        store,
                                        relay,
                                        sessions,
                                    )
                                    .await;
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Listener shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;
        });

        Ok(local_addr)
    }

    /// Stop accepting and close every live session
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        self.broadcast(Message::Close {
            reason: "server shutting down".to_string(),
        })
        .await;

        Ok(())
    }

    /// Send one message to every live session.
    ///
    /// Iterates a snapshot so sessions disconnecting mid-broadcast cannot
    /// invalidate the iteration.
    pub async fn broadcast(&self, message: Message) {
        let targets: Vec<SessionEntry> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };

        tracing::debug!("Broadcasting {} to {} sessions", message.name(), targets.len());
        for entry in targets {
            tracing::trace!("Broadcast {} -> {}", message.name(), entry.addr);
            let _ = entry.outbound.send(message.clone()).await;
        }
    }

    /// Broadcast banner text of any length, chunked to fit the frame size
    pub async fn broadcast_banner(&self, text: &str) {
        for piece in chunk::chunks_banners(text, BANNER_CAPACITY) {
            self.broadcast(Message::Banner {
                text: piece.to_string(),
            })
            .await;
        }
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Drive one connection from accept to teardown
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    id: SessionId,
    auth_timeout: Option<Duration>,
    store: Arc<dyn TopologyStore>,
    relay: RelayHandle,
    sessions: Arc<RwLock<HashMap<SessionId, SessionEntry>>>,
) {
    let mut conn = Connection::new(stream, addr);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(256);
    let mut session = Session::new(id, store, relay, outbound_tx.clone());

    {
        let mut sessions = sessions.write().await;
        sessions.insert(
            id,
            SessionEntry {
                addr,
                outbound: outbound_tx,
            },
        );
    }

    session.start().await;

    let auth_timer = tokio::time::sleep(auth_timeout.unwrap_or(FAR_FUTURE));
    tokio::pin!(auth_timer);

    let reason = loop {
        tokio::select! {
            result = conn.recv() => {
                match result {
                    Ok(Some(message)) => {
                        if session.handle_message(message).await == SessionOutcome::Closed {
                            break "session closed".to_string();
                        }
                    }
                    Ok(None) => {
                        session.shutdown();
                        break "connection closed by peer".to_string();
                    }
                    Err(e @ (ConnectionError::Codec(_) | ConnectionError::Message(_))) => {
                        // Connection-fatal; explain over a close sequence.
                        let reason = format!("protocol error: {}", e);
                        session.close_with(&reason).await;
                        break reason;
                    }
                    Err(e) => {
                        session.shutdown();
                        break format!("receive error: {}", e);
                    }
                }
            }

            Some(message) = outbound_rx.recv() => {
                if let Err(e) = conn.send(&message).await {
                    session.shutdown();
                    break format!("send error: {}", e);
                }
            }

            _ = &mut auth_timer, if auth_timeout.is_some()
                    && session.state() == SessionState::AuthRequested => {
                session.close_with("authentication timed out").await;
                break "authentication timed out".to_string();
            }
        }
    };

    // Best-effort flush of whatever the session queued on its way out,
    // typically its final Banner/Close sequence.
    while let Ok(message) = outbound_rx.try_recv() {
        if conn.send(&message).await.is_err() {
            break;
        }
    }

    {
        let mut sessions = sessions.write().await;
        sessions.remove(&id);
    }

    let _ = conn.shutdown().await;

    let stats = conn.stats();
    tracing::info!(
        "Session {} ({}) ended: {} ({} msgs / {} bytes in, {} msgs / {} bytes out)",
        id,
        conn.remote_addr(),
        reason,
        stats.messages_received,
        stats.bytes_received,
        stats.messages_sent,
        stats.bytes_sent,
    );
}
