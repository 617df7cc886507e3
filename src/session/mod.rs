//! Per-connection session state machine
//!
//! Drives a client from connect through authentication and topology open to
//! packet relay. The session owns its connection's protocol state for the
//! connection's lifetime; it talks to the socket only through the outbound
//! message queue, so the whole machine is testable without any network.
//!
//! States: Connected -> AuthRequested -> Authenticated -> TopologyOpen,
//! with Closed reachable from anywhere.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::{chunk, Message, BANNER_CAPACITY, CLOSE_CAPACITY};
use crate::relay::{RelayError, RelayHandle, SessionId};
use crate::topology::TopologyStore;

/// Authentication / handshake progress of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, challenge not yet sent
    Connected,
    /// Salt sent, waiting for AuthReply
    AuthRequested,
    /// Credentials verified, no topology open
    Authenticated,
    /// Topology open, relaying packets
    TopologyOpen,
    /// Terminal
    Closed,
}

/// What the connection loop should do after feeding a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Continue,
    Closed,
}

/// Server-side state for one client connection
pub struct Session {
    id: SessionId,
    state: SessionState,
    salt: Bytes,
    username: Option<String>,
    topology_id: Option<u32>,
    virtual_host_id: Option<String>,
    store: Arc<dyn TopologyStore>,
    relay: RelayHandle,
    outbound: mpsc::Sender<Message>,
}

impl Session {
    pub fn new(
        id: SessionId,
        store: Arc<dyn TopologyStore>,
        relay: RelayHandle,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id,
            state: SessionState::Connected,
            salt: Bytes::new(),
            username: None,
            topology_id: None,
            virtual_host_id: None,
            store,
            relay,
            outbound,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Send the auth challenge; first thing after accept
    pub async fn start(&mut self) {
        let salt: [u8; 16] = rand::random();
        self.salt = Bytes::copy_from_slice(&salt);
        self.send(Message::AuthRequest {
            salt: self.salt.clone(),
        })
        .await;
        self.state = SessionState::AuthRequested;
        tracing::debug!("Session {}: sent auth challenge", self.id);
    }

    /// Feed one decoded message into the state machine
    pub async fn handle_message(&mut self, message: Message) -> SessionOutcome {
        match message {
            // Advisory in any state.
            Message::Banner { text } => {
                tracing::info!("Session {}: client banner: {}", self.id, text);
                SessionOutcome::Continue
            }

            // A client Close ends the session from any state.
            Message::Close { reason } => {
                tracing::info!("Session {}: client closed: {}", self.id, reason);
                self.close_with("Goodbye!").await
            }

            Message::AuthReply { username, digest }
                if self.state == SessionState::AuthRequested =>
            {
                self.handle_auth_reply(username, &digest).await
            }

            Message::Open {
                topology_id,
                virtual_host_id,
                client_id,
                ..
            } if self.state == SessionState::Authenticated => {
                self.handle_open(topology_id, virtual_host_id, client_id).await
            }

            Message::OpenTemplate { template_name, .. }
                if self.state == SessionState::Authenticated =>
            {
                tracing::warn!(
                    "Session {}: rejecting template open '{}'",
                    self.id,
                    template_name
                );
                self.close_with(&format!(
                    "template topologies are not supported (requested '{}')",
                    template_name
                ))
                .await
            }

            Message::Packet {
                interface_name,
                payload,
            } if self.state == SessionState::TopologyOpen => {
                self.handle_packet(&interface_name, payload).await
            }

            // Everything else is illegal in the current state.
            other => {
                tracing::warn!(
                    "Session {}: {} message in {:?} state",
                    self.id,
                    other.name(),
                    self.state
                );
                self.close_with(&format!(
                    "protocol violation: unexpected {} message",
                    other.name()
                ))
                .await
            }
        }
    }

    async fn handle_auth_reply(&mut self, username: String, digest: &[u8; 20]) -> SessionOutcome {
        if self.store.authenticate(&username, &self.salt, digest) {
            tracing::info!("Session {}: authenticated as '{}'", self.id, username);
            self.username = Some(username);
            self.state = SessionState::Authenticated;
            self.send(Message::AuthStatus {
                ok: true,
                message: "authenticated".to_string(),
            })
            .await;
        } else {
            // Unlimited retries; the client stays in AuthRequested.
            tracing::warn!("Session {}: authentication failed for '{}'", self.id, username);
            tracing::debug!(
                "Session {}: offered digest {} for salt {}",
                self.id,
                hex::encode(digest),
                hex::encode(&self.salt)
            );
            self.send(Message::AuthStatus {
                ok: false,
                message: "authentication failed".to_string(),
            })
            .await;
        }
        SessionOutcome::Continue
    }

    async fn handle_open(
        &mut self,
        topology_id: u32,
        virtual_host_id: String,
        client_id: String,
    ) -> SessionOutcome {
        let Some(topology) = self.store.lookup_topology(topology_id) else {
            tracing::warn!("Session {}: unknown topology {}", self.id, topology_id);
            self.send(Message::Banner {
                text: format!("topology {} is not available", topology_id),
            })
            .await;
            return self.close_with(&format!("cannot open topology {}", topology_id)).await;
        };

        let mut descriptors = Vec::with_capacity(topology.interfaces.len());
        for spec in &topology.interfaces {
            match spec.descriptor() {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => {
                    tracing::error!(
                        "Session {}: bad interface in topology {}: {}",
                        self.id,
                        topology_id,
                        e
                    );
                    return self
                        .close_with(&format!("topology {} is misconfigured", topology_id))
                        .await;
                }
            }
        }

        for spec in &topology.interfaces {
            if let Err(e) = self
                .relay
                .bind(self.id, &spec.name, spec.port, self.outbound.clone())
                .await
            {
                tracing::warn!(
                    "Session {}: cannot bind '{}' to port {}: {}",
                    self.id,
                    spec.name,
                    spec.port,
                    e
                );
                self.send(Message::Banner {
                    text: format!("cannot open topology {}: {}", topology_id, e),
                })
                .await;
                return self.close_with(&format!("topology {} is in use", topology_id)).await;
            }
        }

        self.topology_id = Some(topology_id);
        self.virtual_host_id = Some(virtual_host_id.clone());
        self.state = SessionState::TopologyOpen;

        self.send(Message::HardwareInfo {
            interfaces: descriptors,
        })
        .await;
        self.send(Message::RoutingTable {
            virtual_host_id,
            table_text: topology.rtable,
        })
        .await;

        tracing::info!(
            "Session {}: client '{}' opened topology {}",
            self.id,
            client_id,
            topology_id
        );
        SessionOutcome::Continue
    }

    async fn handle_packet(&mut self, interface_name: &str, payload: Bytes) -> SessionOutcome {
        match self
            .relay
            .deliver_to_plane(self.id, interface_name, payload)
            .await
        {
            Ok(()) => {}
            Err(RelayError::UnboundInterface(name)) => {
                // Drop the frame, warn the client, keep the session alive.
                tracing::warn!(
                    "Session {}: packet for unbound interface '{}'",
                    self.id,
                    name
                );
                self.send(Message::Banner {
                    text: format!("no forwarding port bound for interface '{}'", name),
                })
                .await;
            }
            Err(e) => {
                tracing::warn!("Session {}: packet relay failed: {}", self.id, e);
                self.send(Message::Banner {
                    text: format!("packet dropped: {}", e),
                })
                .await;
            }
        }
        SessionOutcome::Continue
    }

    /// Send a chunked Banner/Close sequence carrying `reason`, then close.
    ///
    /// Used both for orderly closes and for protocol violations; safe to
    /// call in any state.
    pub async fn close_with(&mut self, reason: &str) -> SessionOutcome {
        if self.state == SessionState::Closed {
            return SessionOutcome::Closed;
        }

        for (kind, piece) in chunk::chunks_with_close(reason, BANNER_CAPACITY, CLOSE_CAPACITY) {
            let message = match kind {
                chunk::ChunkKind::Banner => Message::Banner {
                    text: piece.to_string(),
                },
                chunk::ChunkKind::Close => Message::Close {
                    reason: piece.to_string(),
                },
            };
            self.send(message).await;
        }
        self.finish()
    }

    /// Tear down without a close sequence (socket already gone)
    pub fn shutdown(&mut self) {
        if self.state != SessionState::Closed {
            self.finish();
        }
    }

    fn finish(&mut self) -> SessionOutcome {
        self.state = SessionState::Closed;
        self.relay.unbind_session(self.id);
        tracing::debug!(
            "Session {}: closed (user: {:?}, topology: {:?}, vhost: {:?})",
            self.id,
            self.username,
            self.topology_id,
            self.virtual_host_id
        );
        SessionOutcome::Closed
    }

    async fn send(&self, message: Message) {
        // The receiver disappearing means the connection is going away; the
        // loop notices on its own.
        let _ = self.outbound.send(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::RecordingPlane;
    use crate::relay::{self, PortId};
    use crate::topology::{salted_digest, InterfaceSpec, MemoryStore, TopologyDescriptor};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    const ETH0_PORT: PortId = 1;
    const ETH1_PORT: PortId = 2;

    fn test_store() -> Arc<MemoryStore> {
        let interfaces = vec![
            InterfaceSpec {
                name: "eth0".to_string(),
                mac: "02:00:00:00:01:01".to_string(),
                ip: Ipv4Addr::new(10, 0, 1, 1),
                mask: Ipv4Addr::new(255, 255, 255, 0),
                port: ETH0_PORT,
            },
            InterfaceSpec {
                name: "eth1".to_string(),
                mac: "02:00:00:00:01:02".to_string(),
                ip: Ipv4Addr::new(10, 0, 2, 1),
                mask: Ipv4Addr::new(255, 255, 255, 0),
                port: ETH1_PORT,
            },
        ];
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "alicepw".to_string());
        Arc::new(
            MemoryStore::new(
                vec![TopologyDescriptor {
                    id: 5,
                    interfaces,
                    rtable: "0.0.0.0 10.0.1.1 0.0.0.0 eth0\n".to_string(),
                }],
                users,
            )
            .unwrap(),
        )
    }

    struct Fixture {
        plane: Arc<RecordingPlane>,
        relay: RelayHandle,
        store: Arc<MemoryStore>,
        next_id: SessionId,
    }

    impl Fixture {
        fn new() -> Self {
            let plane = Arc::new(RecordingPlane::default());
            let relay = relay::spawn(plane.clone());
            relay.switch_up(0, vec![ETH0_PORT, ETH1_PORT]);
            Self {
                plane,
                relay,
                store: test_store(),
                next_id: 0,
            }
        }

        async fn started_session(&mut self) -> (Session, mpsc::Receiver<Message>) {
            self.next_id += 1;
            let (tx, rx) = mpsc::channel(64);
            let mut session = Session::new(self.next_id, self.store.clone(), self.relay.clone(), tx);
            session.start().await;
            (session, rx)
        }

        /// Drive a fresh session through auth, consuming the AuthStatus
        async fn authed_session(&mut self) -> (Session, mpsc::Receiver<Message>) {
            let (mut session, mut rx) = self.started_session().await;
            let salt = match rx.recv().await.unwrap() {
                Message::AuthRequest { salt } => salt,
                other => panic!("expected AuthRequest, got {:?}", other),
            };
            let outcome = session
                .handle_message(Message::AuthReply {
                    username: "alice".to_string(),
                    digest: salted_digest(&salt, "alicepw"),
                })
                .await;
            assert_eq!(outcome, SessionOutcome::Continue);
            match rx.recv().await.unwrap() {
                Message::AuthStatus { ok: true, .. } => {}
                other => panic!("expected AuthStatus ok, got {:?}", other),
            }
            (session, rx)
        }

        fn open_msg(&self) -> Message {
            Message::Open {
                topology_id: 5,
                virtual_host_id: "vh1".to_string(),
                client_id: "client".to_string(),
                password: String::new(),
            }
        }
    }

    #[tokio::test]
    async fn test_start_sends_challenge() {
        let mut fx = Fixture::new();
        let (session, mut rx) = fx.started_session().await;
        assert_eq!(session.state(), SessionState::AuthRequested);
        match rx.recv().await.unwrap() {
            Message::AuthRequest { salt } => assert!(!salt.is_empty()),
            other => panic!("expected AuthRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_digest_keeps_state() {
        let mut fx = Fixture::new();
        let (mut session, mut rx) = fx.started_session().await;
        let _challenge = rx.recv().await.unwrap();

        let outcome = session
            .handle_message(Message::AuthReply {
                username: "alice".to_string(),
                digest: salted_digest(b"wrong salt", "alicepw"),
            })
            .await;

        assert_eq!(outcome, SessionOutcome::Continue);
        assert_eq!(session.state(), SessionState::AuthRequested);
        match rx.recv().await.unwrap() {
            Message::AuthStatus { ok: false, .. } => {}
            other => panic!("expected AuthStatus failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_good_digest_authenticates() {
        let mut fx = Fixture::new();
        let (session, _rx) = fx.authed_session().await;
        assert_eq!(session.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_open_before_auth_is_violation() {
        let mut fx = Fixture::new();
        let (mut session, mut rx) = fx.started_session().await;
        let _challenge = rx.recv().await.unwrap();

        let open = fx.open_msg();
        let outcome = session.handle_message(open).await;
        assert_eq!(outcome, SessionOutcome::Closed);
        assert_eq!(session.state(), SessionState::Closed);

        // Violation ends with a Close frame explaining itself.
        let mut last = None;
        while let Ok(msg) = rx.try_recv() {
            last = Some(msg);
        }
        match last {
            Some(Message::Close { reason }) => assert!(reason.contains("Open")),
            other => panic!("expected trailing Close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_unknown_topology_closes() {
        let mut fx = Fixture::new();
        let (mut session, _rx) = fx.authed_session().await;

        let outcome = session
            .handle_message(Message::Open {
                topology_id: 42,
                virtual_host_id: "vh1".to_string(),
                client_id: "client".to_string(),
                password: String::new(),
            })
            .await;
        assert_eq!(outcome, SessionOutcome::Closed);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_open_pushes_hardware_then_rtable() {
        let mut fx = Fixture::new();
        let (mut session, mut rx) = fx.authed_session().await;

        let open = fx.open_msg();
        let outcome = session.handle_message(open).await;
        assert_eq!(outcome, SessionOutcome::Continue);
        assert_eq!(session.state(), SessionState::TopologyOpen);

        match rx.recv().await.unwrap() {
            Message::HardwareInfo { interfaces } => {
                assert_eq!(interfaces.len(), 2);
                assert_eq!(interfaces[0].name, "eth0");
                assert_eq!(interfaces[0].ip, Ipv4Addr::new(10, 0, 1, 1));
            }
            other => panic!("expected HardwareInfo, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            Message::RoutingTable {
                virtual_host_id,
                table_text,
            } => {
                assert_eq!(virtual_host_id, "vh1");
                assert!(table_text.contains("eth0"));
            }
            other => panic!("expected RoutingTable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_packet_reaches_plane() {
        let mut fx = Fixture::new();
        let (mut session, _rx) = fx.authed_session().await;
        let open = fx.open_msg();
        session.handle_message(open).await;

        let frame = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]);
        let outcome = session
            .handle_message(Message::Packet {
                interface_name: "eth0".to_string(),
                payload: frame.clone(),
            })
            .await;
        assert_eq!(outcome, SessionOutcome::Continue);

        let injected = fx.plane.injected.lock().await;
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0], (ETH0_PORT, frame.to_vec()));
    }

    #[tokio::test]
    async fn test_packet_on_unbound_interface_warns() {
        let mut fx = Fixture::new();
        let (mut session, mut rx) = fx.authed_session().await;
        let open = fx.open_msg();
        session.handle_message(open).await;
        let _hardware = rx.recv().await.unwrap();
        let _rtable = rx.recv().await.unwrap();

        let outcome = session
            .handle_message(Message::Packet {
                interface_name: "eth9".to_string(),
                payload: Bytes::from_static(b"x"),
            })
            .await;

        // Dropped, warned, session still open.
        assert_eq!(outcome, SessionOutcome::Continue);
        assert_eq!(session.state(), SessionState::TopologyOpen);
        match rx.recv().await.unwrap() {
            Message::Banner { text } => assert!(text.contains("eth9")),
            other => panic!("expected Banner warning, got {:?}", other),
        }
        assert!(fx.plane.injected.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_client_close_gets_farewell() {
        let mut fx = Fixture::new();
        let (mut session, mut rx) = fx.authed_session().await;

        let outcome = session
            .handle_message(Message::Close {
                reason: "done".to_string(),
            })
            .await;
        assert_eq!(outcome, SessionOutcome::Closed);
        match rx.recv().await.unwrap() {
            Message::Close { reason } => assert_eq!(reason, "Goodbye!"),
            other => panic!("expected Close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_open_conflicts_on_ports() {
        let mut fx = Fixture::new();
        let (mut first, _rx1) = fx.authed_session().await;
        let open = fx.open_msg();
        first.handle_message(open).await;
        assert_eq!(first.state(), SessionState::TopologyOpen);

        let (mut second, _rx2) = fx.authed_session().await;
        let open = fx.open_msg();
        let outcome = second.handle_message(open).await;
        assert_eq!(outcome, SessionOutcome::Closed);
        assert_eq!(second.state(), SessionState::Closed);

        // First session's binding survived the failed open.
        let frame = Bytes::from_static(b"still mine");
        first
            .handle_message(Message::Packet {
                interface_name: "eth0".to_string(),
                payload: frame.clone(),
            })
            .await;
        let injected = fx.plane.injected.lock().await;
        assert_eq!(injected.last().unwrap(), &(ETH0_PORT, frame.to_vec()));
    }

    #[tokio::test]
    async fn test_shutdown_releases_bindings() {
        let mut fx = Fixture::new();
        let (mut first, _rx1) = fx.authed_session().await;
        let open = fx.open_msg();
        first.handle_message(open).await;
        first.shutdown();
        assert_eq!(first.state(), SessionState::Closed);

        // Ports are reusable afterwards.
        let (mut second, _rx2) = fx.authed_session().await;
        let open = fx.open_msg();
        let outcome = second.handle_message(open).await;
        assert_eq!(outcome, SessionOutcome::Continue);
        assert_eq!(second.state(), SessionState::TopologyOpen);
    }
}
