//! Relay bridge between sessions and the forwarding plane
//!
//! Sessions run on the listener's I/O tasks; packet and lifecycle events
//! originate on the forwarding plane's own execution context. The bridge is
//! the only state shared between the two, so it runs as a dedicated task
//! owning the binding maps exclusively. Everything crosses over a single
//! command queue, which also gives per-binding FIFO ordering; replies travel
//! back over oneshot channels. Neither side ever blocks on the other.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::Message;

/// Forwarding-plane port number
pub type PortId = u32;

/// Identifies one client session for the lifetime of its connection
pub type SessionId = u64;

/// Identifies one switch on the forwarding plane
pub type SwitchId = u64;

/// Packet injection failure reported by the forwarding plane
#[derive(Error, Debug)]
#[error("{0}")]
pub struct InjectError(pub String);

/// Relay errors. Never fatal to a session; the session surfaces them as
/// banners or rejects the operation that caused them.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("No forwarding port bound for interface '{0}'")]
    UnboundInterface(String),

    #[error("Forwarding port {0} is already bound")]
    PortConflict(PortId),

    #[error("Packet injection failed: {0}")]
    Inject(#[from] InjectError),

    #[error("Relay bridge is not running")]
    BridgeClosed,
}

pub type RelayResult<T> = Result<T, RelayError>;

/// The packet-switching system the bridge injects frames into
#[async_trait]
pub trait ForwardingPlane: Send + Sync {
    /// Push one Ethernet frame out of the given port
    async fn inject_packet(&self, port: PortId, frame: &[u8]) -> Result<(), InjectError>;
}

enum Command {
    Bind {
        session: SessionId,
        interface: String,
        port: PortId,
        outbound: mpsc::Sender<Message>,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    UnbindSession {
        session: SessionId,
    },
    Deliver {
        session: SessionId,
        interface: String,
        frame: Bytes,
        reply: oneshot::Sender<RelayResult<()>>,
    },
    PacketArrived {
        port: PortId,
        frame: Bytes,
    },
    SwitchUp {
        switch: SwitchId,
        ports: Vec<PortId>,
    },
    SwitchDown {
        switch: SwitchId,
    },
}

/// Cloneable entry point to the bridge task.
///
/// Sends are non-blocking (the queue is unbounded), so the forwarding
/// plane's callbacks may post from their own context without waiting on
/// session I/O.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RelayHandle {
    /// Exclusively bind `(session, interface)` to a forwarding port.
    ///
    /// Frames arriving on the port are sent to `outbound` as Packet
    /// messages. Fails with [`RelayError::PortConflict`] if any session
    /// already holds the port.
    pub async fn bind(
        &self,
        session: SessionId,
        interface: &str,
        port: PortId,
        outbound: mpsc::Sender<Message>,
    ) -> RelayResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Bind {
                session,
                interface: interface.to_string(),
                port,
                outbound,
                reply,
            })
            .map_err(|_| RelayError::BridgeClosed)?;
        rx.await.map_err(|_| RelayError::BridgeClosed)?
    }

    /// Release every port the session holds. Idempotent.
    pub fn unbind_session(&self, session: SessionId) {
        let _ = self.tx.send(Command::UnbindSession { session });
    }

    /// Inject a client frame into the forwarding plane through the port
    /// bound to `(session, interface)`.
    pub async fn deliver_to_plane(
        &self,
        session: SessionId,
        interface: &str,
        frame: Bytes,
    ) -> RelayResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Deliver {
                session,
                interface: interface.to_string(),
                frame,
                reply,
            })
            .map_err(|_| RelayError::BridgeClosed)?;
        rx.await.map_err(|_| RelayError::BridgeClosed)?
    }

    /// Forwarding-plane callback: a frame arrived on a port.
    ///
    /// If no session owns the port the frame is dropped; ports may be
    /// transiently unbound during topology teardown.
    pub fn packet_arrived(&self, port: PortId, frame: Bytes) {
        let _ = self.tx.send(Command::PacketArrived { port, frame });
    }

    /// Forwarding-plane callback: a switch and its ports came up
    pub fn switch_up(&self, switch: SwitchId, ports: Vec<PortId>) {
        let _ = self.tx.send(Command::SwitchUp { switch, ports });
    }

    /// Forwarding-plane callback: a switch went away
    pub fn switch_down(&self, switch: SwitchId) {
        let _ = self.tx.send(Command::SwitchDown { switch });
    }
}

struct PortOwner {
    session: SessionId,
    interface: String,
    outbound: mpsc::Sender<Message>,
}

/// The bridge task state. Owned by exactly one task; reached only through
/// [`RelayHandle`].
struct Bridge {
    plane: Arc<dyn ForwardingPlane>,
    /// (session, interface) -> port
    bindings: HashMap<(SessionId, String), PortId>,
    /// port -> owning session
    owners: HashMap<PortId, PortOwner>,
    /// Ports currently reachable, per switch
    switch_ports: HashMap<SwitchId, Vec<PortId>>,
    up_ports: HashSet<PortId>,
}

/// Spawn the bridge task and return its handle
pub fn spawn(plane: Arc<dyn ForwardingPlane>) -> RelayHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut bridge = Bridge {
        plane,
        bindings: HashMap::new(),
        owners: HashMap::new(),
        switch_ports: HashMap::new(),
        up_ports: HashSet::new(),
    };

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            bridge.handle(command).await;
        }
        tracing::debug!("Relay bridge stopped");
    });

    RelayHandle { tx }
}

impl Bridge {
    async fn handle(&mut self, command: Command) {
        match command {
            Command::Bind {
                session,
                interface,
                port,
                outbound,
                reply,
            } => {
                let result = self.bind(session, interface, port, outbound);
                let _ = reply.send(result);
            }
            Command::UnbindSession { session } => self.unbind_session(session),
            Command::Deliver {
                session,
                interface,
                frame,
                reply,
            } => {
                let result = self.deliver(session, &interface, frame).await;
                let _ = reply.send(result);
            }
            Command::PacketArrived { port, frame } => self.packet_arrived(port, frame),
            Command::SwitchUp { switch, ports } => {
                tracing::info!("Switch {} up with ports {:?}", switch, ports);
                self.up_ports.extend(ports.iter().copied());
                self.switch_ports.insert(switch, ports);
            }
            Command::SwitchDown { switch } => {
                tracing::info!("Switch {} down", switch);
                if let Some(ports) = self.switch_ports.remove(&switch) {
                    for port in ports {
                        self.up_ports.remove(&port);
                    }
                }
            }
        }
    }

    fn bind(
        &mut self,
        session: SessionId,
        interface: String,
        port: PortId,
        outbound: mpsc::Sender<Message>,
    ) -> RelayResult<()> {
        if self.owners.contains_key(&port) {
            return Err(RelayError::PortConflict(port));
        }

        tracing::debug!(
            "Session {} bound interface '{}' to port {}",
            session,
            interface,
            port
        );
        self.owners.insert(
            port,
            PortOwner {
                session,
                interface: interface.clone(),
                outbound,
            },
        );
        self.bindings.insert((session, interface), port);
        Ok(())
    }

    fn unbind_session(&mut self, session: SessionId) {
        let released: Vec<PortId> = self
            .bindings
            .iter()
            .filter(|((owner, _), _)| *owner == session)
            .map(|(_, port)| *port)
            .collect();

        if released.is_empty() {
            return;
        }

        self.bindings.retain(|(owner, _), _| *owner != session);
        for port in &released {
            self.owners.remove(port);
        }
        tracing::debug!("Session {} released ports {:?}", session, released);
    }

    async fn deliver(
        &self,
        session: SessionId,
        interface: &str,
        frame: Bytes,
    ) -> RelayResult<()> {
        let key = (session, interface.to_string());
        let port = *self
            .bindings
            .get(&key)
            .ok_or_else(|| RelayError::UnboundInterface(interface.to_string()))?;

        if !self.up_ports.contains(&port) {
            // Transient during switch teardown; not an error for the session.
            tracing::debug!("Port {} is down, dropping {} byte frame", port, frame.len());
            return Ok(());
        }

        self.plane.inject_packet(port, &frame).await?;
        Ok(())
    }

    fn packet_arrived(&self, port: PortId, frame: Bytes) {
        let Some(owner) = self.owners.get(&port) else {
            tracing::debug!(
                "Dropping {} byte frame for unowned port {}",
                frame.len(),
                port
            );
            return;
        };

        let message = Message::Packet {
            interface_name: owner.interface.clone(),
            payload: frame,
        };
        // try_send so one slow session cannot stall the bridge.
        if let Err(e) = owner.outbound.try_send(message) {
            tracing::warn!(
                "Dropping frame for session {} (port {}): {}",
                owner.session,
                port,
                e
            );
        }
    }
}
