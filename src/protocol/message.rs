//! Protocol message definitions
//!
//! One variant per catalog entry, each with a fixed hand-packed binary
//! layout. Fixed-width string fields are right-padded with null bytes on the
//! wire and trimmed of trailing nulls on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;
use thiserror::Error;

use super::{DESCRIPTOR_SIZE, DIGEST_SIZE, ID_SIZE, INTERFACE_NAME_SIZE, TEMPLATE_NAME_SIZE};

/// Type codes for each message. The set is closed; there is no versioning.
pub mod type_codes {
    pub const OPEN: u32 = 1;
    pub const CLOSE: u32 = 2;
    pub const PACKET: u32 = 4;
    pub const BANNER: u32 = 8;
    pub const HARDWARE_INFO: u32 = 16;
    pub const ROUTING_TABLE: u32 = 32;
    pub const OPEN_TEMPLATE: u32 = 64;
    pub const AUTH_REQUEST: u32 = 128;
    pub const AUTH_REPLY: u32 = 256;
    pub const AUTH_STATUS: u32 = 512;
}

/// Message decode errors
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Unknown message type code {0}")]
    UnknownType(u32),

    #[error("Malformed body for type {type_code}: {reason}")]
    Malformed { type_code: u32, reason: &'static str },
}

pub type MessageResult<T> = Result<T, MessageError>;

fn malformed(type_code: u32, reason: &'static str) -> MessageError {
    MessageError::Malformed { type_code, reason }
}

/// One virtual interface as carried in HardwareInfo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// Interface name, at most 16 bytes on the wire
    pub name: String,
    /// Hardware address
    pub mac: [u8; 6],
    /// Interface address
    pub ip: Ipv4Addr,
    /// Subnet mask
    pub mask: Ipv4Addr,
}

impl InterfaceDescriptor {
    fn pack(&self, buf: &mut BytesMut) {
        put_fixed_str(buf, &self.name, INTERFACE_NAME_SIZE);
        buf.put_slice(&self.mac);
        buf.put_slice(&self.ip.octets());
        buf.put_slice(&self.mask.octets());
    }

    fn unpack(body: &[u8]) -> Self {
        debug_assert_eq!(body.len(), DESCRIPTOR_SIZE);
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&body[16..22]);
        Self {
            name: fixed_str(&body[..INTERFACE_NAME_SIZE]),
            mac,
            ip: Ipv4Addr::new(body[22], body[23], body[24], body[25]),
            mask: Ipv4Addr::new(body[26], body[27], body[28], body[29]),
        }
    }
}

/// All protocol messages
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client requests a topology
    Open {
        topology_id: u32,
        virtual_host_id: String,
        client_id: String,
        password: String,
    },

    /// Final message of a session, carrying the close reason
    Close { reason: String },

    /// One Ethernet frame crossing the bridge, in either direction
    Packet {
        interface_name: String,
        /// Raw Ethernet frame, passed through unmodified
        payload: Bytes,
    },

    /// Informational text; never requires a reply
    Banner { text: String },

    /// The opened topology's interfaces
    HardwareInfo { interfaces: Vec<InterfaceDescriptor> },

    /// Routing table for a virtual host; the table is an opaque text blob
    RoutingTable {
        virtual_host_id: String,
        table_text: String,
    },

    /// Client requests a topology instantiated from a template
    OpenTemplate {
        template_name: String,
        virtual_host_id: String,
        source_filters: Vec<Ipv4Addr>,
    },

    /// Server challenge; the whole body is the salt
    AuthRequest { salt: Bytes },

    /// Client response: username plus sha1(salt + password)
    AuthReply { username: String, digest: [u8; 20] },

    /// Authentication outcome
    AuthStatus { ok: bool, message: String },
}

impl Message {
    /// Wire type code for this message
    pub fn type_code(&self) -> u32 {
        match self {
            Message::Open { .. } => type_codes::OPEN,
            Message::Close { .. } => type_codes::CLOSE,
            Message::Packet { .. } => type_codes::PACKET,
            Message::Banner { .. } => type_codes::BANNER,
            Message::HardwareInfo { .. } => type_codes::HARDWARE_INFO,
            Message::RoutingTable { .. } => type_codes::ROUTING_TABLE,
            Message::OpenTemplate { .. } => type_codes::OPEN_TEMPLATE,
            Message::AuthRequest { .. } => type_codes::AUTH_REQUEST,
            Message::AuthReply { .. } => type_codes::AUTH_REPLY,
            Message::AuthStatus { .. } => type_codes::AUTH_STATUS,
        }
    }

    /// Short name for logs and close reasons
    pub fn name(&self) -> &'static str {
        match self {
            Message::Open { .. } => "Open",
            Message::Close { .. } => "Close",
            Message::Packet { .. } => "Packet",
            Message::Banner { .. } => "Banner",
            Message::HardwareInfo { .. } => "HardwareInfo",
            Message::RoutingTable { .. } => "RoutingTable",
            Message::OpenTemplate { .. } => "OpenTemplate",
            Message::AuthRequest { .. } => "AuthRequest",
            Message::AuthReply { .. } => "AuthReply",
            Message::AuthStatus { .. } => "AuthStatus",
        }
    }

    /// Pack the message body (envelope excluded)
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::Open {
                topology_id,
                virtual_host_id,
                client_id,
                password,
            } => {
                buf.put_u32(*topology_id);
                put_fixed_str(&mut buf, virtual_host_id, ID_SIZE);
                put_fixed_str(&mut buf, client_id, ID_SIZE);
                buf.put_slice(password.as_bytes());
            }
            Message::Close { reason } => {
                buf.put_slice(reason.as_bytes());
            }
            Message::Packet {
                interface_name,
                payload,
            } => {
                put_fixed_str(&mut buf, interface_name, INTERFACE_NAME_SIZE);
                buf.put_slice(payload);
            }
            Message::Banner { text } => {
                buf.put_slice(text.as_bytes());
            }
            Message::HardwareInfo { interfaces } => {
                for intf in interfaces {
                    intf.pack(&mut buf);
                }
            }
            Message::RoutingTable {
                virtual_host_id,
                table_text,
            } => {
                put_fixed_str(&mut buf, virtual_host_id, ID_SIZE);
                buf.put_slice(table_text.as_bytes());
            }
            Message::OpenTemplate {
                template_name,
                virtual_host_id,
                source_filters,
            } => {
                put_fixed_str(&mut buf, template_name, TEMPLATE_NAME_SIZE);
                put_fixed_str(&mut buf, virtual_host_id, ID_SIZE);
                for addr in source_filters {
                    buf.put_slice(&addr.octets());
                }
            }
            Message::AuthRequest { salt } => {
                buf.put_slice(salt);
            }
            Message::AuthReply { username, digest } => {
                buf.put_slice(username.as_bytes());
                buf.put_slice(digest);
            }
            Message::AuthStatus { ok, message } => {
                buf.put_u8(u8::from(*ok));
                buf.put_slice(message.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Unpack a body for the given type code
    pub fn unpack(type_code: u32, body: &Bytes) -> MessageResult<Self> {
        match type_code {
            type_codes::OPEN => {
                let fixed = 4 + 2 * ID_SIZE;
                if body.len() < fixed {
                    return Err(malformed(type_code, "body shorter than fixed fields"));
                }
                let mut head = &body[..];
                let topology_id = head.get_u32();
                Ok(Message::Open {
                    topology_id,
                    virtual_host_id: fixed_str(&body[4..4 + ID_SIZE]),
                    client_id: fixed_str(&body[4 + ID_SIZE..fixed]),
                    password: text(&body[fixed..]),
                })
            }
            type_codes::CLOSE => Ok(Message::Close {
                reason: text(body),
            }),
            type_codes::PACKET => {
                if body.len() < INTERFACE_NAME_SIZE {
                    return Err(malformed(type_code, "missing interface name"));
                }
                Ok(Message::Packet {
                    interface_name: fixed_str(&body[..INTERFACE_NAME_SIZE]),
                    payload: body.slice(INTERFACE_NAME_SIZE..),
                })
            }
            type_codes::BANNER => Ok(Message::Banner { text: text(body) }),
            type_codes::HARDWARE_INFO => {
                if body.len() % DESCRIPTOR_SIZE != 0 {
                    return Err(malformed(type_code, "body not a whole number of descriptors"));
                }
                let interfaces = body
                    .chunks_exact(DESCRIPTOR_SIZE)
                    .map(InterfaceDescriptor::unpack)
                    .collect();
                Ok(Message::HardwareInfo { interfaces })
            }
            type_codes::ROUTING_TABLE => {
                if body.len() < ID_SIZE {
                    return Err(malformed(type_code, "missing virtual host id"));
                }
                Ok(Message::RoutingTable {
                    virtual_host_id: fixed_str(&body[..ID_SIZE]),
                    table_text: text(&body[ID_SIZE..]),
                })
            }
            type_codes::OPEN_TEMPLATE => {
                let fixed = TEMPLATE_NAME_SIZE + ID_SIZE;
                if body.len() < fixed {
                    return Err(malformed(type_code, "body shorter than fixed fields"));
                }
                let filters = &body[fixed..];
                if filters.len() % 4 != 0 {
                    return Err(malformed(type_code, "trailing source filters not 4-byte aligned"));
                }
                let source_filters = filters
                    .chunks_exact(4)
                    .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                    .collect();
                Ok(Message::OpenTemplate {
                    template_name: fixed_str(&body[..TEMPLATE_NAME_SIZE]),
                    virtual_host_id: fixed_str(&body[TEMPLATE_NAME_SIZE..fixed]),
                    source_filters,
                })
            }
            type_codes::AUTH_REQUEST => Ok(Message::AuthRequest { salt: body.clone() }),
            type_codes::AUTH_REPLY => {
                if body.len() < DIGEST_SIZE {
                    return Err(malformed(type_code, "body shorter than digest"));
                }
                let split = body.len() - DIGEST_SIZE;
                let mut digest = [0u8; DIGEST_SIZE];
                digest.copy_from_slice(&body[split..]);
                // Clients may null-pad the username to a fixed width.
                Ok(Message::AuthReply {
                    username: fixed_str(&body[..split]),
                    digest,
                })
            }
            type_codes::AUTH_STATUS => {
                if body.is_empty() {
                    return Err(malformed(type_code, "missing ok flag"));
                }
                Ok(Message::AuthStatus {
                    ok: body[0] != 0,
                    message: text(&body[1..]),
                })
            }
            other => Err(MessageError::UnknownType(other)),
        }
    }
}

/// Write `s` truncated or null-padded to exactly `width` bytes
fn put_fixed_str(buf: &mut BytesMut, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, width - n);
}

/// Read a fixed-width field, trimming trailing null padding
fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
