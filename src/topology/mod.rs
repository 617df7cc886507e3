//! Topology and credential store
//!
//! The session layer looks up topologies and checks auth digests through the
//! [`TopologyStore`] trait; the core never persists credentials itself.
//! [`MemoryStore`] is the built-in implementation, populated from the
//! configuration file.

use sha1::{Digest, Sha1};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::protocol::InterfaceDescriptor;

/// Store errors (configuration-time validation)
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Invalid MAC address '{0}'")]
    BadMac(String),

    #[error("Duplicate topology id {0}")]
    DuplicateTopology(u32),
}

pub type TopologyResult<T> = Result<T, TopologyError>;

/// One interface of a topology, wired to a forwarding-plane port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// Interface name as seen by the client (e.g. "eth0")
    pub name: String,
    /// Hardware address, colon-separated hex
    pub mac: String,
    /// Interface address
    pub ip: Ipv4Addr,
    /// Subnet mask
    pub mask: Ipv4Addr,
    /// Forwarding-plane port this interface is wired to
    pub port: u32,
}

impl InterfaceSpec {
    /// Parse the MAC string into its six octets
    pub fn mac_octets(&self) -> TopologyResult<[u8; 6]> {
        let parts: Vec<&str> = self.mac.split(':').collect();
        if parts.len() != 6 {
            return Err(TopologyError::BadMac(self.mac.clone()));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| TopologyError::BadMac(self.mac.clone()))?;
        }
        Ok(octets)
    }

    /// Wire-format descriptor for HardwareInfo
    pub fn descriptor(&self) -> TopologyResult<InterfaceDescriptor> {
        Ok(InterfaceDescriptor {
            name: self.name.clone(),
            mac: self.mac_octets()?,
            ip: self.ip,
            mask: self.mask,
        })
    }
}

/// A named virtual network configuration a client can open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyDescriptor {
    /// Topology id clients pass in Open
    pub id: u32,
    /// Interfaces of the virtual host
    pub interfaces: Vec<InterfaceSpec>,
    /// Routing table pushed to the client, opaque newline-delimited text
    #[serde(default)]
    pub rtable: String,
}

/// Lookup and authentication interface the session layer depends on
pub trait TopologyStore: Send + Sync {
    /// Find a topology by id
    fn lookup_topology(&self, topology_id: u32) -> Option<TopologyDescriptor>;

    /// Check a salted-password digest for a user
    fn authenticate(&self, username: &str, salt: &[u8], digest: &[u8; 20]) -> bool;
}

/// Compute sha1(salt || password), the digest carried in AuthReply
pub fn salted_digest(salt: &[u8], password: &str) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// In-memory store built from configuration
pub struct MemoryStore {
    topologies: HashMap<u32, TopologyDescriptor>,
    users: HashMap<String, String>,
}

impl MemoryStore {
    /// Build a store, validating topology ids and MAC addresses up front
    pub fn new(
        topologies: Vec<TopologyDescriptor>,
        users: HashMap<String, String>,
    ) -> TopologyResult<Self> {
        let mut by_id = HashMap::with_capacity(topologies.len());
        for topo in topologies {
            for intf in &topo.interfaces {
                intf.mac_octets()?;
            }
            if by_id.insert(topo.id, topo.clone()).is_some() {
                return Err(TopologyError::DuplicateTopology(topo.id));
            }
        }
        Ok(Self {
            topologies: by_id,
            users,
        })
    }
}

impl TopologyStore for MemoryStore {
    fn lookup_topology(&self, topology_id: u32) -> Option<TopologyDescriptor> {
        self.topologies.get(&topology_id).cloned()
    }

    fn authenticate(&self, username: &str, salt: &[u8], digest: &[u8; 20]) -> bool {
        match self.users.get(username) {
            Some(password) => salted_digest(salt, password) == *digest,
            None => false,
        }
    }
}
