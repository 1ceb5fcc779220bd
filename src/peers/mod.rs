//! Signed cluster membership
//!
//! A `Peers` document names every server in the cluster, which of them leads,
//! and the term (configuration epoch) it belongs to. It is signed once by the
//! operator key and never mutated afterwards: reconfiguring the cluster means
//! signing a new document with a higher term.

pub mod keys;

use crate::common::{Blake3Hasher, Error, Hash, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

pub use keys::{PrivateKey, PublicKey, Signature};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

/// One cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: NodeId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_key: Option<PublicKey>,
}

impl Server {
    pub fn new(id: impl Into<NodeId>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            pub_key: None,
        }
    }

    pub fn leader(id: impl Into<NodeId>) -> Self {
        Self::new(id, Role::Leader)
    }

    pub fn follower(id: impl Into<NodeId>) -> Self {
        Self::new(id, Role::Follower)
    }
}

/// Cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peers {
    pub term: u64,
    pub leader: Option<Server>,
    pub servers: Vec<Server>,
    #[serde(default)]
    pub pub_key: Option<PublicKey>,
    #[serde(default)]
    pub signature: Option<Signature>,
}

/// The signed part of a peer set
#[derive(Serialize)]
struct SignedFields<'a> {
    term: u64,
    leader: &'a Option<Server>,
    servers: &'a [Server],
    pub_key: &'a Option<PublicKey>,
}

impl Peers {
    /// Unsigned peer set; `leader` is taken from the server list.
    pub fn new(term: u64, servers: Vec<Server>) -> Self {
        let leader = servers.iter().find(|s| s.role == Role::Leader).cloned();
        Self {
            term,
            leader,
            servers,
            pub_key: None,
            signature: None,
        }
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let fields = SignedFields {
            term: self.term,
            leader: &self.leader,
            servers: &self.servers,
            pub_key: &self.pub_key,
        };
        Ok(bincode::serialize(&fields)?)
    }

    /// Digest over term, leader, servers and public key (the signed fields)
    pub fn digest(&self) -> Result<Hash> {
        let mut hasher = Blake3Hasher::new();
        hasher.update(b"kayak-peers").update(&self.canonical_bytes()?);
        Ok(hasher.finalize())
    }

    /// Stamp `key`'s public half into the set and sign it.
    pub fn sign(&mut self, key: &PrivateKey) -> Result<()> {
        self.pub_key = Some(key.public_key());
        let digest = self.digest()?;
        self.signature = Some(key.sign(digest.as_bytes()));
        Ok(())
    }

    /// Check shape (single leader, unique members) and signature.
    pub fn verify(&self) -> Result<()> {
        self.check_shape()?;

        let pub_key = self.pub_key.as_ref().ok_or(Error::InvalidSignature)?;
        let signature = self.signature.as_ref().ok_or(Error::InvalidSignature)?;
        pub_key.verify(self.digest()?.as_bytes(), signature)
    }

    fn check_shape(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::MalformedConfig("empty server list".into()));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.is_empty() {
                return Err(Error::MalformedConfig("server with empty id".into()));
            }
            if !seen.insert(&server.id) {
                return Err(Error::MalformedConfig(format!(
                    "duplicate server {}",
                    server.id
                )));
            }
        }

        let mut leaders = self.servers.iter().filter(|s| s.role == Role::Leader);
        let leader = match (leaders.next(), leaders.next()) {
            (Some(leader), None) => leader,
            (None, _) => return Err(Error::MalformedConfig("no leader".into())),
            (Some(_), Some(_)) => return Err(Error::MalformedConfig("multiple leaders".into())),
        };

        match &self.leader {
            Some(declared) if declared == leader => Ok(()),
            Some(declared) => Err(Error::MalformedConfig(format!(
                "leader field {} does not match server list leader {}",
                declared.id, leader.id
            ))),
            None => Err(Error::MalformedConfig("leader field missing".into())),
        }
    }

    /// Reject `self` unless it supersedes `previous`.
    pub fn check_successor(&self, previous: &Peers) -> Result<()> {
        if self.term <= previous.term {
            return Err(Error::StaleConfig {
                accepted: previous.term,
                got: self.term,
            });
        }
        Ok(())
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader.as_ref().map(|s| &s.id)
    }

    pub fn is_leader(&self, id: &NodeId) -> bool {
        self.leader_id() == Some(id)
    }

    pub fn find(&self, id: &NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| &s.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.find(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Load a peer file (JSON). The result is not verified.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        serde_json::from_slice(&bytes).map_err(|e| Error::MalformedConfig(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }
}
