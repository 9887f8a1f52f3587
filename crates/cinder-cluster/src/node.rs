//! Node identity and the per-node worker record.
//!
//! A [`Worker`] is what this node knows about one cluster member,
//! including itself: where it lives, what role it plays, and the
//! config epoch its record was last stamped with.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ClusterError;

/// Address reported for a worker that has no bound endpoint yet.
pub const UNASSIGNED_ADDRESS: &str = "unassigned";

/// Port reported for a worker that has no bound endpoint yet.
pub const UNASSIGNED_PORT: u16 = 0;

/// Longest address or hostname, in bytes. Both are u16-length-prefixed on
/// the wire.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// Unique identifier for a cluster node.
///
/// Wraps a UUID v4. The text form is the 32-character lowercase hex
/// encoding without dashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Length of a node id on the wire.
    pub const LEN: usize = 16;

    /// Generates a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses a node ID from its hex form (dashes optional).
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::try_parse(s)?))
    }

    /// Builds a node ID from its raw wire bytes.
    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw wire bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        self.0.as_bytes()
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(8);
        s
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// The role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeRole {
    /// No role yet. Also what lookups of unknown nodes return.
    #[default]
    Unassigned,
    /// Owns slots and accepts writes.
    Primary,
    /// Mirrors a primary; never owns slots directly.
    Replica,
}

impl NodeRole {
    /// Wire tag for the codec.
    pub fn tag(self) -> u8 {
        match self {
            NodeRole::Unassigned => 0,
            NodeRole::Primary => 1,
            NodeRole::Replica => 2,
        }
    }

    /// Inverse of [`NodeRole::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(NodeRole::Unassigned),
            1 => Some(NodeRole::Primary),
            2 => Some(NodeRole::Replica),
            _ => None,
        }
    }

    /// Flag word used in `CLUSTER NODES` output.
    pub fn as_flag(self) -> &'static str {
        match self {
            NodeRole::Unassigned => "noflags",
            NodeRole::Primary => "master",
            NodeRole::Replica => "slave",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Unassigned => write!(f, "unassigned"),
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

/// One entry in the identity and address table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    /// Stable node identifier.
    pub id: NodeId,
    /// Host or IP for client connections, or [`UNASSIGNED_ADDRESS`].
    pub address: String,
    /// Client port, or [`UNASSIGNED_PORT`].
    pub port: u16,
    pub role: NodeRole,
    /// Primary this node replicates, only set for replicas.
    pub replica_of: Option<NodeId>,
    /// Epoch this record was last stamped with. Higher wins in a merge.
    pub config_epoch: u64,
    /// Free-form announced hostname. May be empty.
    pub hostname: String,
}

impl Worker {
    /// Creates a worker record.
    ///
    /// An empty address or a zero port yields the unassigned placeholder
    /// endpoint, so a half-specified endpoint is never stored.
    pub fn new(
        id: NodeId,
        address: &str,
        port: u16,
        role: NodeRole,
        replica_of: Option<NodeId>,
        config_epoch: u64,
        hostname: &str,
    ) -> Self {
        let (address, port) = normalize_endpoint(address, port);
        Self {
            id,
            address,
            port,
            role,
            replica_of,
            config_epoch,
            hostname: hostname.to_string(),
        }
    }

    /// Creates a primary with a bound endpoint.
    pub fn primary(id: NodeId, address: &str, port: u16) -> Self {
        Self::new(id, address, port, NodeRole::Primary, None, 0, "")
    }

    /// Creates a replica of `primary` with a bound endpoint.
    pub fn replica(id: NodeId, address: &str, port: u16, primary: NodeId) -> Self {
        Self::new(id, address, port, NodeRole::Replica, Some(primary), 0, "")
    }

    /// Creates a record whose endpoint isn't known yet.
    pub fn placeholder(id: NodeId, role: NodeRole) -> Self {
        Self::new(id, "", 0, role, None, 0, "")
    }

    /// Returns true if this worker has no bound endpoint.
    pub fn is_placeholder(&self) -> bool {
        self.address == UNASSIGNED_ADDRESS && self.port == UNASSIGNED_PORT
    }

    /// Address and port pair.
    pub fn endpoint(&self) -> (&str, u16) {
        (&self.address, self.port)
    }

    /// Rebinds the endpoint, normalizing empty input to the placeholder.
    pub fn set_endpoint(&mut self, address: &str, port: u16) {
        let (address, port) = normalize_endpoint(address, port);
        self.address = address;
        self.port = port;
    }

    /// Checks the role against the replica-of link in isolation.
    ///
    /// Whether the named primary exists and really is a primary is up to
    /// the owning config.
    pub fn check_role(&self) -> Result<(), ClusterError> {
        match (self.role, self.replica_of) {
            (NodeRole::Replica, None) => Err(ClusterError::InvalidRole(format!(
                "replica {} must name a primary",
                self.id
            ))),
            (NodeRole::Primary | NodeRole::Unassigned, Some(_)) => Err(ClusterError::InvalidRole(
                format!("{} {} can't replicate another node", self.role, self.id),
            )),
            (NodeRole::Replica, Some(primary)) if primary == self.id => Err(
                ClusterError::InvalidRole(format!("node {} can't replicate itself", self.id)),
            ),
            _ => Ok(()),
        }
    }

    /// Checks that the address and hostname fit the wire format.
    pub fn check_fields(&self) -> Result<(), ClusterError> {
        check_field_len("address", &self.address)?;
        check_field_len("hostname", &self.hostname)
    }
}

pub(crate) fn check_field_len(field: &'static str, value: &str) -> Result<(), ClusterError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(ClusterError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}

fn normalize_endpoint(address: &str, port: u16) -> (String, u16) {
    if address.is_empty() || port == UNASSIGNED_PORT {
        (UNASSIGNED_ADDRESS.to_string(), UNASSIGNED_PORT)
    } else {
        (address.to_string(), port)
    }
}
