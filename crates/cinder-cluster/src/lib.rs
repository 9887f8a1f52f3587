//! cinder-cluster: membership and slot ownership for a cinder node.
//!
//! The [`ClusterConfig`] is this node's view of the cluster: which nodes
//! exist, what role each plays, which hash slots each owns, and the epochs
//! used to reconcile conflicting views gossiped between peers.
//!
//! # Architecture
//!
//! - **Identity table**: [`Worker`] records keyed by [`NodeId`], `self` first
//! - **Slot map**: one [`SlotState`] per slot (owner plus migration peer)
//! - **Epochs**: a global config epoch and a per-worker `config_epoch`
//! - **Merge**: deterministic, commutative reconciliation of two views
//! - **Codec**: versioned binary form for gossip and persistence
//! - **Handle**: [`ClusterHandle`] serializes writers behind a lock
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cinder_cluster::{ClusterConfig, NodeId, NodeRole};
//!
//! let mut config = ClusterConfig::initialize_local_worker(
//!     NodeId::new(), "127.0.0.1", 7000, 0, NodeRole::Primary, None, "",
//! )?;
//! config.assign_slot(0, config.my_id())?;
//!
//! let bytes = config.to_bytes();
//! assert_eq!(ClusterConfig::from_bytes(&bytes)?, config);
//! ```

mod codec;
mod config;
mod error;
mod merge;
mod node;
mod shared;
mod slots;

pub use codec::{FORMAT_VERSION, MAGIC, MIN_FORMAT_VERSION};
pub use config::{ClusterConfig, MAX_WORKERS, SELF_ORDINAL, UNASSIGNED_ORDINAL};
pub use error::{ClusterError, CodecError};
pub use merge::merge;
pub use node::{NodeId, NodeRole, Worker, MAX_FIELD_LEN, UNASSIGNED_ADDRESS, UNASSIGNED_PORT};
pub use shared::{ClusterHandle, MergeOutcome, DEFAULT_FORGET_BAN};
pub use slots::{
    key_slot, key_slot_in, OwnedSlots, SlotMap, SlotRange, SlotState, DEFAULT_SLOT_COUNT,
};
