//! The cluster config aggregate.
//!
//! [`ClusterConfig`] owns the worker table, the slot map and the global
//! epoch, and every mutation goes through a method here so the
//! cross-field invariants hold after each call:
//!
//! - every slot reference and every `replica_of` names an existing worker
//! - the global epoch increases whenever a slot owner or a node role changes
//! - `self` is always the first worker and never changes identity
//! - a replica points at a primary (or an unassigned node); a primary
//!   never has `replica_of` set
//!
//! Operations either succeed completely or return an error with the
//! config untouched.

use std::collections::HashMap;

use tracing::debug;

use crate::node::{check_field_len, UNASSIGNED_ADDRESS, UNASSIGNED_PORT};
use crate::slots::{key_slot_in, OwnedSlots, SlotMap, SlotRange, SlotState, DEFAULT_SLOT_COUNT};
use crate::{ClusterError, NodeId, NodeRole, Worker};

/// Most workers a config can hold. Ordinals are u16 on the wire and 0 is
/// reserved for "no worker".
pub const MAX_WORKERS: usize = u16::MAX as usize - 1;

/// Ordinal that always resolves to the unassigned placeholder.
pub const UNASSIGNED_ORDINAL: usize = 0;

/// Ordinal of the local node.
pub const SELF_ORDINAL: usize = 1;

/// This node's view of cluster membership and slot ownership.
///
/// Equality compares the global epoch, the slot map, and the set of worker
/// records keyed by id. Table order and which worker is `self` are local
/// presentation details and don't take part.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Worker table; index 0 is always `self`.
    workers: Vec<Worker>,
    slots: SlotMap,
    epoch: u64,
}

impl ClusterConfig {
    /// Creates a config holding only the local worker and no assigned slots.
    ///
    /// An empty address or a zero port stores the unassigned sentinel. A
    /// replica must name its primary; the primary is recorded as a
    /// placeholder until its address is learned.
    pub fn initialize_local_worker(
        id: NodeId,
        address: &str,
        port: u16,
        epoch: u64,
        role: NodeRole,
        replica_of: Option<NodeId>,
        hostname: &str,
    ) -> Result<Self, ClusterError> {
        let me = Worker::new(id, address, port, role, replica_of, epoch, hostname);
        me.check_role()?;
        me.check_fields()?;

        let mut workers = vec![me];
        if let Some(primary) = replica_of {
            workers.push(Worker::placeholder(primary, NodeRole::Primary));
        }

        debug!(node = %id, %role, "initialized local worker");
        Ok(Self {
            workers,
            slots: SlotMap::default(),
            epoch,
        })
    }

    /// Replaces the slot map with an empty one of `slot_count` slots.
    pub fn with_slot_count(mut self, slot_count: u16) -> Result<Self, ClusterError> {
        if slot_count == 0 {
            return Err(ClusterError::InvalidSlotCount(slot_count));
        }
        self.slots = SlotMap::new(slot_count);
        Ok(self)
    }

    /// Assembles a config from already-validated parts.
    pub(crate) fn from_parts(workers: Vec<Worker>, slots: SlotMap, epoch: u64) -> Self {
        Self {
            workers,
            slots,
            epoch,
        }
    }

    // -- identity table --

    /// The local worker.
    pub fn myself(&self) -> &Worker {
        &self.workers[0]
    }

    pub fn my_id(&self) -> NodeId {
        self.myself().id
    }

    /// Global config epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// All workers, `self` first, then table order.
    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&self, id: NodeId) -> Option<&Worker> {
        self.workers.iter().find(|w| w.id == id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.index_of(id).is_some()
    }

    /// Ordinal of a worker: 1 for `self`, 2.. for the rest in table order.
    pub fn ordinal_of(&self, id: NodeId) -> Option<usize> {
        self.index_of(id).map(|idx| idx + 1)
    }

    /// Looks up a worker's endpoint by ordinal.
    ///
    /// Ordinal 0 is the reserved unassigned slot and always yields the
    /// sentinel pair. Placeholders also report the sentinel, since that is
    /// what they store.
    pub fn worker_address(&self, ordinal: usize) -> Result<(&str, u16), ClusterError> {
        if ordinal == UNASSIGNED_ORDINAL {
            return Ok((UNASSIGNED_ADDRESS, UNASSIGNED_PORT));
        }
        self.workers
            .get(ordinal - 1)
            .map(Worker::endpoint)
            .ok_or(ClusterError::IndexOutOfRange(ordinal))
    }

    /// Role of a node, or `Unassigned` if it isn't in the table.
    pub fn node_role(&self, id: NodeId) -> NodeRole {
        self.worker(id).map(|w| w.role).unwrap_or_default()
    }

    /// Like [`ClusterConfig::node_role`], but takes the text id. Strings
    /// that don't parse as an id are unknown nodes too.
    pub fn node_role_by_name(&self, name: &str) -> NodeRole {
        NodeId::parse(name)
            .map(|id| self.node_role(id))
            .unwrap_or_default()
    }

    /// Adds a node learned through MEET or configuration.
    ///
    /// A replica's primary must already be known.
    pub fn add_worker(&mut self, worker: Worker) -> Result<(), ClusterError> {
        if self.contains(worker.id) {
            return Err(ClusterError::NodeAlreadyKnown(worker.id.to_string()));
        }
        if self.workers.len() >= MAX_WORKERS {
            return Err(ClusterError::TableFull(self.workers.len()));
        }
        worker.check_role()?;
        worker.check_fields()?;
        if let Some(primary) = worker.replica_of {
            self.check_primary_target(primary)?;
        }

        debug!(node = %worker.id, address = %worker.address, port = worker.port, "added worker");
        self.workers.push(worker);
        Ok(())
    }

    /// Binds (or rebinds) a worker's endpoint.
    pub fn set_worker_address(
        &mut self,
        id: NodeId,
        address: &str,
        port: u16,
    ) -> Result<(), ClusterError> {
        let idx = self.require(id)?;
        check_field_len("address", address)?;
        self.workers[idx].set_endpoint(address, port);
        Ok(())
    }

    /// Removes a node and every reference to it.
    ///
    /// Slots it owned become ownerless and its replicas drop back to
    /// unassigned. Forgetting `self` is refused.
    pub fn forget(&mut self, id: NodeId) -> Result<(), ClusterError> {
        if id == self.my_id() {
            return Err(ClusterError::CannotForgetSelf);
        }
        self.require(id)?;

        let released = self.remove_worker(id);
        let epoch = self.next_epoch();
        debug!(node = %id, released, epoch, "forgot node");
        Ok(())
    }

    /// Returns a copy with the given nodes removed as if forgotten, without
    /// touching the epoch. `self` is never removed.
    pub fn without(&self, ids: impl IntoIterator<Item = NodeId>) -> Self {
        let mut out = self.clone();
        let me = out.my_id();
        for id in ids {
            if id != me && out.contains(id) {
                out.remove_worker(id);
            }
        }
        out
    }

    // -- epochs and roles --

    /// Increments the global epoch and stamps it on the worker, so that
    /// worker's next change wins merges against everything seen so far.
    pub fn bump_epoch(&mut self, id: NodeId) -> Result<u64, ClusterError> {
        let idx = self.require(id)?;
        let epoch = self.next_epoch();
        self.workers[idx].config_epoch = epoch;
        Ok(epoch)
    }

    /// Turns a node into a replica of `primary`.
    ///
    /// The node must not own slots or have replicas of its own.
    pub fn set_replica_of(&mut self, id: NodeId, primary: NodeId) -> Result<(), ClusterError> {
        let idx = self.require(id)?;
        if id == primary {
            return Err(ClusterError::InvalidRole(format!(
                "node {id} can't replicate itself"
            )));
        }
        self.check_primary_target(primary)?;
        if self.slots.owned_slots(id).next().is_some() {
            return Err(ClusterError::InvalidRole(format!(
                "node {id} still owns slots"
            )));
        }
        if self.workers.iter().any(|w| w.replica_of == Some(id)) {
            return Err(ClusterError::InvalidRole(format!(
                "node {id} still has replicas"
            )));
        }

        let epoch = self.next_epoch();
        let worker = &mut self.workers[idx];
        worker.role = NodeRole::Replica;
        worker.replica_of = Some(primary);
        worker.config_epoch = epoch;
        debug!(node = %id, %primary, epoch, "set replica");
        Ok(())
    }

    /// Promotes a replica to primary.
    ///
    /// The replica takes over every slot its primary owned, the old primary
    /// becomes its replica, and sibling replicas follow the new primary.
    /// Every touched record is stamped with the new epoch.
    pub fn promote(&mut self, id: NodeId) -> Result<(), ClusterError> {
        let idx = self.require(id)?;
        let old_primary = match (self.workers[idx].role, self.workers[idx].replica_of) {
            (NodeRole::Replica, Some(primary)) => primary,
            _ => {
                return Err(ClusterError::InvalidRole(format!(
                    "node {id} is not a replica"
                )))
            }
        };

        let epoch = self.next_epoch();
        let moved = self.slots.transfer_ownership(old_primary, id);
        for worker in &mut self.workers {
            if worker.id == id {
                worker.role = NodeRole::Primary;
                worker.replica_of = None;
            } else if worker.id == old_primary || worker.replica_of == Some(old_primary) {
                worker.role = NodeRole::Replica;
                worker.replica_of = Some(id);
            } else {
                continue;
            }
            worker.config_epoch = epoch;
        }

        debug!(node = %id, %old_primary, moved, epoch, "promoted replica");
        Ok(())
    }

    // -- slot map --

    pub fn slot_count(&self) -> u16 {
        self.slots.len()
    }

    pub fn slots(&self) -> &SlotMap {
        &self.slots
    }

    /// State of one slot.
    pub fn slot(&self, slot: u16) -> Result<&SlotState, ClusterError> {
        self.slots.get(slot).ok_or(ClusterError::SlotOutOfRange {
            slot,
            count: self.slot_count(),
        })
    }

    /// Assigns a slot to a node, dropping any in-flight migration.
    pub fn assign_slot(&mut self, slot: u16, id: NodeId) -> Result<(), ClusterError> {
        self.check_slot(slot)?;
        let idx = self.require(id)?;
        if self.workers[idx].role == NodeRole::Replica {
            return Err(ClusterError::InvalidRole(format!(
                "replica {id} can't own slots"
            )));
        }

        let next = SlotState::owned_by(id);
        if self.slots.get(slot) != Some(&next) {
            self.set_slot(slot, next);
            self.next_epoch();
        }
        Ok(())
    }

    /// Clears a slot's owner.
    pub fn unassign_slot(&mut self, slot: u16) -> Result<(), ClusterError> {
        if self.slot(slot)?.owner.is_none() {
            return Err(ClusterError::SlotUnassigned(slot));
        }
        self.set_slot(slot, SlotState::default());
        self.next_epoch();
        Ok(())
    }

    /// Marks a slot as migrating from its owner to `target`.
    pub fn begin_migration(&mut self, slot: u16, target: NodeId) -> Result<(), ClusterError> {
        let state = *self.slot(slot)?;
        let target_idx = self.require(target)?;
        let owner = state.owner.ok_or(ClusterError::SlotUnassigned(slot))?;

        if state.importing_from.is_some() {
            return Err(conflict(slot, "slot is being imported"));
        }
        if owner == target {
            return Err(conflict(slot, "target already owns the slot"));
        }
        if state.migrating_to.is_some_and(|current| current != target) {
            return Err(conflict(slot, "slot is already migrating to another node"));
        }
        if self.workers[target_idx].role == NodeRole::Replica {
            return Err(ClusterError::InvalidRole(format!(
                "replica {target} can't receive slots"
            )));
        }

        self.set_slot(
            slot,
            SlotState {
                migrating_to: Some(target),
                ..state
            },
        );
        Ok(())
    }

    /// Marks a slot as being imported into this node from `source`.
    ///
    /// `source` must differ from the recorded owner and from `self`.
    pub fn begin_import(&mut self, slot: u16, source: NodeId) -> Result<(), ClusterError> {
        let state = *self.slot(slot)?;
        self.require(source)?;
        let owner = state.owner.ok_or(ClusterError::SlotUnassigned(slot))?;

        if state.migrating_to.is_some() {
            return Err(conflict(slot, "slot is migrating"));
        }
        if owner == source {
            return Err(conflict(slot, "source is the recorded owner"));
        }
        if owner == self.my_id() || source == self.my_id() {
            return Err(conflict(slot, "slot can't be imported from or into its owner"));
        }
        if self.myself().role == NodeRole::Replica {
            return Err(ClusterError::InvalidRole(
                "a replica can't import slots".to_string(),
            ));
        }
        if state.importing_from.is_some_and(|current| current != source) {
            return Err(conflict(slot, "slot is already importing from another node"));
        }

        self.set_slot(
            slot,
            SlotState {
                importing_from: Some(source),
                ..state
            },
        );
        Ok(())
    }

    /// Finishes an in-flight migration or import.
    ///
    /// A migration hands the slot to its target; an import hands it to
    /// `self`. Both transient fields are cleared.
    pub fn complete_migration(&mut self, slot: u16) -> Result<(), ClusterError> {
        let state = *self.slot(slot)?;
        let new_owner = match (state.migrating_to, state.importing_from) {
            (Some(target), _) => target,
            (None, Some(_)) => self.my_id(),
            (None, None) => return Err(ClusterError::NoMigrationInProgress(slot)),
        };
        if self.node_role(new_owner) == NodeRole::Replica {
            return Err(ClusterError::InvalidRole(format!(
                "replica {new_owner} can't own slots"
            )));
        }

        self.set_slot(slot, SlotState::owned_by(new_owner));
        let epoch = self.next_epoch();
        debug!(slot, owner = %new_owner, epoch, "slot migration completed");
        Ok(())
    }

    /// Drops an in-flight migration or import, keeping the owner.
    pub fn abort_migration(&mut self, slot: u16) -> Result<(), ClusterError> {
        let state = *self.slot(slot)?;
        if state.is_stable() {
            return Err(ClusterError::NoMigrationInProgress(slot));
        }
        self.set_slot(
            slot,
            SlotState {
                migrating_to: None,
                importing_from: None,
                ..state
            },
        );
        Ok(())
    }

    /// Slots owned by `id`, ascending. The iterator is lazy and `Clone`.
    pub fn owned_slots(&self, id: NodeId) -> OwnedSlots<'_> {
        self.slots.owned_slots(id)
    }

    /// Slots owned by `id`, collapsed into ranges.
    pub fn owned_ranges(&self, id: NodeId) -> Vec<SlotRange> {
        self.slots.slots_for_node(id)
    }

    /// Slot a key hashes to under this config's slot count.
    pub fn key_slot(&self, key: &[u8]) -> u16 {
        key_slot_in(key, self.slot_count())
    }

    /// Returns true if the local node owns the slot `key` hashes to.
    pub fn owns_key(&self, key: &[u8]) -> bool {
        self.slots.owner(self.key_slot(key)) == Some(self.my_id())
    }

    // -- rendering --

    /// Generates the response for CLUSTER INFO.
    pub fn cluster_info(&self) -> String {
        let assigned = self.slots.assigned_count();
        let state = if self.slots.is_complete() { "ok" } else { "fail" };
        let primaries = self
            .workers
            .iter()
            .filter(|w| w.role == NodeRole::Primary)
            .count();

        format!(
            "cluster_state:{}\r\n\
             cluster_slots_assigned:{}\r\n\
             cluster_slots_ok:{}\r\n\
             cluster_slot_count:{}\r\n\
             cluster_known_nodes:{}\r\n\
             cluster_size:{}\r\n\
             cluster_current_epoch:{}\r\n\
             cluster_my_epoch:{}\r\n",
            state,
            assigned,
            if state == "ok" { assigned } else { 0 },
            self.slot_count(),
            self.workers.len(),
            primaries,
            self.epoch,
            self.myself().config_epoch,
        )
    }

    /// Generates the response for CLUSTER NODES: `self` first, then table
    /// order, one line per worker.
    pub fn cluster_nodes(&self) -> String {
        let me = self.my_id();
        self.workers
            .iter()
            .map(|w| self.node_line(w, w.id == me))
            .collect::<Vec<_>>()
            .join("\n")
    }

    // Format: <id> <addr>:<port>[,<hostname>] <flags> <primary-id> <ping-sent>
    // <pong-recv> <config-epoch> <link-state> <slots>
    fn node_line(&self, worker: &Worker, myself: bool) -> String {
        let mut flags = Vec::with_capacity(3);
        if myself {
            flags.push("myself");
        }
        flags.push(worker.role.as_flag());
        if worker.is_placeholder() {
            flags.push("noaddr");
        }

        let mut endpoint = format!("{}:{}", worker.address, worker.port);
        if !worker.hostname.is_empty() {
            endpoint.push(',');
            endpoint.push_str(&worker.hostname);
        }

        let primary = worker
            .replica_of
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());

        let mut slots: Vec<String> = self
            .owned_ranges(worker.id)
            .iter()
            .map(SlotRange::to_string)
            .collect();
        if myself {
            for (slot, state) in self.slots.iter() {
                if let Some(target) = state.migrating_to {
                    slots.push(format!("[{slot}->-{target}]"));
                } else if let Some(source) = state.importing_from {
                    slots.push(format!("[{slot}-<-{source}]"));
                }
            }
        }

        format!(
            "{} {} {} {} 0 0 {} connected {}",
            worker.id,
            endpoint,
            flags.join(","),
            primary,
            worker.config_epoch,
            slots.join(" "),
        )
        .trim_end()
        .to_string()
    }

    // -- invariants --

    /// Checks every cross-field invariant. Decoded configs go through this
    /// before they are handed out.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers.is_empty() {
            return Err("config has no local worker".into());
        }
        if self.workers.len() > MAX_WORKERS {
            return Err(format!("{} workers exceeds the table limit", self.workers.len()));
        }

        let roles: HashMap<NodeId, NodeRole> =
            self.workers.iter().map(|w| (w.id, w.role)).collect();
        if roles.len() != self.workers.len() {
            return Err("duplicate node id in worker table".into());
        }

        for worker in &self.workers {
            worker.check_role().map_err(|e| e.to_string())?;
            worker.check_fields().map_err(|e| e.to_string())?;
            if let Some(primary) = worker.replica_of {
                match roles.get(&primary) {
                    None => return Err(format!("replica {} names unknown primary", worker.id)),
                    Some(NodeRole::Replica) => {
                        return Err(format!("replica {} follows another replica", worker.id))
                    }
                    Some(_) => {}
                }
            }
        }

        for (slot, state) in self.slots.iter() {
            if !state.is_consistent() {
                return Err(format!("slot {slot} has inconsistent migration state"));
            }
            let dangling = [state.owner, state.migrating_to, state.importing_from]
                .into_iter()
                .flatten()
                .any(|id| !roles.contains_key(&id));
            if dangling {
                return Err(format!("slot {slot} references an unknown node"));
            }
            if state.owner.and_then(|id| roles.get(&id)) == Some(&NodeRole::Replica) {
                return Err(format!("slot {slot} is owned by a replica"));
            }
        }
        Ok(())
    }

    // -- internals --

    fn index_of(&self, id: NodeId) -> Option<usize> {
        self.workers.iter().position(|w| w.id == id)
    }

    fn require(&self, id: NodeId) -> Result<usize, ClusterError> {
        self.index_of(id).ok_or_else(|| ClusterError::unknown_node(id))
    }

    fn check_slot(&self, slot: u16) -> Result<(), ClusterError> {
        self.slot(slot).map(|_| ())
    }

    fn check_primary_target(&self, primary: NodeId) -> Result<(), ClusterError> {
        let idx = self.require(primary)?;
        if self.workers[idx].role == NodeRole::Replica {
            return Err(ClusterError::InvalidRole(format!(
                "node {primary} is a replica"
            )));
        }
        Ok(())
    }

    fn set_slot(&mut self, slot: u16, state: SlotState) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = state;
        }
    }

    fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Drops a worker and every reference to it. Returns the number of
    /// slots that lost their owner.
    fn remove_worker(&mut self, id: NodeId) -> usize {
        self.workers.retain(|w| w.id != id);
        for worker in &mut self.workers {
            if worker.replica_of == Some(id) {
                worker.role = NodeRole::Unassigned;
                worker.replica_of = None;
            }
        }
        self.slots.release_node(id)
    }
}

impl Default for ClusterConfig {
    /// A fresh unassigned node with no endpoint.
    fn default() -> Self {
        Self {
            workers: vec![Worker::placeholder(NodeId::new(), NodeRole::Unassigned)],
            slots: SlotMap::new(DEFAULT_SLOT_COUNT),
            epoch: 0,
        }
    }
}

impl PartialEq for ClusterConfig {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch
            && self.slots == other.slots
            && self.workers.len() == other.workers.len()
            && self
                .workers
                .iter()
                .all(|w| other.worker(w.id) == Some(w))
    }
}

impl Eq for ClusterConfig {}

fn conflict(slot: u16, reason: &'static str) -> ClusterError {
    ClusterError::MigrationConflict { slot, reason }
}
