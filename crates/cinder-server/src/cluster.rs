//! Cluster command handlers and the gossip loop.
//!
//! The coordinator owns the node's [`ClusterHandle`] and the config file.
//! Every admin command and every incoming gossip payload goes through it,
//! and any change to the live config is written back to disk before the
//! reply goes out. File writes run on the blocking pool.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cinder_cluster::{
    ClusterConfig, ClusterError, ClusterHandle, MergeOutcome, NodeId, Worker,
};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::commands::{ClusterCommand, SetSlotAction};
use crate::frame::Frame;
use crate::store::ConfigStore;

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

/// Executes cluster commands and gossip against the live config.
#[derive(Debug)]
pub struct ClusterCoordinator {
    handle: Arc<ClusterHandle>,
    store: Option<ConfigStore>,
    /// Serializes file writes so the last save always holds the newest config.
    save_lock: Mutex<()>,
    forget_ban: Duration,
    gossip_port_offset: u16,
    seeds: Vec<SocketAddr>,
}

impl ClusterCoordinator {
    pub fn new(
        handle: Arc<ClusterHandle>,
        store: Option<ConfigStore>,
        forget_ban: Duration,
        gossip_port_offset: u16,
        seeds: Vec<SocketAddr>,
    ) -> Self {
        Self {
            handle,
            store,
            save_lock: Mutex::new(()),
            forget_ban,
            gossip_port_offset,
            seeds,
        }
    }

    pub fn handle(&self) -> &Arc<ClusterHandle> {
        &self.handle
    }

    /// Runs one CLUSTER subcommand and renders the reply. A change to the
    /// live config is on disk before this returns.
    pub async fn execute(&self, cmd: ClusterCommand) -> Frame {
        let before = self.handle.version();
        let reply = self.apply(cmd);
        if self.handle.version() != before {
            self.persist().await;
        }
        reply
    }

    fn apply(&self, cmd: ClusterCommand) -> Frame {
        match cmd {
            ClusterCommand::MyId => Frame::text(self.handle.read(|c| c.my_id().to_string())),
            ClusterCommand::Nodes => Frame::text(self.handle.read(ClusterConfig::cluster_nodes)),
            ClusterCommand::Info => Frame::text(self.handle.read(ClusterConfig::cluster_info)),
            ClusterCommand::Slots => self.handle.read(cluster_slots),
            ClusterCommand::Meet { id, host, port } => self.cluster_meet(&id, &host, port),
            ClusterCommand::Forget { id, ban_secs } => self.cluster_forget(&id, ban_secs),
            ClusterCommand::AddSlots(slots) => self.cluster_addslots(&slots),
            ClusterCommand::DelSlots(slots) => self.cluster_delslots(&slots),
            ClusterCommand::SetSlot { slot, action } => self.cluster_setslot(slot, action),
            ClusterCommand::BumpEpoch(id) => self.cluster_bumpepoch(id.as_deref()),
            ClusterCommand::Replicate(primary) => {
                self.reply_ok(resolve(&primary).and_then(|primary| {
                    self.mutate(|c| {
                        let me = c.my_id();
                        c.set_replica_of(me, primary)
                    })
                }))
            }
            ClusterCommand::Failover(id) => {
                self.reply_ok(resolve(&id).and_then(|id| self.mutate(|c| c.promote(id))))
            }
            ClusterCommand::KeySlot(key) => {
                Frame::Integer(self.handle.read(|c| c.key_slot(key.as_bytes())) as i64)
            }
            ClusterCommand::Role(id) => {
                Frame::text(self.handle.read(|c| c.node_role_by_name(&id)).to_string())
            }
        }
    }

    /// CLUSTER MEET id host port
    fn cluster_meet(&self, raw: &str, host: &str, port: u16) -> Frame {
        let Ok(id) = NodeId::parse(raw) else {
            return Frame::err(format!("Invalid node ID {raw}"));
        };
        let result = self.mutate(|c| c.add_worker(Worker::primary(id, host, port)));
        if result.is_ok() {
            info!(node = %id, host, port, "met node");
        }
        self.reply_ok(result)
    }

    /// CLUSTER FORGET id [ban-seconds]
    fn cluster_forget(&self, raw: &str, ban_secs: Option<u64>) -> Frame {
        let ban = ban_secs.map_or(self.forget_ban, Duration::from_secs);
        self.reply_ok(resolve(raw).and_then(|id| self.handle.forget(id, ban)))
    }

    /// CLUSTER ADDSLOTS slot [slot ...]
    ///
    /// All-or-nothing: one bad slot rejects the whole list.
    fn cluster_addslots(&self, slots: &[u16]) -> Frame {
        let result = self.mutate(|c| {
            let me = c.my_id();
            check_unique(slots)?;
            for &slot in slots {
                if c.slot(slot).map_err(|e| e.to_string())?.owner.is_some() {
                    return Err(format!("Slot {slot} is already busy"));
                }
            }
            for &slot in slots {
                c.assign_slot(slot, me).map_err(|e| e.to_string())?;
            }
            Ok(())
        });
        self.reply_ok(result)
    }

    /// CLUSTER DELSLOTS slot [slot ...]
    fn cluster_delslots(&self, slots: &[u16]) -> Frame {
        let result = self.mutate(|c| {
            let me = c.my_id();
            check_unique(slots)?;
            for &slot in slots {
                match c.slot(slot).map_err(|e| e.to_string())?.owner {
                    None => return Err(format!("Slot {slot} is already unassigned")),
                    Some(owner) if owner != me => {
                        return Err(format!("Slot {slot} is not owned by this node"))
                    }
                    Some(_) => {}
                }
            }
            for &slot in slots {
                c.unassign_slot(slot).map_err(|e| e.to_string())?;
            }
            Ok(())
        });
        self.reply_ok(result)
    }

    /// CLUSTER SETSLOT slot NODE|MIGRATING|IMPORTING id, or STABLE|COMPLETE
    fn cluster_setslot(&self, slot: u16, action: SetSlotAction) -> Frame {
        let result = match action {
            SetSlotAction::Node(raw) => resolve(&raw)
                .and_then(|id| self.mutate(|c| c.assign_slot(slot, id)))
                .map_err(|e| e.to_string()),
            SetSlotAction::Migrating(raw) => resolve(&raw)
                .map_err(|e| e.to_string())
                .and_then(|target| {
                    self.mutate(|c| {
                        let owner = c.slot(slot).map_err(|e| e.to_string())?.owner;
                        if owner != Some(c.my_id()) {
                            return Err(format!("I'm not the owner of hash slot {slot}"));
                        }
                        c.begin_migration(slot, target).map_err(|e| e.to_string())
                    })
                }),
            SetSlotAction::Importing(raw) => resolve(&raw)
                .and_then(|source| self.mutate(|c| c.begin_import(slot, source)))
                .map_err(|e| e.to_string()),
            SetSlotAction::Stable => self
                .mutate(|c| c.abort_migration(slot))
                .map_err(|e| e.to_string()),
            SetSlotAction::Complete => self
                .mutate(|c| c.complete_migration(slot))
                .map_err(|e| e.to_string()),
        };
        self.reply_ok(result)
    }

    /// CLUSTER BUMPEPOCH [id]
    fn cluster_bumpepoch(&self, raw: Option<&str>) -> Frame {
        let result = match raw {
            Some(raw) => resolve(raw).and_then(|id| self.mutate(|c| c.bump_epoch(id))),
            None => self.mutate(|c| {
                let me = c.my_id();
                c.bump_epoch(me)
            }),
        };
        match result {
            Ok(epoch) => Frame::Simple(format!("BUMPED {epoch}")),
            Err(e) => Frame::err(e),
        }
    }

    fn reply_ok<E: std::fmt::Display>(&self, result: Result<(), E>) -> Frame {
        match result {
            Ok(()) => Frame::ok(),
            Err(e) => Frame::err(e),
        }
    }

    fn mutate<R, E>(&self, f: impl FnOnce(&mut ClusterConfig) -> Result<R, E>) -> Result<R, E> {
        self.handle.update(f)
    }

    /// Writes the current config to disk. Failures are logged; the live
    /// config stays authoritative either way.
    ///
    /// The snapshot is taken under the save lock, so a later call never
    /// writes an older config than an earlier one.
    pub async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.save_lock.lock().await;
        let config = self.handle.snapshot();
        let store = store.clone();
        let path = store.path().to_path_buf();
        match tokio::task::spawn_blocking(move || store.save(&config)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(path = %path.display(), "failed to save cluster config: {e}"),
            Err(e) => error!(path = %path.display(), "config save task failed: {e}"),
        }
    }

    // -- gossip --

    /// Merges a payload received from a peer.
    pub async fn receive_gossip(&self, data: &[u8], from: SocketAddr) -> Option<MergeOutcome> {
        match self.handle.merge_bytes(data) {
            Ok(outcome) => {
                if outcome == MergeOutcome::Changed {
                    debug!(%from, "gossip changed cluster config");
                    self.persist().await;
                }
                Some(outcome)
            }
            Err(e) => {
                warn!(%from, "dropping undecodable gossip: {e}");
                None
            }
        }
    }

    /// Gossip endpoints of every peer with a known address, plus the seeds.
    pub async fn gossip_targets(&self) -> Vec<SocketAddr> {
        let peers: Vec<(String, u16)> = self.handle.read(|c| {
            let me = c.my_id();
            c.workers()
                .iter()
                .filter(|w| w.id != me && !w.is_placeholder())
                .filter_map(|w| {
                    let port = w.port.checked_add(self.gossip_port_offset)?;
                    Some((w.address.clone(), port))
                })
                .collect()
        });

        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(peers.len() + self.seeds.len());
        for addr in self.seeds.iter().copied() {
            if seen.insert(addr) {
                targets.push(addr);
            }
        }
        for (host, port) in peers {
            match tokio::net::lookup_host((host.as_str(), port)).await {
                Ok(addrs) => {
                    for addr in addrs.take(1) {
                        if seen.insert(addr) {
                            targets.push(addr);
                        }
                    }
                }
                Err(e) => debug!(host = %host, port, "can't resolve gossip peer: {e}"),
            }
        }
        targets
    }

    /// Sends the current config to every gossip target once.
    pub async fn gossip_round(&self, socket: &UdpSocket) {
        let payload: Bytes = self.handle.read(ClusterConfig::to_bytes);
        if payload.len() > MAX_DATAGRAM {
            warn!(bytes = payload.len(), "cluster config too large for one datagram");
            return;
        }
        for target in self.gossip_targets().await {
            if let Err(e) = socket.send_to(&payload, target).await {
                debug!(%target, "gossip send failed: {e}");
            }
        }
    }

    /// Starts the gossip loop on an already bound socket.
    ///
    /// Each tick pushes the local config to all targets; datagrams from
    /// peers are merged as they arrive.
    pub fn spawn_gossip(self: &Arc<Self>, socket: UdpSocket, interval: Duration) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut recv_buf = vec![0u8; 65535];
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        coordinator.gossip_round(&socket).await;
                    }
                    result = socket.recv_from(&mut recv_buf) => {
                        match result {
                            Ok((len, from)) => {
                                coordinator.receive_gossip(&recv_buf[..len], from).await;
                            }
                            Err(e) => warn!("gossip recv error: {e}"),
                        }
                    }
                }
            }
        })
    }
}

/// Binds the gossip socket at the client port plus `offset`.
pub async fn bind_gossip(client_addr: SocketAddr, offset: u16) -> io::Result<UdpSocket> {
    let port = client_addr.port().checked_add(offset).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("gossip port {} + {offset} overflows", client_addr.port()),
        )
    })?;
    let addr = SocketAddr::new(client_addr.ip(), port);
    let socket = UdpSocket::bind(addr).await?;
    info!("gossip listening on {addr}");
    Ok(socket)
}

/// Unparsable ids are unknown nodes too.
fn resolve(raw: &str) -> Result<NodeId, ClusterError> {
    NodeId::parse(raw).map_err(|_| ClusterError::unknown_node(raw))
}

fn check_unique(slots: &[u16]) -> Result<(), String> {
    let mut seen = HashSet::with_capacity(slots.len());
    for &slot in slots {
        if !seen.insert(slot) {
            return Err(format!("Slot {slot} specified multiple times"));
        }
    }
    Ok(())
}

/// CLUSTER SLOTS: `[start, end, [host, port, id], replicas...]` per range.
fn cluster_slots(config: &ClusterConfig) -> Frame {
    let node_info = |w: &Worker| {
        Frame::Array(vec![
            Frame::text(w.address.clone()),
            Frame::Integer(w.port as i64),
            Frame::text(w.id.to_string()),
        ])
    };

    let mut result = Vec::new();
    for node in config.workers() {
        for range in config.owned_ranges(node.id) {
            let mut entry = vec![
                Frame::Integer(range.start as i64),
                Frame::Integer(range.end as i64),
                node_info(node),
            ];
            entry.extend(
                config
                    .workers()
                    .iter()
                    .filter(|w| w.replica_of == Some(node.id))
                    .map(node_info),
            );
            result.push(Frame::Array(entry));
        }
    }
    Frame::Array(result)
}
