//! Shared, lock-protected access to the live cluster config.
//!
//! The node runtime owns one [`ClusterHandle`] behind an `Arc` and passes
//! it to the command layer and the gossip loop. Writers are serialized by
//! the lock; each update runs against a copy and only replaces the live
//! config when it succeeds, so readers never see half an operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::{ClusterConfig, ClusterError, CodecError, NodeId, SlotRange};

/// How long a forgotten node stays banned when no duration is given.
pub const DEFAULT_FORGET_BAN: Duration = Duration::from_secs(60);

/// Result of feeding a peer's config into the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merge changed the live config.
    Changed,
    /// The live config already covered everything in the incoming one.
    Unchanged,
    /// The sender is banned; nothing was merged.
    Ignored,
}

/// Thread-safe owner of the live [`ClusterConfig`].
#[derive(Debug)]
pub struct ClusterHandle {
    config: RwLock<ClusterConfig>,
    /// Bumped on every change so the storage engine can poll cheaply.
    version: AtomicU64,
    /// Forgotten node -> ban expiry.
    bans: Mutex<HashMap<NodeId, Instant>>,
}

impl ClusterHandle {
    pub fn new(config: ClusterConfig) -> Self {
        Self {
            config: RwLock::new(config),
            version: AtomicU64::new(0),
            bans: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` against the current config under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&ClusterConfig) -> R) -> R {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        f(&config)
    }

    /// Returns a copy of the current config.
    pub fn snapshot(&self) -> ClusterConfig {
        self.read(ClusterConfig::clone)
    }

    /// Applies a mutation atomically.
    ///
    /// `f` runs on a copy; the live config is replaced only if `f` returns
    /// `Ok` and the copy actually differs.
    pub fn update<R, E>(
        &self,
        f: impl FnOnce(&mut ClusterConfig) -> Result<R, E>,
    ) -> Result<R, E> {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        let mut next = config.clone();
        let out = f(&mut next)?;
        if next != *config {
            *config = next;
            self.version.fetch_add(1, Ordering::Release);
        }
        Ok(out)
    }

    /// Swaps in a config wholesale, as when loading persisted state.
    pub fn replace(&self, config: ClusterConfig) {
        let mut current = self.config.write().unwrap_or_else(|e| e.into_inner());
        *current = config;
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Change counter. Differs between two calls iff the config changed in
    /// between.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Slot ranges owned by the local node.
    pub fn my_ranges(&self) -> Vec<SlotRange> {
        self.read(|c| c.owned_ranges(c.my_id()))
    }

    /// Forgets a node and bans it for `ban`, so gossip from peers that
    /// haven't forgotten it yet can't bring it back.
    pub fn forget(&self, id: NodeId, ban: Duration) -> Result<(), ClusterError> {
        self.update(|c| c.forget(id))?;
        self.ban(id, ban);
        info!(node = %id, ban_secs = ban.as_secs(), "forgot node");
        Ok(())
    }

    /// Bans a node until `ban` has elapsed.
    pub fn ban(&self, id: NodeId, ban: Duration) {
        let mut bans = self.bans.lock().unwrap_or_else(|e| e.into_inner());
        bans.insert(id, Instant::now() + ban);
    }

    pub fn is_banned(&self, id: NodeId) -> bool {
        self.banned().contains(&id)
    }

    /// Currently banned nodes. Expired bans are dropped on the way.
    pub fn banned(&self) -> Vec<NodeId> {
        let now = Instant::now();
        let mut bans = self.bans.lock().unwrap_or_else(|e| e.into_inner());
        bans.retain(|_, until| *until > now);
        bans.keys().copied().collect()
    }

    /// Merges a config received from a peer.
    ///
    /// Banned nodes are stripped from the incoming view first. A config
    /// sent by a banned node is ignored entirely.
    pub fn merge_incoming(&self, incoming: &ClusterConfig) -> MergeOutcome {
        let banned = self.banned();
        if banned.contains(&incoming.my_id()) {
            debug!(sender = %incoming.my_id(), "ignoring config from banned node");
            return MergeOutcome::Ignored;
        }
        let incoming = if banned.is_empty() {
            incoming.clone()
        } else {
            incoming.without(banned)
        };

        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        let merged = config.merge(&incoming);
        if merged == *config {
            return MergeOutcome::Unchanged;
        }
        *config = merged;
        self.version.fetch_add(1, Ordering::Release);
        debug!(epoch = config.epoch(), "config changed by merge");
        MergeOutcome::Changed
    }

    /// Decodes and merges a peer's serialized config. A decode error
    /// leaves the live config untouched.
    pub fn merge_bytes(&self, data: &[u8]) -> Result<MergeOutcome, CodecError> {
        let incoming = ClusterConfig::from_bytes(data)?;
        Ok(self.merge_incoming(&incoming))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::config::tests::cluster;

    #[test]
    fn failed_update_changes_nothing() {
        let handle = ClusterHandle::new(cluster(1));
        let before = handle.snapshot();

        let err = handle
            .update(|c| {
                c.assign_slot(0, c.my_id())?;
                c.assign_slot(1, NodeId::new())
            })
            .unwrap_err();
        assert!(err.is_unknown_node());
        assert_eq!(handle.snapshot(), before);
        assert_eq!(handle.version(), 0);
    }

    #[test]
    fn version_tracks_real_changes() {
        let handle = ClusterHandle::new(cluster(0));
        handle.update(|c| c.assign_slot(0, c.my_id())).unwrap();
        assert_eq!(handle.version(), 1);

        // no-op update
        handle.update(|c| c.assign_slot(0, c.my_id())).unwrap();
        assert_eq!(handle.version(), 1);
        assert_eq!(handle.my_ranges(), vec![SlotRange::single(0)]);
    }

    #[test]
    fn forget_ban_blocks_resurrection() {
        let config = cluster(2);
        let victim = config.workers()[2].id;
        let peer_view = config.clone();
        let handle = ClusterHandle::new(config);

        handle.forget(victim, DEFAULT_FORGET_BAN).unwrap();
        assert!(handle.is_banned(victim));

        // peer still knows the victim
        assert_eq!(handle.merge_incoming(&peer_view), MergeOutcome::Unchanged);
        assert!(!handle.read(|c| c.contains(victim)));
        assert_eq!(handle.read(|c| c.worker_count()), 2);
    }

    #[test]
    fn expired_ban_allows_rejoin() {
        let config = cluster(1);
        let victim = config.workers()[1].id;
        let peer_view = config.clone();
        let handle = ClusterHandle::new(config);

        handle.forget(victim, Duration::ZERO).unwrap();
        assert!(!handle.is_banned(victim));
        assert_eq!(handle.merge_incoming(&peer_view), MergeOutcome::Changed);
        assert!(handle.read(|c| c.contains(victim)));
    }

    #[test]
    fn banned_sender_is_ignored() {
        let local = cluster(1);
        let sender = local.workers()[1].id;
        let mut theirs = ClusterConfig::initialize_local_worker(
            sender,
            "127.0.0.1",
            7001,
            0,
            crate::NodeRole::Primary,
            None,
            "",
        )
        .unwrap();
        theirs.add_worker(local.myself().clone()).unwrap();

        let handle = ClusterHandle::new(local);
        handle.ban(sender, DEFAULT_FORGET_BAN);
        assert_eq!(handle.merge_incoming(&theirs), MergeOutcome::Ignored);
    }

    #[test]
    fn bad_bytes_keep_config() {
        let handle = ClusterHandle::new(cluster(1));
        let before = handle.snapshot();
        assert!(handle.merge_bytes(b"garbage").is_err());
        assert_eq!(handle.snapshot(), before);

        let mut peer = before.clone();
        peer.assign_slot(3, peer.my_id()).unwrap();
        assert_eq!(
            handle.merge_bytes(&peer.to_bytes()).unwrap(),
            MergeOutcome::Changed
        );
        assert_eq!(handle.read(|c| c.slots().owner(3)), Some(before.my_id()));
    }

    #[test]
    fn concurrent_writers_serialize() {
        let handle = Arc::new(ClusterHandle::new(cluster(0).with_slot_count(64).unwrap()));
        let threads: Vec<_> = (0..4u16)
            .map(|t| {
                let handle = Arc::clone(&handle);
                thread::spawn(move || {
                    for slot in (t * 16)..(t * 16 + 16) {
                        handle.update(|c| c.assign_slot(slot, c.my_id())).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        handle.read(|c| {
            assert!(c.slots().is_complete());
            assert_eq!(c.epoch(), 64);
        });
        assert_eq!(handle.version(), 64);
    }
}
