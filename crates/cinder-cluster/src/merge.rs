//! Epoch-based reconciliation of two cluster views.
//!
//! Worker records merge by `config_epoch`, strictly greater wins. Equal
//! epochs with different content are ordered on
//!
//! 1. whether the record is the source node's own record,
//! 2. the source config's global epoch,
//! 3. the record content (primaries first, then the replica link and
//!    endpoint).
//!
//! The local `self` record is only ever replaced by a strictly newer one.
//!
//! Slots that differ are settled by comparing claims, where a claim
//! orders on
//!
//! 1. the owner's `config_epoch` in the config the entry came from,
//! 2. that config's global epoch,
//! 3. the owner id bytes (no owner sorts lowest),
//! 4. the whole entry.
//!
//! Both orders are total, so the outcome doesn't depend on which side is
//! local. A slot whose winning owner ended up a replica passes to that
//! replica's primary, or is cleared if there is none. The merged epoch is
//! the larger input epoch, plus one if the inputs disagreed on any slot
//! owner or a slot had to be reassigned.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::config::MAX_WORKERS;
use crate::slots::{SlotMap, SlotState};
use crate::{ClusterConfig, NodeId, NodeRole, Worker};

type Claim = (u64, u64, Option<[u8; NodeId::LEN]>, SlotState);

type Rank<'a> = (u64, bool, u64, u8, Option<NodeId>, &'a str, u16, &'a str);

type Links = HashMap<NodeId, (NodeRole, Option<NodeId>)>;

impl ClusterConfig {
    /// Merges an incoming view into this one. See [`merge`].
    pub fn merge(&self, incoming: &ClusterConfig) -> ClusterConfig {
        merge(self, incoming)
    }
}

/// Reconciles `local` with a config received from a peer.
///
/// The result keeps `local`'s identity: its `self` stays first and is only
/// replaced by an incoming record with a strictly greater epoch. Known
/// workers keep their order and new ones follow in incoming order.
///
/// Configs with different slot counts can't be reconciled, and neither can
/// a pair whose combined worker table would overflow the ordinal space;
/// `local` is returned unchanged.
pub fn merge(local: &ClusterConfig, incoming: &ClusterConfig) -> ClusterConfig {
    if local.slot_count() != incoming.slot_count() {
        warn!(
            local = local.slot_count(),
            incoming = incoming.slot_count(),
            "ignoring config with a different slot count"
        );
        return local.clone();
    }

    let known: HashSet<NodeId> = local.workers().iter().map(|w| w.id).collect();
    let by_id: HashMap<NodeId, &Worker> = incoming.workers().iter().map(|w| (w.id, w)).collect();
    let added = incoming
        .workers()
        .iter()
        .filter(|w| !known.contains(&w.id))
        .count();
    if known.len() + added > MAX_WORKERS {
        warn!(
            local = known.len(),
            added,
            "ignoring config that would overflow the worker table"
        );
        return local.clone();
    }

    let me = local.my_id();
    let mut workers: Vec<Worker> = local
        .workers()
        .iter()
        .map(|ours| match by_id.get(&ours.id) {
            Some(&other) if incoming_wins(local, ours, incoming, other, me) => other.clone(),
            _ => ours.clone(),
        })
        .collect();
    workers.extend(
        incoming
            .workers()
            .iter()
            .filter(|w| !known.contains(&w.id))
            .cloned(),
    );
    normalize_replicas(&mut workers);

    let mut states = Vec::with_capacity(local.slot_count() as usize);
    let mut disagreements = 0usize;
    for ((_, ours), (_, theirs)) in local.slots().iter().zip(incoming.slots().iter()) {
        if ours == theirs {
            states.push(*ours);
            continue;
        }
        if ours.owner != theirs.owner {
            disagreements += 1;
        }
        let winner = if claim(local, ours) >= claim(incoming, theirs) {
            ours
        } else {
            theirs
        };
        states.push(*winner);
    }
    let reassigned = reassign_replica_slots(&workers, &mut states);

    let mut epoch = local.epoch().max(incoming.epoch());
    if disagreements > 0 || reassigned > 0 {
        epoch += 1;
    }

    let Some(slots) = SlotMap::from_states(states) else {
        // both inputs hold a valid map of this length
        return local.clone();
    };

    debug!(
        workers = workers.len(),
        disagreements,
        reassigned,
        epoch,
        "merged incoming config"
    );
    ClusterConfig::from_parts(workers, slots, epoch)
}

fn incoming_wins(
    local: &ClusterConfig,
    ours: &Worker,
    incoming: &ClusterConfig,
    theirs: &Worker,
    me: NodeId,
) -> bool {
    if ours.id == me {
        return theirs.config_epoch > ours.config_epoch;
    }
    rank(incoming, theirs) > rank(local, ours)
}

fn rank<'a>(source: &ClusterConfig, worker: &'a Worker) -> Rank<'a> {
    let role = match worker.role {
        NodeRole::Unassigned => 0,
        NodeRole::Replica => 1,
        NodeRole::Primary => 2,
    };
    (
        worker.config_epoch,
        worker.id == source.my_id(),
        source.epoch(),
        role,
        worker.replica_of,
        worker.address.as_str(),
        worker.port,
        worker.hostname.as_str(),
    )
}

fn claim(source: &ClusterConfig, state: &SlotState) -> Claim {
    let owner_epoch = state
        .owner
        .and_then(|id| source.worker(id))
        .map_or(0, |w| w.config_epoch);
    (
        owner_epoch,
        source.epoch(),
        state.owner.map(|id| *id.as_bytes()),
        *state,
    )
}

fn links_of(workers: &[Worker]) -> Links {
    workers
        .iter()
        .map(|w| (w.id, (w.role, w.replica_of)))
        .collect()
}

/// Repoints replicas whose primary was itself demoted by the merge.
///
/// A replica follows the chain of `replica_of` links to the first node
/// that isn't a replica. If the chain is broken or loops, the replica
/// drops back to unassigned. Links are resolved against the merged roles
/// before any rewrite, so the outcome doesn't depend on table order.
fn normalize_replicas(workers: &mut [Worker]) {
    let links = links_of(workers);

    for worker in workers.iter_mut().filter(|w| w.role == NodeRole::Replica) {
        match resolve_primary(&links, worker.id, worker.replica_of) {
            Some(primary) => worker.replica_of = Some(primary),
            None => {
                worker.role = NodeRole::Unassigned;
                worker.replica_of = None;
            }
        }
    }
}

fn resolve_primary(links: &Links, me: NodeId, mut next: Option<NodeId>) -> Option<NodeId> {
    for _ in 0..links.len() {
        let target = next?;
        if target == me {
            return None;
        }
        match links.get(&target)? {
            (NodeRole::Replica, link) => next = *link,
            _ => return Some(target),
        }
    }
    None
}

/// Hands slots owned by a replica to its primary, or clears them when the
/// replica follows a node that isn't a primary. Returns how many slots
/// changed.
fn reassign_replica_slots(workers: &[Worker], states: &mut [SlotState]) -> usize {
    let links = links_of(workers);
    let mut reassigned = 0;
    for state in states.iter_mut() {
        let Some((NodeRole::Replica, primary)) = state.owner.and_then(|id| links.get(&id)) else {
            continue;
        };
        let heir = (*primary).filter(|p| matches!(links.get(p), Some((NodeRole::Primary, _))));
        *state = heir.map(SlotState::owned_by).unwrap_or_default();
        reassigned += 1;
    }
    reassigned
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::config::tests::cluster;

    /// Two views of the same cluster, seen from different nodes.
    fn two_views() -> (ClusterConfig, ClusterConfig) {
        let a = cluster(2);
        let b_id = a.workers()[1].id;
        let mut b = ClusterConfig::initialize_local_worker(
            b_id,
            "127.0.0.1",
            7001,
            0,
            NodeRole::Primary,
            None,
            "",
        )
        .unwrap();
        for worker in a.workers().iter().filter(|w| w.id != b_id) {
            b.add_worker(worker.clone()).unwrap();
        }
        (a, b)
    }

    #[test]
    fn merge_with_self_is_identity() {
        let (mut a, _) = two_views();
        let me = a.my_id();
        a.assign_slot(0, me).unwrap();
        a.assign_slot(1, a.workers()[2].id).unwrap();
        a.begin_migration(0, a.workers()[1].id).unwrap();

        let merged = a.merge(&a);
        assert_eq!(merged, a);
        assert_eq!(merged.my_id(), me);
    }

    #[test]
    fn higher_worker_epoch_wins() {
        let (mut a, mut b) = two_views();
        let b_id = b.my_id();
        b.set_worker_address(b_id, "10.1.1.1", 7100).unwrap();
        b.bump_epoch(b_id).unwrap();

        let merged = a.merge(&b);
        assert_eq!(merged.worker(b_id).unwrap().endpoint(), ("10.1.1.1", 7100));

        // on equal epochs a node's own record wins, from either side
        a.set_worker_address(b_id, "10.2.2.2", 7200).unwrap();
        a.bump_epoch(b_id).unwrap();
        assert_eq!(
            a.worker(b_id).unwrap().config_epoch,
            b.myself().config_epoch
        );
        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert_eq!(ab.worker(b_id).unwrap().endpoint(), ("10.1.1.1", 7100));
        assert_eq!(ba.worker(b_id).unwrap().endpoint(), ("10.1.1.1", 7100));
    }

    #[test]
    fn equal_epoch_records_break_ties_by_content() {
        let (a, b) = two_views();
        let third = a.workers()[2].id;
        let mut a = a;
        let mut b = b;
        a.set_worker_address(third, "10.0.0.1", 7301).unwrap();
        b.set_worker_address(third, "10.0.0.2", 7302).unwrap();

        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.worker(third).unwrap().endpoint(), ("10.0.0.2", 7302));
    }

    #[test]
    fn self_only_replaced_by_newer_record() {
        let (a, mut b) = two_views();
        let a_id = a.my_id();
        b.set_worker_address(a_id, "10.9.9.9", 1).unwrap();

        let merged = a.merge(&b);
        assert_eq!(merged.myself().endpoint(), ("127.0.0.1", 7000));

        b.bump_epoch(a_id).unwrap();
        let merged = a.merge(&b);
        assert_eq!(merged.myself().endpoint(), ("10.9.9.9", 1));
        assert_eq!(merged.my_id(), a_id);
    }

    #[test]
    fn new_workers_are_appended() {
        let a = cluster(1);
        let mut b = a.clone();
        let newcomer = Worker::primary(NodeId::new(), "10.0.0.5", 7005);
        b.add_worker(newcomer.clone()).unwrap();

        let merged = a.merge(&b);
        assert_eq!(merged.worker_count(), 3);
        assert_eq!(merged.workers()[2], newcomer);
        assert_eq!(merged.my_id(), a.my_id());
    }

    #[test]
    fn bumped_owner_wins_slot() {
        let (mut a, mut b) = two_views();
        let a_id = a.my_id();
        let b_id = b.my_id();
        a.assign_slot(5, a_id).unwrap();
        b.bump_epoch(b_id).unwrap();
        b.assign_slot(5, b_id).unwrap();

        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert_eq!(ab.slots().owner(5), Some(b_id));
        assert_eq!(ab, ba);
        assert_eq!(ab.epoch(), a.epoch().max(b.epoch()) + 1);
    }

    #[test]
    fn global_epoch_breaks_owner_epoch_ties() {
        let (mut a, mut b) = two_views();
        let a_id = a.my_id();
        let b_id = b.my_id();
        a.assign_slot(9, a_id).unwrap();
        b.assign_slot(9, b_id).unwrap();
        b.assign_slot(10, b_id).unwrap();

        let merged = a.merge(&b);
        assert_eq!(merged.slots().owner(9), Some(b_id));
        assert_eq!(merged.slots().owner(10), Some(b_id));
    }

    #[test]
    fn owner_id_breaks_full_ties() {
        let (mut a, mut b) = two_views();
        let a_id = a.my_id();
        let b_id = b.my_id();
        a.assign_slot(3, a_id).unwrap();
        b.assign_slot(3, b_id).unwrap();

        let expected = a_id.max(b_id);
        assert_eq!(a.merge(&b).slots().owner(3), Some(expected));
        assert_eq!(b.merge(&a).slots().owner(3), Some(expected));
    }

    #[test]
    fn epoch_unchanged_without_owner_conflict() {
        let (mut a, b) = two_views();
        a.assign_slot(0, a.my_id()).unwrap();
        a.assign_slot(1, a.my_id()).unwrap();
        let b = b.merge(&a);

        let merged = a.merge(&b);
        assert_eq!(merged.epoch(), a.epoch().max(b.epoch()));
    }

    #[test]
    fn mismatched_slot_count_keeps_local() {
        let a = cluster(1);
        let b = a.clone().with_slot_count(128).unwrap();
        assert_eq!(a.merge(&b), a);
    }

    #[test]
    fn demoted_primary_pulls_replicas_along() {
        let mut a = cluster(1);
        let old_primary = a.workers()[1].id;
        let promoted = NodeId::new();
        let sibling = NodeId::new();
        a.add_worker(Worker::replica(promoted, "h", 1, old_primary))
            .unwrap();
        a.add_worker(Worker::replica(sibling, "h", 2, old_primary))
            .unwrap();

        // the failover view never heard of the sibling
        let mut b = a.clone();
        b.promote(promoted).unwrap();
        let partial = b.without([sibling]);

        let merged = a.merge(&partial);
        assert_eq!(merged.node_role(promoted), NodeRole::Primary);
        assert_eq!(merged.worker(old_primary).unwrap().replica_of, Some(promoted));
        assert_eq!(merged.worker(sibling).unwrap().replica_of, Some(promoted));
        assert!(merged.validate().is_ok());
    }

    #[test]
    fn concurrent_failovers_converge() {
        let mut base = cluster(0);
        let primary = NodeId::new();
        let r1 = NodeId::new();
        let r2 = NodeId::new();
        base.add_worker(Worker::primary(primary, "10.0.0.1", 7001))
            .unwrap();
        base.add_worker(Worker::replica(r1, "10.0.0.2", 7002, primary))
            .unwrap();
        base.add_worker(Worker::replica(r2, "10.0.0.3", 7003, primary))
            .unwrap();
        for slot in 0..5 {
            base.assign_slot(slot, primary).unwrap();
        }

        let mut a = base.clone();
        a.promote(r1).unwrap();
        let mut b = base.clone();
        b.promote(r2).unwrap();

        let ab = a.merge(&b);
        let ba = b.merge(&a);
        assert_eq!(ab, ba);
        assert!(ab.validate().is_ok(), "{:?}", ab.validate());
        assert!(ab.epoch() > a.epoch().max(b.epoch()));
        for slot in 0..5 {
            let owner = ab.slots().owner(slot).unwrap();
            assert_eq!(ab.node_role(owner), NodeRole::Primary);
        }
        assert_eq!(ab.node_role(primary), NodeRole::Replica);
    }

    #[test]
    fn slots_of_a_demoted_owner_pass_to_its_primary() {
        let base = cluster(2);
        let x = base.workers()[1].id;
        let y = base.workers()[2].id;

        let mut a = base.clone();
        a.bump_epoch(x).unwrap();
        a.assign_slot(0, x).unwrap();

        // a newer record makes x a replica of y, and never saw the slot
        let mut b = base.clone();
        b.bump_epoch(x).unwrap();
        b.bump_epoch(x).unwrap();
        b.set_replica_of(x, y).unwrap();

        let ab = a.merge(&b);
        assert_eq!(ab.node_role(x), NodeRole::Replica);
        assert_eq!(ab.slots().owner(0), Some(y));
        assert_eq!(ab.epoch(), a.epoch().max(b.epoch()) + 1);
        assert!(ab.validate().is_ok());
        assert_eq!(ab, b.merge(&a));
    }

    #[test]
    fn worker_table_overflow_keeps_local() {
        let local = cluster(0);
        let workers: Vec<Worker> = (0..MAX_WORKERS)
            .map(|_| Worker::primary(NodeId::new(), "10.0.0.1", 7000))
            .collect();
        let incoming =
            ClusterConfig::from_parts(workers, SlotMap::new(local.slot_count()), 1);

        assert_eq!(local.merge(&incoming), local);
    }

    fn random_ops(rng: &mut StdRng, config: &mut ClusterConfig, ids: &[NodeId], rounds: usize) {
        let slot_count = config.slot_count();
        for _ in 0..rounds {
            let slot = rng.random_range(0..slot_count);
            let id = ids[rng.random_range(0..ids.len())];
            let _ = match rng.random_range(0..6) {
                0 | 1 => config.assign_slot(slot, id),
                2 => config.bump_epoch(id).map(|_| ()),
                3 => config.begin_migration(slot, id),
                4 => config.complete_migration(slot),
                _ => config.unassign_slot(slot),
            };
        }
    }

    fn random_role_ops(
        rng: &mut StdRng,
        config: &mut ClusterConfig,
        ids: &[NodeId],
        rounds: usize,
    ) {
        for _ in 0..rounds {
            let id = ids[rng.random_range(0..ids.len())];
            let other = ids[rng.random_range(0..ids.len())];
            let _ = match rng.random_range(0..4) {
                0 => config.set_replica_of(id, other),
                1 => config.promote(id),
                _ => {
                    random_ops(rng, config, ids, 5);
                    Ok(())
                }
            };
        }
    }

    #[test]
    fn randomized_merge_properties() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let (a, b) = two_views();
            let mut a = a.with_slot_count(64).unwrap();
            let mut b = b.with_slot_count(64).unwrap();
            let ids: Vec<NodeId> = a.workers().iter().map(|w| w.id).collect();

            random_ops(&mut rng, &mut a, &ids, 40);
            random_ops(&mut rng, &mut b, &ids, 40);

            let ab = a.merge(&b);
            let ba = b.merge(&a);
            assert_eq!(ab, ba);
            assert_eq!(a.merge(&a), a);
            assert!(ab.epoch() >= a.epoch().max(b.epoch()));
            assert!(ab.validate().is_ok(), "{:?}", ab.validate());
            assert_eq!(ab.merge(&ab), ab);
            assert_eq!(ab.merge(&a).slots(), ab.slots());
        }
    }

    #[test]
    fn randomized_merge_with_role_changes() {
        let mut rng = StdRng::seed_from_u64(0xfa11);
        for _ in 0..50 {
            let (a, b) = two_views();
            let mut a = a.with_slot_count(32).unwrap();
            let mut b = b.with_slot_count(32).unwrap();
            let ids: Vec<NodeId> = a.workers().iter().map(|w| w.id).collect();

            random_role_ops(&mut rng, &mut a, &ids, 12);
            random_role_ops(&mut rng, &mut b, &ids, 12);
            assert!(a.validate().is_ok(), "{:?}", a.validate());
            assert!(b.validate().is_ok(), "{:?}", b.validate());

            let ab = a.merge(&b);
            let ba = b.merge(&a);
            assert_eq!(ab, ba);
            assert_eq!(a.merge(&a), a);
            assert!(ab.epoch() >= a.epoch().max(b.epoch()));
            assert!(ab.validate().is_ok(), "{:?}", ab.validate());
            assert_eq!(ab.merge(&ab), ab);
        }
    }
}
