//! Slot hashing and the slot map.
//!
//! Keys hash to slots with CRC16 (XMODEM), honoring `{hash tags}`. The
//! [`SlotMap`] holds one [`SlotState`] per slot: the owner plus at most
//! one in-flight migration peer.

use crate::NodeId;

/// Slot count used when none is configured.
pub const DEFAULT_SLOT_COUNT: u16 = 16384;

/// CRC16 lookup table from Redis source code (crc16.c).
/// Uses CCITT polynomial for Redis Cluster slot calculation.
#[rustfmt::skip]
static CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7,
    0x8108, 0x9129, 0xa14a, 0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
    0x1231, 0x0210, 0x3273, 0x2252, 0x52b5, 0x4294, 0x72f7, 0x62d6,
    0x9339, 0x8318, 0xb37b, 0xa35a, 0xd3bd, 0xc39c, 0xf3ff, 0xe3de,
    0x2462, 0x3443, 0x0420, 0x1401, 0x64e6, 0x74c7, 0x44a4, 0x5485,
    0xa56a, 0xb54b, 0x8528, 0x9509, 0xe5ee, 0xf5cf, 0xc5ac, 0xd58d,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76d7, 0x66f6, 0x5695, 0x46b4,
    0xb75b, 0xa77a, 0x9719, 0x8738, 0xf7df, 0xe7fe, 0xd79d, 0xc7bc,
    0x48c4, 0x58e5, 0x6886, 0x78a7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xc9cc, 0xd9ed, 0xe98e, 0xf9af, 0x8948, 0x9969, 0xa90a, 0xb92b,
    0x5af5, 0x4ad4, 0x7ab7, 0x6a96, 0x1a71, 0x0a50, 0x3a33, 0x2a12,
    0xdbfd, 0xcbdc, 0xfbbf, 0xeb9e, 0x9b79, 0x8b58, 0xbb3b, 0xab1a,
    0x6ca6, 0x7c87, 0x4ce4, 0x5cc5, 0x2c22, 0x3c03, 0x0c60, 0x1c41,
    0xedae, 0xfd8f, 0xcdec, 0xddcd, 0xad2a, 0xbd0b, 0x8d68, 0x9d49,
    0x7e97, 0x6eb6, 0x5ed5, 0x4ef4, 0x3e13, 0x2e32, 0x1e51, 0x0e70,
    0xff9f, 0xefbe, 0xdfdd, 0xcffc, 0xbf1b, 0xaf3a, 0x9f59, 0x8f78,
    0x9188, 0x81a9, 0xb1ca, 0xa1eb, 0xd10c, 0xc12d, 0xf14e, 0xe16f,
    0x1080, 0x00a1, 0x30c2, 0x20e3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83b9, 0x9398, 0xa3fb, 0xb3da, 0xc33d, 0xd31c, 0xe37f, 0xf35e,
    0x02b1, 0x1290, 0x22f3, 0x32d2, 0x4235, 0x5214, 0x6277, 0x7256,
    0xb5ea, 0xa5cb, 0x95a8, 0x8589, 0xf56e, 0xe54f, 0xd52c, 0xc50d,
    0x34e2, 0x24c3, 0x14a0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405,
    0xa7db, 0xb7fa, 0x8799, 0x97b8, 0xe75f, 0xf77e, 0xc71d, 0xd73c,
    0x26d3, 0x36f2, 0x0691, 0x16b0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xd94c, 0xc96d, 0xf90e, 0xe92f, 0x99c8, 0x89e9, 0xb98a, 0xa9ab,
    0x5844, 0x4865, 0x7806, 0x6827, 0x18c0, 0x08e1, 0x3882, 0x28a3,
    0xcb7d, 0xdb5c, 0xeb3f, 0xfb1e, 0x8bf9, 0x9bd8, 0xabbb, 0xbb9a,
    0x4a75, 0x5a54, 0x6a37, 0x7a16, 0x0af1, 0x1ad0, 0x2ab3, 0x3a92,
    0xfd2e, 0xed0f, 0xdd6c, 0xcd4d, 0xbdaa, 0xad8b, 0x9de8, 0x8dc9,
    0x7c26, 0x6c07, 0x5c64, 0x4c45, 0x3ca2, 0x2c83, 0x1ce0, 0x0cc1,
    0xef1f, 0xff3e, 0xcf5d, 0xdf7c, 0xaf9b, 0xbfba, 0x8fd9, 0x9ff8,
    0x6e17, 0x7e36, 0x4e55, 0x5e74, 0x2e93, 0x3eb2, 0x0ed1, 0x1ef0,
];

fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let idx = ((crc >> 8) ^ (byte as u16)) as usize;
        (crc << 8) ^ CRC16_TABLE[idx]
    })
}

/// Returns the part of the key that gets hashed.
///
/// The tag is the content between the first `{` and the first `}` after
/// it. No closing brace, or an empty tag, means the whole key is hashed.
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let after_open = &key[open + 1..];
    match after_open.iter().position(|&b| b == b'}') {
        Some(0) | None => key,
        Some(close) => &after_open[..close],
    }
}

/// Computes the slot for a key with the default slot count.
pub fn key_slot(key: &[u8]) -> u16 {
    key_slot_in(key, DEFAULT_SLOT_COUNT)
}

/// Computes the slot for a key in a map of `slot_count` slots.
pub fn key_slot_in(key: &[u8], slot_count: u16) -> u16 {
    crc16(hash_tag(key)) % slot_count.max(1)
}

/// A contiguous, inclusive range of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    /// Creates a new slot range (end is inclusive).
    ///
    /// # Panics
    ///
    /// Panics if `start > end`.
    pub fn new(start: u16, end: u16) -> Self {
        assert!(start <= end, "SlotRange requires start <= end");
        Self { start, end }
    }

    /// Creates a range containing a single slot.
    pub fn single(slot: u16) -> Self {
        Self::new(slot, slot)
    }

    /// Number of slots in the range.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u32 {
        u32::from(self.end - self.start) + 1
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl std::fmt::Display for SlotRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Ownership and migration bookkeeping for one slot.
///
/// At most one of `migrating_to` / `importing_from` is set, and neither
/// equals `owner`. [`crate::ClusterConfig`] enforces this on every
/// transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotState {
    pub owner: Option<NodeId>,
    pub migrating_to: Option<NodeId>,
    pub importing_from: Option<NodeId>,
}

impl SlotState {
    /// A stable slot owned by `node`.
    pub fn owned_by(node: NodeId) -> Self {
        Self {
            owner: Some(node),
            ..Self::default()
        }
    }

    /// Returns true if no migration or import is in flight.
    pub fn is_stable(&self) -> bool {
        self.migrating_to.is_none() && self.importing_from.is_none()
    }

    /// Returns true if any field names `node`.
    pub fn references(&self, node: NodeId) -> bool {
        self.owner == Some(node)
            || self.migrating_to == Some(node)
            || self.importing_from == Some(node)
    }

    /// Clears every field that names `node`. Returns true if the owner
    /// was among them.
    fn release(&mut self, node: NodeId) -> bool {
        let owned = self.owner == Some(node);
        if owned {
            // transient fields are meaningless without an owner
            *self = Self::default();
            return true;
        }
        if self.migrating_to == Some(node) {
            self.migrating_to = None;
        }
        if self.importing_from == Some(node) {
            self.importing_from = None;
        }
        false
    }

    /// Checks the triple against its own invariant.
    pub fn is_consistent(&self) -> bool {
        let transients_exclusive = self.migrating_to.is_none() || self.importing_from.is_none();
        let owner_distinct = self.owner.is_none()
            || (self.migrating_to != self.owner && self.importing_from != self.owner);
        let transients_need_owner = self.owner.is_some() || self.is_stable();
        transients_exclusive && owner_distinct && transients_need_owner
    }
}

/// Maps every slot in `[0, len)` to its [`SlotState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMap {
    slots: Box<[SlotState]>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_COUNT)
    }
}

impl SlotMap {
    /// Creates an empty map with `slot_count` slots.
    ///
    /// # Panics
    ///
    /// Panics if `slot_count` is zero.
    pub fn new(slot_count: u16) -> Self {
        assert!(slot_count > 0, "slot map needs at least one slot");
        Self {
            slots: vec![SlotState::default(); slot_count as usize].into_boxed_slice(),
        }
    }

    /// Builds a map from decoded states. Returns `None` for an empty or
    /// oversized vector.
    pub(crate) fn from_states(states: Vec<SlotState>) -> Option<Self> {
        if states.is_empty() || states.len() > u16::MAX as usize {
            return None;
        }
        Some(Self {
            slots: states.into_boxed_slice(),
        })
    }

    /// Number of slots.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn get(&self, slot: u16) -> Option<&SlotState> {
        self.slots.get(slot as usize)
    }

    pub(crate) fn get_mut(&mut self, slot: u16) -> Option<&mut SlotState> {
        self.slots.get_mut(slot as usize)
    }

    /// Returns the owner of a slot, if assigned.
    pub fn owner(&self, slot: u16) -> Option<NodeId> {
        self.get(slot).and_then(|s| s.owner)
    }

    /// All slots in order, paired with their index.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &SlotState)> {
        self.slots.iter().enumerate().map(|(i, s)| (i as u16, s))
    }

    /// Lazily yields the slots owned by `node` in ascending order.
    pub fn owned_slots(&self, node: NodeId) -> OwnedSlots<'_> {
        OwnedSlots {
            slots: &self.slots,
            node,
            next: 0,
        }
    }

    /// Returns all slots owned by `node` as a list of ranges.
    ///
    /// Consecutive slots are merged into ranges for compact output.
    pub fn slots_for_node(&self, node: NodeId) -> Vec<SlotRange> {
        let mut ranges: Vec<SlotRange> = Vec::new();
        for slot in self.owned_slots(node) {
            match ranges.last_mut() {
                Some(last) if last.end + 1 == slot => last.end = slot,
                _ => ranges.push(SlotRange::single(slot)),
            }
        }
        ranges
    }

    /// Returns true if every slot has an owner.
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| s.owner.is_some())
    }

    /// Returns the number of slots with an owner.
    pub fn assigned_count(&self) -> usize {
        self.slots.iter().filter(|s| s.owner.is_some()).count()
    }

    /// Returns a count of slots per owner.
    pub fn slot_counts(&self) -> std::collections::HashMap<NodeId, usize> {
        let mut counts = std::collections::HashMap::new();
        for owner in self.slots.iter().filter_map(|s| s.owner) {
            *counts.entry(owner).or_insert(0) += 1;
        }
        counts
    }

    /// Drops every reference to `node`. Slots it owned become ownerless.
    /// Returns the number of slots that lost their owner.
    pub(crate) fn release_node(&mut self, node: NodeId) -> usize {
        self.slots
            .iter_mut()
            .filter(|s| s.references(node))
            .map(|s| s.release(node))
            .filter(|owned| *owned)
            .count()
    }

    /// Moves every slot owned by `from` to `to`, keeping transient state.
    /// Returns the number of slots moved.
    pub(crate) fn transfer_ownership(&mut self, from: NodeId, to: NodeId) -> usize {
        let mut moved = 0;
        for state in self.slots.iter_mut().filter(|s| s.owner == Some(from)) {
            state.owner = Some(to);
            if state.migrating_to == Some(to) {
                state.migrating_to = None;
            }
            if state.importing_from == Some(to) {
                state.importing_from = None;
            }
            moved += 1;
        }
        moved
    }
}

/// Iterator over the slots a node owns. See [`SlotMap::owned_slots`].
///
/// Cloning restarts from the clone's position, so callers can walk the
/// same sequence more than once.
#[derive(Debug, Clone)]
pub struct OwnedSlots<'a> {
    slots: &'a [SlotState],
    node: NodeId,
    next: usize,
}

impl Iterator for OwnedSlots<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        while self.next < self.slots.len() {
            let idx = self.next;
            self.next += 1;
            if self.slots[idx].owner == Some(self.node) {
                return Some(idx as u16);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.slots.len() - self.next))
    }
}

impl std::iter::FusedIterator for OwnedSlots<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vectors verified against Redis CLUSTER KEYSLOT
    #[test]
    fn crc16_matches_redis() {
        assert_eq!(key_slot(b""), 0);
        assert_eq!(key_slot(b"foo"), 12182);
        assert_eq!(key_slot(b"bar"), 5061);
        assert_eq!(key_slot(b"hello"), 866);
        assert_eq!(key_slot(b"123456789"), 12739);
    }

    #[test]
    fn hash_tags() {
        assert_eq!(key_slot(b"user:{123}:profile"), key_slot(b"123"));
        assert_eq!(key_slot(b"{user}:123"), key_slot(b"user"));
        assert_eq!(key_slot(b"{a}{b}"), key_slot(b"a"));
        assert_eq!(hash_tag(b"foo{}bar"), b"foo{}bar");
        assert_eq!(hash_tag(b"foo{bar"), b"foo{bar");
    }

    #[test]
    fn smaller_slot_space() {
        assert_eq!(key_slot_in(b"foo", 1024), 12182 % 1024);
        assert_eq!(key_slot_in(b"foo", 1), 0);
    }

    #[test]
    fn slot_range_basics() {
        let range = SlotRange::new(0, 5460);
        assert_eq!(range.len(), 5461);
        assert!(range.contains(5460));
        assert!(!range.contains(5461));
        assert_eq!(range.to_string(), "0-5460");
        assert_eq!(SlotRange::single(100).to_string(), "100");
        assert_eq!(SlotRange::new(0, u16::MAX).len(), 65536);
    }

    #[test]
    fn slot_state_consistency() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert!(SlotState::default().is_consistent());
        assert!(SlotState::owned_by(a).is_consistent());

        let migrating = SlotState {
            owner: Some(a),
            migrating_to: Some(b),
            importing_from: None,
        };
        assert!(migrating.is_consistent());

        let both = SlotState {
            owner: Some(a),
            migrating_to: Some(b),
            importing_from: Some(b),
        };
        assert!(!both.is_consistent());

        let to_self = SlotState {
            owner: Some(a),
            migrating_to: Some(a),
            importing_from: None,
        };
        assert!(!to_self.is_consistent());

        let ownerless = SlotState {
            owner: None,
            migrating_to: Some(b),
            importing_from: None,
        };
        assert!(!ownerless.is_consistent());
    }

    #[test]
    fn owned_slots_ascending_and_restartable() {
        let node = NodeId::new();
        let other = NodeId::new();
        let mut map = SlotMap::new(64);
        for slot in [40u16, 3, 17, 4] {
            map.get_mut(slot).unwrap().owner = Some(node);
        }
        map.get_mut(5).unwrap().owner = Some(other);

        let iter = map.owned_slots(node);
        let first: Vec<u16> = iter.clone().collect();
        let second: Vec<u16> = iter.collect();
        assert_eq!(first, vec![3, 4, 17, 40]);
        assert_eq!(first, second);
        assert_eq!(map.owned_slots(NodeId::new()).count(), 0);
    }

    #[test]
    fn slots_for_node_ranges() {
        let node = NodeId::new();
        let mut map = SlotMap::default();
        for slot in (0..=10).chain(100..=110).chain([200]) {
            map.get_mut(slot).unwrap().owner = Some(node);
        }
        assert_eq!(
            map.slots_for_node(node),
            vec![
                SlotRange::new(0, 10),
                SlotRange::new(100, 110),
                SlotRange::single(200)
            ]
        );
    }

    #[test]
    fn release_node_clears_every_reference() {
        let a = NodeId::new();
        let b = NodeId::new();
        let mut map = SlotMap::new(8);
        *map.get_mut(0).unwrap() = SlotState::owned_by(a);
        *map.get_mut(1).unwrap() = SlotState {
            owner: Some(a),
            migrating_to: Some(b),
            importing_from: None,
        };
        *map.get_mut(2).unwrap() = SlotState {
            owner: Some(b),
            migrating_to: Some(a),
            importing_from: None,
        };

        assert_eq!(map.release_node(a), 2);
        assert_eq!(map.owner(0), None);
        assert_eq!(*map.get(1).unwrap(), SlotState::default());
        assert_eq!(*map.get(2).unwrap(), SlotState::owned_by(b));
        assert!(map.iter().all(|(_, s)| !s.references(a)));
    }

    #[test]
    fn counts() {
        let a = NodeId::new();
        let mut map = SlotMap::new(4);
        assert!(!map.is_complete());
        for slot in 0..4 {
            map.get_mut(slot).unwrap().owner = Some(a);
        }
        assert!(map.is_complete());
        assert_eq!(map.assigned_count(), 4);
        assert_eq!(map.slot_counts().get(&a), Some(&4));
    }
}
