//! Error types for cluster config operations.

/// Errors returned by cluster config state transitions.
///
/// Every error is local to one operation: the config is left exactly as
/// it was before the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// The operation referenced a node this config has never heard of.
    #[error("I don't know about node {0}.")]
    UnknownNode(String),

    /// A node can't remove its own record.
    #[error("I tried hard but I can't forget myself...")]
    CannotForgetSelf,

    /// Role and replica-of combination is not allowed.
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// Slot number is outside the configured slot count.
    #[error("Invalid or out of range slot {slot} (slot count is {count})")]
    SlotOutOfRange { slot: u16, count: u16 },

    /// Worker ordinal doesn't exist in the table.
    #[error("worker index {0} is out of range")]
    IndexOutOfRange(usize),

    /// Slot has no migration or import in flight.
    #[error("no migration in progress for slot {0}")]
    NoMigrationInProgress(u16),

    /// Migration requires an owned slot.
    #[error("slot {0} is not assigned to any node")]
    SlotUnassigned(u16),

    /// The slot already has a conflicting migration state.
    #[error("slot {slot} migration conflict: {reason}")]
    MigrationConflict { slot: u16, reason: &'static str },

    /// A node with this id is already in the table.
    #[error("node {0} is already known")]
    NodeAlreadyKnown(String),

    /// The worker table can't be addressed by a u16 ordinal any more.
    #[error("worker table is full ({0} workers)")]
    TableFull(usize),

    /// An address or hostname is too long to encode.
    #[error("{field} is {len} bytes, longer than the 65535 byte limit")]
    FieldTooLong { field: &'static str, len: usize },

    /// A slot map needs at least one slot.
    #[error("invalid slot count {0}")]
    InvalidSlotCount(u16),
}

impl ClusterError {
    /// Creates an `UnknownNode` error from anything printable.
    pub fn unknown_node(id: impl std::fmt::Display) -> Self {
        ClusterError::UnknownNode(id.to_string())
    }

    /// Returns true if the error means the referenced node is unknown.
    pub fn is_unknown_node(&self) -> bool {
        matches!(self, ClusterError::UnknownNode(_))
    }
}

/// Errors returned when decoding a serialized cluster config.
///
/// A failed decode never touches the config the caller already holds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid magic bytes")]
    InvalidMagic,

    #[error("unsupported config format version: {0}")]
    UnsupportedVersion(u8),

    #[error("truncated config: need {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },

    #[error("invalid worker reference {index} in {field} (table has {count} workers)")]
    InvalidReference {
        field: &'static str,
        index: u16,
        count: usize,
    },

    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_node_message() {
        let err = ClusterError::unknown_node("1ip23j89123no");
        assert_eq!(err.to_string(), "I don't know about node 1ip23j89123no.");
        assert!(err.is_unknown_node());
        assert!(!ClusterError::CannotForgetSelf.is_unknown_node());
    }

    #[test]
    fn slot_out_of_range_message() {
        let err = ClusterError::SlotOutOfRange {
            slot: 16384,
            count: 16384,
        };
        assert!(err.to_string().contains("out of range slot 16384"));
    }

    #[test]
    fn codec_error_messages() {
        assert_eq!(
            CodecError::UnsupportedVersion(9).to_string(),
            "unsupported config format version: 9"
        );
        let err = CodecError::InvalidReference {
            field: "slot owner",
            index: 7,
            count: 3,
        };
        assert!(err.to_string().contains("slot owner"));
    }
}
