//! Unique identifiers for SWARM.GRID entities.
//!
//! Node IDs are name-based UUIDs derived from the owner and the device
//! fingerprint, so a device that reconnects gets the same ID back.
//! Task IDs are random.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for node-id derivation
const NODE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x1f, 0x3c, 0x52, 0x9e, 0x04, 0x4d, 0x8a, 0xa7, 0x21, 0x5e, 0x90, 0xc3, 0x17, 0x4b, 0x66,
]);

/// Node identifier - identifies a volunteer compute node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a new random NodeId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derive the stable ID for an owner's device
    ///
    /// The same owner/fingerprint pair always yields the same ID.
    #[must_use]
    pub fn derive(owner_id: &str, device_fingerprint: &str) -> Self {
        let name = format!("{}\u{1f}{}", owner_id, device_fingerprint);
        Self(Uuid::new_v5(&NODE_NAMESPACE, name.as_bytes()))
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

/// Task identifier - identifies a unit of work in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new random TaskId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_node_id_derive_is_stable() {
        let a = NodeId::derive("owner-1", "fp-abc");
        let b = NodeId::derive("owner-1", "fp-abc");
        assert_eq!(a, b);
    }

    #[test]
    fn test_node_id_derive_distinguishes_inputs() {
        let a = NodeId::derive("owner-1", "fp-abc");
        assert_ne!(a, NodeId::derive("owner-2", "fp-abc"));
        assert_ne!(a, NodeId::derive("owner-1", "fp-abd"));
        // separator keeps "ab"+"c" distinct from "a"+"bc"
        assert_ne!(NodeId::derive("ab", "c"), NodeId::derive("a", "bc"));
    }

    #[test]
    fn test_random_ids_unique() {
        assert_ne!(NodeId::new(), NodeId::new());
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn test_id_display() {
        let node = NodeId::from_bytes([0u8; 16]);
        assert_eq!(node.to_string(), "node_00000000-0000-0000-0000-000000000000");
        let task = TaskId::from_bytes([0u8; 16]);
        assert!(task.to_string().starts_with("task_"));
    }

    #[test]
    fn test_id_serde() {
        let task = TaskId::new();
        let json = serde_json::to_string(&task).unwrap();
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(task, back);
    }

    proptest! {
        #[test]
        fn prop_derive_is_stable_per_pair(owner in "[a-z0-9-]{1,16}", fp in "[a-z0-9-]{1,16}", other in "[a-z0-9-]{1,16}") {
            prop_assert_eq!(NodeId::derive(&owner, &fp), NodeId::derive(&owner, &fp));
            if other != fp {
                prop_assert_ne!(NodeId::derive(&owner, &fp), NodeId::derive(&owner, &other));
            }
        }
    }
}
