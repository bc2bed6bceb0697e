//! The authoritative record of what an engine persists.
//!
//! [`EngineConfig`] caches what was on disk plus every change made since.
//! Runtime state never lands here.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use ingress_dynamo::{DynamoSnapshot, Identifier, Result};

/// The persisted form of one node, as last seen by the engine.
#[derive(Debug, Clone)]
pub enum NodeSnapshot {
    /// Captured from a live node; encoded only when saving.
    Computed {
        snapshot: DynamoSnapshot,
        created: SystemTime,
    },
    /// Bytes read back from a package, kept verbatim.
    Cached {
        bytes: Arc<[u8]>,
        modified: SystemTime,
    },
}

impl NodeSnapshot {
    pub fn computed(snapshot: DynamoSnapshot) -> Self {
        Self::Computed {
            snapshot,
            created: SystemTime::now(),
        }
    }

    /// The encoded node file.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Computed { snapshot, .. } => snapshot.encode(),
            Self::Cached { bytes, .. } => Ok(bytes.to_vec()),
        }
    }

    /// When the content last changed.
    pub fn modified(&self) -> SystemTime {
        match self {
            Self::Computed { created, .. } => *created,
            Self::Cached { modified, .. } => *modified,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached { .. })
    }
}

/// Repository identifier plus one snapshot per known node.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    repository_id: Identifier,
    node_ids: BTreeSet<Identifier>,
    node_snapshots: BTreeMap<Identifier, NodeSnapshot>,
}

impl EngineConfig {
    pub fn new(repository_id: Identifier) -> Self {
        Self {
            repository_id,
            node_ids: BTreeSet::new(),
            node_snapshots: BTreeMap::new(),
        }
    }

    pub fn repository_id(&self) -> Identifier {
        self.repository_id
    }

    pub fn node_ids(&self) -> impl Iterator<Item = Identifier> + '_ {
        self.node_ids.iter().copied()
    }

    pub fn node_snapshot(&self, id: Identifier) -> Option<&NodeSnapshot> {
        self.node_snapshots.get(&id)
    }

    pub fn node_snapshots(&self) -> impl Iterator<Item = (Identifier, &NodeSnapshot)> + '_ {
        self.node_snapshots.iter().map(|(id, snapshot)| (*id, snapshot))
    }

    /// Record a point-in-time copy of a live node for the next save.
    pub fn save_node_snapshot(&mut self, snapshot: DynamoSnapshot) {
        let id = snapshot.id();
        self.node_ids.insert(id);
        self.node_snapshots.insert(id, NodeSnapshot::computed(snapshot));
    }

    /// Record previously saved bytes of a node.
    ///
    /// A missing modification time sorts before every real one.
    pub fn save_cached_node(&mut self, id: Identifier, bytes: Vec<u8>, modified: Option<SystemTime>) {
        self.node_ids.insert(id);
        self.node_snapshots.insert(
            id,
            NodeSnapshot::Cached {
                bytes: bytes.into(),
                modified: modified.unwrap_or(SystemTime::UNIX_EPOCH),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Named {
        name: &'static str,
    }

    #[test]
    fn every_indexed_node_has_one_snapshot() {
        let mut config = EngineConfig::new(Identifier::new());
        let id = Identifier::new();

        config.save_cached_node(id, b"{}".to_vec(), None);
        config.save_node_snapshot(DynamoSnapshot::new(id, "test.named", Named { name: "a" }));
        config.save_node_snapshot(DynamoSnapshot::new(Identifier::new(), "test.named", Named { name: "b" }));

        assert_eq!(config.len(), 2);
        for id in config.node_ids() {
            assert!(config.node_snapshot(id).is_some());
        }
        assert!(!config.node_snapshot(id).unwrap().is_cached());
    }

    #[test]
    fn cached_node_without_time_is_oldest() {
        let mut config = EngineConfig::new(Identifier::new());
        let id = Identifier::new();
        config.save_cached_node(id, b"{\"a\": 1}".to_vec(), None);

        let snapshot = config.node_snapshot(id).unwrap();
        assert_eq!(snapshot.modified(), SystemTime::UNIX_EPOCH);
        assert_eq!(snapshot.encode().unwrap(), b"{\"a\": 1}");
    }
}
