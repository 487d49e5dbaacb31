//! # registry
//!
//! why: one process hosts many raft groups and needs to route requests to the right node
//! relations: holds whatever node type the embedding service registers
//! what: RegisteredNode, NodeRegistry (copy-on-write maps by node id and by group)

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use raft_core::{GroupId, NodeId, PeerId};

/// anything that can be looked up by its `(group_id, peer_id)`
pub trait RegisteredNode: Send + Sync {
    fn node_id(&self) -> NodeId;
}

struct NodeMaps<N> {
    nodes: BTreeMap<NodeId, Arc<N>>,
    groups: BTreeMap<GroupId, Vec<Arc<N>>>,
}

// derive would require N: Clone
impl<N> Clone for NodeMaps<N> {
    fn clone(&self) -> Self {
        Self { nodes: self.nodes.clone(), groups: self.groups.clone() }
    }
}

impl<N> Default for NodeMaps<N> {
    fn default() -> Self {
        Self { nodes: BTreeMap::new(), groups: BTreeMap::new() }
    }
}

/// `(group_id, peer_id) -> node` plus an index by group
///
/// readers grab the current `Arc` and never block writers for longer than a
/// pointer copy; writers serialize, clone the maps, edit and publish.
pub struct NodeRegistry<N: RegisteredNode> {
    current: RwLock<Arc<NodeMaps<N>>>,
    writer: Mutex<()>,
}

impl<N: RegisteredNode> Default for NodeRegistry<N> {
    fn default() -> Self {
        Self { current: RwLock::new(Arc::new(NodeMaps::default())), writer: Mutex::new(()) }
    }
}

impl<N: RegisteredNode> fmt::Debug for NodeRegistry<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let maps = self.load();
        f.debug_struct("NodeRegistry")
            .field("nodes", &maps.nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<N: RegisteredNode> NodeRegistry<N> {
    pub fn new() -> Self {
        Self::default()
    }

    fn load(&self) -> Arc<NodeMaps<N>> {
        self.current.read().clone()
    }

    fn publish(&self, maps: NodeMaps<N>) {
        *self.current.write() = Arc::new(maps);
    }

    /// false if a node with the same id is already registered
    pub fn add(&self, node: Arc<N>) -> bool {
        let _writer = self.writer.lock();
        let id = node.node_id();
        let mut maps = (*self.load()).clone();
        if maps.nodes.contains_key(&id) {
            warn!("node {:?} is already registered", id);
            return false;
        }
        maps.groups.entry(id.group_id.clone()).or_default().push(node.clone());
        maps.nodes.insert(id.clone(), node);
        self.publish(maps);
        debug!("registered node {:?}", id);
        true
    }

    /// false if this exact node is not registered
    pub fn remove(&self, node: &Arc<N>) -> bool {
        let _writer = self.writer.lock();
        let id = node.node_id();
        let mut maps = (*self.load()).clone();
        match maps.nodes.get(&id) {
            Some(registered) if Arc::ptr_eq(registered, node) => {}
            _ => return false,
        }
        maps.nodes.remove(&id);
        if let Some(group) = maps.groups.get_mut(&id.group_id) {
            group.retain(|n| !Arc::ptr_eq(n, node));
            if group.is_empty() {
                maps.groups.remove(&id.group_id);
            }
        }
        self.publish(maps);
        debug!("unregistered node {:?}", id);
        true
    }

    pub fn get(&self, group_id: &str, peer_id: &PeerId) -> Option<Arc<N>> {
        self.load().nodes.get(&NodeId::new(group_id, peer_id.clone())).cloned()
    }

    /// nodes of `group_id` in registration order
    pub fn get_nodes_by_group_id(&self, group_id: &str) -> Vec<Arc<N>> {
        self.load().groups.get(group_id).cloned().unwrap_or_default()
    }

    /// every node, ordered by node id
    pub fn get_all_nodes(&self) -> Vec<Arc<N>> {
        self.load().nodes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.load().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.load().nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node(NodeId);

    impl RegisteredNode for Node {
        fn node_id(&self) -> NodeId {
            self.0.clone()
        }
    }

    fn node(group: &str, peer: &str) -> Arc<Node> {
        Arc::new(Node(NodeId::new(group, peer.parse().unwrap())))
    }

    #[test]
    fn add_rejects_duplicates() {
        let registry = NodeRegistry::new();
        assert!(registry.add(node("g", "127.0.0.1:8000")));
        assert!(!registry.add(node("g", "127.0.0.1:8000")));
        assert!(registry.add(node("g", "127.0.0.1:8000:1")));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_nodes_by_group_id("g").len(), 2);
    }

    #[test]
    fn remove_requires_the_same_node() {
        let registry = NodeRegistry::new();
        let a = node("g", "127.0.0.1:8000");
        let impostor = node("g", "127.0.0.1:8000");
        registry.add(a.clone());
        assert!(!registry.remove(&impostor));
        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert!(registry.is_empty());
        assert!(registry.get_nodes_by_group_id("g").is_empty());
    }

    #[test]
    fn snapshots_do_not_see_later_writes() {
        let registry = NodeRegistry::new();
        registry.add(node("g", "127.0.0.1:8000"));
        let before = registry.get_all_nodes();
        registry.add(node("h", "127.0.0.1:8001"));
        assert_eq!(before.len(), 1);
        assert_eq!(registry.get_all_nodes().len(), 2);
        let peer: PeerId = "127.0.0.1:8001".parse().unwrap();
        assert!(registry.get("h", &peer).is_some());
        assert!(registry.get("g", &peer).is_none());
    }
}
