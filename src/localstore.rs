use log::error;

use crate::node::Node;
use crate::utils::hash_node;

/// Worker-local fast store for nodes that never escape the creating worker.
///
/// Same find-or-put/get/set contract as the distributed table, but private
/// to one worker: fixed capacity, bounded salted probing, no locking, no
/// compare-and-swap. Exhaustion is fatal.
///
/// Every worker deserializes its own replica of the model through this
/// store, so a local index denotes the same node on all workers.
pub struct LocalStore {
    nodes: Vec<Node>,
    mask: u64,
}

impl LocalStore {
    /// Create a store with `2^bits` slots.
    pub fn new(bits: u32) -> Self {
        assert!(bits <= 28, "Local store bits should be in the range 0..=28");
        Self {
            nodes: vec![Node::default(); 1 << bits],
            mask: (1u64 << bits) - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Find the node in the store, inserting it if absent, and return its index.
    pub fn find_or_put(&mut self, key: &Node) -> u64 {
        let (word0, word1) = key.words();
        for salt in 0..self.nodes.len() as u64 {
            let index = hash_node(word0, word1, salt) & self.mask;
            let slot = &mut self.nodes[index as usize];
            if slot.is_empty() {
                *slot = *key;
                return index;
            }
            if slot == key {
                return index;
            }
        }

        error!("local store is full, allocate more entries");
        panic!("Local store is full");
    }

    /// Resolve an index to its node.
    pub fn retrieve(&self, index: u64) -> Node {
        self.nodes[index as usize]
    }

    /// Overwrite a published slot (used to flip the traversal mark in place).
    pub fn set(&mut self, index: u64, node: Node) {
        self.nodes[index as usize] = node;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::Ref;

    fn node(level: u32) -> Node {
        Node::pack(level, Ref::FALSE, Ref::TRUE).0
    }

    #[test]
    fn test_find_or_put_dedupes() {
        let mut store = LocalStore::new(4);
        let i = store.find_or_put(&node(1));
        let j = store.find_or_put(&node(2));
        let k = store.find_or_put(&node(1));
        assert_ne!(i, j);
        assert_eq!(i, k);
        assert_eq!(store.retrieve(i), node(1));
        assert_eq!(store.retrieve(j), node(2));
    }

    #[test]
    fn test_set_overwrites() {
        let mut store = LocalStore::new(4);
        let i = store.find_or_put(&node(1));
        let mut marked = store.retrieve(i);
        marked.set_mark(true);
        store.set(i, marked);
        assert!(store.retrieve(i).is_marked());
    }

    #[test]
    #[should_panic(expected = "Local store is full")]
    fn test_exhaustion_is_fatal() {
        let mut store = LocalStore::new(2);
        for level in 1..100 {
            store.find_or_put(&node(level));
        }
    }
}
