//! Reference-counted dependency nodes

use std::collections::HashMap;
use std::hash::Hash;

struct Node<V> {
    refs: usize,
    value: V,
}

/// Arena of dependency nodes keyed by a deduplication code
///
/// Each node is created on its first [`acquire`](Self::acquire) and removed
/// by the [`release`](Self::release) that drops its reference count to zero.
/// The removed value is handed back so the caller can tear it down.
pub struct DependencyTable<K, V> {
    nodes: HashMap<K, Node<V>>,
}

impl<K: Eq + Hash + Clone, V> Default for DependencyTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V> DependencyTable<K, V> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Add a reference to `key`, creating the node with `make` if needed
    ///
    /// Returns `true` if the node was created by this call.
    pub fn acquire(&mut self, key: K, make: impl FnOnce() -> V) -> bool {
        match self.nodes.get_mut(&key) {
            Some(node) => {
                node.refs += 1;
                false
            }
            None => {
                self.nodes.insert(key, Node { refs: 1, value: make() });
                true
            }
        }
    }

    /// Drop a reference to `key`
    ///
    /// Returns the node's value when this was the last reference.
    pub fn release(&mut self, key: &K) -> Option<V> {
        let node = self.nodes.get_mut(key)?;
        node.refs -= 1;
        if node.refs == 0 {
            self.nodes.remove(key).map(|n| n.value)
        } else {
            None
        }
    }

    /// Remove a node regardless of its reference count
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.nodes.remove(key).map(|n| n.value)
    }

    /// Current reference count of `key` (0 if absent)
    pub fn refs(&self, key: &K) -> usize {
        self.nodes.get(key).map(|n| n.refs).unwrap_or(0)
    }

    /// Value of a node
    pub fn get(&self, key: &K) -> Option<&V> {
        self.nodes.get(key).map(|n| &n.value)
    }

    /// Mutable value of a node
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.nodes.get_mut(key).map(|n| &mut n.value)
    }

    /// Whether a node exists for `key`
    pub fn contains(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    /// Keys of all live nodes
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.nodes.keys()
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the table has no live nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_release_removes_node() {
        let mut table = DependencyTable::new();
        assert!(table.acquire("a", || 1));
        assert!(!table.acquire("a", || 2));
        assert_eq!(table.refs(&"a"), 2);
        assert_eq!(table.get(&"a"), Some(&1));

        assert_eq!(table.release(&"a"), None);
        assert!(table.contains(&"a"));
        assert_eq!(table.release(&"a"), Some(1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_unknown_is_noop() {
        let mut table: DependencyTable<&str, ()> = DependencyTable::new();
        assert_eq!(table.release(&"ghost"), None);
    }
}
