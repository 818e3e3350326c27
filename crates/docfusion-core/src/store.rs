//! Ordered, addressable node collection.
//!
//! One ingestion pass produces one `NodeStore`. Order is the ingestion
//! order (documents sorted by path, sections in document order) and is the
//! order the graph builder batches over.

use std::collections::HashMap;

use crate::models::Node;

#[derive(Debug, Clone, Default)]
pub struct NodeStore {
    nodes: Vec<Node>,
    by_id: HashMap<String, usize>,
}

impl NodeStore {
    /// Build a store. If two nodes share an id, the first one wins.
    pub fn new(nodes: Vec<Node>) -> Self {
        let mut kept = Vec::with_capacity(nodes.len());
        let mut by_id = HashMap::with_capacity(nodes.len());
        for node in nodes {
            if by_id.contains_key(&node.id) {
                continue;
            }
            by_id.insert(node.id.clone(), kept.len());
            kept.push(node);
        }
        Self { nodes: kept, by_id }
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.by_id.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, text: &str) -> Node {
        Node {
            id: id.to_string(),
            source_path: "a.md".to_string(),
            heading_path: Vec::new(),
            text: text.to_string(),
            content_hash: String::new(),
            embedding: None,
        }
    }

    #[test]
    fn test_lookup_and_order() {
        let store = NodeStore::new(vec![node("b", "1"), node("a", "2"), node("b", "3")]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("b").map(|n| n.text.as_str()), Some("1"));
        let ids: Vec<&str> = store.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(!store.contains("z"));
    }
}
