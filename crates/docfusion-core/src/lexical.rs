//! In-memory BM25 index over nodes.
//!
//! Rebuilt from scratch on every run; there is nothing to persist.
//! Tokens are kept exact (lowercased, no stemming) because API names such
//! as `SetVelocity` or `gameWrapper` are the terms users search for.
//!
//! | Parameter | Value |
//! |-----------|-------|
//! | `k1`      | 1.2   |
//! | `b`       | 0.75  |
//! | idf       | `ln((N - df + 0.5) / (df + 0.5) + 1)` |

use std::collections::{BTreeSet, HashMap};

use crate::models::Node;

const K1: f64 = 1.2;
const B: f64 = 0.75;

struct IndexedNode {
    id: String,
    term_freqs: HashMap<String, u32>,
    len: usize,
}

/// Sparse term index over a fixed node sequence.
pub struct LexicalIndex {
    nodes: Vec<IndexedNode>,
    doc_freq: HashMap<String, usize>,
    avg_len: f64,
}

impl LexicalIndex {
    /// Index every node's [`Node::indexed_text`].
    pub fn build(nodes: &[Node]) -> Self {
        let mut indexed = Vec::with_capacity(nodes.len());
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        let mut total_len = 0usize;

        for node in nodes {
            let tokens = tokenize(&node.indexed_text());
            let mut term_freqs: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *term_freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in term_freqs.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            total_len += tokens.len();
            indexed.push(IndexedNode {
                id: node.id.clone(),
                term_freqs,
                len: tokens.len(),
            });
        }

        let avg_len = if indexed.is_empty() {
            0.0
        } else {
            total_len as f64 / indexed.len() as f64
        };

        Self {
            nodes: indexed,
            doc_freq,
            avg_len,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Best `k` nodes for `query` as `(node_id, score)`, highest first.
    ///
    /// Only nodes sharing at least one term with the query are returned.
    /// Equal scores keep index order.
    pub fn top_k(&self, query: &str, k: usize) -> Vec<(String, f64)> {
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() || self.nodes.is_empty() || k == 0 {
            return Vec::new();
        }

        let n = self.nodes.len() as f64;
        let idf: Vec<(&str, f64)> = terms
            .iter()
            .filter_map(|t| {
                let df = *self.doc_freq.get(t)? as f64;
                Some((t.as_str(), ((n - df + 0.5) / (df + 0.5) + 1.0).ln()))
            })
            .collect();

        let mut scored: Vec<(usize, f64)> = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            let mut score = 0.0;
            for (term, term_idf) in &idf {
                let Some(&tf) = node.term_freqs.get(*term) else {
                    continue;
                };
                let tf = tf as f64;
                let norm = 1.0 - B + B * node.len as f64 / self.avg_len.max(f64::EPSILON);
                score += term_idf * (tf * (K1 + 1.0)) / (tf + K1 * norm);
            }
            if score > 0.0 {
                scored.push((idx, score));
            }
        }

        scored.sort_by(|(ia, a), (ib, b)| b.total_cmp(a).then(ia.cmp(ib)));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(idx, score)| (self.nodes[idx].id.clone(), score))
            .collect()
    }
}

/// Lowercased runs of alphanumerics and `_`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, text: &str) -> Node {
        Node {
            id: id.to_string(),
            source_path: "sdk.md".to_string(),
            heading_path: Vec::new(),
            text: text.to_string(),
            content_hash: String::new(),
            embedding: None,
        }
    }

    #[test]
    fn test_tokenize_keeps_identifiers_whole() {
        assert_eq!(
            tokenize("car->SetVelocity(Vector{0,0,1}); game_wrapper"),
            vec!["car", "setvelocity", "vector", "0", "0", "1", "game_wrapper"]
        );
    }

    #[test]
    fn test_exact_term_ranks_first() {
        let index = LexicalIndex::build(&[
            node("a", "The ball has a location and a velocity."),
            node("b", "SetVelocity sets the velocity of a car."),
            node("c", "Boost amount of the car."),
        ]);
        let top = index.top_k("SetVelocity", 10);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, "b");
    }

    #[test]
    fn test_rare_terms_outweigh_common_ones() {
        let index = LexicalIndex::build(&[
            node("a", "car car car"),
            node("b", "car wrapper"),
            node("c", "car demolish"),
        ]);
        let top = index.top_k("car demolish", 3);
        assert_eq!(top[0].0, "c");
    }

    #[test]
    fn test_ties_keep_index_order() {
        let index = LexicalIndex::build(&[node("z", "same words"), node("a", "same words")]);
        let ids: Vec<String> = index.top_k("same", 5).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["z", "a"]);
    }

    #[test]
    fn test_heading_path_is_searchable() {
        let mut n = node("a", "Returns a vector.");
        n.heading_path = vec!["CarWrapper".to_string(), "GetVelocity".to_string()];
        let index = LexicalIndex::build(&[n, node("b", "Unrelated.")]);
        assert_eq!(index.top_k("getvelocity", 5)[0].0, "a");
    }

    #[test]
    fn test_empty_cases() {
        let empty = LexicalIndex::build(&[]);
        assert!(empty.is_empty());
        assert!(empty.top_k("anything", 5).is_empty());

        let index = LexicalIndex::build(&[node("a", "text")]);
        assert!(index.top_k("", 5).is_empty());
        assert!(index.top_k("?!", 5).is_empty());
        assert!(index.top_k("text", 0).is_empty());
        assert!(index.top_k("missing", 5).is_empty());
    }
}
