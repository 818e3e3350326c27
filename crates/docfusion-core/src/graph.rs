//! Keyword lookup over extracted triplets.
//!
//! The graph retriever maps a query to source nodes in two steps:
//!
//! ```text
//! query ──keywords──▶ triplets whose subject/object contain a keyword  (weight 1.0)
//!                          │
//!                          └─entities─▶ other triplets touching those entities (weight 0.5)
//! ```
//!
//! Each hit adds `weight × confidence` to the triplet's source node. Nodes
//! are ranked by total score, ties broken by node id so the output is fully
//! determined by the triplet set.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::lexical::tokenize;
use crate::models::Triplet;

/// Weight applied to triplets reached through a matched entity.
pub const NEIGHBOUR_WEIGHT: f64 = 0.5;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "get",
    "how", "i", "in", "is", "it", "my", "of", "on", "or", "set", "the", "this", "to", "use",
    "what", "when", "where", "which", "who", "why", "with", "you",
];

/// Triplets indexed by the tokens of their subject and object.
pub struct TripletIndex {
    triplets: Vec<Triplet>,
    by_token: HashMap<String, Vec<usize>>,
    by_entity: HashMap<String, Vec<usize>>,
}

impl TripletIndex {
    pub fn new(triplets: Vec<Triplet>) -> Self {
        let mut by_token: HashMap<String, Vec<usize>> = HashMap::new();
        let mut by_entity: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, t) in triplets.iter().enumerate() {
            let mut tokens: BTreeSet<String> = tokenize(&t.subject).into_iter().collect();
            tokens.extend(tokenize(&t.object));
            for token in tokens {
                by_token.entry(token).or_default().push(idx);
            }

            let subject = normalize_entity(&t.subject);
            let object = normalize_entity(&t.object);
            by_entity.entry(subject.clone()).or_default().push(idx);
            if object != subject {
                by_entity.entry(object).or_default().push(idx);
            }
        }

        Self {
            triplets,
            by_token,
            by_entity,
        }
    }

    pub fn len(&self) -> usize {
        self.triplets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triplets.is_empty()
    }

    /// Score source nodes for `query`; best `k` as `(node_id, score)`.
    pub fn rank_nodes(&self, query: &str, k: usize) -> Vec<(String, f64)> {
        let keywords = query_keywords(query);
        if keywords.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut direct: BTreeSet<usize> = BTreeSet::new();
        for kw in &keywords {
            if let Some(hits) = self.by_token.get(kw) {
                direct.extend(hits.iter().copied());
            }
        }

        let mut entities: BTreeSet<String> = BTreeSet::new();
        for &idx in &direct {
            let t = &self.triplets[idx];
            entities.insert(normalize_entity(&t.subject));
            entities.insert(normalize_entity(&t.object));
        }

        let mut neighbours: BTreeSet<usize> = BTreeSet::new();
        for entity in &entities {
            if let Some(hits) = self.by_entity.get(entity) {
                neighbours.extend(hits.iter().copied().filter(|i| !direct.contains(i)));
            }
        }

        let mut scores: BTreeMap<&str, f64> = BTreeMap::new();
        for &idx in &direct {
            let t = &self.triplets[idx];
            *scores.entry(t.source_node_id.as_str()).or_insert(0.0) += t.confidence;
        }
        for &idx in &neighbours {
            let t = &self.triplets[idx];
            *scores.entry(t.source_node_id.as_str()).or_insert(0.0) += NEIGHBOUR_WEIGHT * t.confidence;
        }

        let mut ranked: Vec<(&str, f64)> = scores.into_iter().filter(|(_, s)| *s > 0.0).collect();
        ranked.sort_by(|(id_a, a), (id_b, b)| b.total_cmp(a).then(id_a.cmp(id_b)));
        ranked.truncate(k);
        ranked
            .into_iter()
            .map(|(id, score)| (id.to_string(), score))
            .collect()
    }
}

/// Distinct query tokens minus stop words, in first-occurrence order.
pub fn query_keywords(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

fn normalize_entity(entity: &str) -> String {
    entity.trim().to_lowercase()
}
