//! Reciprocal Rank Fusion.
//!
//! Combines the ranked node lists of the vector, graph and lexical
//! retrievers using ranks only; raw scores are not comparable across
//! retrievers and are ignored here.
//!
//! ```text
//! fused(node) = Σ_R  1 / (rank_R(node) + c)      rank is 1-based
//! ```
//!
//! Ordering is total and reproducible:
//!
//! 1. fused score, descending;
//! 2. number of contributing retrievers, descending;
//! 3. first-seen position scanning the lists in priority order
//!    (vector, graph, lexical);
//! 4. node id, ascending.

use std::collections::HashMap;

use crate::models::{FusedResult, RetrieverSource};

/// Default smoothing constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

struct Accumulator {
    score: f64,
    sources: Vec<RetrieverSource>,
    first_seen: usize,
}

/// Fuse per-retriever rankings into one ordering.
///
/// `lists` may arrive in any order and may omit retrievers (a failed
/// retriever simply contributes nothing). A node repeated within one list
/// only counts at its best rank.
pub fn reciprocal_rank_fusion(
    lists: &[(RetrieverSource, Vec<String>)],
    c: f64,
) -> Vec<FusedResult> {
    let mut ordered: Vec<&(RetrieverSource, Vec<String>)> = lists.iter().collect();
    ordered.sort_by_key(|(source, _)| *source);

    let mut acc: HashMap<&str, Accumulator> = HashMap::new();
    let mut seen_counter = 0usize;

    for (source, ids) in ordered {
        for (position, id) in ids.iter().enumerate() {
            let rank = position + 1;
            let entry = acc.entry(id.as_str()).or_insert_with(|| {
                seen_counter += 1;
                Accumulator {
                    score: 0.0,
                    sources: Vec::new(),
                    first_seen: seen_counter,
                }
            });
            if entry.sources.contains(source) {
                continue;
            }
            entry.score += 1.0 / (rank as f64 + c);
            entry.sources.push(*source);
        }
    }

    let mut fused: Vec<(&str, Accumulator)> = acc.into_iter().collect();
    fused.sort_by(|(id_a, a), (id_b, b)| {
        b.score
            .total_cmp(&a.score)
            .then(b.sources.len().cmp(&a.sources.len()))
            .then(a.first_seen.cmp(&b.first_seen))
            .then(id_a.cmp(id_b))
    });

    fused
        .into_iter()
        .map(|(id, a)| FusedResult {
            node_id: id.to_string(),
            fused_score: a.score,
            sources: a.sources,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn order(fused: &[FusedResult]) -> Vec<&str> {
        fused.iter().map(|f| f.node_id.as_str()).collect()
    }

    #[test]
    fn test_reference_example_orders_a_b_c() {
        let lists = vec![
            (RetrieverSource::Vector, ids(&["a", "b", "c"])),
            (RetrieverSource::Graph, ids(&["b", "a"])),
            (RetrieverSource::Lexical, Vec::new()),
        ];
        let fused = reciprocal_rank_fusion(&lists, 60.0);
        assert_eq!(order(&fused), vec!["a", "b", "c"]);

        let expected_ab = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].fused_score - expected_ab).abs() < 1e-12);
        assert_eq!(fused[0].fused_score, fused[1].fused_score);
        assert!((fused[2].fused_score - 1.0 / 63.0).abs() < 1e-12);
        assert_eq!(
            fused[0].sources,
            vec![RetrieverSource::Vector, RetrieverSource::Graph]
        );
        assert_eq!(fused[2].sources, vec![RetrieverSource::Vector]);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let forward = vec![
            (RetrieverSource::Vector, ids(&["a", "b"])),
            (RetrieverSource::Graph, ids(&["b", "a"])),
        ];
        let reversed = vec![
            (RetrieverSource::Graph, ids(&["b", "a"])),
            (RetrieverSource::Vector, ids(&["a", "b"])),
        ];
        assert_eq!(
            reciprocal_rank_fusion(&forward, 60.0),
            reciprocal_rank_fusion(&reversed, 60.0)
        );
    }

    #[test]
    fn test_more_sources_wins_equal_score() {
        // c = 1: x scores 1/2 from one list, y scores 1/4 + 1/4 from two.
        let lists = vec![
            (RetrieverSource::Vector, ids(&["x", "p", "q"])),
            (RetrieverSource::Graph, ids(&["r", "s", "y"])),
            (RetrieverSource::Lexical, ids(&["t", "u", "y"])),
        ];
        let fused = reciprocal_rank_fusion(&lists, 1.0);
        let pos_x = fused.iter().position(|f| f.node_id == "x").unwrap();
        let pos_y = fused.iter().position(|f| f.node_id == "y").unwrap();
        assert_eq!(fused[pos_x].fused_score, fused[pos_y].fused_score);
        assert!(pos_y < pos_x);
    }

    #[test]
    fn test_first_seen_priority_breaks_full_ties() {
        // g is first seen in the graph list, l in the lexical list.
        let lists = vec![
            (RetrieverSource::Lexical, ids(&["l"])),
            (RetrieverSource::Graph, ids(&["g"])),
        ];
        let fused = reciprocal_rank_fusion(&lists, 60.0);
        assert_eq!(order(&fused), vec!["g", "l"]);
    }

    #[test]
    fn test_duplicate_within_list_counts_once() {
        let lists = vec![(RetrieverSource::Vector, ids(&["a", "a", "b"]))];
        let fused = reciprocal_rank_fusion(&lists, 60.0);
        assert_eq!(fused.len(), 2);
        assert!((fused[0].fused_score - 1.0 / 61.0).abs() < 1e-12);
        assert!((fused[1].fused_score - 1.0 / 63.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(reciprocal_rank_fusion(&[], 60.0).is_empty());
        let lists = vec![(RetrieverSource::Vector, Vec::new())];
        assert!(reciprocal_rank_fusion(&lists, 60.0).is_empty());
    }
}
