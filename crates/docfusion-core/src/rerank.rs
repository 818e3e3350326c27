//! Rerank ordering.
//!
//! Candidates are graded in fixed-size batches by an external relevance
//! judge. This module holds the deterministic half of reranking: turning
//! per-batch grades (or per-batch failures) into the final order.
//!
//! * Graded candidates come first, by relevance descending. Equal
//!   relevance keeps the pre-rerank fused order.
//! * Members of failed batches follow in their fused order.
//! * The result is truncated to `top_n`.

use serde::Serialize;

use crate::models::FusedResult;

/// Grader verdict for one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchGrades {
    /// One entry per batch member, in batch order. `None` means the grader
    /// did not mention that member; it is treated as relevance `0.0`.
    Graded(Vec<Option<f64>>),
    /// The grading call failed after retries.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankedCandidate {
    #[serde(flatten)]
    pub result: FusedResult,
    /// `None` when the candidate's batch could not be graded.
    pub relevance: Option<f64>,
}

/// Final rerank ordering plus the degraded-mode report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankOutcome {
    pub candidates: Vec<RerankedCandidate>,
    /// Ids of every candidate whose batch failed grading, in fused order,
    /// whether or not it survived truncation.
    pub ungraded: Vec<String>,
}

impl RerankOutcome {
    /// True when some candidates fell back to fusion order.
    pub fn is_degraded(&self) -> bool {
        !self.ungraded.is_empty()
    }
}

/// Merge batch grades into the final order.
///
/// `grades[i]` describes `candidates.chunks(batch_size).nth(i)`. Missing
/// trailing entries are treated as [`BatchGrades::Failed`].
pub fn merge_grades(
    candidates: &[FusedResult],
    batch_size: usize,
    grades: &[BatchGrades],
    top_n: usize,
) -> RerankOutcome {
    let batch_size = batch_size.max(1);
    let mut graded: Vec<(usize, f64)> = Vec::new();
    let mut ungraded: Vec<usize> = Vec::new();

    for (batch_idx, batch) in candidates.chunks(batch_size).enumerate() {
        let offset = batch_idx * batch_size;
        match grades.get(batch_idx) {
            Some(BatchGrades::Graded(scores)) => {
                for pos in 0..batch.len() {
                    let score = scores.get(pos).copied().flatten().unwrap_or(0.0);
                    graded.push((offset + pos, score));
                }
            }
            Some(BatchGrades::Failed) | None => {
                ungraded.extend(offset..offset + batch.len());
            }
        }
    }

    graded.sort_by(|(idx_a, a), (idx_b, b)| b.total_cmp(a).then(idx_a.cmp(idx_b)));

    let mut ordered: Vec<RerankedCandidate> = graded
        .iter()
        .map(|(idx, score)| RerankedCandidate {
            result: candidates[*idx].clone(),
            relevance: Some(*score),
        })
        .collect();
    ordered.extend(ungraded.iter().map(|idx| RerankedCandidate {
        result: candidates[*idx].clone(),
        relevance: None,
    }));
    ordered.truncate(top_n);

    RerankOutcome {
        candidates: ordered,
        ungraded: ungraded
            .iter()
            .map(|idx| candidates[*idx].node_id.clone())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RetrieverSource;

    fn fused(n: usize) -> Vec<FusedResult> {
        (0..n)
            .map(|i| FusedResult {
                node_id: format!("n{:02}", i),
                fused_score: 1.0 / (i as f64 + 61.0),
                sources: vec![RetrieverSource::Vector],
            })
            .collect()
    }

    fn ids(outcome: &RerankOutcome) -> Vec<&str> {
        outcome
            .candidates
            .iter()
            .map(|c| c.result.node_id.as_str())
            .collect()
    }

    #[test]
    fn test_graded_order_by_relevance() {
        let c = fused(5);
        let grades = vec![BatchGrades::Graded(vec![
            Some(2.0),
            Some(9.0),
            Some(5.0),
            Some(9.0),
            Some(1.0),
        ])];
        let out = merge_grades(&c, 5, &grades, 5);
        assert_eq!(ids(&out), vec!["n01", "n03", "n02", "n00", "n04"]);
        assert!(!out.is_degraded());
    }

    #[test]
    fn test_failed_batch_appended_in_fused_order() {
        let c = fused(15);
        let grades = vec![
            BatchGrades::Graded(vec![Some(3.0), Some(1.0), Some(8.0), Some(2.0), Some(5.0)]),
            BatchGrades::Failed,
            BatchGrades::Graded(vec![Some(7.0), Some(4.0), Some(6.0), Some(9.0), Some(0.5)]),
        ];
        let out = merge_grades(&c, 5, &grades, 15);
        assert_eq!(
            ids(&out),
            vec![
                "n13", "n02", "n10", "n12", "n04", "n11", "n00", "n03", "n01", "n14", // graded
                "n05", "n06", "n07", "n08", "n09", // fallback
            ]
        );
        assert_eq!(out.ungraded, vec!["n05", "n06", "n07", "n08", "n09"]);
        assert!(out.candidates[10..].iter().all(|c| c.relevance.is_none()));
    }

    #[test]
    fn test_truncates_to_top_n_but_reports_all_ungraded() {
        let c = fused(10);
        let grades = vec![BatchGrades::Graded(vec![Some(1.0); 5]), BatchGrades::Failed];
        let out = merge_grades(&c, 5, &grades, 5);
        assert_eq!(ids(&out), vec!["n00", "n01", "n02", "n03", "n04"]);
        assert_eq!(out.ungraded.len(), 5);
        assert!(out.is_degraded());
    }

    #[test]
    fn test_omitted_member_scores_zero() {
        let c = fused(3);
        let grades = vec![BatchGrades::Graded(vec![None, Some(4.0)])];
        let out = merge_grades(&c, 5, &grades, 3);
        assert_eq!(ids(&out), vec!["n01", "n00", "n02"]);
        assert_eq!(out.candidates[1].relevance, Some(0.0));
    }

    #[test]
    fn test_missing_grades_treated_as_failed() {
        let c = fused(7);
        let grades = vec![BatchGrades::Graded(vec![Some(1.0); 5])];
        let out = merge_grades(&c, 5, &grades, 10);
        assert_eq!(out.ungraded, vec!["n05", "n06"]);
    }
}
