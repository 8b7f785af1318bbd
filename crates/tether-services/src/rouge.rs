//! ROUGE-L over word tokens.

use serde_json::json;

use crate::capability::{ScoreDetail, SimilarityScorer};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RougeScore {
    pub precision: f64,
    pub recall: f64,
    pub fmeasure: f64,
}

/// Longest-common-subsequence F-measure. Tokens are lower-cased runs of
/// alphanumeric characters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RougeL;

impl RougeL {
    pub fn compute(&self, candidate: &str, reference: &str) -> RougeScore {
        let cand = tokenize(candidate);
        let refs = tokenize(reference);
        if cand.is_empty() || refs.is_empty() {
            return RougeScore {
                precision: 0.0,
                recall: 0.0,
                fmeasure: 0.0,
            };
        }

        let lcs = lcs_len(&cand, &refs) as f64;
        let precision = lcs / cand.len() as f64;
        let recall = lcs / refs.len() as f64;
        let fmeasure = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        RougeScore {
            precision,
            recall,
            fmeasure,
        }
    }
}

impl SimilarityScorer for RougeL {
    fn score(&self, candidate: &str, reference: &str) -> f64 {
        self.compute(candidate, reference).fmeasure
    }

    fn score_with_detail(&self, candidate: &str, reference: &str) -> ScoreDetail {
        let s = self.compute(candidate, reference);
        ScoreDetail {
            score: s.fmeasure,
            raw: Some(json!({
                "rougeL": {"precision": s.precision, "recall": s.recall, "fmeasure": s.fmeasure}
            })),
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Two-row DP; memory is O(len(b)).
fn lcs_len(a: &[String], b: &[String]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
