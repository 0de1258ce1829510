//! Hybrid Fusion: per-dataset inverted lexical index with TF·IDF scoring,
//! snippet extraction, and the five rank-fusion algorithms. Grounded on
//! the original service's `hybrid_search_service.py`.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::VectorRecord;
use crate::query::{tokenize, SearchResult};

const SNIPPET_WINDOW: usize = 200;
const RRF_K: f64 = 60.0;

/// Inverted index over a dataset's live `content` fields, rebuilt
/// whenever a text or hybrid search needs it (the caller decides how
/// aggressively to cache this — it is cheap relative to a vector scan).
pub struct LexicalIndex {
    postings: HashMap<String, Vec<String>>, // token -> vector ids
    doc_token_counts: HashMap<String, HashMap<String, usize>>, // vector id -> token -> count
    doc_lengths: HashMap<String, usize>,
    total_docs: usize,
}

impl LexicalIndex {
    pub fn build(rows: &[VectorRecord]) -> Self {
        let mut postings: HashMap<String, Vec<String>> = HashMap::new();
        let mut doc_token_counts = HashMap::new();
        let mut doc_lengths = HashMap::new();

        for row in rows {
            let Some(content) = &row.content else { continue };
            let tokens = tokenize(content);
            doc_lengths.insert(row.id.clone(), tokens.len());
            let mut counts: HashMap<String, usize> = HashMap::new();
            for token in &tokens {
                *counts.entry(token.clone()).or_insert(0) += 1;
            }
            for token in counts.keys() {
                postings.entry(token.clone()).or_default().push(row.id.clone());
            }
            doc_token_counts.insert(row.id.clone(), counts);
        }

        Self {
            total_docs: doc_token_counts.len(),
            postings,
            doc_token_counts,
            doc_lengths,
        }
    }

    /// TF·IDF-scored text search: `tf = count/tokens_in_doc`, `idf = ln(N/df)`.
    pub fn search(&self, query_text: &str, rows_by_id: &HashMap<&str, &VectorRecord>) -> Vec<SearchResult> {
        let query_tokens = tokenize(query_text);
        let mut scores: HashMap<String, f64> = HashMap::new();

        for token in &query_tokens {
            let Some(posting) = self.postings.get(token) else { continue };
            let df = posting.len();
            if df == 0 {
                continue;
            }
            let idf = ((self.total_docs.max(1) as f64) / df as f64).ln();
            for doc_id in posting {
                let count = self.doc_token_counts.get(doc_id).and_then(|c| c.get(token)).copied().unwrap_or(0);
                let doc_len = self.doc_lengths.get(doc_id).copied().unwrap_or(1).max(1);
                let tf = count as f64 / doc_len as f64;
                *scores.entry(doc_id.clone()).or_insert(0.0) += tf * idf;
            }
        }

        let mut results: Vec<SearchResult> = scores
            .into_iter()
            .filter_map(|(id, score)| {
                let row = rows_by_id.get(id.as_str())?;
                Some(SearchResult {
                    vector_id: id,
                    document_id: row.document_id.clone(),
                    score,
                    distance: -score,
                    rank: 0,
                    content: row.content.clone().map(|c| snippet(&c, &query_tokens)),
                    metadata: row.metadata.clone(),
                })
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        for (i, r) in results.iter_mut().enumerate() {
            r.rank = i + 1;
        }
        results
    }
}

/// Centers a ≤200-char window on the first matched query token.
fn snippet(content: &str, query_tokens: &[String]) -> String {
    let lower = content.to_ascii_lowercase();
    let first_match = query_tokens.iter().find_map(|t| lower.find(t.as_str()));
    let Some(pos) = first_match else {
        return content.chars().take(SNIPPET_WINDOW).collect();
    };
    let half = SNIPPET_WINDOW / 2;
    let start = pos.saturating_sub(half);
    let end = (pos + half).min(content.len());
    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.push_str(&content[start..end]);
    if end < content.len() {
        out.push_str("...");
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    WeightedSum,
    Rrf,
    CombSum,
    CombMnz,
    Borda,
}

impl FusionMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "weighted_sum" => Some(Self::WeightedSum),
            "rrf" => Some(Self::Rrf),
            "combsum" => Some(Self::CombSum),
            "combmnz" => Some(Self::CombMnz),
            "borda" | "borda_count" => Some(Self::Borda),
            _ => None,
        }
    }
}

/// Fuses a ranked vector-result list and a ranked text-result list into a
/// single list, ordered best-first, with weights `(vector_weight, text_weight)`
/// normalized to sum to 1.
pub fn fuse(
    vector_results: &[SearchResult],
    text_results: &[SearchResult],
    method: FusionMethod,
    vector_weight: f64,
    text_weight: f64,
) -> Vec<SearchResult> {
    let total = (vector_weight + text_weight).max(1e-9);
    let wv = vector_weight / total;
    let wt = text_weight / total;

    let fused_scores: HashMap<String, f64> = match method {
        FusionMethod::WeightedSum => weighted_sum(vector_results, text_results, wv, wt),
        FusionMethod::Rrf => rrf(vector_results, text_results, wv, wt),
        FusionMethod::CombSum => comb_sum(vector_results, text_results, wv, wt),
        FusionMethod::CombMnz => comb_mnz(vector_results, text_results, wv, wt),
        FusionMethod::Borda => borda(vector_results, text_results, wv, wt),
    };

    let by_id: HashMap<&str, &SearchResult> = vector_results
        .iter()
        .chain(text_results.iter())
        .map(|r| (r.vector_id.as_str(), r))
        .collect();

    let mut fused: Vec<SearchResult> = fused_scores
        .into_iter()
        .filter_map(|(id, score)| {
            let source = by_id.get(id.as_str())?;
            Some(SearchResult {
                vector_id: id,
                document_id: source.document_id.clone(),
                score,
                distance: -score,
                rank: 0,
                content: source.content.clone(),
                metadata: source.metadata.clone(),
            })
        })
        .collect();

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    for (i, r) in fused.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    fused
}

fn min_max_normalize(results: &[SearchResult]) -> HashMap<String, f64> {
    if results.is_empty() {
        return HashMap::new();
    }
    let min = results.iter().map(|r| r.score).fold(f64::INFINITY, f64::min);
    let max = results.iter().map(|r| r.score).fold(f64::NEG_INFINITY, f64::max);
    let range = (max - min).max(1e-9);
    results.iter().map(|r| (r.vector_id.clone(), (r.score - min) / range)).collect()
}

fn weighted_sum(vector: &[SearchResult], text: &[SearchResult], wv: f64, wt: f64) -> HashMap<String, f64> {
    let vn = min_max_normalize(vector);
    let tn = min_max_normalize(text);
    combine_with(&vn, &tn, wv, wt)
}

fn comb_sum(vector: &[SearchResult], text: &[SearchResult], wv: f64, wt: f64) -> HashMap<String, f64> {
    let vs: HashMap<String, f64> = vector.iter().map(|r| (r.vector_id.clone(), r.score)).collect();
    let ts: HashMap<String, f64> = text.iter().map(|r| (r.vector_id.clone(), r.score)).collect();
    combine_with(&vs, &ts, wv, wt)
}

fn comb_mnz(vector: &[SearchResult], text: &[SearchResult], wv: f64, wt: f64) -> HashMap<String, f64> {
    let base = comb_sum(vector, text, wv, wt);
    let vs: HashMap<&str, f64> = vector.iter().map(|r| (r.vector_id.as_str(), r.score)).collect();
    let ts: HashMap<&str, f64> = text.iter().map(|r| (r.vector_id.as_str(), r.score)).collect();
    base.into_iter()
        .map(|(id, score)| {
            let mut hits = 0;
            if vs.get(id.as_str()).map(|s| *s > 0.0).unwrap_or(false) {
                hits += 1;
            }
            if ts.get(id.as_str()).map(|s| *s > 0.0).unwrap_or(false) {
                hits += 1;
            }
            (id, score * hits as f64)
        })
        .collect()
}

fn rrf(vector: &[SearchResult], text: &[SearchResult], wv: f64, wt: f64) -> HashMap<String, f64> {
    let mut scores = HashMap::new();
    for r in vector {
        *scores.entry(r.vector_id.clone()).or_insert(0.0) += wv / (RRF_K + r.rank as f64);
    }
    for r in text {
        *scores.entry(r.vector_id.clone()).or_insert(0.0) += wt / (RRF_K + r.rank as f64);
    }
    scores
}

fn borda(vector: &[SearchResult], text: &[SearchResult], wv: f64, wt: f64) -> HashMap<String, f64> {
    let mut scores = HashMap::new();
    let vn = vector.len() as f64;
    let tn = text.len() as f64;
    for r in vector {
        *scores.entry(r.vector_id.clone()).or_insert(0.0) += wv * (vn - r.rank as f64 + 1.0);
    }
    for r in text {
        *scores.entry(r.vector_id.clone()).or_insert(0.0) += wt * (tn - r.rank as f64 + 1.0);
    }
    scores
}

fn combine_with(a: &HashMap<String, f64>, b: &HashMap<String, f64>, wa: f64, wb: f64) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for (id, score) in a {
        *out.entry(id.clone()).or_insert(0.0) += wa * score;
    }
    for (id, score) in b {
        *out.entry(id.clone()).or_insert(0.0) += wb * score;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(id: &str, content: &str) -> VectorRecord {
        let now = Utc::now();
        VectorRecord {
            id: id.to_string(),
            document_id: id.to_string(),
            chunk_id: None,
            chunk_index: None,
            chunk_count: None,
            values: vec![0.0],
            content: Some(content.to_string()),
            content_hash: None,
            content_type: None,
            language: None,
            model: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn lexical_search_ranks_matching_doc_first() {
        let rows = vec![row("a", "the quick brown fox"), row("b", "lazy dogs and cats")];
        let by_id: HashMap<&str, &VectorRecord> = rows.iter().map(|r| (r.id.as_str(), r)).collect();
        let index = LexicalIndex::build(&rows);
        let results = index.search("dogs cats", &by_id);
        assert_eq!(results[0].vector_id, "b");
    }

    #[test]
    fn rrf_fusion_matches_reciprocal_rank_formula() {
        let vector_results = vec![SearchResult {
            vector_id: "a".into(),
            document_id: "d1".into(),
            score: 1.0,
            distance: 0.0,
            rank: 1,
            content: None,
            metadata: serde_json::json!({}),
        }];
        let text_results = vec![SearchResult {
            vector_id: "b".into(),
            document_id: "d2".into(),
            score: 1.0,
            distance: 0.0,
            rank: 1,
            content: None,
            metadata: serde_json::json!({}),
        }];
        let fused = fuse(&vector_results, &text_results, FusionMethod::Rrf, 0.5, 0.5);
        let a = fused.iter().find(|r| r.vector_id == "a").unwrap();
        assert!((a.score - 0.5 / 61.0).abs() < 1e-9);
    }

    #[test]
    fn fusion_method_parses_known_names() {
        assert_eq!(FusionMethod::parse("rrf"), Some(FusionMethod::Rrf));
        assert_eq!(FusionMethod::parse("CombMNZ"), Some(FusionMethod::CombMnz));
        assert_eq!(FusionMethod::parse("unknown"), None);
    }
}
