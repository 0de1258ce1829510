//! Query Engine: candidate generation → filter → rank → paginate, per the
//! pipeline the specification lays out. Owns no state of its own — it is
//! handed a dataset handle, its live vectors, and an optional built index,
//! and returns an ordered result list plus timing/volume stats.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;

use crate::error::{AidbError, AidbResult};
use crate::filter::{self, FilterExpression};
use crate::indexing::Index;
use crate::metrics;
use crate::models::{Metric, VectorRecord};

pub const DEFAULT_OVERSCAN_FACTOR: usize = 10;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub threshold: Option<f64>,
    pub metric_override: Option<Metric>,
    pub filter: Option<FilterExpression>,
    pub deduplicate: bool,
    pub group_by_document: bool,
    pub rerank_query_text: Option<String>,
    pub ef_search: Option<usize>,
    pub nprobe: Option<usize>,
    pub max_distance: Option<f64>,
    pub min_score: Option<f64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            threshold: None,
            metric_override: None,
            filter: None,
            deduplicate: false,
            group_by_document: false,
            rerank_query_text: None,
            ef_search: None,
            nprobe: None,
            max_distance: None,
            min_score: None,
        }
    }
}

impl SearchOptions {
    pub fn validate(&self) -> AidbResult<()> {
        if !(1..=1000).contains(&self.top_k) {
            return Err(AidbError::InvalidSearchParameters(format!(
                "top_k must be in [1, 1000], got {}",
                self.top_k
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub vector_id: String,
    pub document_id: String,
    pub score: f64,
    pub distance: f64,
    pub rank: usize,
    pub content: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct SearchStats {
    pub vectors_scanned: u64,
    pub index_hits: u64,
    pub filtered_results: u64,
    pub database_time_ms: f64,
    pub post_processing_time_ms: f64,
}

/// Runs the full search pipeline against an already-materialized set of
/// live rows (the caller — `service.rs` — resolves the dataset and its
/// index before calling in).
pub fn search(
    rows: &[VectorRecord],
    index: Option<&Index>,
    dataset_dim: usize,
    dataset_metric: Metric,
    query: &[f32],
    options: &SearchOptions,
) -> AidbResult<(Vec<SearchResult>, SearchStats)> {
    if query.len() != dataset_dim {
        return Err(AidbError::InvalidDimensions {
            expected: dataset_dim,
            actual: query.len(),
        });
    }
    options.validate()?;

    let db_start = Instant::now();
    let metric = options.metric_override.unwrap_or(dataset_metric);
    let by_id: HashMap<&str, &VectorRecord> = rows.iter().map(|r| (r.id.as_str(), r)).collect();

    let overscan = options.top_k * DEFAULT_OVERSCAN_FACTOR;
    let (candidate_rows, index_hits): (Vec<&VectorRecord>, u64) = match index {
        Some(idx) if !matches!(idx, Index::Flat) => {
            let ids = idx.search(query, overscan, options.ef_search, options.nprobe);
            let hits = ids.len() as u64;
            let candidates: Vec<&VectorRecord> =
                ids.iter().filter_map(|id| by_id.get(id.as_str()).copied()).collect();
            if candidates.len() < options.top_k {
                (rows.iter().collect(), rows.len() as u64)
            } else {
                (candidates, hits)
            }
        }
        _ => (rows.iter().collect(), 0),
    };

    let mut scored: Vec<SearchResult> = candidate_rows
        .iter()
        .map(|row| {
            let (score, distance) = metrics::score(metric, query, &row.values);
            SearchResult {
                vector_id: row.id.clone(),
                document_id: row.document_id.clone(),
                score,
                distance,
                rank: 0,
                content: row.content.clone(),
                metadata: row.metadata.clone(),
            }
        })
        .collect();

    let descending = metrics::ranks_descending(metric);
    scored.sort_by(|a, b| {
        if descending {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
        } else {
            a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal)
        }
    });

    let database_time_ms = db_start.elapsed().as_secs_f64() * 1000.0;
    let post_start = Instant::now();

    let before_filter = scored.len() as u64;
    let mut filtered: Vec<SearchResult> = scored
        .into_iter()
        .filter(|r| options.threshold.map(|t| r.score >= t).unwrap_or(true))
        .filter(|r| options.max_distance.map(|m| r.distance <= m).unwrap_or(true))
        .filter(|r| options.min_score.map(|m| r.score >= m).unwrap_or(true))
        .filter(|r| match &options.filter {
            Some(expr) => filter::evaluate(expr, &r.metadata),
            None => true,
        })
        .collect();
    let filtered_results = before_filter - filtered.len() as u64;

    if options.deduplicate {
        let mut seen = HashSet::new();
        filtered.retain(|r| seen.insert(r.vector_id.clone()));
    }

    if options.group_by_document {
        let mut best_per_document: HashMap<String, SearchResult> = HashMap::new();
        for r in filtered {
            best_per_document
                .entry(r.document_id.clone())
                .and_modify(|existing| {
                    let better = if descending { r.score > existing.score } else { r.distance < existing.distance };
                    if better {
                        *existing = r.clone();
                    }
                })
                .or_insert(r);
        }
        filtered = best_per_document.into_values().collect();
        filtered.sort_by(|a, b| {
            if descending {
                b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
            } else {
                a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal)
            }
        });
    }

    if let Some(query_text) = &options.rerank_query_text {
        rerank_by_token_overlap(&mut filtered, query_text, descending);
    }

    filtered.truncate(options.top_k);
    for (i, r) in filtered.iter_mut().enumerate() {
        r.rank = i + 1;
    }

    let stats = SearchStats {
        vectors_scanned: rows.len() as u64,
        index_hits,
        filtered_results,
        database_time_ms,
        post_processing_time_ms: post_start.elapsed().as_secs_f64() * 1000.0,
    };

    Ok((filtered, stats))
}

fn rerank_by_token_overlap(results: &mut [SearchResult], query_text: &str, descending: bool) {
    let query_tokens: HashSet<String> = tokenize(query_text).into_iter().collect();
    if query_tokens.is_empty() {
        return;
    }
    for r in results.iter_mut() {
        let Some(content) = &r.content else { continue };
        let content_tokens: HashSet<String> = tokenize(content).into_iter().collect();
        if content_tokens.is_empty() {
            continue;
        }
        let overlap = query_tokens.intersection(&content_tokens).count();
        let overlap_ratio = overlap as f64 / query_tokens.len() as f64;
        let boost = 1.0 + overlap_ratio * 0.1;
        r.score *= boost;
        if !descending {
            r.distance /= boost;
        }
    }
    results.sort_by(|a, b| {
        if descending {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
        } else {
            a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal)
        }
    });
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_ascii_lowercase())
        .filter(|w| w.len() >= 2)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(id: &str, doc: &str, values: Vec<f32>) -> VectorRecord {
        let now = Utc::now();
        VectorRecord {
            id: id.to_string(),
            document_id: doc.to_string(),
            chunk_id: None,
            chunk_index: None,
            chunk_count: None,
            values,
            content: None,
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
    fn cosine_ranking_scenario() {
        let rows = vec![
            row("A", "d1", vec![1.0, 0.0, 0.0]),
            row("B", "d1", vec![0.9, 0.1, 0.0]),
            row("C", "d1", vec![0.0, 1.0, 0.0]),
        ];
        let options = SearchOptions { top_k: 3, ..Default::default() };
        let (results, _) = search(&rows, None, 3, Metric::Cosine, &[1.0, 0.0, 0.0], &options).unwrap();
        assert_eq!(
            results.iter().map(|r| r.vector_id.as_str()).collect::<Vec<_>>(),
            vec!["A", "B", "C"]
        );
        assert!((results[0].score - 1.0).abs() < 1e-3);
        assert!((results[1].score - 0.9939).abs() < 1e-3);
        assert!(results[2].score.abs() < 1e-3);
    }

    #[test]
    fn euclidean_ranking_scenario() {
        let rows = vec![row("A", "d1", vec![0.0, 0.0]), row("B", "d1", vec![3.0, 4.0])];
        let options = SearchOptions { top_k: 2, ..Default::default() };
        let (results, _) = search(&rows, None, 2, Metric::Euclidean, &[0.0, 0.0], &options).unwrap();
        assert_eq!(results[0].vector_id, "A");
        assert!((results[0].distance - 0.0).abs() < 1e-3);
        assert!((results[1].distance - 5.0).abs() < 1e-3);
        assert!((results[1].score - 1.0 / 6.0).abs() < 1e-3);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let rows = vec![row("A", "d1", vec![1.0, 0.0, 0.0])];
        let options = SearchOptions::default();
        let err = search(&rows, None, 3, Metric::Cosine, &[1.0, 0.0], &options).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_DIMENSIONS");
    }

    #[test]
    fn threshold_excludes_low_scores() {
        let rows = vec![row("A", "d1", vec![1.0, 0.0, 0.0]), row("B", "d1", vec![0.0, 1.0, 0.0])];
        let options = SearchOptions { top_k: 2, min_score: Some(0.5), ..Default::default() };
        let (results, _) = search(&rows, None, 3, Metric::Cosine, &[1.0, 0.0, 0.0], &options).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].vector_id, "A");
    }

    #[test]
    fn top_k_bounds_result_count() {
        let rows: Vec<VectorRecord> = (0..5).map(|i| row(&format!("v{i}"), "d1", vec![1.0, 0.0, 0.0])).collect();
        let options = SearchOptions { top_k: 2, ..Default::default() };
        let (results, _) = search(&rows, None, 3, Metric::Cosine, &[1.0, 0.0, 0.0], &options).unwrap();
        assert_eq!(results.len(), 2);
    }
}
