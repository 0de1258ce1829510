//! Distance/similarity kernels shared by the storage index, flat scan,
//! and hybrid fusion stages. Each kernel returns `(score, distance)` so
//! callers never have to re-derive one from the other.

use crate::models::Metric;

/// Computes `(score, distance)` for `query` against `candidate` under `metric`.
/// Panics if the slices differ in length; callers validate dimensions upstream.
pub fn score(metric: Metric, query: &[f32], candidate: &[f32]) -> (f64, f64) {
    debug_assert_eq!(query.len(), candidate.len());
    match metric {
        Metric::Cosine => cosine(query, candidate),
        Metric::Dot => dot(query, candidate),
        Metric::Euclidean => euclidean(query, candidate),
        Metric::Manhattan => manhattan(query, candidate),
        Metric::Hamming => hamming(query, candidate),
    }
}

fn cosine(q: &[f32], v: &[f32]) -> (f64, f64) {
    let mut dot = 0f64;
    let mut qn = 0f64;
    let mut vn = 0f64;
    for (a, b) in q.iter().zip(v.iter()) {
        let (a, b) = (*a as f64, *b as f64);
        dot += a * b;
        qn += a * a;
        vn += b * b;
    }
    let denom = qn.sqrt() * vn.sqrt();
    if denom == 0.0 {
        return (0.0, 1.0);
    }
    let s = dot / denom;
    (s, 1.0 - s)
}

fn dot(q: &[f32], v: &[f32]) -> (f64, f64) {
    let s: f64 = q.iter().zip(v.iter()).map(|(a, b)| *a as f64 * *b as f64).sum();
    (s, -s)
}

fn euclidean(q: &[f32], v: &[f32]) -> (f64, f64) {
    let d: f64 = q
        .iter()
        .zip(v.iter())
        .map(|(a, b)| (*a as f64 - *b as f64).powi(2))
        .sum::<f64>()
        .sqrt();
    (1.0 / (1.0 + d), d)
}

fn manhattan(q: &[f32], v: &[f32]) -> (f64, f64) {
    let d: f64 = q.iter().zip(v.iter()).map(|(a, b)| (*a as f64 - *b as f64).abs()).sum();
    (1.0 / (1.0 + d), d)
}

fn hamming(q: &[f32], v: &[f32]) -> (f64, f64) {
    let dim = q.len().max(1) as f64;
    let differing = q
        .iter()
        .zip(v.iter())
        .filter(|(a, b)| (**a > 0.5) != (**b > 0.5))
        .count() as f64;
    let d = differing / dim;
    (1.0 - d, d)
}

/// Sort direction for a metric's score: `true` = descending (similarity-like).
pub fn ranks_descending(metric: Metric) -> bool {
    metric.ranks_by_similarity()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identical_vectors_scores_one() {
        let v = [1.0, 2.0, 3.0];
        let (s, d) = score(Metric::Cosine, &v, &v);
        assert!((s - 1.0).abs() < 1e-6);
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_vector_is_zero_score_one_distance() {
        let q = [0.0, 0.0];
        let v = [1.0, 1.0];
        assert_eq!(score(Metric::Cosine, &q, &v), (0.0, 1.0));
    }

    #[test]
    fn euclidean_zero_distance_gives_score_one() {
        let v = [1.0, 1.0, 1.0];
        let (s, d) = score(Metric::Euclidean, &v, &v);
        assert_eq!(d, 0.0);
        assert_eq!(s, 1.0);
    }

    #[test]
    fn hamming_counts_thresholded_mismatches() {
        let q = [0.9, 0.1, 0.9, 0.1];
        let v = [0.8, 0.9, 0.1, 0.2];
        let (s, d) = score(Metric::Hamming, &q, &v);
        assert!((d - 0.5).abs() < 1e-9);
        assert!((s - 0.5).abs() < 1e-9);
    }

    #[test]
    fn dot_distance_is_negative_score() {
        let q = [1.0, 2.0];
        let v = [3.0, 4.0];
        let (s, d) = score(Metric::Dot, &q, &v);
        assert_eq!(s, 11.0);
        assert_eq!(d, -11.0);
    }
}
