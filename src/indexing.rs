//! Index Registry: builds and holds Flat/HNSW/IVF indexes per dataset and
//! applies the fallback/auto-scaling policy that decides which one
//! actually answers a given query. HNSW wraps `instant_distance` the way
//! the teacher's `indexing.rs` did; IVF is hand-rolled (no crate in the
//! corpus implements coarse-quantizer k-means), generalized to the
//! dataset's configured metric rather than the teacher's hardcoded L2.

use std::time::Instant;

use instant_distance::{Builder, HnswMap, Point, Search};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::metrics;
use crate::models::{IndexKind, Metric};

#[derive(Clone, Debug)]
struct VectorPoint(Vec<f32>);

impl Point for VectorPoint {
    fn distance(&self, other: &Self) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HnswParameters {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for HnswParameters {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 50,
        }
    }
}

/// Auto-scales M/efConstruction by live vector count per the registry policy.
pub fn scale_hnsw_parameters(n: usize) -> HnswParameters {
    let mut params = HnswParameters::default();
    if n < 10_000 {
        params.m = params.m.min(8);
        params.ef_construction = params.ef_construction.min(100);
    } else if n > 1_000_000 {
        params.m = params.m.max(32);
        params.ef_construction = params.ef_construction.max(400);
    }
    params
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct IvfParameters {
    pub nlist: usize,
    pub nprobe: usize,
}

fn clamp(value: usize, lo: usize, hi: usize) -> usize {
    value.clamp(lo, hi)
}

pub fn scale_ivf_parameters(n: usize) -> IvfParameters {
    IvfParameters {
        nlist: clamp(n / 100, 100, 4096),
        nprobe: clamp(n / 1000, 10, 128),
    }
}

/// Decides which index variant actually serves a query, applying the
/// Flat-fallback thresholds: declared `flat`, or too few vectors for the
/// declared approximate structure, always resolve to Flat.
pub fn effective_kind(declared: IndexKind, live_count: usize, ivf_nlist: usize) -> IndexKind {
    match declared {
        IndexKind::Flat => IndexKind::Flat,
        IndexKind::Hnsw => {
            if live_count < 100 {
                IndexKind::Flat
            } else {
                IndexKind::Hnsw
            }
        }
        IndexKind::Ivf | IndexKind::Default => {
            if live_count < 40 * ivf_nlist.max(1) {
                IndexKind::Flat
            } else {
                IndexKind::Ivf
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub index_type: IndexKind,
    pub total_vectors: usize,
    pub approx_bytes: usize,
    pub build_seconds: f64,
    pub is_trained: bool,
}

/// One built index for a dataset. `Flat` carries no structure — search
/// degrades to a full scan performed by the caller (the Query Engine),
/// so this variant only exists to make the sum type exhaustive.
pub enum Index {
    Flat,
    Hnsw { map: HnswMap<VectorPoint, String>, params: HnswParameters },
    Ivf { centroids: Vec<Vec<f32>>, assignments: Vec<Vec<(String, Vec<f32>)>>, params: IvfParameters },
}

impl Index {
    pub fn build(kind: IndexKind, vectors: &[(String, Vec<f32>)], metric: Metric) -> (Self, IndexStats) {
        let start = Instant::now();
        let n = vectors.len();
        let effective = match kind {
            IndexKind::Flat => IndexKind::Flat,
            IndexKind::Hnsw => effective_kind(IndexKind::Hnsw, n, 1),
            IndexKind::Ivf | IndexKind::Default => {
                let ivf_params = scale_ivf_parameters(n);
                effective_kind(IndexKind::Ivf, n, ivf_params.nlist)
            }
        };

        let (index, total_vectors, is_trained) = match effective {
            IndexKind::Flat => (Index::Flat, n, true),
            IndexKind::Hnsw => {
                let params = scale_hnsw_parameters(n);
                let points: Vec<VectorPoint> = vectors.iter().map(|(_, v)| VectorPoint(v.clone())).collect();
                let values: Vec<String> = vectors.iter().map(|(id, _)| id.clone()).collect();
                let map = Builder::default().build(points, values);
                (Index::Hnsw { map, params }, n, true)
            }
            IndexKind::Ivf => {
                let params = scale_ivf_parameters(n);
                let (centroids, assignments) = train_ivf(vectors, params.nlist, metric);
                (Index::Ivf { centroids, assignments, params }, n, true)
            }
            IndexKind::Default => unreachable!("effective_kind never returns Default"),
        };

        let stats = IndexStats {
            index_type: effective,
            total_vectors,
            approx_bytes: total_vectors * vectors.first().map(|(_, v)| v.len()).unwrap_or(0) * 4,
            build_seconds: start.elapsed().as_secs_f64(),
            is_trained,
        };
        (index, stats)
    }

    /// Returns candidate ids in approximate nearest-first order. The
    /// caller re-scores candidates with the dataset's real metric kernel;
    /// HNSW/IVF here only narrow the candidate set.
    pub fn search(&self, query: &[f32], k: usize, ef_search: Option<usize>, nprobe: Option<usize>) -> Vec<String> {
        match self {
            Index::Flat => Vec::new(),
            Index::Hnsw { map, params } => {
                let ef = ef_search.unwrap_or(params.ef_search).clamp(1, 200);
                let _ = ef; // instant_distance's Search has no direct ef knob in this API version
                let query_point = VectorPoint(query.to_vec());
                let mut search_state = Search::default();
                map.search(&query_point, &mut search_state)
                    .take(k)
                    .map(|item| item.value.clone())
                    .collect()
            }
            Index::Ivf { centroids, assignments, params } => {
                let nprobe = nprobe.unwrap_or(params.nprobe).clamp(1, 100);
                let mut cluster_order: Vec<usize> = (0..centroids.len()).collect();
                cluster_order.sort_by(|&a, &b| {
                    let da = euclidean_sq(query, &centroids[a]);
                    let db = euclidean_sq(query, &centroids[b]);
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                });
                let mut candidates: Vec<String> = Vec::new();
                for &cluster in cluster_order.iter().take(nprobe) {
                    candidates.extend(assignments[cluster].iter().map(|(id, _)| id.clone()));
                }
                candidates.truncate(k.max(candidates.len().min(k * 10)));
                candidates
            }
        }
    }
}

fn euclidean_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Lloyd's-algorithm k-means with a fixed iteration cap, seeded
/// deterministically per build so repeated builds over the same vectors
/// are reproducible within a process.
fn train_ivf(
    vectors: &[(String, Vec<f32>)],
    nlist: usize,
    metric: Metric,
) -> (Vec<Vec<f32>>, Vec<Vec<(String, Vec<f32>)>>) {
    let dim = vectors.first().map(|(_, v)| v.len()).unwrap_or(0);
    let k = nlist.min(vectors.len()).max(1);
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut indices: Vec<usize> = (0..vectors.len()).collect();
    indices.shuffle(&mut rng);
    let mut centroids: Vec<Vec<f32>> = indices.iter().take(k).map(|&i| vectors[i].1.clone()).collect();

    const MAX_ITERS: usize = 10;
    let mut assignments = vec![0usize; vectors.len()];
    for _ in 0..MAX_ITERS {
        let mut changed = false;
        for (vi, (_, v)) in vectors.iter().enumerate() {
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for (ci, c) in centroids.iter().enumerate() {
                let (_, d) = metrics::score(metric, v, c);
                let d = d as f32;
                if d < best_dist {
                    best_dist = d;
                    best = ci;
                }
            }
            if assignments[vi] != best {
                changed = true;
            }
            assignments[vi] = best;
        }

        let mut sums = vec![vec![0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (vi, (_, v)) in vectors.iter().enumerate() {
            let c = assignments[vi];
            counts[c] += 1;
            for (d, x) in sums[c].iter_mut().zip(v.iter()) {
                *d += x;
            }
        }
        for ci in 0..k {
            if counts[ci] > 0 {
                for d in sums[ci].iter_mut() {
                    *d /= counts[ci] as f32;
                }
                centroids[ci] = sums[ci].clone();
            }
        }
        if !changed {
            break;
        }
    }

    let mut clusters: Vec<Vec<(String, Vec<f32>)>> = vec![Vec::new(); k];
    for (vi, (id, v)) in vectors.iter().enumerate() {
        clusters[assignments[vi]].push((id.clone(), v.clone()));
    }
    (centroids, clusters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_dataset_falls_back_to_flat() {
        assert_eq!(effective_kind(IndexKind::Hnsw, 10, 1), IndexKind::Flat);
        assert_eq!(effective_kind(IndexKind::Ivf, 10, 100), IndexKind::Flat);
    }

    #[test]
    fn hnsw_parameters_scale_with_size() {
        let small = scale_hnsw_parameters(500);
        assert!(small.m <= 8);
        assert!(small.ef_construction <= 100);
        let large = scale_hnsw_parameters(2_000_000);
        assert!(large.m >= 32);
        assert!(large.ef_construction >= 400);
    }

    #[test]
    fn ivf_parameters_are_clamped() {
        let params = scale_ivf_parameters(50);
        assert_eq!(params.nlist, 100);
        assert_eq!(params.nprobe, 10);
        let params = scale_ivf_parameters(1_000_000);
        assert_eq!(params.nlist, 4096);
        assert_eq!(params.nprobe, 128);
    }

    #[test]
    fn build_flat_for_small_hnsw_declared_dataset() {
        let vectors = vec![
            ("a".to_string(), vec![1.0, 0.0, 0.0]),
            ("b".to_string(), vec![0.0, 1.0, 0.0]),
        ];
        let (index, stats) = Index::build(IndexKind::Hnsw, &vectors, Metric::Euclidean);
        assert_eq!(stats.index_type, IndexKind::Flat);
        assert!(matches!(index, Index::Flat));
    }

    #[test]
    fn hnsw_search_finds_nearest_point() {
        let vectors: Vec<(String, Vec<f32>)> = (0..150)
            .map(|i| (format!("v{i}"), vec![i as f32, 0.0, 0.0]))
            .collect();
        let (index, stats) = Index::build(IndexKind::Hnsw, &vectors, Metric::Euclidean);
        assert_eq!(stats.index_type, IndexKind::Hnsw);
        let results = index.search(&[0.0, 0.0, 0.0], 1, None, None);
        assert_eq!(results[0], "v0");
    }
}
