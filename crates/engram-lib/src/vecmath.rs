//! Primitive vector operations used by the retrieval engine.
//!
//! All vectors are 32-bit floats. Stored vectors are unit-norm, so cosine
//! similarity reduces to a single dot product.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Normalise a vector in place by its L2 norm. A zero vector is returned
/// unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity of two unit vectors: a single dot product.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    dot(a, b)
}

/// Dot product.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// A scored row in a top-K selection. Ordered so that a max-heap of
/// `Reverse<ScoredRow>` keeps the k best rows: lower score is "greater"
/// inside the heap, and on ties the higher row index is evicted first.
#[derive(Debug, PartialEq)]
struct ScoredRow {
    score: f32,
    row: usize,
}

impl Eq for ScoredRow {}

impl Ord for ScoredRow {
    fn cmp(&self, other: &Self) -> Ordering {
        // Score descending wins; ties broken by row index ascending.
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.row.cmp(&self.row))
    }
}

impl PartialOrd for ScoredRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Top-K selection over a row-major matrix of unit vectors.
///
/// Computes the dot product of every row against `query` and returns the
/// `k` largest as `(row_index, score)` pairs, score descending, ties broken
/// by row index ascending. Selection uses a k-heap so the cost is O(N log k)
/// rather than a full sort.
pub fn top_k(matrix: &[f32], dim: usize, query: &[f32], k: usize) -> Vec<(usize, f32)> {
    if dim == 0 || k == 0 || matrix.is_empty() {
        return Vec::new();
    }
    let rows = matrix.len() / dim;
    let mut heap: BinaryHeap<std::cmp::Reverse<ScoredRow>> = BinaryHeap::with_capacity(k + 1);

    for row in 0..rows {
        let score = dot(&matrix[row * dim..(row + 1) * dim], query);
        heap.push(std::cmp::Reverse(ScoredRow { score, row }));
        if heap.len() > k {
            heap.pop();
        }
    }

    let mut out: Vec<(usize, f32)> = heap
        .into_iter()
        .map(|std::cmp::Reverse(entry)| (entry.row, entry.score))
        .collect();
    out.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_norm() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_unchanged() {
        let mut v = vec![0.0, 0.0, 0.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn cosine_of_identical_unit_vectors_is_one() {
        let mut v = vec![1.0, 2.0, 3.0];
        normalize(&mut v);
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn top_k_orders_by_score_descending() {
        // Three 2-d rows; query aligned with the second.
        let matrix = vec![1.0, 0.0, 0.0, 1.0, 0.7071, 0.7071];
        let query = vec![0.0, 1.0];
        let results = top_k(&matrix, 2, &query, 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 1);
        assert!((results[0].1 - 1.0).abs() < 1e-4);
        assert_eq!(results[1].0, 2);
    }

    #[test]
    fn top_k_breaks_ties_by_row_index() {
        // Two identical rows; the earlier index must come first.
        let matrix = vec![0.0, 1.0, 0.0, 1.0];
        let query = vec![0.0, 1.0];
        let results = top_k(&matrix, 2, &query, 2);
        assert_eq!(results[0].0, 0);
        assert_eq!(results[1].0, 1);
    }

    #[test]
    fn top_k_with_k_larger_than_rows() {
        let matrix = vec![1.0, 0.0];
        let query = vec![1.0, 0.0];
        let results = top_k(&matrix, 2, &query, 10);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn top_k_empty_matrix() {
        assert!(top_k(&[], 384, &[0.0; 384], 5).is_empty());
    }
}
