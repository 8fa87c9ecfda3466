//! The vector-index capability and its in-memory fallback.
//!
//! The preferred index is the `vec0` virtual table living inside the record
//! store, mutated in the same transaction as the record row (see
//! `db::store`). When that module cannot be initialised the store falls back
//! to [`MatrixIndex`]: every vector in a flat matrix, KNN by full dot
//! product with a k-heap.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{EngramError, Result};
use crate::vecmath;

/// Approximate-nearest-neighbour index over unit vectors keyed by record id.
pub trait VectorIndex: Send + Sync {
    /// Insert or replace a vector.
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()>;

    /// Remove a vector; unknown ids are a no-op.
    fn remove(&mut self, id: &str);

    /// K nearest neighbours as `(id, similarity)` pairs, best first.
    fn search(&self, query: &[f32], k: usize) -> Vec<(String, f64)>;

    /// Batched [`VectorIndex::search`].
    fn batch_search(&self, queries: &[Vec<f32>], k: usize) -> Vec<Vec<(String, f64)>> {
        queries.iter().map(|q| self.search(q, k)).collect()
    }

    /// Number of indexed vectors.
    fn size(&self) -> usize;

    /// Persist the index to a file.
    fn save(&self, path: &Path) -> Result<()>;

    /// Replace the index contents from a file.
    fn load(&mut self, path: &Path) -> Result<()>;
}

const MATRIX_FILE_MAGIC: &[u8; 4] = b"EGVX";

/// Brute-force index: row-major matrix plus a parallel id list.
pub struct MatrixIndex {
    dim: usize,
    ids: Vec<String>,
    matrix: Vec<f32>,
    rows_by_id: HashMap<String, usize>,
}

impl MatrixIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            ids: Vec::new(),
            matrix: Vec::new(),
            rows_by_id: HashMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Search restricted to a candidate id set (used for filtered recall).
    /// `None` searches everything.
    pub fn search_within(
        &self,
        query: &[f32],
        k: usize,
        candidates: Option<&HashSet<String>>,
    ) -> Vec<(String, f64)> {
        match candidates {
            None => vecmath::top_k(&self.matrix, self.dim, query, k)
                .into_iter()
                .map(|(row, score)| (self.ids[row].clone(), f64::from(score)))
                .collect(),
            Some(allowed) => {
                // Gather the allowed rows into a dense sub-matrix first so
                // the k-heap selection stays branch-free.
                let mut sub_rows = Vec::new();
                let mut sub_matrix = Vec::new();
                for (row, id) in self.ids.iter().enumerate() {
                    if allowed.contains(id) {
                        sub_rows.push(row);
                        sub_matrix.extend_from_slice(&self.matrix[row * self.dim..(row + 1) * self.dim]);
                    }
                }
                vecmath::top_k(&sub_matrix, self.dim, query, k)
                    .into_iter()
                    .map(|(sub, score)| (self.ids[sub_rows[sub]].clone(), f64::from(score)))
                    .collect()
            }
        }
    }
}

impl VectorIndex for MatrixIndex {
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dim {
            return Err(EngramError::Embedding(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dim
            )));
        }
        if let Some(&row) = self.rows_by_id.get(id) {
            self.matrix[row * self.dim..(row + 1) * self.dim].copy_from_slice(vector);
        } else {
            self.rows_by_id.insert(id.to_string(), self.ids.len());
            self.ids.push(id.to_string());
            self.matrix.extend_from_slice(vector);
        }
        Ok(())
    }

    fn remove(&mut self, id: &str) {
        let Some(row) = self.rows_by_id.remove(id) else {
            return;
        };
        let last = self.ids.len() - 1;
        // Swap-remove keeps the matrix dense.
        self.ids.swap_remove(row);
        if row != last {
            let (head, tail) = self.matrix.split_at_mut(last * self.dim);
            head[row * self.dim..(row + 1) * self.dim].copy_from_slice(&tail[..self.dim]);
            self.rows_by_id.insert(self.ids[row].clone(), row);
        }
        self.matrix.truncate(last * self.dim);
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(String, f64)> {
        self.search_within(query, k, None)
    }

    fn size(&self) -> usize {
        self.ids.len()
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        file.write_all(MATRIX_FILE_MAGIC)?;
        file.write_all(&(self.dim as u32).to_le_bytes())?;
        file.write_all(&(self.ids.len() as u32).to_le_bytes())?;
        for (row, id) in self.ids.iter().enumerate() {
            let id_bytes = id.as_bytes();
            file.write_all(&(id_bytes.len() as u16).to_le_bytes())?;
            file.write_all(id_bytes)?;
            let vector = &self.matrix[row * self.dim..(row + 1) * self.dim];
            file.write_all(bytemuck::cast_slice(vector))?;
        }
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::open(path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MATRIX_FILE_MAGIC {
            return Err(EngramError::Storage(format!(
                "not a vector index file: {}",
                path.display()
            )));
        }
        let mut word = [0u8; 4];
        file.read_exact(&mut word)?;
        let dim = u32::from_le_bytes(word) as usize;
        if dim != self.dim {
            return Err(EngramError::Embedding(format!(
                "index file dimension {dim} does not match database dimension {}",
                self.dim
            )));
        }
        file.read_exact(&mut word)?;
        let count = u32::from_le_bytes(word) as usize;

        let mut ids = Vec::with_capacity(count);
        let mut matrix = Vec::with_capacity(count * dim);
        let mut rows_by_id = HashMap::with_capacity(count);
        for row in 0..count {
            let mut len_bytes = [0u8; 2];
            file.read_exact(&mut len_bytes)?;
            let mut id_bytes = vec![0u8; u16::from_le_bytes(len_bytes) as usize];
            file.read_exact(&mut id_bytes)?;
            let id = String::from_utf8(id_bytes)
                .map_err(|e| EngramError::Storage(format!("corrupt index id: {e}")))?;
            let mut vec_bytes = vec![0u8; dim * 4];
            file.read_exact(&mut vec_bytes)?;
            matrix.extend_from_slice(&bytemuck::pod_collect_to_vec::<u8, f32>(&vec_bytes));
            rows_by_id.insert(id.clone(), row);
            ids.push(id);
        }

        self.ids = ids;
        self.matrix = matrix;
        self.rows_by_id = rows_by_id;
        Ok(())
    }
}
