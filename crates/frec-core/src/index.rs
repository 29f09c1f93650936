//! Flat L2 similarity index over face embeddings.
//!
//! Every entry pairs a vector with the identity it was enrolled under. Search
//! is exhaustive; galleries here are a few hundred vectors at most.
//!
//! On-disk layout, all little-endian:
//!
//! ```text
//! i32 count | i32 dimension | count x (f32 x dimension, i32 identity_id)
//! ```

use crate::types::NO_MATCH;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

const HEADER_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index has not been built")]
    NotBuilt,
    #[error("vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("{ids} identity ids for {vectors} vectors")]
    LengthMismatch { ids: usize, vectors: usize },
    #[error("identity id {0} does not fit the index file format")]
    IdOutOfRange(i64),
    #[error("corrupt index file: {0}")]
    Corrupt(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Map a Euclidean distance between unit vectors to a similarity in [0, 1].
///
/// Identical vectors give 1.0, orthogonal 0.5, opposite 0.0.
pub fn distance_to_similarity(distance: f32) -> f32 {
    let d2 = (distance * distance).min(4.0);
    let cosine = (1.0 - d2 / 2.0).clamp(-1.0, 1.0);
    (1.0 + cosine) / 2.0
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[derive(Debug, Clone)]
struct Entry {
    identity_id: i64,
    vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct SimilarityIndex {
    dimension: usize,
    entries: Vec<Entry>,
    built: bool,
}

impl SimilarityIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Vec::new(),
            built: false,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Reset to an empty, built index, reserving room for `capacity` entries.
    pub fn build(&mut self, capacity: usize) {
        self.entries = Vec::with_capacity(capacity);
        self.built = true;
        tracing::debug!(capacity, dimension = self.dimension, "similarity index built");
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.built = false;
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    pub fn add(&mut self, identity_id: i64, vector: &[f32]) -> Result<(), IndexError> {
        if !self.built {
            return Err(IndexError::NotBuilt);
        }
        self.check_dimension(vector)?;
        self.entries.push(Entry {
            identity_id,
            vector: vector.to_vec(),
        });
        Ok(())
    }

    /// Add many entries at once. Nothing is added unless every vector fits.
    pub fn add_batch(&mut self, ids: &[i64], vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        if !self.built {
            return Err(IndexError::NotBuilt);
        }
        if ids.len() != vectors.len() {
            return Err(IndexError::LengthMismatch {
                ids: ids.len(),
                vectors: vectors.len(),
            });
        }
        for v in vectors {
            self.check_dimension(v)?;
        }
        self.entries.extend(ids.iter().zip(vectors).map(|(&identity_id, v)| Entry {
            identity_id,
            vector: v.clone(),
        }));
        Ok(())
    }

    /// Nearest entry as `(identity_id, similarity)`.
    ///
    /// An unbuilt or empty index, or a query of the wrong length, yields
    /// `(NO_MATCH, 0.0)`. Equal distances keep the earliest entry.
    pub fn search(&self, query: &[f32]) -> (i64, f32) {
        if !self.built || query.len() != self.dimension {
            return (NO_MATCH, 0.0);
        }
        let mut best: Option<(i64, f32)> = None;
        for entry in &self.entries {
            let d2 = squared_distance(query, &entry.vector);
            if best.map_or(true, |(_, min)| d2 < min) {
                best = Some((entry.identity_id, d2));
            }
        }
        match best {
            Some((id, d2)) => (id, distance_to_similarity(d2.sqrt())),
            None => (NO_MATCH, 0.0),
        }
    }

    /// Up to `k` nearest entries, most similar first.
    pub fn search_k(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        if !self.built || k == 0 || query.len() != self.dimension {
            return Vec::new();
        }
        let mut scored: Vec<(i64, f32)> = self
            .entries
            .iter()
            .map(|e| (e.identity_id, squared_distance(query, &e.vector)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
            .into_iter()
            .map(|(id, d2)| (id, distance_to_similarity(d2.sqrt())))
            .collect()
    }

    /// Number of entries per identity.
    pub fn cluster_sizes(&self) -> BTreeMap<i64, usize> {
        let mut sizes = BTreeMap::new();
        for entry in &self.entries {
            *sizes.entry(entry.identity_id).or_insert(0) += 1;
        }
        sizes
    }

    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        if !self.built {
            return Err(IndexError::NotBuilt);
        }
        let count = i32::try_from(self.entries.len())
            .map_err(|_| IndexError::Corrupt("too many entries".into()))?;
        let dimension = i32::try_from(self.dimension)
            .map_err(|_| IndexError::Corrupt("dimension too large".into()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut out = BufWriter::new(fs::File::create(path)?);
        out.write_all(&count.to_le_bytes())?;
        out.write_all(&dimension.to_le_bytes())?;
        for entry in &self.entries {
            for v in &entry.vector {
                out.write_all(&v.to_le_bytes())?;
            }
            let id = i32::try_from(entry.identity_id)
                .map_err(|_| IndexError::IdOutOfRange(entry.identity_id))?;
            out.write_all(&id.to_le_bytes())?;
        }
        out.flush()?;

        tracing::info!(path = %path.display(), entries = count, "similarity index saved");
        Ok(())
    }

    /// Replace the contents with the file at `path`. The dimension is taken
    /// from the file. On error the index is left unchanged.
    pub fn load(&mut self, path: &Path) -> Result<(), IndexError> {
        let bytes = fs::read(path)?;
        let (dimension, entries) = parse(&bytes)?;

        self.dimension = dimension;
        self.entries = entries;
        self.built = true;

        tracing::info!(
            path = %path.display(),
            entries = self.entries.len(),
            identities = self.cluster_sizes().len(),
            dimension,
            "similarity index loaded"
        );
        Ok(())
    }
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn parse(bytes: &[u8]) -> Result<(usize, Vec<Entry>), IndexError> {
    if bytes.len() < HEADER_LEN {
        return Err(IndexError::Corrupt(format!("header truncated ({} bytes)", bytes.len())));
    }
    let count = read_i32(bytes, 0);
    let dimension = read_i32(bytes, 4);
    if count < 0 || dimension <= 0 {
        return Err(IndexError::Corrupt(format!("bad header: count {count}, dimension {dimension}")));
    }
    let (count, dimension) = (count as usize, dimension as usize);

    let record_len = (dimension + 1) * 4;
    let expected = count
        .checked_mul(record_len)
        .and_then(|n| n.checked_add(HEADER_LEN))
        .ok_or_else(|| IndexError::Corrupt("header overflows".into()))?;
    if bytes.len() != expected {
        return Err(IndexError::Corrupt(format!(
            "expected {expected} bytes for {count} entries, found {}",
            bytes.len()
        )));
    }

    let entries = bytes[HEADER_LEN..]
        .chunks_exact(record_len)
        .map(|record| {
            let vector = record[..dimension * 4]
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Entry {
                identity_id: read_i32(record, dimension * 4) as i64,
                vector,
            }
        })
        .collect();
    Ok((dimension, entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(dimension: usize) -> SimilarityIndex {
        let mut index = SimilarityIndex::new(dimension);
        index.build(16);
        index
    }

    #[test]
    fn test_similarity_mapping() {
        assert!((distance_to_similarity(0.0) - 1.0).abs() < 1e-6);
        assert!((distance_to_similarity(2.0_f32.sqrt()) - 0.5).abs() < 1e-6);
        assert!((distance_to_similarity(2.0) - 0.0).abs() < 1e-6);
        // distances past the unit-sphere diameter saturate
        assert_eq!(distance_to_similarity(5.0), 0.0);
    }

    #[test]
    fn test_similarity_for_same_orthogonal_opposite() {
        let mut index = built(2);
        index.add(1, &[1.0, 0.0]).unwrap();
        index.add(2, &[0.0, 1.0]).unwrap();
        index.add(3, &[-1.0, 0.0]).unwrap();

        let hits = index.search_k(&[1.0, 0.0], 3);
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
        assert!((hits[1].1 - 0.5).abs() < 1e-6);
        assert!(hits[2].1.abs() < 1e-6);
    }

    #[test]
    fn test_wrong_length_add_leaves_count() {
        let mut index = built(2);
        index.add(1, &[1.0, 0.0]).unwrap();
        assert!(matches!(
            index.add(2, &[1.0, 0.0, 0.0]),
            Err(IndexError::DimensionMismatch { expected: 2, actual: 3 })
        ));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_save_clear_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let mut index = built(2);
        index.add(1, &[1.0, 0.0]).unwrap();
        index.add(2, &[0.0, 1.0]).unwrap();
        let before = index.search(&[0.9, 0.1]);
        index.save(&path).unwrap();

        index.clear();
        assert!(!index.is_built());
        assert_eq!(index.search(&[0.9, 0.1]), (NO_MATCH, 0.0));

        index.load(&path).unwrap();
        assert_eq!(index.search(&[0.9, 0.1]), before);
    }

    #[test]
    fn test_search_empty_and_unbuilt() {
        let index = SimilarityIndex::new(3);
        assert_eq!(index.search(&[1.0, 0.0, 0.0]), (NO_MATCH, 0.0));
        let index = built(3);
        assert_eq!(index.search(&[1.0, 0.0, 0.0]), (NO_MATCH, 0.0));
        assert!(index.search_k(&[1.0, 0.0, 0.0], 3).is_empty());
    }

    #[test]
    fn test_add_requires_build() {
        let mut index = SimilarityIndex::new(2);
        assert!(matches!(index.add(1, &[1.0, 0.0]), Err(IndexError::NotBuilt)));
        index.build(1);
        index.add(1, &[1.0, 0.0]).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_search_nearest() {
        let mut index = built(2);
        index.add(1, &[1.0, 0.0]).unwrap();
        index.add(2, &[0.0, 1.0]).unwrap();

        let (id, sim) = index.search(&[0.8, 0.6]);
        assert_eq!(id, 1);
        // |q - e1|^2 = 0.04 + 0.36 = 0.4 -> cos 0.8 -> 0.9
        assert!((sim - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_search_tie_keeps_first() {
        let mut index = built(2);
        index.add(7, &[1.0, 0.0]).unwrap();
        index.add(8, &[1.0, 0.0]).unwrap();
        assert_eq!(index.search(&[1.0, 0.0]).0, 7);
    }

    #[test]
    fn test_search_k_ordering() {
        let mut index = built(2);
        index.add(1, &[0.0, 1.0]).unwrap();
        index.add(2, &[1.0, 0.0]).unwrap();
        index.add(3, &[0.6, 0.8]).unwrap();

        let hits = index.search_k(&[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 2);
        assert_eq!(hits[1].0, 3);
        assert!(hits[0].1 >= hits[1].1);
        assert_eq!(index.search_k(&[1.0, 0.0], 10).len(), 3);
    }

    #[test]
    fn test_add_batch_is_atomic() {
        let mut index = built(2);
        let err = index
            .add_batch(&[1, 2], &[vec![1.0, 0.0], vec![1.0, 0.0, 0.0]])
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 2, actual: 3 }));
        assert!(index.is_empty());

        let err = index.add_batch(&[1], &[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap_err();
        assert!(matches!(err, IndexError::LengthMismatch { ids: 1, vectors: 2 }));
        assert!(index.is_empty());
    }

    #[test]
    fn test_save_load_preserves_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/index.bin");

        let mut index = built(3);
        index.add(10, &[1.0, 0.0, 0.0]).unwrap();
        index.add(11, &[0.0, 1.0, 0.0]).unwrap();
        index.add(10, &[0.0, 0.0, 1.0]).unwrap();
        index.save(&path).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 8 + 3 * 16);
        assert_eq!(&bytes[..4], &3i32.to_le_bytes());

        let mut loaded = SimilarityIndex::new(0);
        loaded.load(&path).unwrap();
        assert_eq!(loaded.dimension(), 3);
        assert_eq!(loaded.len(), 3);
        let query = [0.1, 0.9, 0.1];
        assert_eq!(loaded.search(&query), index.search(&query));
        assert_eq!(loaded.cluster_sizes().get(&10), Some(&2));
    }

    #[test]
    fn test_load_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");

        let mut index = built(2);
        index.add(1, &[1.0, 0.0]).unwrap();
        index.save(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        fs::write(&path, &bytes).unwrap();

        let mut target = built(2);
        target.add(5, &[0.0, 1.0]).unwrap();
        assert!(matches!(target.load(&path), Err(IndexError::Corrupt(_))));
        // unchanged on failure
        assert_eq!(target.len(), 1);
        assert_eq!(target.search(&[0.0, 1.0]).0, 5);

        fs::write(&path, [1u8, 0]).unwrap();
        assert!(matches!(target.load(&path), Err(IndexError::Corrupt(_))));
    }

    #[test]
    fn test_save_unbuilt_fails() {
        let dir = tempfile::tempdir().unwrap();
        let index = SimilarityIndex::new(2);
        assert!(matches!(index.save(&dir.path().join("i.bin")), Err(IndexError::NotBuilt)));
    }
}
