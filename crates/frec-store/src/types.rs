use serde::{Deserialize, Serialize};

/// A named identity that faces are enrolled under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    /// Number of embeddings currently stored for this identity.
    pub enrollment_count: i64,
    /// RFC 3339 timestamp.
    pub created_at: String,
    /// RFC 3339 timestamp.
    pub updated_at: String,
}

impl Identity {
    /// Creation time as Unix milliseconds, or 0 if the stored timestamp is malformed.
    pub fn created_timestamp_ms(&self) -> u64 {
        chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map(|t| t.timestamp_millis().max(0) as u64)
            .unwrap_or(0)
    }
}

/// Provenance record for an image captured or imported for an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentImage {
    pub id: i64,
    pub identity_id: i64,
    pub file_path: String,
    pub created_at: String,
}

/// A stored embedding vector in its raw byte form.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub identity_id: i64,
    pub source_path: String,
    /// Little-endian `f32` values, `dimension * 4` bytes.
    pub vector_bytes: Vec<u8>,
    pub created_at: String,
}

impl EmbeddingRecord {
    /// Decode the stored bytes. Returns `None` unless the blob holds exactly
    /// `dimension` floats.
    pub fn vector(&self, dimension: usize) -> Option<Vec<f32>> {
        if self.vector_bytes.len() != dimension * std::mem::size_of::<f32>() {
            return None;
        }
        Some(bytes_to_vector(&self.vector_bytes))
    }
}

/// Serialize an embedding as little-endian `f32` bytes.
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Deserialize little-endian `f32` bytes. Trailing bytes that do not form a
/// whole float are ignored.
pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_bytes_layout() {
        let bytes = vector_to_bytes(&[1.0, -0.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(bytes_to_vector(&bytes), vec![1.0, -0.5]);
    }

    #[test]
    fn test_record_vector_dimension_guard() {
        let record = EmbeddingRecord {
            id: 1,
            identity_id: 1,
            source_path: String::new(),
            vector_bytes: vector_to_bytes(&[0.1, 0.2, 0.3]),
            created_at: String::new(),
        };
        assert!(record.vector(3).is_some());
        assert!(record.vector(4).is_none());
        assert!(record.vector(2).is_none());
    }

    #[test]
    fn test_created_timestamp_ms() {
        let identity = Identity {
            id: 1,
            name: "A1".into(),
            enrollment_count: 0,
            created_at: "1970-01-01T00:00:01+00:00".into(),
            updated_at: String::new(),
        };
        assert_eq!(identity.created_timestamp_ms(), 1000);

        let bad = Identity { created_at: "yesterday".into(), ..identity };
        assert_eq!(bad.created_timestamp_ms(), 0);
    }
}
