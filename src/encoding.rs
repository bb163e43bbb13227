//! Face encodings and their persistence format

use serde::{Deserialize, Serialize};

use crate::error::{FaceError, Result};

/// Length of a face descriptor
pub const ENCODING_DIM: usize = 128;

/// A 128-dimensional face descriptor.
///
/// Immutable once created. The zero-length encoding returned by
/// [`FaceEncoding::empty`] is the "no face" sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEncoding {
    values: Vec<f64>,
}

/// Serialized form of an encoding: flat values plus matrix shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodingRecord {
    pub values: Vec<f64>,
    pub rows: usize,
    pub columns: usize,
}

impl FaceEncoding {
    /// Create an encoding from exactly 128 values
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        if values.len() != ENCODING_DIM {
            return Err(FaceError::InvalidEncodingLength(values.len()));
        }
        Ok(Self {
            values: values.to_vec(),
        })
    }

    /// The zero-length sentinel
    pub fn empty() -> Self {
        Self { values: Vec::new() }
    }

    pub(crate) fn from_descriptor(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column-vector record, `rows = len`, `columns = 1`
    pub fn to_record(&self) -> EncodingRecord {
        EncodingRecord {
            values: self.values.clone(),
            rows: self.values.len(),
            columns: if self.values.is_empty() { 0 } else { 1 },
        }
    }

    pub fn from_record(record: &EncodingRecord) -> Result<Self> {
        if record.rows * record.columns != record.values.len() {
            return Err(FaceError::InvalidArgument(format!(
                "record shape {}x{} does not match {} values",
                record.rows,
                record.columns,
                record.values.len()
            )));
        }
        if record.values.is_empty() {
            return Ok(Self::empty());
        }
        Self::from_slice(&record.values)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_record())?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let record: EncodingRecord = serde_json::from_str(json)?;
        Self::from_record(&record)
    }

    /// Convert to little-endian bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Create from little-endian bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 8 != 0 {
            return Err(FaceError::InvalidArgument(format!(
                "encoding byte length {} is not a multiple of 8",
                bytes.len()
            )));
        }

        let values: Vec<f64> = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(chunk);
                f64::from_le_bytes(arr)
            })
            .collect();

        if values.is_empty() {
            return Ok(Self::empty());
        }
        Self::from_slice(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FaceEncoding {
        let values: Vec<f64> = (0..ENCODING_DIM).map(|i| (i as f64).sin() / 7.0).collect();
        FaceEncoding::from_slice(&values).unwrap()
    }

    #[test]
    fn test_from_slice_requires_128_values() {
        assert!(matches!(
            FaceEncoding::from_slice(&[0.0; 127]),
            Err(FaceError::InvalidEncodingLength(127))
        ));
        assert_eq!(sample().len(), ENCODING_DIM);
    }

    #[test]
    fn test_record_shape() {
        let record = sample().to_record();
        assert_eq!((record.rows, record.columns), (128, 1));
        assert_eq!(FaceEncoding::empty().to_record().columns, 0);
    }

    #[test]
    fn test_json_round_trip_is_bit_exact() {
        let original = sample();
        let restored = FaceEncoding::from_json(&original.to_json().unwrap()).unwrap();
        for (a, b) in original.values().iter().zip(restored.values()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let original = sample();
        let restored = FaceEncoding::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(original, restored);
        assert!(FaceEncoding::from_bytes(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_record_shape_mismatch() {
        let record = EncodingRecord {
            values: vec![0.0; 128],
            rows: 64,
            columns: 1,
        };
        assert!(matches!(
            FaceEncoding::from_record(&record),
            Err(FaceError::InvalidArgument(_))
        ));
    }
}
