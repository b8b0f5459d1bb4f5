//! Core types and traits for vecmatch.

use byteorder::{ByteOrder as _, LittleEndian};

/// Global identifier of an embedding vector (and of the line it was produced from).
pub type VectorId = u64;

/// A batch of embeddings, one row per input string. Shape: [batch, dim]
pub type Embedding = ndarray::Array2<f32>;

/// Borrowed view into a batch of embeddings.
pub type EmbeddingView<'a> = ndarray::ArrayView2<'a, f32>;

/// Embedding dimension of the default deployment model.
pub const DEFAULT_DIMENSION: usize = 1024;

/// Size of one packed candidate record: u64 id + f32 distance + f32 reserved.
pub const CANDIDATE_RECORD_SIZE: usize = 16;

/// One approximate (or re-ranked) neighbor of a queue row.
///
/// Wire format is little-endian `(u64 id, f32 distance, f32 reserved)`, densely
/// packed. The reserved word is always written as zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: VectorId,
    pub distance: f32,
}

impl Candidate {
    #[must_use]
    pub fn new(id: VectorId, distance: f32) -> Self {
        Self { id, distance }
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; CANDIDATE_RECORD_SIZE] {
        let mut buf = [0u8; CANDIDATE_RECORD_SIZE];
        LittleEndian::write_u64(&mut buf[..8], self.id);
        LittleEndian::write_f32(&mut buf[8..12], self.distance);
        buf
    }

    #[must_use]
    pub fn from_bytes(buf: &[u8; CANDIDATE_RECORD_SIZE]) -> Self {
        Self {
            id: LittleEndian::read_u64(&buf[..8]),
            distance: LittleEndian::read_f32(&buf[8..12]),
        }
    }

    /// Decode as many whole records as fit in `bytes`.
    ///
    /// Returns the decoded records and the number of trailing bytes that did not
    /// form a complete record.
    #[must_use]
    pub fn decode_all(bytes: &[u8]) -> (Vec<Self>, usize) {
        let chunks = bytes.chunks_exact(CANDIDATE_RECORD_SIZE);
        let remainder = chunks.remainder().len();
        let records = chunks
            .map(|chunk| {
                let mut buf = [0u8; CANDIDATE_RECORD_SIZE];
                buf.copy_from_slice(chunk);
                Self::from_bytes(&buf)
            })
            .collect();
        (records, remainder)
    }
}

/// A capability mapping a batch of strings to a batch of fixed-width vectors.
pub trait Embedder {
    /// Width of every produced vector.
    fn dimension(&self) -> usize;

    /// Embed `texts`, returning one row per input in input order.
    fn embed_batch(&mut self, texts: &[String]) -> eyre::Result<Embedding>;
}

/// Stored data violates the structure its format promises.
#[derive(Debug, thiserror::Error)]
pub enum CorruptionError {
    #[error("record {record} has negative size: end {end} < start {start}")]
    NegativeRecordSize { record: u64, start: u64, end: u64 },

    #[error("offset index has {entries} entries, record {record} needs entry {needed}")]
    RecordOutOfRange {
        record: u64,
        entries: u64,
        needed: u64,
    },

    #[error("offset index of {len} bytes is not a multiple of 8")]
    MisalignedIndex { len: u64 },

    #[error("byte range {start}..{end} exceeds data length {len}")]
    RangeOutOfBounds { start: u64, end: u64, len: u64 },

    #[error("unexpected empty line after {lines_seen} lines")]
    UnexpectedEmptyLine { lines_seen: u64 },

    #[error("expected {expected} lines in range, found {found}")]
    LineCountMismatch { expected: u64, found: u64 },

    #[error("vector ids must be sorted and unique: {previous} followed by {next}")]
    UnsortedIds { previous: VectorId, next: VectorId },

    #[error("{0}")]
    Other(String),
}

/// A line in the line store is not valid JSON.
#[derive(Debug, thiserror::Error)]
#[error("invalid json line: {content}")]
pub struct DecodeError {
    pub content: String,
    #[source]
    pub source: serde_json::Error,
}

/// The coordinator asked the worker to stop (pause or cancel).
///
/// Not a failure: the task will be resumed later from its last checkpoint.
#[derive(Debug, thiserror::Error)]
#[error("task was interrupted: {reason}")]
pub struct Interrupted {
    pub reason: String,
}

/// Whether an error chain was caused by a coordinator interrupt.
#[must_use]
pub fn is_interrupted(err: &eyre::Report) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<Interrupted>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_wire_layout() {
        let bytes = Candidate::new(7, 0.25).to_bytes();
        assert_eq!(&bytes[..8], &7u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &0.25f32.to_le_bytes());
        assert_eq!(&bytes[12..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_all_drops_partial_record() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&Candidate::new(7, 0.1).to_bytes());
        bytes.extend_from_slice(&Candidate::new(3, 0.9).to_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);

        let (records, remainder) = Candidate::decode_all(&bytes);
        assert_eq!(remainder, 3);
        assert_eq!(records, vec![Candidate::new(7, 0.1), Candidate::new(3, 0.9)]);
    }

    #[test]
    fn test_interrupted_detected_through_context() {
        use eyre::WrapErr as _;

        let result: eyre::Result<()> = Err(Interrupted {
            reason: "paused".to_string(),
        }
        .into());
        let err = result.wrap_err("heartbeat failed").unwrap_err();
        assert!(is_interrupted(&err));

        let other = eyre::eyre!("disk on fire");
        assert!(!is_interrupted(&other));
    }
}
