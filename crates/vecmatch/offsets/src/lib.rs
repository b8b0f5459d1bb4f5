//! Offset index: a flat file of little-endian u64 byte offsets.
//!
//! An index over N records has N + 1 entries and no header or footer. Record
//! `i` occupies the half-open byte range `[offset[i], offset[i + 1])` of its
//! companion data file. The same format delimits JSON lines in a line store and
//! per-row candidate blocks in a candidate queue.
//!
//! Two access patterns are supported:
//! - targeted lookups ([`offset_at`], [`offsets_for`]) that read 8 or 16 bytes
//!   of an index too large to load
//! - bulk loading ([`OffsetIndex`]) for workloads that touch most records

use byteorder::{ByteOrder as _, LittleEndian};
use eyre::WrapErr as _;
use vecmatch_core::CorruptionError;
use vecmatch_store::ObjectStore;

mod reader;

pub use reader::{MappedRecords, RecordReader};

/// Width of one index entry in bytes.
pub const OFFSET_WIDTH: u64 = 8;

/// An offset index held fully in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetIndex {
    offsets: Vec<u64>,
}

impl OffsetIndex {
    /// Wrap already decoded offsets.
    #[must_use]
    pub fn from_offsets(offsets: Vec<u64>) -> Self {
        Self { offsets }
    }

    /// Decode an index from its on-disk bytes.
    pub fn from_bytes(bytes: &[u8]) -> eyre::Result<Self> {
        if bytes.len() as u64 % OFFSET_WIDTH != 0 {
            return Err(CorruptionError::MisalignedIndex {
                len: bytes.len() as u64,
            }
            .into());
        }
        let mut offsets = vec![0u64; bytes.len() / OFFSET_WIDTH as usize];
        LittleEndian::read_u64_into(bytes, &mut offsets);
        Ok(Self { offsets })
    }

    /// Load an index file from the local filesystem.
    pub fn open(path: &std::path::Path) -> eyre::Result<Self> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read offset index {}", path.display()))?;
        let index = Self::from_bytes(&bytes)
            .wrap_err_with(|| format!("failed to decode offset index {}", path.display()))?;
        tracing::debug!(path = %path.display(), records = index.record_count(), "loaded offset index");
        Ok(index)
    }

    /// Load a whole index object from a store with a single range read.
    pub fn load<S: ObjectStore + ?Sized>(store: &S, key: &str) -> eyre::Result<Self> {
        let size = store.size(key)?;
        let bytes = store
            .get_range(key, 0..size)
            .wrap_err_with(|| format!("failed to read offset index {key}"))?;
        Self::from_bytes(&bytes).wrap_err_with(|| format!("failed to decode offset index {key}"))
    }

    /// Encode to the on-disk representation.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.offsets.len() * OFFSET_WIDTH as usize];
        LittleEndian::write_u64_into(&self.offsets, &mut bytes);
        bytes
    }

    /// Raw entries.
    #[must_use]
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Number of records described (entries minus one).
    #[must_use]
    pub fn record_count(&self) -> u64 {
        (self.offsets.len() as u64).saturating_sub(1)
    }

    /// Byte range of `record`.
    pub fn range(&self, record: u64) -> eyre::Result<std::ops::Range<u64>> {
        self.span(record, record + 1)
    }

    /// Byte range covering records `first..end` (exclusive), i.e.
    /// `[offset[first], offset[end])`.
    pub fn span(&self, first: u64, end: u64) -> eyre::Result<std::ops::Range<u64>> {
        let entries = self.offsets.len() as u64;
        let fetch = |i: u64| {
            usize::try_from(i)
                .ok()
                .and_then(|i| self.offsets.get(i).copied())
                .ok_or(CorruptionError::RecordOutOfRange {
                    record: first,
                    entries,
                    needed: i,
                })
        };
        let start = fetch(first)?;
        let stop = fetch(end)?;
        checked_range(first, start, stop)
    }

    /// Check the non-decreasing invariant over the whole index.
    pub fn validate(&self) -> eyre::Result<()> {
        for (record, pair) in self.offsets.windows(2).enumerate() {
            checked_range(record as u64, pair[0], pair[1])?;
        }
        Ok(())
    }
}

fn checked_range(record: u64, start: u64, end: u64) -> eyre::Result<std::ops::Range<u64>> {
    if end < start {
        return Err(CorruptionError::NegativeRecordSize { record, start, end }.into());
    }
    Ok(start..end)
}

/// Read entry `i` of a remote index with one 8-byte range read.
pub fn offset_at<S: ObjectStore + ?Sized>(store: &S, index_key: &str, i: u64) -> eyre::Result<u64> {
    let start = i * OFFSET_WIDTH;
    let bytes = store
        .get_range(index_key, start..start + OFFSET_WIDTH)
        .wrap_err_with(|| format!("failed to read entry {i} of offset index {index_key}"))?;
    Ok(LittleEndian::read_u64(&bytes))
}

/// Byte range of record `i` from a remote index with one 16-byte range read.
pub fn offsets_for<S: ObjectStore + ?Sized>(
    store: &S,
    index_key: &str,
    i: u64,
) -> eyre::Result<std::ops::Range<u64>> {
    let start = i * OFFSET_WIDTH;
    let bytes = store
        .get_range(index_key, start..start + 2 * OFFSET_WIDTH)
        .wrap_err_with(|| format!("failed to read entries {i}..={} of offset index {index_key}", i + 1))?;
    checked_range(
        i,
        LittleEndian::read_u64(&bytes[..8]),
        LittleEndian::read_u64(&bytes[8..16]),
    )
}

/// Incrementally builds the offset index of a newline-delimited line store.
///
/// Entry 0 is 0 and every subsequent entry is the byte position of a `\n`, so
/// each record after the first begins with the newline that terminated its
/// predecessor. A final entry at the file length closes an unterminated last
/// line.
#[derive(Debug)]
pub struct LineIndexBuilder {
    offsets: Vec<u64>,
    position: u64,
    last_byte: Option<u8>,
}

impl Default for LineIndexBuilder {
    fn default() -> Self {
        Self {
            offsets: vec![0],
            position: 0,
            last_byte: None,
        }
    }
}

impl LineIndexBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next block of the file.
    pub fn feed(&mut self, block: &[u8]) {
        let base = self.position;
        self.offsets.extend(
            block
                .iter()
                .enumerate()
                .filter(|(_, b)| **b == b'\n')
                .map(|(i, _)| base + i as u64),
        );
        self.position += block.len() as u64;
        if let Some(&b) = block.last() {
            self.last_byte = Some(b);
        }
    }

    /// Finish and return the index.
    #[must_use]
    pub fn finish(mut self) -> OffsetIndex {
        if matches!(self.last_byte, Some(b) if b != b'\n') {
            self.offsets.push(self.position);
        }
        OffsetIndex::from_offsets(self.offsets)
    }
}

/// Build the offset index of an in-memory line store.
#[must_use]
pub fn line_offsets(data: &[u8]) -> OffsetIndex {
    let mut builder = LineIndexBuilder::new();
    builder.feed(data);
    builder.finish()
}
