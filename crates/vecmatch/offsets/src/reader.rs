//! Record store readers: resolve record numbers to bytes of a flat data file.

use eyre::WrapErr as _;
use vecmatch_core::CorruptionError;
use vecmatch_store::ObjectStore;

use crate::OffsetIndex;

/// Reads records of a data object in a store, resolving offsets either from a
/// bulk-loaded index or with targeted reads against the index object.
pub struct RecordReader<'a, S: ?Sized> {
    store: &'a S,
    data_key: String,
    index_key: String,
    loaded: Option<OffsetIndex>,
}

impl<'a, S: ObjectStore + ?Sized> RecordReader<'a, S> {
    /// Reader that looks offsets up on demand.
    pub fn new(store: &'a S, data_key: impl Into<String>, index_key: impl Into<String>) -> Self {
        Self {
            store,
            data_key: data_key.into(),
            index_key: index_key.into(),
            loaded: None,
        }
    }

    /// Reader that loads the whole index up front.
    pub fn bulk(
        store: &'a S,
        data_key: impl Into<String>,
        index_key: impl Into<String>,
    ) -> eyre::Result<Self> {
        let mut reader = Self::new(store, data_key, index_key);
        reader.loaded = Some(OffsetIndex::load(store, &reader.index_key)?);
        Ok(reader)
    }

    /// Byte range of records `first..end` (exclusive end).
    pub fn span(&self, first: u64, end: u64) -> eyre::Result<std::ops::Range<u64>> {
        match &self.loaded {
            Some(index) => index.span(first, end),
            None if end == first + 1 => crate::offsets_for(self.store, &self.index_key, first),
            None => {
                let start = crate::offset_at(self.store, &self.index_key, first)?;
                let stop = crate::offset_at(self.store, &self.index_key, end)?;
                if stop < start {
                    return Err(CorruptionError::NegativeRecordSize {
                        record: first,
                        start,
                        end: stop,
                    }
                    .into());
                }
                Ok(start..stop)
            }
        }
    }

    /// Raw bytes of `range` in the data object, with one range read.
    pub fn read_range(&self, range: std::ops::Range<u64>) -> eyre::Result<Vec<u8>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .get_range(&self.data_key, range.clone())
            .wrap_err_with(|| {
                format!(
                    "failed to read bytes {}..{} of {}",
                    range.start, range.end, self.data_key
                )
            })
    }

    /// Raw bytes of record `record`.
    pub fn record(&self, record: u64) -> eyre::Result<Vec<u8>> {
        self.read_range(self.span(record, record + 1)?)
    }

    /// Raw bytes of the contiguous records `first..end`.
    pub fn records(&self, first: u64, end: u64) -> eyre::Result<Vec<u8>> {
        self.read_range(self.span(first, end)?)
    }
}

/// A local data file mapped into memory together with its bulk-loaded index.
pub struct MappedRecords {
    index: OffsetIndex,
    data: Data,
}

enum Data {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl std::ops::Deref for Data {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Data::Mapped(mmap) => &mmap[..],
            Data::Owned(bytes) => bytes.as_slice(),
        }
    }
}

impl std::fmt::Debug for MappedRecords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRecords")
            .field("records", &self.record_count())
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl MappedRecords {
    /// Map `data_path` and load `index_path` fully into memory.
    pub fn open(data_path: &std::path::Path, index_path: &std::path::Path) -> eyre::Result<Self> {
        let index = OffsetIndex::open(index_path)?;

        let file = std::fs::File::open(data_path)
            .wrap_err_with(|| format!("failed to open data file {}", data_path.display()))?;
        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat {}", data_path.display()))?
            .len();

        // mapping an empty file fails on some platforms
        let data = if len == 0 {
            Data::Owned(Vec::new())
        } else {
            let mmap = unsafe {
                memmap2::Mmap::map(&file)
                    .wrap_err_with(|| format!("failed to mmap {}", data_path.display()))?
            };
            Data::Mapped(mmap)
        };

        Ok(Self { index, data })
    }

    /// Records held in memory.
    #[must_use]
    pub fn from_parts(index: OffsetIndex, data: Vec<u8>) -> Self {
        Self {
            index,
            data: Data::Owned(data),
        }
    }

    #[must_use]
    pub fn index(&self) -> &OffsetIndex {
        &self.index
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.index.record_count()
    }

    /// Borrow the bytes of `record`.
    pub fn record(&self, record: u64) -> eyre::Result<&[u8]> {
        let range = self.index.range(record)?;
        let len = self.data.len() as u64;
        if range.end > len {
            return Err(CorruptionError::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                len,
            }
            .into());
        }
        Ok(&self.data[range.start as usize..range.end as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> vecmatch_store::MemoryObjectStore {
        let store = vecmatch_store::MemoryObjectStore::new();
        store.put("data", b"hello world!").unwrap();
        store
            .put(
                "data.idx",
                &OffsetIndex::from_offsets(vec![0, 5, 5, 12]).to_bytes(),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_targeted_and_bulk_agree() {
        let store = fixture();
        let targeted = RecordReader::new(&store, "data", "data.idx");
        let bulk = RecordReader::bulk(&store, "data", "data.idx").unwrap();

        for reader in [&targeted, &bulk] {
            assert_eq!(reader.record(0).unwrap(), b"hello");
            assert!(reader.record(1).unwrap().is_empty());
            assert_eq!(reader.record(2).unwrap(), b" world!");
            assert_eq!(reader.records(0, 3).unwrap(), b"hello world!");
        }
    }

    #[test]
    fn test_mapped_records() {
        let tmp = tempfile::tempdir().unwrap();
        let data_path = tmp.path().join("lines.json");
        let index_path = tmp.path().join("lines.idx");
        std::fs::write(&data_path, b"hello world!").unwrap();
        std::fs::write(
            &index_path,
            OffsetIndex::from_offsets(vec![0, 5, 5, 12, 40]).to_bytes(),
        )
        .unwrap();

        let records = MappedRecords::open(&data_path, &index_path).unwrap();
        assert_eq!(records.record_count(), 4);
        assert_eq!(records.record(0).unwrap(), b"hello");
        assert_eq!(records.record(1).unwrap(), b"");
        assert_eq!(records.record(2).unwrap(), b" world!");

        // index points past the end of the data file
        let err = records.record(3).unwrap_err();
        assert!(err.downcast_ref::<CorruptionError>().is_some());
    }
}
