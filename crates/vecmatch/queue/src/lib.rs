//! Candidate queues.
//!
//! A queue is a pair of files sharing a prefix: `{prefix}.queues` holds packed
//! [`Candidate`] records and `{prefix}.index` is the offset index giving each
//! row's byte range. A row with an empty range has no candidates.

use eyre::WrapErr as _;
use vecmatch_core::{CANDIDATE_RECORD_SIZE, Candidate};

mod writer;

pub use writer::QueueWriter;

pub const QUEUE_EXTENSION: &str = "queues";
pub const INDEX_EXTENSION: &str = "index";

fn with_suffix(prefix: &std::path::Path, extension: &str) -> std::path::PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(".");
    path.push(extension);
    path.into()
}

/// Data and index paths for a queue prefix.
#[must_use]
pub fn queue_paths(prefix: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    (
        with_suffix(prefix, QUEUE_EXTENSION),
        with_suffix(prefix, INDEX_EXTENSION),
    )
}

/// Index path accompanying a data file, `<data>.index`.
#[must_use]
pub fn index_path_for(data: &std::path::Path) -> std::path::PathBuf {
    with_suffix(data, INDEX_EXTENSION)
}

/// One non-empty row of a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRow {
    pub row: u64,
    pub candidates: Vec<Candidate>,
}

/// Read-only view of a candidate queue.
#[derive(Debug)]
pub struct CandidateQueue {
    records: vecmatch_offsets::MappedRecords,
}

impl CandidateQueue {
    /// Open `{prefix}.queues` with `{prefix}.index`.
    pub fn open(prefix: &std::path::Path) -> eyre::Result<Self> {
        let (data, index) = queue_paths(prefix);
        let records = vecmatch_offsets::MappedRecords::open(&data, &index)
            .wrap_err_with(|| format!("failed to open candidate queue {}", prefix.display()))?;
        tracing::info!(rows = records.record_count(), prefix = %prefix.display(), "opened candidate queue");
        Ok(Self { records })
    }

    #[must_use]
    pub fn from_records(records: vecmatch_offsets::MappedRecords) -> Self {
        Self { records }
    }

    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.records.record_count()
    }

    /// Candidates of `row`, in file order.
    ///
    /// A byte range that is not a whole number of records is truncated to the
    /// records that fit, with a warning.
    pub fn row(&self, row: u64) -> eyre::Result<Vec<Candidate>> {
        let bytes = self.records.record(row)?;
        let (candidates, remainder) = Candidate::decode_all(bytes);
        if remainder != 0 {
            tracing::warn!(
                row,
                len = bytes.len(),
                record_size = CANDIDATE_RECORD_SIZE,
                dropped = remainder,
                "candidate row is not a whole number of records, truncating"
            );
        }
        Ok(candidates)
    }

    /// Rows `first..end` that have at least one candidate.
    pub fn rows(&self, first: u64, end: u64) -> impl Iterator<Item = eyre::Result<QueueRow>> + '_ {
        (first..end.min(self.row_count())).filter_map(move |row| match self.row(row) {
            Ok(candidates) if candidates.is_empty() => None,
            Ok(candidates) => Some(Ok(QueueRow { row, candidates })),
            Err(err) => Some(Err(err)),
        })
    }
}
