//! Match report writers.

use eyre::WrapErr as _;
use vecmatch_core::{Candidate, DecodeError, VectorId};

/// Re-ranked candidates of one queue row.
#[derive(Debug, Clone, Copy)]
pub struct RankedRow<'a> {
    /// Position of the row in the candidate queue.
    pub queue_row: u64,
    /// Vector id of the row.
    pub id: VectorId,
    /// Candidates within the threshold, in queue order.
    pub candidates: &'a [Candidate],
}

/// Destination of re-ranked rows.
///
/// Rows arrive in ascending `queue_row` order. Rows without candidates in the
/// queue are never delivered.
pub trait ReportSink {
    fn write_row(&mut self, row: &RankedRow<'_>) -> eyre::Result<()>;

    /// Called once after the last row, with the number of rows in the queue.
    fn finish(&mut self, row_count: u64) -> eyre::Result<()>;
}

/// Keeps nothing; the run's summary is the only result.
#[derive(Debug, Default, Clone, Copy)]
pub struct SummaryOnly;

impl ReportSink for SummaryOnly {
    fn write_row(&mut self, _row: &RankedRow<'_>) -> eyre::Result<()> {
        Ok(())
    }

    fn finish(&mut self, _row_count: u64) -> eyre::Result<()> {
        Ok(())
    }
}

/// Compact report in the candidate queue format.
///
/// The data stream holds the kept candidates of each row back to back; the
/// accompanying offset index has an entry for every queue row, so the report
/// can be read again as a candidate queue.
pub struct BinaryReport<W: std::io::Write> {
    writer: Option<vecmatch_queue::QueueWriter<W>>,
    index_path: Option<std::path::PathBuf>,
    finished: Option<(W, vecmatch_offsets::OffsetIndex)>,
}

impl BinaryReport<std::io::BufWriter<std::fs::File>> {
    /// Write to `output`, with the offset index in `<output>.index`.
    pub fn create(output: &std::path::Path) -> eyre::Result<Self> {
        let mut report = Self::new(vecmatch_queue::QueueWriter::create(output)?);
        report.index_path = Some(vecmatch_queue::index_path_for(output));
        Ok(report)
    }
}

impl<W: std::io::Write> BinaryReport<W> {
    pub fn new(writer: vecmatch_queue::QueueWriter<W>) -> Self {
        Self {
            writer: Some(writer),
            index_path: None,
            finished: None,
        }
    }

    /// Data sink and index after [`ReportSink::finish`].
    pub fn into_parts(self) -> Option<(W, vecmatch_offsets::OffsetIndex)> {
        self.finished
    }

    fn writer(&mut self) -> eyre::Result<&mut vecmatch_queue::QueueWriter<W>> {
        self.writer
            .as_mut()
            .ok_or_else(|| eyre::eyre!("binary report already finished"))
    }

    fn pad_to(&mut self, row: u64) -> eyre::Result<()> {
        let writer = self.writer()?;
        while writer.row_count() < row {
            writer.push_row(&[])?;
        }
        Ok(())
    }
}

impl<W: std::io::Write> ReportSink for BinaryReport<W> {
    fn write_row(&mut self, row: &RankedRow<'_>) -> eyre::Result<()> {
        self.pad_to(row.queue_row)?;
        let writer = self.writer()?;
        if writer.row_count() != row.queue_row {
            eyre::bail!(
                "row {} arrived after row {} was written",
                row.queue_row,
                writer.row_count() - 1
            );
        }
        writer.push_row(row.candidates)
    }

    fn finish(&mut self, row_count: u64) -> eyre::Result<()> {
        self.pad_to(row_count)?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| eyre::eyre!("binary report already finished"))?;
        let (data, index) = writer.finish()?;
        if let Some(path) = &self.index_path {
            std::fs::write(path, index.to_bytes())
                .wrap_err_with(|| format!("failed to write report index {}", path.display()))?;
        }
        tracing::info!(rows = index.record_count(), "binary report written");
        self.finished = Some((data, index));
        Ok(())
    }
}

/// External identity of a record: the source file and its row there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalId {
    pub file_id: String,
    pub row_id: String,
}

/// Resolves vector ids to external identities through a JSON line store.
pub struct ExternalIdLookup {
    records: vecmatch_offsets::MappedRecords,
    cache: lru::LruCache<VectorId, ExternalId>,
}

impl ExternalIdLookup {
    pub const DEFAULT_CACHE_SIZE: usize = 65536;

    pub fn new(records: vecmatch_offsets::MappedRecords, cache_size: usize) -> eyre::Result<Self> {
        let capacity = std::num::NonZeroUsize::new(cache_size)
            .ok_or_else(|| eyre::eyre!("lookup cache size must be non-zero"))?;
        Ok(Self {
            records,
            cache: lru::LruCache::new(capacity),
        })
    }

    pub fn open(lines: &std::path::Path, index: &std::path::Path) -> eyre::Result<Self> {
        let records = vecmatch_offsets::MappedRecords::open(lines, index)
            .wrap_err("failed to open the line store for external ids")?;
        Self::new(records, Self::DEFAULT_CACHE_SIZE)
    }

    pub fn get(&mut self, id: VectorId) -> eyre::Result<ExternalId> {
        if let Some(found) = self.cache.get(&id) {
            return Ok(found.clone());
        }
        let found = self.read(id)?;
        self.cache.put(id, found.clone());
        Ok(found)
    }

    fn read(&self, id: VectorId) -> eyre::Result<ExternalId> {
        let bytes = self.records.record(id)?;
        // Records after the first start with the preceding newline.
        let line = bytes.trim_ascii();
        let value: serde_json::Value =
            serde_json::from_slice(line).map_err(|source| DecodeError {
                content: String::from_utf8_lossy(line).into_owned(),
                source,
            })?;
        let field = |name: &str| -> eyre::Result<String> {
            match value.get(name) {
                Some(serde_json::Value::String(s)) => Ok(s.clone()),
                Some(serde_json::Value::Null) | None => {
                    eyre::bail!("record {id} has no {name}")
                }
                Some(other) => Ok(other.to_string()),
            }
        };
        Ok(ExternalId {
            file_id: field("file_id")?,
            row_id: field("row_id")?,
        })
    }
}

/// Denormalised report: one CSV line per kept pair,
/// `row_file_id,row_row_id,candidate_file_id,candidate_row_id`.
pub struct CsvReport<W: std::io::Write> {
    writer: csv::Writer<W>,
    lookup: ExternalIdLookup,
}

impl CsvReport<std::fs::File> {
    pub fn create(output: &std::path::Path, lookup: ExternalIdLookup) -> eyre::Result<Self> {
        let file = std::fs::File::create(output)
            .wrap_err_with(|| format!("failed to create {}", output.display()))?;
        Ok(Self::new(file, lookup))
    }
}

impl<W: std::io::Write> CsvReport<W> {
    pub fn new(output: W, lookup: ExternalIdLookup) -> Self {
        Self {
            writer: csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(output),
            lookup,
        }
    }

    pub fn into_inner(self) -> eyre::Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| eyre::eyre!("failed to flush csv report: {}", e.error()))
    }
}

impl<W: std::io::Write> ReportSink for CsvReport<W> {
    fn write_row(&mut self, row: &RankedRow<'_>) -> eyre::Result<()> {
        if row.candidates.is_empty() {
            return Ok(());
        }
        let own = self.lookup.get(row.id)?;
        for candidate in row.candidates {
            let other = self.lookup.get(candidate.id)?;
            self.writer
                .write_record([&own.file_id, &own.row_id, &other.file_id, &other.row_id])
                .wrap_err("failed to write csv record")?;
        }
        Ok(())
    }

    fn finish(&mut self, _row_count: u64) -> eyre::Result<()> {
        self.writer.flush().wrap_err("failed to flush csv report")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_over(lines: &[&str]) -> ExternalIdLookup {
        let mut data = lines.join("\n").into_bytes();
        data.push(b'\n');
        let index = vecmatch_offsets::line_offsets(&data);
        ExternalIdLookup::new(vecmatch_offsets::MappedRecords::from_parts(index, data), 2).unwrap()
    }

    #[test]
    fn test_lookup_trims_and_stringifies() {
        let mut lookup = lookup_over(&[
            r#"{"file_id": "a.csv", "row_id": 17}"#,
            r#"{"file_id": "b.csv", "row_id": "r-2", "name": "x"}"#,
            r#"{"file_id": "c.csv"}"#,
        ]);
        assert_eq!(
            lookup.get(0).unwrap(),
            ExternalId { file_id: "a.csv".to_string(), row_id: "17".to_string() }
        );
        assert_eq!(lookup.get(1).unwrap().row_id, "r-2");
        // Cached on the second call.
        assert_eq!(lookup.get(1).unwrap().file_id, "b.csv");
        assert!(lookup.get(2).is_err());
        assert!(lookup.get(3).is_err());
    }

    #[test]
    fn test_csv_skips_empty_rows() {
        let lookup = lookup_over(&[
            r#"{"file_id": "f", "row_id": 0}"#,
            r#"{"file_id": "f", "row_id": 1}"#,
            r#"{"file_id": "g", "row_id": 2}"#,
        ]);
        let mut report = CsvReport::new(Vec::new(), lookup);
        report
            .write_row(&RankedRow { queue_row: 0, id: 0, candidates: &[Candidate::new(2, 0.1), Candidate::new(1, 0.3)] })
            .unwrap();
        report
            .write_row(&RankedRow { queue_row: 1, id: 1, candidates: &[] })
            .unwrap();
        report.finish(2).unwrap();

        let text = String::from_utf8(report.into_inner().unwrap()).unwrap();
        assert_eq!(text, "f,0,g,2\nf,0,f,1\n");
    }

    #[test]
    fn test_binary_report_pads_missing_rows() {
        let mut report = BinaryReport::new(vecmatch_queue::QueueWriter::new(Vec::new()));
        report
            .write_row(&RankedRow { queue_row: 1, id: 1, candidates: &[Candidate::new(4, 0.5)] })
            .unwrap();
        report
            .write_row(&RankedRow { queue_row: 3, id: 3, candidates: &[] })
            .unwrap();
        report.finish(5).unwrap();

        let (data, index) = report.into_parts().unwrap();
        assert_eq!(index.offsets(), &[0, 0, 16, 16, 16, 16]);
        assert_eq!(data, Candidate::new(4, 0.5).to_bytes().to_vec());
    }

    #[test]
    fn test_binary_report_rejects_out_of_order_rows() {
        let mut report = BinaryReport::new(vecmatch_queue::QueueWriter::new(Vec::new()));
        report
            .write_row(&RankedRow { queue_row: 2, id: 2, candidates: &[] })
            .unwrap();
        assert!(report
            .write_row(&RankedRow { queue_row: 1, id: 1, candidates: &[] })
            .is_err());
    }
}
