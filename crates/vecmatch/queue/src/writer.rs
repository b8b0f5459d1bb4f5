use eyre::WrapErr as _;
use vecmatch_core::Candidate;

/// Writes rows of candidates in the queue format, data and index side by side.
#[derive(Debug)]
pub struct QueueWriter<W: std::io::Write> {
    data: W,
    offsets: Vec<u64>,
    position: u64,
}

impl QueueWriter<std::io::BufWriter<std::fs::File>> {
    /// Create `data_path`; its index is written by [`QueueWriter::finish`].
    pub fn create(data_path: &std::path::Path) -> eyre::Result<Self> {
        let file = std::fs::File::create(data_path)
            .wrap_err_with(|| format!("failed to create {}", data_path.display()))?;
        Ok(Self::new(std::io::BufWriter::new(file)))
    }
}

impl<W: std::io::Write> QueueWriter<W> {
    pub fn new(data: W) -> Self {
        Self {
            data,
            offsets: vec![0],
            position: 0,
        }
    }

    /// Rows written so far.
    #[must_use]
    pub fn row_count(&self) -> u64 {
        self.offsets.len() as u64 - 1
    }

    /// Append one row. An empty slice records a row without candidates.
    pub fn push_row(&mut self, candidates: &[Candidate]) -> eyre::Result<()> {
        for candidate in candidates {
            self.data.write_all(&candidate.to_bytes())?;
        }
        self.position += (candidates.len() * vecmatch_core::CANDIDATE_RECORD_SIZE) as u64;
        self.offsets.push(self.position);
        Ok(())
    }

    /// Flush the data and return it with the completed offset index.
    pub fn finish(mut self) -> eyre::Result<(W, vecmatch_offsets::OffsetIndex)> {
        self.data.flush()?;
        Ok((self.data, vecmatch_offsets::OffsetIndex::from_offsets(self.offsets)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_queue_reads_back() {
        let mut writer = QueueWriter::new(Vec::new());
        writer.push_row(&[Candidate::new(4, 0.25)]).unwrap();
        writer.push_row(&[]).unwrap();
        writer
            .push_row(&[Candidate::new(1, 0.0), Candidate::new(9, 1.0)])
            .unwrap();
        assert_eq!(writer.row_count(), 3);

        let (data, index) = writer.finish().unwrap();
        assert_eq!(index.offsets(), &[0, 16, 16, 48]);

        let queue = crate::CandidateQueue::from_records(vecmatch_offsets::MappedRecords::from_parts(index, data));
        assert_eq!(queue.row(2).unwrap()[1], Candidate::new(9, 1.0));
        assert!(queue.row(1).unwrap().is_empty());
    }
}
