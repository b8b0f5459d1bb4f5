//! Re-ranking engine.
//!
//! Reads a candidate queue, loads the vectors of every row and its candidates
//! from the shard directory, recomputes exact cosine distances on the
//! accelerator and reports the candidates within the distance threshold.
//! Rows are processed in groups bounded by the number of candidate pairs so
//! that only one group's vectors are resident at a time.

use vecmatch_core::{Candidate, VectorId};
use vecmatch_queue::{CandidateQueue, QueueRow};

pub mod report;

pub use report::{
    BinaryReport, CsvReport, ExternalId, ExternalIdLookup, RankedRow, ReportSink, SummaryOnly,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankConfig {
    /// Candidates with a distance above this are dropped; equal is kept.
    pub threshold: f32,
    /// Soft cap on candidate pairs evaluated per group.
    pub batch_pairs: usize,
    /// Vector id of queue row 0.
    pub row_base: VectorId,
    /// Read shards concurrently.
    pub parallel_loads: bool,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            threshold: f32::INFINITY,
            batch_pairs: 16384,
            row_base: 0,
            parallel_loads: true,
        }
    }
}

/// Counters of one re-ranking run.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RerankSummary {
    pub rows_scanned: u64,
    pub rows_with_candidates: u64,
    pub candidates_considered: u64,
    pub candidates_kept: u64,
    pub vectors_loaded: u64,
    pub groups: u64,
}

pub struct RerankEngine<'a> {
    queue: &'a CandidateQueue,
    loader: vecmatch_shard::VectorLoader,
    accelerator: vecmatch_similarity::Accelerator,
    config: RerankConfig,
}

impl<'a> RerankEngine<'a> {
    pub fn new(
        queue: &'a CandidateQueue,
        loader: vecmatch_shard::VectorLoader,
        accelerator: vecmatch_similarity::Accelerator,
        config: RerankConfig,
    ) -> eyre::Result<Self> {
        if config.batch_pairs == 0 {
            eyre::bail!("batch size must be at least one pair");
        }
        if config.threshold.is_nan() {
            eyre::bail!("distance threshold must be a number");
        }
        Ok(Self {
            queue,
            loader: loader.with_parallel(config.parallel_loads),
            accelerator,
            config,
        })
    }

    /// Vector id of queue row `row`.
    #[must_use]
    pub fn row_id(&self, row: u64) -> VectorId {
        self.config.row_base + row
    }

    /// Re-rank every row of the queue into `sink`.
    pub fn run<R: ReportSink + ?Sized>(&self, sink: &mut R) -> eyre::Result<RerankSummary> {
        let row_count = self.queue.row_count();
        let mut summary = RerankSummary {
            rows_scanned: row_count,
            ..RerankSummary::default()
        };

        let mut group = Vec::new();
        let mut pairs = 0;
        for row in self.queue.rows(0, row_count) {
            let row = row?;
            pairs += row.candidates.len();
            group.push(row);
            if pairs >= self.config.batch_pairs {
                self.process_group(&group, sink, &mut summary)?;
                group.clear();
                pairs = 0;
            }
        }
        if !group.is_empty() {
            self.process_group(&group, sink, &mut summary)?;
        }
        sink.finish(row_count)?;

        tracing::info!(?summary, "re-ranking finished");
        Ok(summary)
    }

    fn process_group<R: ReportSink + ?Sized>(
        &self,
        group: &[QueueRow],
        sink: &mut R,
        summary: &mut RerankSummary,
    ) -> eyre::Result<()> {
        // One load per distinct id, however often it recurs in the group.
        let mut ids: Vec<VectorId> = group
            .iter()
            .flat_map(|row| {
                std::iter::once(self.row_id(row.row)).chain(row.candidates.iter().map(|c| c.id))
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        if u32::try_from(ids.len()).is_err() {
            eyre::bail!("group needs {} vectors, more than can be indexed", ids.len());
        }
        let local = |id: VectorId| -> eyre::Result<u32> {
            let index = ids
                .binary_search(&id)
                .map_err(|_| eyre::eyre!("vector {id} missing from the group's id set"))?;
            Ok(index as u32)
        };

        let mut left = Vec::new();
        let mut right = Vec::new();
        for row in group {
            let own = local(self.row_id(row.row))?;
            for candidate in &row.candidates {
                left.push(own);
                right.push(local(candidate.id)?);
            }
        }

        tracing::debug!(
            rows = group.len(),
            vectors = ids.len(),
            pairs = left.len(),
            "evaluating group"
        );
        let vectors = self.loader.load(&ids)?;
        let matrix = self.accelerator.upload(vectors.view())?;
        let distances = matrix.pairwise_distances(&left, &right)?;

        let mut offset = 0;
        let mut kept = Vec::new();
        for row in group {
            let row_distances = &distances[offset..offset + row.candidates.len()];
            offset += row.candidates.len();

            kept.clear();
            kept.extend(
                row.candidates
                    .iter()
                    .zip(row_distances)
                    .filter(|(_, distance)| **distance <= self.config.threshold)
                    .map(|(candidate, &distance)| Candidate::new(candidate.id, distance)),
            );
            sink.write_row(&RankedRow {
                queue_row: row.row,
                id: self.row_id(row.row),
                candidates: &kept,
            })?;

            summary.rows_with_candidates += 1;
            summary.candidates_considered += row.candidates.len() as u64;
            summary.candidates_kept += kept.len() as u64;
        }
        summary.vectors_loaded += ids.len() as u64;
        summary.groups += 1;
        Ok(())
    }
}
