//! Vector shard loading.
//!
//! Vectors are little-endian `f32` rows packed into files named `{n}.vecs`,
//! each holding `records_per_shard` rows. A global id maps to exactly one
//! shard and one byte offset within it.

use byteorder::ByteOrder as _;
use eyre::WrapErr as _;
use rayon::prelude::*;

mod cursor;

pub use cursor::ShardCursor;

const FLOAT_WIDTH: usize = std::mem::size_of::<f32>();

/// Where one vector lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLocation {
    pub shard: u64,
    pub offset: u64,
}

/// Geometry of a shard directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    records_per_shard: u64,
    dimension: usize,
}

impl ShardLayout {
    pub fn new(records_per_shard: u64, dimension: usize) -> eyre::Result<Self> {
        if records_per_shard == 0 {
            eyre::bail!("a shard must hold at least one vector");
        }
        if dimension == 0 {
            eyre::bail!("vector dimension must be non-zero");
        }
        Ok(Self {
            records_per_shard,
            dimension,
        })
    }

    /// Layout for shards of `capacity_bytes` bytes each.
    pub fn from_capacity(capacity_bytes: u64, dimension: usize) -> eyre::Result<Self> {
        let vector_bytes = (dimension * FLOAT_WIDTH) as u64;
        if vector_bytes == 0 {
            eyre::bail!("vector dimension must be non-zero");
        }
        if capacity_bytes % vector_bytes != 0 {
            tracing::warn!(
                capacity_bytes,
                vector_bytes,
                "shard capacity is not a whole number of vectors, rounding down"
            );
        }
        Self::new(capacity_bytes / vector_bytes, dimension)
    }

    #[must_use]
    pub fn records_per_shard(&self) -> u64 {
        self.records_per_shard
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn vector_bytes(&self) -> usize {
        self.dimension * FLOAT_WIDTH
    }

    #[must_use]
    pub fn locate(&self, id: vecmatch_core::VectorId) -> ShardLocation {
        ShardLocation {
            shard: id / self.records_per_shard,
            offset: (id % self.records_per_shard) * self.vector_bytes() as u64,
        }
    }
}

/// File name of shard `n`.
#[must_use]
pub fn shard_file_name(shard: u64) -> String {
    format!("{shard}.vecs")
}

/// Reads vectors for sorted, unique id lists out of a shard directory.
#[derive(Debug, Clone)]
pub struct VectorLoader {
    dir: std::path::PathBuf,
    layout: ShardLayout,
    parallel: bool,
}

impl VectorLoader {
    #[must_use]
    pub fn new(dir: impl Into<std::path::PathBuf>, layout: ShardLayout) -> Self {
        Self {
            dir: dir.into(),
            layout,
            parallel: true,
        }
    }

    /// Load each shard's share on its own thread (the default).
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    #[must_use]
    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    /// Load the vectors for `ids` into a dense `(ids.len(), dimension)` matrix,
    /// row k holding the vector of `ids[k]`.
    ///
    /// `ids` must be strictly increasing.
    pub fn load(&self, ids: &[vecmatch_core::VectorId]) -> eyre::Result<vecmatch_core::Embedding> {
        if let Some(pair) = ids.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(vecmatch_core::CorruptionError::UnsortedIds {
                previous: pair[0],
                next: pair[1],
            }
            .into());
        }

        let dimension = self.layout.dimension;
        let mut data = vec![0.0_f32; ids.len() * dimension];

        // Ids are sorted, so each shard's ids form one contiguous slice.
        let mut groups = Vec::new();
        let mut remaining_ids = ids;
        let mut remaining_out = data.as_mut_slice();
        while let Some(&first) = remaining_ids.first() {
            let shard = self.layout.locate(first).shard;
            let len = remaining_ids
                .iter()
                .take_while(|&&id| self.layout.locate(id).shard == shard)
                .count();
            let (group_ids, rest_ids) = remaining_ids.split_at(len);
            let (group_out, rest_out) = remaining_out.split_at_mut(len * dimension);
            groups.push((group_ids, group_out));
            remaining_ids = rest_ids;
            remaining_out = rest_out;
        }

        tracing::debug!(vectors = ids.len(), shards = groups.len(), "loading vectors");

        if self.parallel {
            groups.into_par_iter().try_for_each(|(group_ids, out)| {
                let mut cursor = ShardCursor::new(&self.dir);
                self.read_group(&mut cursor, group_ids, out)
            })?;
        } else {
            let mut cursor = ShardCursor::new(&self.dir);
            for (group_ids, out) in groups {
                self.read_group(&mut cursor, group_ids, out)?;
            }
        }

        vecmatch_core::Embedding::from_shape_vec((ids.len(), dimension), data)
            .wrap_err("loaded vectors do not form a matrix")
    }

    /// Read one shard's ids, coalescing runs of consecutive ids into single reads.
    fn read_group(
        &self,
        cursor: &mut ShardCursor,
        ids: &[vecmatch_core::VectorId],
        out: &mut [f32],
    ) -> eyre::Result<()> {
        let dimension = self.layout.dimension;
        let vector_bytes = self.layout.vector_bytes();
        let mut buf = Vec::new();
        let mut start = 0;
        while start < ids.len() {
            let run = 1 + ids[start..]
                .windows(2)
                .take_while(|pair| pair[1] == pair[0] + 1)
                .count();
            let location = self.layout.locate(ids[start]);
            buf.resize(run * vector_bytes, 0);
            cursor.read_at(location, &mut buf).wrap_err_with(|| {
                format!(
                    "failed to read vectors {}..={} from shard {}",
                    ids[start],
                    ids[start + run - 1],
                    location.shard
                )
            })?;
            byteorder::LittleEndian::read_f32_into(
                &buf,
                &mut out[start * dimension..(start + run) * dimension],
            );
            start += run;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Vector `id` is `[id, id + 0.5, ...]` so every row is recognisable.
    fn expected(id: u64, dimension: usize) -> Vec<f32> {
        (0..dimension).map(|j| id as f32 + j as f32 * 0.5).collect()
    }

    fn write_shards(dir: &std::path::Path, layout: ShardLayout, count: u64) {
        for id in 0..count {
            let location = layout.locate(id);
            let path = dir.join(shard_file_name(location.shard));
            let mut bytes = std::fs::read(&path).unwrap_or_default();
            assert_eq!(bytes.len() as u64, location.offset);
            for value in expected(id, layout.dimension()) {
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            std::fs::write(&path, bytes).unwrap();
        }
    }

    #[test]
    fn test_locate_uses_in_shard_index() {
        let layout = ShardLayout::new(100, 4).unwrap();
        assert_eq!(layout.locate(0), ShardLocation { shard: 0, offset: 0 });
        assert_eq!(layout.locate(99), ShardLocation { shard: 0, offset: 99 * 16 });
        assert_eq!(layout.locate(250), ShardLocation { shard: 2, offset: 50 * 16 });
    }

    #[test]
    fn test_layout_from_capacity() {
        let layout = ShardLayout::from_capacity(4096 * 10, 1024).unwrap();
        assert_eq!(layout.records_per_shard(), 10);
        assert!(ShardLayout::from_capacity(100, 1024).is_err());
    }

    #[test]
    fn test_load_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShardLayout::new(3, 2).unwrap();
        write_shards(dir.path(), layout, 10);

        let ids = [0, 1, 2, 4, 8, 9];
        for parallel in [true, false] {
            let loader = VectorLoader::new(dir.path(), layout).with_parallel(parallel);
            let matrix = loader.load(&ids).unwrap();
            assert_eq!(matrix.dim(), (ids.len(), 2));
            for (row, &id) in ids.iter().enumerate() {
                assert_eq!(matrix.row(row).to_vec(), expected(id, 2), "id {id}");
            }
        }
    }

    #[test]
    fn test_rejects_unsorted_or_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShardLayout::new(3, 2).unwrap();
        write_shards(dir.path(), layout, 4);
        let loader = VectorLoader::new(dir.path(), layout);

        for ids in [[2_u64, 1], [1, 1]] {
            let err = loader.load(&ids).unwrap_err();
            assert!(err.downcast_ref::<vecmatch_core::CorruptionError>().is_some());
        }
    }

    #[test]
    fn test_missing_vector_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShardLayout::new(3, 2).unwrap();
        write_shards(dir.path(), layout, 4);
        let loader = VectorLoader::new(dir.path(), layout);
        assert!(loader.load(&[3, 4]).is_err());
        assert!(loader.load(&[7]).is_err());
    }

    #[test]
    fn test_empty_request() {
        let dir = tempfile::tempdir().unwrap();
        let loader = VectorLoader::new(dir.path(), ShardLayout::new(3, 2).unwrap());
        assert_eq!(loader.load(&[]).unwrap().dim(), (0, 2));
    }
}
