use eyre::WrapErr as _;

use crate::ShardLocation;

/// An open handle on one shard, reopened only when a read targets another.
#[derive(Debug)]
pub struct ShardCursor {
    dir: std::path::PathBuf,
    current: Option<(u64, std::fs::File)>,
    opened: usize,
}

impl ShardCursor {
    #[must_use]
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: None,
            opened: 0,
        }
    }

    /// Number of shard files opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.opened
    }

    #[must_use]
    pub fn current_shard(&self) -> Option<u64> {
        self.current.as_ref().map(|(shard, _)| *shard)
    }

    fn file_for(&mut self, shard: u64) -> eyre::Result<&mut std::fs::File> {
        if self.current_shard() != Some(shard) {
            let path = self.dir.join(crate::shard_file_name(shard));
            let file = std::fs::File::open(&path)
                .wrap_err_with(|| format!("failed to open shard {}", path.display()))?;
            tracing::trace!(shard, "opened shard");
            self.opened += 1;
            self.current = Some((shard, file));
        }
        match self.current.as_mut() {
            Some((_, file)) => Ok(file),
            None => eyre::bail!("shard {shard} is not open"),
        }
    }

    /// Fill `buf` from the shard and offset given by `location`.
    pub fn read_at(&mut self, location: ShardLocation, buf: &mut [u8]) -> eyre::Result<()> {
        use std::io::{Read as _, Seek as _};

        let file = self.file_for(location.shard)?;
        file.seek(std::io::SeekFrom::Start(location.offset))?;
        file.read_exact(buf).wrap_err_with(|| {
            format!(
                "shard {} is too short for {} bytes at offset {}",
                location.shard,
                buf.len(),
                location.offset
            )
        })
    }
}
