//! Object-store capability used by the embedding pipeline.
//!
//! The pipeline only ever needs a handful of operations: byte-range reads of
//! existing objects, whole-object writes for small artifacts, and segmented
//! multipart uploads for the embedding output. Two backends are provided:
//!
//! - [`LocalObjectStore`]: objects are files below a root directory, multipart
//!   parts are staged under `.multipart/<upload_id>/` until completion
//! - [`MemoryObjectStore`]: everything lives in a map, for tests and dry runs

use std::io::{Read as _, Seek as _, Write as _};

use eyre::WrapErr as _;

mod memory;

pub use memory::MemoryObjectStore;

const MULTIPART_DIR: &str = ".multipart";

/// A part of a multipart upload whose upload was acknowledged by the store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Byte-range reads and multipart writes against a single bucket.
pub trait ObjectStore {
    /// Size of an object in bytes.
    fn size(&self, key: &str) -> eyre::Result<u64>;

    /// Read the half-open byte range `range` of an object.
    ///
    /// Returns exactly `range.end - range.start` bytes or an error.
    fn get_range(&self, key: &str, range: std::ops::Range<u64>) -> eyre::Result<Vec<u8>>;

    /// Write a whole object, replacing any previous content.
    fn put(&self, key: &str, data: &[u8]) -> eyre::Result<()>;

    /// Start a multipart upload for `key`, returning its upload id.
    fn create_multipart(&self, key: &str) -> eyre::Result<String>;

    /// Upload one part. Returns the part's etag once the part is durable.
    fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> eyre::Result<String>;

    /// Assemble the listed parts, in order, into the final object.
    fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> eyre::Result<()>;
}

impl<S: ObjectStore + ?Sized> ObjectStore for &S {
    fn size(&self, key: &str) -> eyre::Result<u64> {
        (**self).size(key)
    }

    fn get_range(&self, key: &str, range: std::ops::Range<u64>) -> eyre::Result<Vec<u8>> {
        (**self).get_range(key, range)
    }

    fn put(&self, key: &str, data: &[u8]) -> eyre::Result<()> {
        (**self).put(key, data)
    }

    fn create_multipart(&self, key: &str) -> eyre::Result<String> {
        (**self).create_multipart(key)
    }

    fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> eyre::Result<String> {
        (**self).put_part(key, upload_id, part_number, data)
    }

    fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> eyre::Result<()> {
        (**self).complete_multipart(key, upload_id, parts)
    }
}

/// Etag of a part: hex blake3 hash of its content.
#[must_use]
pub fn etag_for(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Filesystem-backed object store rooted at a directory.
pub struct LocalObjectStore {
    root: std::path::PathBuf,
}

impl LocalObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<std::path::PathBuf>) -> eyre::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .wrap_err_with(|| format!("failed to create store root {}", root.display()))?;
        Ok(Self { root })
    }

    /// Root directory of this store.
    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Path of the file holding `key`.
    pub fn object_path(&self, key: &str) -> eyre::Result<std::path::PathBuf> {
        let relative = std::path::Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            eyre::bail!("invalid object key {key:?}");
        }
        Ok(self.root.join(relative))
    }

    fn upload_dir(&self, upload_id: &str) -> eyre::Result<std::path::PathBuf> {
        if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            eyre::bail!("invalid upload id {upload_id:?}");
        }
        Ok(self.root.join(MULTIPART_DIR).join(upload_id))
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> eyre::Result<std::path::PathBuf> {
        Ok(self.upload_dir(upload_id)?.join(format!("{part_number}.part")))
    }
}

fn tmp_path(path: &std::path::Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `data` to `path` via a temporary sibling so readers never see a torn file.
fn write_atomic(path: &std::path::Path, data: &[u8]) -> eyre::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create directory {}", parent.display()))?;
    }
    let tmp = tmp_path(path);
    {
        let mut file = std::fs::File::create(&tmp)
            .wrap_err_with(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(data)
            .wrap_err_with(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync {}", tmp.display()))?;
    }
    std::fs::rename(&tmp, path)
        .wrap_err_with(|| format!("failed to move {} into place", path.display()))
}

impl ObjectStore for LocalObjectStore {
    fn size(&self, key: &str) -> eyre::Result<u64> {
        let path = self.object_path(key)?;
        let metadata = std::fs::metadata(&path)
            .wrap_err_with(|| format!("failed to stat object {}", path.display()))?;
        Ok(metadata.len())
    }

    fn get_range(&self, key: &str, range: std::ops::Range<u64>) -> eyre::Result<Vec<u8>> {
        if range.end < range.start {
            eyre::bail!("invalid byte range {}..{} for {key}", range.start, range.end);
        }
        let path = self.object_path(key)?;
        let mut file = std::fs::File::open(&path)
            .wrap_err_with(|| format!("failed to open object {}", path.display()))?;
        file.seek(std::io::SeekFrom::Start(range.start))
            .wrap_err_with(|| format!("failed to seek to {} in {key}", range.start))?;

        let len = usize::try_from(range.end - range.start).wrap_err("range too large")?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).wrap_err_with(|| {
            format!("failed to read bytes {}..{} of {key}", range.start, range.end)
        })?;
        Ok(buf)
    }

    fn put(&self, key: &str, data: &[u8]) -> eyre::Result<()> {
        write_atomic(&self.object_path(key)?, data)
    }

    fn create_multipart(&self, key: &str) -> eyre::Result<String> {
        // validate the key up front so a bad key fails before any part is uploaded
        self.object_path(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id)?;
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create upload directory {}", dir.display()))?;
        tracing::debug!(key, upload_id, "created multipart upload");
        Ok(upload_id)
    }

    fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> eyre::Result<String> {
        let dir = self.upload_dir(upload_id)?;
        if !dir.is_dir() {
            eyre::bail!("no such multipart upload {upload_id} for {key}");
        }
        write_atomic(&self.part_path(upload_id, part_number)?, data)?;
        let etag = etag_for(data);
        tracing::debug!(key, upload_id, part_number, bytes = data.len(), "uploaded part");
        Ok(etag)
    }

    fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> eyre::Result<()> {
        if parts.is_empty() {
            eyre::bail!("cannot complete upload {upload_id} for {key} without parts");
        }

        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create directory {}", parent.display()))?;
        }
        let tmp = tmp_path(&target);
        let mut out = std::io::BufWriter::new(
            std::fs::File::create(&tmp)
                .wrap_err_with(|| format!("failed to create {}", tmp.display()))?,
        );

        let mut previous = 0;
        for part in parts {
            if part.part_number <= previous {
                eyre::bail!(
                    "parts must be in ascending order: {} after {previous}",
                    part.part_number
                );
            }
            previous = part.part_number;

            let path = self.part_path(upload_id, part.part_number)?;
            let data = std::fs::read(&path)
                .wrap_err_with(|| format!("failed to read part {}", path.display()))?;
            let etag = etag_for(&data);
            if etag != part.etag {
                eyre::bail!(
                    "etag mismatch for part {} of {key}: expected {}, stored {etag}",
                    part.part_number,
                    part.etag
                );
            }
            out.write_all(&data).wrap_err("failed to write assembled object")?;
        }

        let file = out
            .into_inner()
            .map_err(|e| eyre::eyre!("failed to flush assembled object: {e}"))?;
        file.sync_all().wrap_err("failed to sync assembled object")?;
        drop(file);

        std::fs::rename(&tmp, &target)
            .wrap_err_with(|| format!("failed to move {} into place", target.display()))?;
        let dir = self.upload_dir(upload_id)?;
        std::fs::remove_dir_all(&dir)
            .wrap_err_with(|| format!("failed to remove upload directory {}", dir.display()))?;

        tracing::info!(key, upload_id, parts = parts.len(), "completed multipart upload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::open(tmp.path()).unwrap();
        store.put("dir/obj", b"hello world").unwrap();

        assert_eq!(store.size("dir/obj").unwrap(), 11);
        assert_eq!(store.get_range("dir/obj", 6..11).unwrap(), b"world");
        assert!(store.get_range("dir/obj", 6..12).is_err());
        assert!(store.get_range("dir/obj", 3..3).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::open(tmp.path()).unwrap();
        assert!(store.put("../outside", b"x").is_err());
        assert!(store.put("a/../../b", b"x").is_err());
    }

    #[test]
    fn test_multipart_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::open(tmp.path()).unwrap();

        let upload_id = store.create_multipart("out/0.vecs").unwrap();
        let etag1 = store.put_part("out/0.vecs", &upload_id, 1, b"abc").unwrap();
        let etag2 = store.put_part("out/0.vecs", &upload_id, 2, b"def").unwrap();

        assert_eq!(etag2, etag_for(b"def"));

        // re-uploading a part replaces it
        let etag2 = store.put_part("out/0.vecs", &upload_id, 2, b"DEF").unwrap();

        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: etag1,
            },
            CompletedPart {
                part_number: 2,
                etag: etag2,
            },
        ];
        store.complete_multipart("out/0.vecs", &upload_id, &parts).unwrap();

        assert_eq!(std::fs::read(tmp.path().join("out/0.vecs")).unwrap(), b"abcDEF");
        assert!(!tmp.path().join(MULTIPART_DIR).join(&upload_id).exists());
    }

    #[test]
    fn test_complete_detects_stale_etag() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::open(tmp.path()).unwrap();

        let upload_id = store.create_multipart("obj").unwrap();
        let etag = store.put_part("obj", &upload_id, 1, b"first").unwrap();
        store.put_part("obj", &upload_id, 1, b"second").unwrap();

        let parts = vec![CompletedPart {
            part_number: 1,
            etag,
        }];
        assert!(store.complete_multipart("obj", &upload_id, &parts).is_err());
    }
}
