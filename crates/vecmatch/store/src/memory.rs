//! In-memory object store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::{CompletedPart, ObjectStore, etag_for};

#[derive(Default)]
struct Inner {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, (String, BTreeMap<u32, Vec<u8>>)>,
    next_upload: u64,
}

/// Object store keeping all objects and pending uploads in memory.
#[derive(Default)]
pub struct MemoryObjectStore {
    inner: Mutex<Inner>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> eyre::Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| eyre::eyre!("memory store lock poisoned"))
    }

    /// Full content of an object, if present.
    pub fn object(&self, key: &str) -> eyre::Result<Option<Vec<u8>>> {
        Ok(self.lock()?.objects.get(key).cloned())
    }

    /// Number of multipart uploads that were started but not completed.
    pub fn pending_uploads(&self) -> eyre::Result<usize> {
        Ok(self.lock()?.uploads.len())
    }
}

impl ObjectStore for MemoryObjectStore {
    fn size(&self, key: &str) -> eyre::Result<u64> {
        let inner = self.lock()?;
        let data = inner
            .objects
            .get(key)
            .ok_or_else(|| eyre::eyre!("no such object {key}"))?;
        Ok(data.len() as u64)
    }

    fn get_range(&self, key: &str, range: std::ops::Range<u64>) -> eyre::Result<Vec<u8>> {
        let inner = self.lock()?;
        let data = inner
            .objects
            .get(key)
            .ok_or_else(|| eyre::eyre!("no such object {key}"))?;
        let start = usize::try_from(range.start)?;
        let end = usize::try_from(range.end)?;
        data.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
            eyre::eyre!(
                "byte range {start}..{end} out of bounds for {key} ({} bytes)",
                data.len()
            )
        })
    }

    fn put(&self, key: &str, data: &[u8]) -> eyre::Result<()> {
        self.lock()?.objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn create_multipart(&self, key: &str) -> eyre::Result<String> {
        let mut inner = self.lock()?;
        inner.next_upload += 1;
        let upload_id = format!("{:016x}", inner.next_upload);
        inner
            .uploads
            .insert(upload_id.clone(), (key.to_string(), BTreeMap::new()));
        Ok(upload_id)
    }

    fn put_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> eyre::Result<String> {
        let mut inner = self.lock()?;
        let (upload_key, parts) = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| eyre::eyre!("no such multipart upload {upload_id}"))?;
        if upload_key != key {
            eyre::bail!("upload {upload_id} belongs to {upload_key}, not {key}");
        }
        parts.insert(part_number, data.to_vec());
        Ok(etag_for(data))
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
        let mut inner = self.lock()?;
        let (upload_key, stored) = inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| eyre::eyre!("no such multipart upload {upload_id}"))?;
        if upload_key != key {
            eyre::bail!("upload {upload_id} belongs to {upload_key}, not {key}");
        }

        let mut assembled = Vec::new();
        for part in parts {
            let data = stored
                .get(&part.part_number)
                .ok_or_else(|| eyre::eyre!("part {} was never uploaded", part.part_number))?;
            if etag_for(data) != part.etag {
                eyre::bail!("etag mismatch for part {} of {key}", part.part_number);
            }
            assembled.extend_from_slice(data);
        }
        inner.objects.insert(key.to_string(), assembled);
        Ok(())
    }
}
