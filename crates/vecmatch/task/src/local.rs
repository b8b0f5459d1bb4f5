//! Directory-backed coordinator.
//!
//! Each task is a JSON document `<id>.json`. A worker owns a task while it
//! holds `<id>.claim`, created exclusively. Operators stop a running task by
//! writing `paused` or `canceled` into `<id>.interrupt`; the owner notices on
//! its next heartbeat.

use eyre::WrapErr as _;

use crate::{EmbedProgress, EmbedTaskInit, TaskHandle, TaskStatus};

const TASK_EXTENSION: &str = "json";
const CLAIM_EXTENSION: &str = "claim";
const INTERRUPT_EXTENSION: &str = "interrupt";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct TaskRecord {
    status: TaskStatus,
    init: serde_json::Value,
    #[serde(default)]
    progress: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    heartbeat_at: Option<u64>,
    #[serde(default)]
    owner: Option<String>,
}

impl TaskRecord {
    fn read(path: &std::path::Path) -> eyre::Result<Self> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read task {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .wrap_err_with(|| format!("malformed task document {}", path.display()))
    }

    fn write(&self, path: &std::path::Path) -> eyre::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);
        std::fs::write(&tmp, &bytes)
            .wrap_err_with(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .wrap_err_with(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

fn remove_if_present(path: &std::path::Path) -> eyre::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).wrap_err_with(|| format!("failed to remove {}", path.display())),
    }
}

/// A directory of task documents shared by workers and operators.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    dir: std::path::PathBuf,
    identity: String,
}

impl TaskQueue {
    pub fn open(dir: impl Into<std::path::PathBuf>, identity: impl Into<String>) -> eyre::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create task directory {}", dir.display()))?;
        Ok(Self {
            dir,
            identity: identity.into(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn path_for(&self, id: &str, extension: &str) -> std::path::PathBuf {
        self.dir.join(format!("{id}.{extension}"))
    }

    /// Register a new pending task. Fails if `id` already exists.
    pub fn create(&self, id: &str, init: &EmbedTaskInit) -> eyre::Result<()> {
        let path = self.path_for(id, TASK_EXTENSION);
        let record = TaskRecord {
            status: TaskStatus::Pending,
            init: serde_json::to_value(init)?,
            progress: None,
            result: None,
            error: None,
            heartbeat_at: None,
            owner: None,
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create task {}", path.display()))?;
        std::io::Write::write_all(&mut file, &bytes)?;
        Ok(())
    }

    /// Ids of all tasks, sorted.
    pub fn task_ids(&self) -> eyre::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)
            .wrap_err_with(|| format!("failed to list {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(std::ffi::OsStr::to_str) != Some(TASK_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(std::ffi::OsStr::to_str) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Current status of a task.
    pub fn status_of(&self, id: &str) -> eyre::Result<TaskStatus> {
        Ok(TaskRecord::read(&self.path_for(id, TASK_EXTENSION))?.status)
    }

    /// Claim the next pending or resuming task, if any.
    pub fn next_task(&self) -> eyre::Result<Option<FileTask>> {
        for id in self.task_ids()? {
            let path = self.path_for(&id, TASK_EXTENSION);
            if !TaskRecord::read(&path)?.status.is_claimable() {
                continue;
            }

            let claim = self.path_for(&id, CLAIM_EXTENSION);
            let created = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&claim);
            let mut file = match created {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    tracing::debug!(task = %id, "task already claimed");
                    continue;
                }
                Err(err) => {
                    return Err(err).wrap_err_with(|| format!("failed to claim {}", claim.display()));
                }
            };
            std::io::Write::write_all(&mut file, self.identity.as_bytes())?;

            // The status may have moved between the scan and the claim.
            let mut record = TaskRecord::read(&path)?;
            if !record.status.is_claimable() {
                remove_if_present(&claim)?;
                continue;
            }
            record.owner = Some(self.identity.clone());
            record.write(&path)?;

            tracing::info!(task = %id, status = %record.status, "claimed task");
            let interrupt = self.path_for(&id, INTERRUPT_EXTENSION);
            return Ok(Some(FileTask {
                id,
                path,
                claim,
                interrupt,
                record,
            }));
        }
        Ok(None)
    }

    /// Move a failed or paused task back to `resuming` so a worker picks it up
    /// again from its last checkpoint. Returns the status it had before.
    pub fn mark_resuming(&self, id: &str) -> eyre::Result<TaskStatus> {
        let path = self.path_for(id, TASK_EXTENSION);
        let mut record = TaskRecord::read(&path)?;
        let previous = record.status;
        match previous {
            TaskStatus::Error | TaskStatus::Paused => {
                record.status = TaskStatus::Resuming;
                record.error = None;
                record.owner = None;
                record.write(&path)?;
                remove_if_present(&self.path_for(id, CLAIM_EXTENSION))?;
                remove_if_present(&self.path_for(id, INTERRUPT_EXTENSION))?;
                tracing::info!(task = %id, from = %previous, "task marked for resumption");
            }
            _ => eyre::bail!("task {id} is {previous}, only error or paused tasks can be resumed"),
        }
        Ok(previous)
    }

    /// Ask the owner of a running task to stop.
    pub fn interrupt(&self, id: &str, status: TaskStatus) -> eyre::Result<()> {
        if !matches!(status, TaskStatus::Paused | TaskStatus::Canceled) {
            eyre::bail!("a task can only be interrupted into paused or canceled, not {status}");
        }
        let path = self.path_for(id, INTERRUPT_EXTENSION);
        std::fs::write(&path, status.to_string())
            .wrap_err_with(|| format!("failed to write {}", path.display()))
    }

    /// Return running tasks whose owner stopped heartbeating to `resuming`.
    pub fn requeue_orphans(&self, max_silence: std::time::Duration) -> eyre::Result<Vec<String>> {
        let now = unix_now();
        let mut requeued = Vec::new();
        for id in self.task_ids()? {
            let path = self.path_for(&id, TASK_EXTENSION);
            let mut record = TaskRecord::read(&path)?;
            if record.status != TaskStatus::Running {
                continue;
            }
            let silent_for = now.saturating_sub(record.heartbeat_at.unwrap_or(0));
            if silent_for <= max_silence.as_secs() {
                continue;
            }
            tracing::warn!(task = %id, owner = ?record.owner, silent_for, "requeueing orphaned task");
            record.status = TaskStatus::Resuming;
            record.owner = None;
            record.write(&path)?;
            remove_if_present(&self.path_for(&id, CLAIM_EXTENSION))?;
            requeued.push(id);
        }
        Ok(requeued)
    }
}

/// A task claimed from a [`TaskQueue`].
#[derive(Debug)]
pub struct FileTask {
    id: String,
    path: std::path::PathBuf,
    claim: std::path::PathBuf,
    interrupt: std::path::PathBuf,
    record: TaskRecord,
}

impl FileTask {
    fn save(&self) -> eyre::Result<()> {
        self.record.write(&self.path)
    }

    fn release(&mut self) -> eyre::Result<()> {
        self.record.owner = None;
        remove_if_present(&self.claim)
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) -> eyre::Result<()> {
        if self.record.status != from {
            eyre::bail!(
                "task {} is {}, expected {from} before moving to {to}",
                self.id,
                self.record.status
            );
        }
        self.record.status = to;
        self.record.heartbeat_at = Some(unix_now());
        self.save()
    }

    /// Interrupt requested by an operator, if any.
    fn pending_interrupt(&self) -> eyre::Result<Option<TaskStatus>> {
        let contents = match std::fs::read_to_string(&self.interrupt) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("failed to read {}", self.interrupt.display()));
            }
        };
        let status = match contents.trim() {
            "canceled" => TaskStatus::Canceled,
            // Anything else stops the task without losing it.
            _ => TaskStatus::Paused,
        };
        Ok(Some(status))
    }
}

impl TaskHandle for FileTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> TaskStatus {
        self.record.status
    }

    fn init(&self) -> eyre::Result<EmbedTaskInit> {
        serde_json::from_value(self.record.init.clone())
            .wrap_err_with(|| format!("task {} has malformed init parameters", self.id))
    }

    fn start(&mut self) -> eyre::Result<()> {
        self.transition(TaskStatus::Pending, TaskStatus::Running)
    }

    fn resume(&mut self) -> eyre::Result<()> {
        self.transition(TaskStatus::Resuming, TaskStatus::Running)
    }

    fn current_progress(&self) -> eyre::Result<Option<EmbedProgress>> {
        self.record
            .progress
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .wrap_err_with(|| format!("task {} has a malformed progress blob", self.id))
    }

    fn commit_progress(&mut self, progress: &EmbedProgress) -> eyre::Result<()> {
        self.record.progress = Some(serde_json::to_value(progress)?);
        self.record.heartbeat_at = Some(unix_now());
        self.save()?;
        tracing::debug!(task = %self.id, count = progress.count, parts = progress.parts.len(), "progress committed");
        Ok(())
    }

    fn heartbeat(&mut self) -> eyre::Result<()> {
        if let Some(status) = self.pending_interrupt()? {
            self.record.status = status;
            self.release()?;
            self.save()?;
            remove_if_present(&self.interrupt)?;
            tracing::info!(task = %self.id, %status, "task interrupted");
            return Err(vecmatch_core::Interrupted {
                reason: format!("task {} was {status}", self.id),
            }
            .into());
        }
        self.record.heartbeat_at = Some(unix_now());
        self.save()
    }

    fn complete(&mut self, count: u64) -> eyre::Result<()> {
        self.record.status = TaskStatus::Complete;
        self.record.result = Some(serde_json::json!({ "count": count }));
        self.release()?;
        self.save()
    }

    fn fail(&mut self, diagnostic: &str) -> eyre::Result<()> {
        self.record.status = TaskStatus::Error;
        self.record.error = Some(diagnostic.to_string());
        self.release()?;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_init() -> EmbedTaskInit {
        EmbedTaskInit {
            bucket_name: "bucket".to_string(),
            strings_key: "lines.json".to_string(),
            newline_index: "lines.index".to_string(),
            output_key: "out/0.vecs".to_string(),
            start_line: 0,
            end_line: 9,
            template: "{{name}}".to_string(),
        }
    }

    #[test]
    fn test_claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = TaskQueue::open(dir.path(), "worker-a").unwrap();
        let second = TaskQueue::open(dir.path(), "worker-b").unwrap();
        first.create("t0", &sample_init()).unwrap();

        let task = first.next_task().unwrap().unwrap();
        assert_eq!(task.id(), "t0");
        assert_eq!(task.init().unwrap(), sample_init());
        assert!(second.next_task().unwrap().is_none());
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TaskQueue::open(dir.path(), "w").unwrap();
        queue.create("t0", &sample_init()).unwrap();
        assert!(queue.create("t0", &sample_init()).is_err());
    }

    #[test]
    fn test_lifecycle_and_progress() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TaskQueue::open(dir.path(), "w").unwrap();
        queue.create("t0", &sample_init()).unwrap();

        let mut task = queue.next_task().unwrap().unwrap();
        assert!(task.resume().is_err());
        task.start().unwrap();
        assert_eq!(queue.status_of("t0").unwrap(), TaskStatus::Running);
        assert!(task.current_progress().unwrap().is_none());

        let progress = EmbedProgress {
            count: 5,
            upload_id: "u".to_string(),
            parts: Vec::new(),
        };
        task.commit_progress(&progress).unwrap();
        task.heartbeat().unwrap();
        assert_eq!(task.current_progress().unwrap(), Some(progress));

        task.complete(10).unwrap();
        assert_eq!(queue.status_of("t0").unwrap(), TaskStatus::Complete);
        assert!(queue.next_task().unwrap().is_none());
    }

    #[test]
    fn test_interrupt_surfaces_on_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TaskQueue::open(dir.path(), "w").unwrap();
        queue.create("t0", &sample_init()).unwrap();
        let mut task = queue.next_task().unwrap().unwrap();
        task.start().unwrap();

        queue.interrupt("t0", TaskStatus::Paused).unwrap();
        let err = task.heartbeat().unwrap_err();
        assert!(vecmatch_core::is_interrupted(&err));
        assert_eq!(queue.status_of("t0").unwrap(), TaskStatus::Paused);

        assert_eq!(queue.mark_resuming("t0").unwrap(), TaskStatus::Paused);
        let mut task = queue.next_task().unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Resuming);
        task.resume().unwrap();
    }

    #[test]
    fn test_interrupt_reaches_only_its_task() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TaskQueue::open(dir.path(), "w").unwrap();
        queue.create("t0", &sample_init()).unwrap();
        queue.create("t1", &sample_init()).unwrap();

        let mut first = queue.next_task().unwrap().unwrap();
        let mut second = queue.next_task().unwrap().unwrap();
        assert_eq!((first.id(), second.id()), ("t0", "t1"));
        first.start().unwrap();
        second.start().unwrap();

        queue.interrupt("t1", TaskStatus::Canceled).unwrap();
        first.heartbeat().unwrap();
        assert!(vecmatch_core::is_interrupted(&second.heartbeat().unwrap_err()));
        assert_eq!(queue.status_of("t0").unwrap(), TaskStatus::Running);
        assert_eq!(queue.status_of("t1").unwrap(), TaskStatus::Canceled);
    }

    #[test]
    fn test_failed_task_resumes_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TaskQueue::open(dir.path(), "w").unwrap();
        queue.create("t0", &sample_init()).unwrap();
        let mut task = queue.next_task().unwrap().unwrap();
        task.start().unwrap();
        task.fail("boom").unwrap();

        assert!(queue.mark_resuming("t0").is_ok());
        let record = TaskRecord::read(&dir.path().join("t0.json")).unwrap();
        assert_eq!(record.status, TaskStatus::Resuming);
        assert!(record.error.is_none());
        assert!(queue.mark_resuming("t0").is_err());
    }

    #[test]
    fn test_requeue_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TaskQueue::open(dir.path(), "w").unwrap();
        queue.create("t0", &sample_init()).unwrap();
        let mut task = queue.next_task().unwrap().unwrap();
        task.start().unwrap();

        let fresh = queue.requeue_orphans(std::time::Duration::from_secs(3600)).unwrap();
        assert!(fresh.is_empty());

        // Backdate the heartbeat.
        let path = dir.path().join("t0.json");
        let mut record = TaskRecord::read(&path).unwrap();
        record.heartbeat_at = Some(1);
        record.write(&path).unwrap();

        let requeued = queue.requeue_orphans(std::time::Duration::from_secs(60)).unwrap();
        assert_eq!(requeued, vec!["t0".to_string()]);
        assert!(queue.next_task().unwrap().is_some());
    }
}
