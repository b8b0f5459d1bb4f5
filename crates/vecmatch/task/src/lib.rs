//! Task coordination for embedding workers.
//!
//! The coordination service hands out tasks, tracks their status and persists a
//! progress blob for each running task. The pipeline only talks to it through
//! [`TaskHandle`]; a directory-backed implementation lives in [`local`].

pub mod local;

pub use local::{FileTask, TaskQueue};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Resuming,
    Running,
    Paused,
    Canceled,
    Complete,
    Error,
}

impl TaskStatus {
    /// Whether the task will never run again without operator action.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Canceled)
    }

    /// Whether a worker may claim a task in this state.
    #[must_use]
    pub fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Resuming)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Resuming => "resuming",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Parameters of one embedding task, fixed when the task is created.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EmbedTaskInit {
    pub bucket_name: String,
    pub strings_key: String,
    pub newline_index: String,
    pub output_key: String,
    pub start_line: u64,
    pub end_line: u64,
    pub template: String,
}

impl EmbedTaskInit {
    #[must_use]
    pub fn line_range(&self) -> vecmatch_chunk::LineRange {
        vecmatch_chunk::LineRange {
            start_line: self.start_line,
            end_line: self.end_line,
        }
    }
}

/// Checkpoint of an embedding task.
///
/// `count` is the number of lines of the assigned range whose embeddings are in
/// durably uploaded parts; `parts` lists those parts in upload order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EmbedProgress {
    pub count: u64,
    pub upload_id: String,
    pub parts: Vec<vecmatch_store::CompletedPart>,
}

impl EmbedProgress {
    #[must_use]
    pub fn new(upload_id: String) -> Self {
        Self {
            count: 0,
            upload_id,
            parts: Vec::new(),
        }
    }

    /// Part number the next upload must use.
    #[must_use]
    pub fn next_part_number(&self) -> u32 {
        self.parts.last().map_or(1, |part| part.part_number + 1)
    }
}

/// The call surface of the coordination service for a single claimed task.
///
/// Exactly one worker owns a claimed task at a time; that exclusion is the
/// coordinator's job.
pub trait TaskHandle {
    /// Identity of the task.
    fn id(&self) -> &str;

    /// Status as last observed.
    fn status(&self) -> TaskStatus;

    /// Task parameters.
    fn init(&self) -> eyre::Result<EmbedTaskInit>;

    /// Transition `pending -> running`.
    fn start(&mut self) -> eyre::Result<()>;

    /// Transition `resuming -> running`.
    fn resume(&mut self) -> eyre::Result<()>;

    /// Last committed checkpoint, if any.
    fn current_progress(&self) -> eyre::Result<Option<EmbedProgress>>;

    /// Persist a new checkpoint.
    fn commit_progress(&mut self, progress: &EmbedProgress) -> eyre::Result<()>;

    /// Signal liveness.
    ///
    /// Fails with [`vecmatch_core::Interrupted`] when the coordinator wants the
    /// task to stop.
    fn heartbeat(&mut self) -> eyre::Result<()>;

    /// Mark the task done with the final embedded line count.
    fn complete(&mut self, count: u64) -> eyre::Result<()>;

    /// Mark the task failed with a diagnostic.
    fn fail(&mut self, diagnostic: &str) -> eyre::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Resuming).unwrap();
        assert_eq!(json, "\"resuming\"");
        let status: TaskStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(status, TaskStatus::Error);
        assert_eq!(TaskStatus::Complete.to_string(), "complete");
    }

    #[test]
    fn test_progress_blob_format() {
        let progress = EmbedProgress {
            count: 200,
            upload_id: "u1".to_string(),
            parts: vec![vecmatch_store::CompletedPart {
                part_number: 1,
                etag: "abc".to_string(),
            }],
        };
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "count": 200,
                "upload_id": "u1",
                "parts": [{"part_number": 1, "etag": "abc"}]
            })
        );
        assert_eq!(progress.next_part_number(), 2);
        assert_eq!(EmbedProgress::new("u2".to_string()).next_part_number(), 1);
    }
}
