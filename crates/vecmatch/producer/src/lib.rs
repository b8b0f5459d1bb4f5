//! Checkpointed embedding producer.
//!
//! Embeds an inclusive line range of a line store and publishes the vectors as
//! one multipart object. Progress is committed to the task after every part
//! upload is acknowledged, so a resumed task continues at
//! `start_line + progress.count` and the assembled object is byte-identical to
//! that of an uninterrupted run.

use eyre::WrapErr as _;
use vecmatch_core::{CorruptionError, DecodeError, Embedder};
use vecmatch_store::{CompletedPart, ObjectStore};
use vecmatch_task::{EmbedProgress, EmbedTaskInit, TaskHandle, TaskStatus};

/// Tuning knobs of the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Lines per embedding backend call.
    pub chunk_size: usize,
    /// Buffered vector bytes that trigger a part upload. Must stay above the
    /// object store's minimum part size; the final part is exempt.
    pub segment_size: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            segment_size: 8 * 1024 * 1024,
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.chunk_size == 0 {
            eyre::bail!("chunk size must be at least 1");
        }
        if self.segment_size == 0 {
            eyre::bail!("segment size must be at least 1 byte");
        }
        Ok(())
    }
}

/// How a task ended up after [`EmbeddingProducer::process_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { count: u64 },
    Failed { diagnostic: String },
    /// The coordinator paused or canceled the task; it keeps its checkpoint.
    Interrupted,
    /// The task was in a status this worker does not run.
    Skipped { status: TaskStatus },
}

/// Drives embedding tasks through one backend.
pub struct EmbeddingProducer<E> {
    embedder: E,
    config: ProducerConfig,
}

impl<E: Embedder> EmbeddingProducer<E> {
    pub fn new(embedder: E, config: ProducerConfig) -> eyre::Result<Self> {
        config.validate()?;
        Ok(Self { embedder, config })
    }

    #[must_use]
    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    #[must_use]
    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    /// Start or resume a claimed task and run it to a terminal state.
    ///
    /// Failures inside the run mark the task `error` with the full diagnostic
    /// and are reported as [`TaskOutcome::Failed`]; only failures talking to
    /// the coordinator itself are returned as errors.
    pub fn process_task<S, T>(&mut self, store: &S, task: &mut T) -> eyre::Result<TaskOutcome>
    where
        S: ObjectStore + ?Sized,
        T: TaskHandle + ?Sized,
    {
        match task.status() {
            TaskStatus::Pending => {
                tracing::info!(task = task.id(), "starting task");
                task.start()?;
            }
            TaskStatus::Resuming => {
                tracing::info!(task = task.id(), "resuming task");
                task.resume()?;
            }
            status => {
                tracing::warn!(task = task.id(), %status, "cannot process task in this status");
                return Ok(TaskOutcome::Skipped { status });
            }
        }

        match self.embed_task(store, task) {
            Ok(count) => {
                task.complete(count)?;
                tracing::info!(task = task.id(), count, "task complete");
                Ok(TaskOutcome::Completed { count })
            }
            Err(err) if vecmatch_core::is_interrupted(&err) => {
                tracing::info!(task = task.id(), "task interrupted, leaving checkpoint in place");
                Ok(TaskOutcome::Interrupted)
            }
            Err(err) => {
                let diagnostic = format!("{err:?}");
                tracing::error!(task = task.id(), error = %err, "task failed");
                task.fail(&diagnostic)?;
                Ok(TaskOutcome::Failed { diagnostic })
            }
        }
    }

    /// Embed the task's remaining lines and complete its upload, returning the
    /// total number of embedded lines.
    pub fn embed_task<S, T>(&mut self, store: &S, task: &mut T) -> eyre::Result<u64>
    where
        S: ObjectStore + ?Sized,
        T: TaskHandle + ?Sized,
    {
        let init = task.init()?;
        let range = init.line_range();
        if range.is_empty() {
            eyre::bail!(
                "task line range {}..={} is empty",
                init.start_line,
                init.end_line
            );
        }
        let template = vecmatch_embed::RowTemplate::compile(&init.template)?;

        let mut progress = match task.current_progress()? {
            Some(progress) => progress,
            None => {
                let upload_id = store
                    .create_multipart(&init.output_key)
                    .wrap_err_with(|| format!("failed to start upload of {}", init.output_key))?;
                let progress = EmbedProgress::new(upload_id);
                task.commit_progress(&progress)?;
                progress
            }
        };

        let total = range.len();
        if progress.count > total {
            return Err(CorruptionError::Other(format!(
                "checkpoint count {} exceeds the {total} lines of the task",
                progress.count
            ))
            .into());
        }
        let remaining = total - progress.count;
        tracing::info!(
            task = task.id(),
            start_line = init.start_line,
            end_line = init.end_line,
            done = progress.count,
            remaining,
            "embedding line range"
        );

        let mut run = PartRun {
            part_number: progress.next_part_number(),
            part: Vec::new(),
            queued: 0,
        };

        if remaining > 0 {
            let reader = vecmatch_offsets::RecordReader::new(
                store,
                init.strings_key.as_str(),
                init.newline_index.as_str(),
            );
            let first_line = init.start_line + progress.count;
            let bytes = reader.records(first_line, init.end_line + 1)?;

            let mut lines = split_lines(&bytes);
            if first_line > 0 {
                // Records after the first begin with their predecessor's newline.
                if let Some(leading) = lines.next().filter(|segment| !segment.is_empty()) {
                    return Err(CorruptionError::Other(format!(
                        "record {first_line} does not start at a line boundary: {}",
                        String::from_utf8_lossy(leading)
                    ))
                    .into());
                }
            }

            let mut batch: Vec<String> = Vec::with_capacity(self.config.chunk_size);
            let mut seen = 0_u64;
            for line in lines {
                if line.is_empty() {
                    if first_line == 0 && seen == 0 {
                        // An empty record 0 is consumed without a vector.
                        tracing::warn!(task = task.id(), "record 0 is empty, skipping it");
                        seen += 1;
                        run.queued += 1;
                        continue;
                    }
                    return Err(CorruptionError::UnexpectedEmptyLine {
                        lines_seen: progress.count + seen,
                    }
                    .into());
                }

                seen += 1;
                if seen > remaining {
                    return Err(CorruptionError::LineCountMismatch {
                        expected: remaining,
                        found: seen,
                    }
                    .into());
                }

                let row: serde_json::Value =
                    serde_json::from_slice(line).map_err(|source| DecodeError {
                        content: String::from_utf8_lossy(line).into_owned(),
                        source,
                    })?;
                batch.push(template.render(&row)?);

                if batch.len() == self.config.chunk_size {
                    self.embed_into(task, &mut batch, &mut run)?;
                }
                if run.part.len() >= self.config.segment_size {
                    run.upload(store, task, &init, &mut progress)?;
                }
            }

            if !batch.is_empty() {
                self.embed_into(task, &mut batch, &mut run)?;
            }
            if seen != remaining {
                return Err(CorruptionError::LineCountMismatch {
                    expected: remaining,
                    found: seen,
                }
                .into());
            }
        }

        // The final part may be short; an object needs at least one part.
        if !run.part.is_empty() || progress.parts.is_empty() {
            run.upload(store, task, &init, &mut progress)?;
        }

        store
            .complete_multipart(&init.output_key, &progress.upload_id, &progress.parts)
            .wrap_err_with(|| format!("failed to complete upload of {}", init.output_key))?;
        Ok(progress.count)
    }

    fn embed_into<T: TaskHandle + ?Sized>(
        &mut self,
        task: &mut T,
        batch: &mut Vec<String>,
        run: &mut PartRun,
    ) -> eyre::Result<()> {
        task.heartbeat()?;
        let embedding = self
            .embedder
            .embed_batch(batch)
            .wrap_err_with(|| format!("embedding backend failed on a batch of {}", batch.len()))?;
        task.heartbeat()?;

        let expected = (batch.len(), self.embedder.dimension());
        if embedding.dim() != expected {
            eyre::bail!(
                "embedding backend returned shape {:?}, expected {expected:?}",
                embedding.dim()
            );
        }

        run.part.reserve(embedding.len() * std::mem::size_of::<f32>());
        for value in &embedding {
            run.part.extend_from_slice(&value.to_le_bytes());
        }
        run.queued += batch.len() as u64;
        batch.clear();
        Ok(())
    }
}

/// The part being assembled.
struct PartRun {
    part_number: u32,
    part: Vec<u8>,
    /// Lines accounted for by `part`.
    queued: u64,
}

impl PartRun {
    fn upload<S, T>(
        &mut self,
        store: &S,
        task: &mut T,
        init: &EmbedTaskInit,
        progress: &mut EmbedProgress,
    ) -> eyre::Result<()>
    where
        S: ObjectStore + ?Sized,
        T: TaskHandle + ?Sized,
    {
        let etag = store
            .put_part(&init.output_key, &progress.upload_id, self.part_number, &self.part)
            .wrap_err_with(|| {
                format!("failed to upload part {} of {}", self.part_number, init.output_key)
            })?;
        tracing::debug!(
            task = task.id(),
            part_number = self.part_number,
            bytes = self.part.len(),
            lines = self.queued,
            "uploaded part"
        );

        // Only now is the part durable; commit the checkpoint that covers it.
        progress.parts.push(CompletedPart {
            part_number: self.part_number,
            etag,
        });
        progress.count += self.queued;
        task.commit_progress(progress)?;

        self.part_number += 1;
        self.part.clear();
        self.queued = 0;
        Ok(())
    }
}

/// Split on `\n` the way a buffered line reader does: no trailing empty
/// segment after a final newline, and a trailing `\r` is not part of a line.
fn split_lines(bytes: &[u8]) -> impl Iterator<Item = &[u8]> {
    let body = if bytes.is_empty() {
        None
    } else {
        Some(bytes.strip_suffix(b"\n").unwrap_or(bytes))
    };
    body.into_iter()
        .flat_map(|body| body.split(|&b| b == b'\n'))
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}
