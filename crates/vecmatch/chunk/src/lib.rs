//! Work planning for the embedding pipeline.
//!
//! Splits a line store into contiguous, inclusive line ranges, one per task,
//! and names the object each task writes its embeddings to.

/// An inclusive range of line numbers `start_line..=end_line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LineRange {
    pub start_line: u64,
    pub end_line: u64,
}

impl LineRange {
    /// Number of lines in the range.
    #[must_use]
    pub fn len(&self) -> u64 {
        (self.end_line + 1).saturating_sub(self.start_line)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split `line_count` lines into ranges of at most `lines_per_task` lines.
///
/// The last range absorbs the remainder and may be shorter.
#[must_use]
pub fn plan_line_ranges(line_count: u64, lines_per_task: u64) -> Vec<LineRange> {
    if line_count == 0 || lines_per_task == 0 {
        return Vec::new();
    }

    let task_count = line_count.div_ceil(lines_per_task);
    (0..task_count)
        .map(|task_index| {
            let start_line = task_index * lines_per_task;
            let end_line = ((task_index + 1) * lines_per_task - 1).min(line_count - 1);
            LineRange {
                start_line,
                end_line,
            }
        })
        .collect()
}

/// Object key a task writes its embeddings to.
#[must_use]
pub fn task_output_key(output_prefix: &str, task_index: usize) -> String {
    format!("{}/{task_index}.vecs", output_prefix.trim_end_matches('/'))
}

/// Parse a task output key back into prefix and task index.
#[must_use]
pub fn parse_task_output_key(key: &str) -> Option<(&str, usize)> {
    let (prefix, file) = key.rsplit_once('/')?;
    let index = file.strip_suffix(".vecs")?.parse().ok()?;
    Some((prefix, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_split() {
        let ranges = plan_line_ranges(10, 5);
        assert_eq!(
            ranges,
            vec![
                LineRange {
                    start_line: 0,
                    end_line: 4
                },
                LineRange {
                    start_line: 5,
                    end_line: 9
                },
            ]
        );
    }

    #[test]
    fn test_remainder_goes_to_last_task() {
        let ranges = plan_line_ranges(11, 5);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[2].start_line, 10);
        assert_eq!(ranges[2].end_line, 10);
        assert_eq!(ranges[2].len(), 1);

        // ranges tile the store
        let total: u64 = ranges.iter().map(LineRange::len).sum();
        assert_eq!(total, 11);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end_line + 1, pair[1].start_line);
        }
    }

    #[test]
    fn test_empty_store() {
        assert!(plan_line_ranges(0, 5).is_empty());
        assert!(plan_line_ranges(5, 0).is_empty());
    }

    #[test]
    fn test_output_key_roundtrip() {
        let key = task_output_key("vectors/run1/", 7);
        assert_eq!(key, "vectors/run1/7.vecs");

        let (prefix, index) = parse_task_output_key(&key).unwrap();
        assert_eq!(prefix, "vectors/run1");
        assert_eq!(index, 7);
        assert!(parse_task_output_key("vectors/run1/7.bin").is_none());
    }
}
