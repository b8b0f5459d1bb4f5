//! Line store and queue inspection.

use eyre::WrapErr as _;

const BLOCK_SIZE: usize = 1 << 20;

/// Scan `input` and write its offset index to `output`.
pub fn line_index(input: &std::path::Path, output: &std::path::Path) -> eyre::Result<()> {
    let mut file = std::fs::File::open(input)
        .wrap_err_with(|| format!("failed to open {}", input.display()))?;
    let index = build_line_index(&mut file)
        .wrap_err_with(|| format!("failed to scan {}", input.display()))?;
    std::fs::write(output, index.to_bytes())
        .wrap_err_with(|| format!("failed to write {}", output.display()))?;
    tracing::info!(lines = index.record_count(), output = %output.display(), "line index written");
    println!("{}", index.record_count());
    Ok(())
}

fn build_line_index(reader: &mut impl std::io::Read) -> eyre::Result<vecmatch_offsets::OffsetIndex> {
    let mut builder = vecmatch_offsets::LineIndexBuilder::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let read = match reader.read(&mut block) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        builder.feed(&block[..read]);
    }
    Ok(builder.finish())
}

/// Print record `line` of a line store, translating it through `map` first.
pub fn show_line(
    lines: &std::path::Path,
    index: &std::path::Path,
    line: u64,
    map: Option<&std::path::Path>,
) -> eyre::Result<()> {
    let records = vecmatch_offsets::MappedRecords::open(lines, index)?;
    let map = map.map(vecmatch_offsets::OffsetIndex::open).transpose()?;
    let record = lookup_line(&records, line, map.as_ref())?;
    println!("{}", String::from_utf8_lossy(record));
    Ok(())
}

fn lookup_line<'a>(
    records: &'a vecmatch_offsets::MappedRecords,
    line: u64,
    map: Option<&vecmatch_offsets::OffsetIndex>,
) -> eyre::Result<&'a [u8]> {
    let line = match map {
        Some(map) => usize::try_from(line)
            .ok()
            .and_then(|i| map.offsets().get(i).copied())
            .ok_or_else(|| eyre::eyre!("id {line} is not in the id map"))?,
        None => line,
    };
    Ok(records.record(line)?.trim_ascii())
}

/// Print the candidates of queue row `row`, one JSON object per line.
pub fn show_queue(prefix: &std::path::Path, row: u64) -> eyre::Result<()> {
    let queue = vecmatch_queue::CandidateQueue::open(prefix)?;
    for candidate in queue.row(row)? {
        println!(
            "{}",
            serde_json::json!({ "id": candidate.id, "distance": candidate.distance })
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streamed_index_matches_in_memory() {
        let data = b"{\"a\":1}\n{\"a\":2}\n{\"a\":3}";
        let index = build_line_index(&mut &data[..]).unwrap();
        assert_eq!(index, vecmatch_offsets::line_offsets(data));
        assert_eq!(index.record_count(), 3);
    }

    #[test]
    fn test_lookup_through_id_map() {
        let data = b"zero\none\ntwo\n".to_vec();
        let records =
            vecmatch_offsets::MappedRecords::from_parts(vecmatch_offsets::line_offsets(&data), data);
        let map = vecmatch_offsets::OffsetIndex::from_offsets(vec![2, 0]);

        assert_eq!(lookup_line(&records, 1, None).unwrap(), b"one");
        assert_eq!(lookup_line(&records, 0, Some(&map)).unwrap(), b"two");
        assert_eq!(lookup_line(&records, 1, Some(&map)).unwrap(), b"zero");
        assert!(lookup_line(&records, 2, Some(&map)).is_err());
    }
}
