use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineBatch {
    pub lines: Vec<String>,
    /// Offset just past the last complete line returned.
    pub offset: i64,
}

/// Reads up to `max_lines` newline-terminated lines starting at `offset`.
///
/// A trailing line without `\n` is left unread so that a later call picks it
/// up once the writer finishes it.
pub fn read_lines_from_offset(path: &Path, offset: i64, max_lines: usize) -> Result<LineBatch> {
    let start = offset.max(0);
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(start as u64))
        .with_context(|| format!("failed to seek {}", path.display()))?;

    let mut reader = BufReader::new(file);
    let mut batch = LineBatch {
        lines: Vec::new(),
        offset: start,
    };

    while batch.lines.len() < max_lines {
        let mut buf = Vec::<u8>::new();
        let bytes_read = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("failed reading {}", path.display()))?;

        if bytes_read == 0 || buf.last() != Some(&b'\n') {
            break;
        }

        batch.offset += bytes_read as i64;
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        batch
            .lines
            .push(String::from_utf8_lossy(&buf).into_owned());
    }

    Ok(batch)
}
