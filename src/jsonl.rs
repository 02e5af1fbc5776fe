//! JSONL reading for agent logs.
//!
//! Session files and the history log are append-only and are routinely read
//! while another process is still writing them, so every reader here is
//! tolerant: a line that fails to parse is reported and skipped, never fatal.
//!
//! Two access patterns:
//! - [`stream_jsonl`]: lazy, line-at-a-time pass over a whole file
//! - [`read_from_offset`] + [`LineAssembler`]: incremental tailing by byte offset

use crate::records::Record;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Result of reading one non-blank line.
#[derive(Debug)]
pub enum LineOutcome {
    Parsed(Value),
    Skipped {
        line_no: usize,
        error: serde_json::Error,
    },
}

/// Lazy iterator over the lines of a JSONL file.
///
/// Finite: ends at EOF (or on the first read error). Restart by calling
/// [`stream_jsonl`] again.
pub struct JsonlLines {
    reader: Option<BufReader<File>>,
    path: PathBuf,
    line_no: usize,
    buf: Vec<u8>,
}

impl Iterator for JsonlLines {
    type Item = LineOutcome;

    fn next(&mut self) -> Option<LineOutcome> {
        loop {
            let reader = self.reader.as_mut()?;
            self.buf.clear();
            match reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => {
                    self.reader = None;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Read error in {}: {}", self.path.display(), e);
                    self.reader = None;
                    return None;
                }
            }
            self.line_no += 1;

            let trimmed = self.buf.trim_ascii();
            if trimmed.is_empty() {
                continue;
            }

            return Some(match serde_json::from_slice(trimmed) {
                Ok(value) => LineOutcome::Parsed(value),
                Err(error) => LineOutcome::Skipped {
                    line_no: self.line_no,
                    error,
                },
            });
        }
    }
}

/// Stream a JSONL file line by line. A missing file is an empty stream.
pub fn stream_jsonl(path: &Path) -> JsonlLines {
    let reader = match File::open(path) {
        Ok(file) => Some(BufReader::new(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to open {}: {}", path.display(), e);
            None
        }
    };

    JsonlLines {
        reader,
        path: path.to_path_buf(),
        line_no: 0,
        buf: Vec::new(),
    }
}

/// Stream the records of a session file, dropping malformed lines.
pub fn records(path: &Path) -> impl Iterator<Item = Record> {
    let path_label = path.display().to_string();
    stream_jsonl(path).filter_map(move |outcome| match outcome {
        LineOutcome::Parsed(value) => Record::from_value(value),
        LineOutcome::Skipped { line_no, error } => {
            debug!("Skipping malformed line {} in {}: {}", line_no, path_label, error);
            None
        }
    })
}

/// Read an entire (small) JSONL file into memory.
pub fn read_jsonl(path: &Path) -> Vec<Value> {
    stream_jsonl(path)
        .filter_map(|outcome| match outcome {
            LineOutcome::Parsed(value) => Some(value),
            LineOutcome::Skipped { .. } => None,
        })
        .collect()
}

pub fn file_exists(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

/// Raw bytes appended to a file since a known offset.
#[derive(Debug, Default)]
pub struct TailChunk {
    pub bytes: Vec<u8>,
    /// Offset to pass on the next read
    pub end_offset: u64,
    /// The file was shorter than the requested offset and was re-read from 0
    pub reset: bool,
}

/// Read bytes `[offset, len)` of `path`, where `len` is the size observed
/// when the file is opened. Bytes appended during the read are left for the
/// next call.
pub fn read_from_offset(path: &Path, offset: u64) -> io::Result<TailChunk> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();

    // Truncated or replaced file: start over
    let (start, reset) = if offset > file_size {
        (0, true)
    } else {
        (offset, false)
    };

    if start == file_size {
        return Ok(TailChunk {
            bytes: Vec::new(),
            end_offset: file_size,
            reset,
        });
    }

    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::with_capacity((file_size - start) as usize);
    file.take(file_size - start).read_to_end(&mut bytes)?;

    Ok(TailChunk {
        end_offset: start + bytes.len() as u64,
        bytes,
        reset,
    })
}

/// Reassembles lines across incremental reads.
///
/// A read may end in the middle of a line the writer has not finished. That
/// fragment is held back and prepended to the next chunk instead of being
/// parsed (and dropped) on its own.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    /// Append a chunk and return every line it completes (blank lines and
    /// lines that are not valid UTF-8 are dropped).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .split(|&b| b == b'\n')
            .filter_map(|line| {
                let line = line.trim_ascii();
                if line.is_empty() {
                    return None;
                }
                match std::str::from_utf8(line) {
                    Ok(text) => Some(text.to_string()),
                    Err(e) => {
                        debug!("Dropping non-UTF-8 line: {}", e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Release the buffered fragment if it is already a complete JSON object.
    ///
    /// Covers writers that do not terminate their final line. A fragment cut
    /// mid-object never parses as an object, so nothing partial escapes.
    pub fn flush_complete(&mut self) -> Option<String> {
        let trimmed = self.pending.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        let is_object = serde_json::from_slice::<Value>(trimmed)
            .map(|v| v.is_object())
            .unwrap_or(false);
        if !is_object {
            return None;
        }
        let line = String::from_utf8(trimmed.to_vec()).ok();
        self.pending.clear();
        line
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_stream_skips_malformed_and_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "s.jsonl",
            "{\"type\":\"user\",\"uuid\":\"a\"}\n\n{not json\n  \n{\"type\":\"assistant\",\"uuid\":\"b\"}\n",
        );

        let outcomes: Vec<LineOutcome> = stream_jsonl(&path).collect();
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], LineOutcome::Parsed(_)));
        assert!(matches!(outcomes[1], LineOutcome::Skipped { line_no: 3, .. }));
        assert!(matches!(outcomes[2], LineOutcome::Parsed(_)));

        let values = read_jsonl(&path);
        assert_eq!(values.len(), 2);
        assert_eq!(values[1]["uuid"], "b");
    }

    #[test]
    fn test_stream_is_restartable() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "s.jsonl", "{\"uuid\":\"a\"}\n{\"uuid\":\"b\"}\n");
        assert_eq!(records(&path).count(), 2);
        assert_eq!(records(&path).count(), 2);
    }

    #[test]
    fn test_records_log_and_skip_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "s.jsonl", "{\"uuid\":\"a\"}\n{oops\n[1]\n{\"uuid\":\"b\"}\n");
        let ids: Vec<String> = records(&path)
            .filter_map(|r| r.id().map(str::to_owned))
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.jsonl");
        assert_eq!(stream_jsonl(&path).count(), 0);
        assert!(read_jsonl(&path).is_empty());
        assert!(!file_exists(&path));
    }

    #[test]
    fn test_truncated_final_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "s.jsonl", "{\"uuid\":\"a\"}\n{\"uuid\":\"b\",\"ty");
        let values = read_jsonl(&path);
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_read_from_offset_returns_delta() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "s.jsonl", "line one\n");

        let first = read_from_offset(&path, 0).unwrap();
        assert_eq!(first.bytes, b"line one\n");
        assert_eq!(first.end_offset, 9);

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "line two\n").unwrap();

        let second = read_from_offset(&path, first.end_offset).unwrap();
        assert_eq!(second.bytes, b"line two\n");
        assert_eq!(second.end_offset, 18);
        assert!(!second.reset);

        let idle = read_from_offset(&path, second.end_offset).unwrap();
        assert!(idle.bytes.is_empty());
        assert_eq!(idle.end_offset, 18);
    }

    #[test]
    fn test_read_from_offset_resets_after_truncation() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "s.jsonl", "short\n");
        let chunk = read_from_offset(&path, 100).unwrap();
        assert!(chunk.reset);
        assert_eq!(chunk.bytes, b"short\n");
        assert_eq!(chunk.end_offset, 6);
    }

    #[test]
    fn test_read_from_offset_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        assert!(read_from_offset(&dir.path().join("gone.jsonl"), 0).is_err());
    }

    #[test]
    fn test_assembler_holds_partial_line() {
        let mut assembler = LineAssembler::default();

        let lines = assembler.push(b"{\"uuid\":\"a\"}\n{\"uuid\":");
        assert_eq!(lines, vec!["{\"uuid\":\"a\"}".to_string()]);
        assert_eq!(assembler.pending_len(), 8);
        assert_eq!(assembler.flush_complete(), None);

        let lines = assembler.push(b"\"b\"}\n");
        assert_eq!(lines, vec!["{\"uuid\":\"b\"}".to_string()]);
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn test_assembler_handles_split_utf8() {
        let mut assembler = LineAssembler::default();
        let line = "{\"text\":\"héllo\"}\n".as_bytes();
        // Split inside the two-byte 'é'
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        assert!(assembler.push(&line[..split]).is_empty());
        let lines = assembler.push(&line[split..]);
        assert_eq!(lines, vec!["{\"text\":\"héllo\"}".to_string()]);
    }

    #[test]
    fn test_flush_complete_releases_unterminated_object() {
        let mut assembler = LineAssembler::default();
        assert!(assembler.push(b"{\"uuid\":\"z\"}").is_empty());
        assert_eq!(assembler.flush_complete(), Some("{\"uuid\":\"z\"}".to_string()));
        assert_eq!(assembler.pending_len(), 0);

        // The newline arriving later yields nothing new
        assert!(assembler.push(b"\n").is_empty());
    }
}
