//! Per-node JSONL file writer.
//!
//! One append-only file per node, so nodes sharing a logs directory never
//! interleave lines.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;

use super::entry::LogEntry;

/// Entries kept in memory while the node id is still unknown.
const BACKLOG_LIMIT: usize = 4096;

struct NodeFile {
    node: String,
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl NodeFile {
    fn append(&self, mut entry: LogEntry) -> std::io::Result<()> {
        entry.node.clone_from(&self.node);
        let json = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }
}

/// Appends entries to `<logs_dir>/raw/<date>_<node>.jsonl`.
///
/// Until [`open`](Self::open) names the node, entries are buffered (up to a
/// fixed limit) and replayed into the file once it exists.
pub struct NodeLogWriter {
    raw_dir: PathBuf,
    file: OnceLock<NodeFile>,
    backlog: Mutex<Vec<LogEntry>>,
}

impl NodeLogWriter {
    /// Create the `raw/` directory under `logs_dir`.
    pub fn new(logs_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;
        Ok(Self {
            raw_dir,
            file: OnceLock::new(),
            backlog: Mutex::new(Vec::new()),
        })
    }

    /// Open the file for `node` and flush the backlog into it.
    ///
    /// Only the first call opens a file; later calls return its path.
    pub fn open(&self, node: &str) -> std::io::Result<&Path> {
        if let Some(file) = self.file.get() {
            return Ok(&file.path);
        }

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = self.raw_dir.join(format!("{}_{}.jsonl", date, node));
        let handle = OpenOptions::new().create(true).append(true).open(&path)?;
        let file = self.file.get_or_init(|| NodeFile {
            node: node.to_string(),
            path,
            writer: Mutex::new(BufWriter::new(handle)),
        });

        let backlog = std::mem::take(&mut *self.backlog.lock());
        for entry in backlog {
            file.append(entry)?;
        }
        Ok(&file.path)
    }

    /// Node the file belongs to, once opened.
    pub fn node(&self) -> Option<&str> {
        self.file.get().map(|f| f.node.as_str())
    }

    /// Path of the file, once opened.
    pub fn path(&self) -> Option<&Path> {
        self.file.get().map(|f| f.path.as_path())
    }

    /// Append one entry, or buffer it if no file is open yet.
    pub fn write(&self, entry: LogEntry) -> std::io::Result<()> {
        if let Some(file) = self.file.get() {
            return file.append(entry);
        }
        let mut backlog = self.backlog.lock();
        if backlog.len() < BACKLOG_LIMIT {
            backlog.push(entry);
        }
        Ok(())
    }
}

/// Read every entry of one JSONL file, skipping lines that do not parse.
pub fn read_entries(path: impl AsRef<Path>) -> std::io::Result<Vec<LogEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = LogEntry::from_json_line(&line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backlog_replayed_on_open() {
        let temp = TempDir::new().unwrap();
        let writer = NodeLogWriter::new(temp.path()).unwrap();

        writer.write(LogEntry::new("info", "t", "before init")).unwrap();
        assert!(writer.path().is_none());

        let path = writer.open("n3").unwrap().to_path_buf();
        writer.write(LogEntry::new("debug", "t", "after init")).unwrap();

        assert!(path.file_name().unwrap().to_string_lossy().ends_with("_n3.jsonl"));
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].msg, "before init");
        assert!(entries.iter().all(|e| e.node == "n3"));
    }

    #[test]
    fn test_second_open_keeps_first_file() {
        let temp = TempDir::new().unwrap();
        let writer = NodeLogWriter::new(temp.path()).unwrap();
        let first = writer.open("n0").unwrap().to_path_buf();
        let second = writer.open("n1").unwrap().to_path_buf();
        assert_eq!(first, second);
        assert_eq!(writer.node(), Some("n0"));
    }
}
