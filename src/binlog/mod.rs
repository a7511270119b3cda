//! Segmented Event Log
//!
//! Append-only log of event frames spread over numbered segment files plus
//! a plain-text index. The primary's source log and every replica's relay
//! log use the same on-disk format:
//!
//! ```text
//! <dir>/<basename>.index      one segment name per line, oldest first
//! <dir>/<basename>.000001     magic, format handshake, events..., rotate
//! <dir>/<basename>.000002
//! ```

mod reader;
mod segment;
mod writer;

pub use reader::{LogReader, ReadOutcome, ReadEvent};
pub use segment::{read_first_event, MAGIC};
pub use writer::{EventLog, LogKind, LogOptions};

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::coordinate::compare_files;
use crate::error::{Error, Result};

/// Directory layout of one event log
#[derive(Debug, Clone)]
pub struct LogPaths {
    pub dir: PathBuf,
    pub basename: String,
}

impl LogPaths {
    pub fn new(dir: impl Into<PathBuf>, basename: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            basename: basename.into(),
        }
    }

    /// Name of the segment with sequence number `seq`
    pub fn segment_name(&self, seq: u64) -> String {
        format!("{}.{:06}", self.basename, seq)
    }

    pub fn segment_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(format!("{}.index", self.basename))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)
    }
}

/// Read the segment index; a missing index is an empty log
pub fn read_index(paths: &LogPaths) -> Result<Vec<String>> {
    let path = paths.index_path();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    let mut names: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    for name in &names {
        if !paths.segment_path(name).exists() {
            return Err(Error::Checkpoint(format!(
                "index {} lists missing segment {}",
                path.display(),
                name
            )));
        }
    }
    names.sort_by(|a, b| compare_files(a, b));
    Ok(names)
}

/// Atomically replace the segment index
pub fn write_index(paths: &LogPaths, names: &[String]) -> Result<()> {
    let path = paths.index_path();
    let tmp = path.with_extension("index.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        for name in names {
            writeln!(file, "{}", name)?;
        }
        file.sync_all()?;
    }
    std::fs::rename(&tmp, &path)?;
    sync_dir(&paths.dir);
    Ok(())
}

/// Best-effort fsync of a directory after a rename
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = std::fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_index_round_trip_sorted_by_sequence() {
        let dir = tempdir().unwrap();
        let paths = LogPaths::new(dir.path(), "relay");
        for seq in [9, 10, 11] {
            std::fs::write(paths.segment_path(&paths.segment_name(seq)), b"").unwrap();
        }
        let names = vec![
            paths.segment_name(10),
            paths.segment_name(9),
            paths.segment_name(11),
        ];
        write_index(&paths, &names).unwrap();

        let read = read_index(&paths).unwrap();
        assert_eq!(read, vec!["relay.000009", "relay.000010", "relay.000011"]);
    }

    #[test]
    fn test_index_with_missing_segment_is_an_error() {
        let dir = tempdir().unwrap();
        let paths = LogPaths::new(dir.path(), "relay");
        write_index(&paths, &["relay.000001".to_string()]).unwrap();
        assert!(read_index(&paths).is_err());
    }
}
