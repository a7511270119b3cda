//! Checkpoint Files
//!
//! Position records persisted between restarts. Both files are plain text,
//! one value per line, with the first line holding the number of lines in
//! the file. Files are replaced atomically (temp file, fsync, rename) so a
//! crash leaves either the old or the new record, never a mix.

mod apply_state;
mod pending_reset;
mod source_link;

pub use apply_state::{ApplyRunState, ApplyState, StopCondition};
pub use pending_reset::PendingReset;
pub use source_link::{IoRunState, SourceLink, TlsOptions};

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::binlog::sync_dir;
use crate::error::{Error, Result};

/// I/O worker checkpoint file name
pub const SOURCE_LINK_FILE: &str = "source-link.info";

/// Apply worker checkpoint file name
pub const APPLY_STATE_FILE: &str = "apply-state.info";

/// Journal of a relay reset that has not finished yet
pub const PENDING_RESET_FILE: &str = "relay-reset.pending";

/// Location of one link's checkpoint files
#[derive(Debug, Clone)]
pub struct CheckpointPaths {
    pub dir: PathBuf,
}

impl CheckpointPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn source_link(&self) -> PathBuf {
        self.dir.join(SOURCE_LINK_FILE)
    }

    pub fn apply_state(&self) -> PathBuf {
        self.dir.join(APPLY_STATE_FILE)
    }

    pub fn pending_reset(&self) -> PathBuf {
        self.dir.join(PENDING_RESET_FILE)
    }

    /// Remove both files; missing files are fine
    pub fn remove_all(&self) -> Result<()> {
        for path in [self.source_link(), self.apply_state()] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Atomically write `lines`, prefixed with the line count
pub(crate) fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Checkpoint(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let tmp = path.with_extension("info.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        writeln!(file, "{}", lines.len() + 1)?;
        for line in lines {
            writeln!(file, "{}", line)?;
        }
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    sync_dir(dir);
    Ok(())
}

/// Read a checkpoint file's value lines; `None` when the file does not exist
pub(crate) fn read_lines(path: &Path) -> Result<Option<Vec<String>>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut lines = content.lines();
    let count: usize = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| Error::Checkpoint(format!("{}: missing line count", path.display())))?;
    let values: Vec<String> = lines.map(str::to_string).collect();
    if count == 0 || values.len() < count - 1 {
        return Err(Error::Checkpoint(format!(
            "{}: header announces {} lines, found {}",
            path.display(),
            count,
            values.len() + 1
        )));
    }
    Ok(Some(values.into_iter().take(count - 1).collect()))
}

/// Sequential field reader with line numbers in its errors
pub(crate) struct Fields<'a> {
    path: &'a Path,
    values: std::vec::IntoIter<String>,
    line: usize,
}

impl<'a> Fields<'a> {
    pub fn new(path: &'a Path, values: Vec<String>) -> Self {
        Self {
            path,
            values: values.into_iter(),
            // line 1 is the count
            line: 1,
        }
    }

    /// Next raw value, `None` past the end of an older, shorter file
    pub fn next_opt(&mut self) -> Option<String> {
        self.line += 1;
        self.values.next()
    }

    pub fn string(&mut self, what: &str) -> Result<String> {
        self.next_opt().ok_or_else(|| self.error(what, "missing"))
    }

    pub fn number<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let raw = self.string(what)?;
        raw.trim()
            .parse()
            .map_err(|_| self.error(what, &format!("'{}' is not a number", raw)))
    }

    /// Optional trailing number, `default` when the file predates the field
    pub fn number_or<T: std::str::FromStr>(&mut self, what: &str, default: T) -> Result<T> {
        match self.next_opt() {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| self.error(what, &format!("'{}' is not a number", raw))),
        }
    }

    pub fn error(&self, what: &str, reason: &str) -> Error {
        Error::Checkpoint(format!(
            "{} line {} ({}): {}",
            self.path.display(),
            self.line,
            what,
            reason
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lines_are_prefixed_with_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.info");
        write_lines(&path, &["a".into(), "".into(), "c".into()]).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4\na\n\nc\n");
        assert_eq!(
            read_lines(&path).unwrap().unwrap(),
            vec!["a".to_string(), String::new(), "c".to_string()]
        );
        assert!(!path.with_extension("info.tmp").exists());
    }

    #[test]
    fn test_missing_file_reads_as_none() {
        let dir = tempdir().unwrap();
        assert!(read_lines(&dir.path().join("absent.info")).unwrap().is_none());
    }

    #[test]
    fn test_short_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.info");
        std::fs::write(&path, "5\nonly-one\n").unwrap();
        assert!(matches!(read_lines(&path), Err(Error::Checkpoint(_))));
    }
}
