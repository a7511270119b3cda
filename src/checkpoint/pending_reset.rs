//! Relay Reset Journal
//!
//! CHANGE and RESET both discard the relay log and rewrite the position
//! records. The journal is written before any of that happens and removed
//! once all of it is on disk. While it exists the relay log and both records
//! are stale, and opening the link finishes the reset from the journal.

use std::path::Path;

use super::{read_lines, write_lines, ApplyState, Fields, SourceLink};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReset {
    /// Empty the relay, then write both records as given
    ///
    /// The relay positions inside the records are filled in once the relay
    /// has been emptied.
    Change {
        source: SourceLink,
        apply: ApplyState,
    },
    /// Empty the relay, then delete both records
    Forget,
}

impl PendingReset {
    fn to_lines(&self) -> Vec<String> {
        match self {
            PendingReset::Change { source, apply } => {
                let source_lines = source.to_lines();
                let mut lines = Vec::with_capacity(source_lines.len() + 12);
                lines.push("change".to_string());
                lines.push(source_lines.len().to_string());
                lines.extend(source_lines);
                lines.extend(apply.to_lines());
                lines
            }
            PendingReset::Forget => vec!["forget".to_string()],
        }
    }

    fn from_lines(path: &Path, values: Vec<String>) -> Result<Self> {
        let mut f = Fields::new(path, values);
        match f.string("kind")?.as_str() {
            "forget" => Ok(PendingReset::Forget),
            "change" => {
                let count: usize = f.number("source line count")?;
                let mut source_lines = Vec::with_capacity(count);
                for _ in 0..count {
                    source_lines.push(f.string("source link")?);
                }
                let apply_lines: Vec<String> = std::iter::from_fn(|| f.next_opt()).collect();
                Ok(PendingReset::Change {
                    source: SourceLink::from_lines(path, source_lines)?,
                    apply: ApplyState::from_lines(path, apply_lines)?,
                })
            }
            other => Err(f.error("kind", &format!("unknown reset kind '{}'", other))),
        }
    }

    /// Load the journal; `None` when no reset is in flight
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match read_lines(path)? {
            Some(values) => Self::from_lines(path, values).map(Some),
            None => Ok(None),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_lines(path, &self.to_lines())
    }

    /// Drop the journal once the reset is complete
    pub fn clear(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::StopCondition;
    use crate::coordinate::Coordinate;
    use tempfile::tempdir;

    #[test]
    fn test_change_journal_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay-reset.pending");
        let source = SourceLink {
            host: "10.0.0.9".to_string(),
            port: 7701,
            // empty lines inside the source record must not shift the apply record
            password: String::new(),
            requested: Coordinate::new("log.000007", 400),
            ..SourceLink::default()
        };
        let apply = ApplyState {
            stop_condition: StopCondition::AtSourceCoordinate(Coordinate::new("log.000008", 4)),
            ..ApplyState::starting_at(Coordinate::default(), Coordinate::new("log.000007", 400))
        };
        let pending = PendingReset::Change { source, apply };
        pending.save(&path).unwrap();

        assert_eq!(PendingReset::load(&path).unwrap(), Some(pending));

        PendingReset::clear(&path).unwrap();
        assert_eq!(PendingReset::load(&path).unwrap(), None);
        // clearing twice is fine
        PendingReset::clear(&path).unwrap();
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay-reset.pending");
        std::fs::write(&path, "2\nrewind\n").unwrap();
        assert!(matches!(PendingReset::load(&path), Err(Error::Checkpoint(_))));

        PendingReset::Forget.save(&path).unwrap();
        assert_eq!(PendingReset::load(&path).unwrap(), Some(PendingReset::Forget));
    }
}
