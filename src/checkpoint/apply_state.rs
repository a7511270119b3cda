//! Apply State Record
//!
//! Positions of the apply worker. `group_cursor` and `source_mirror` only
//! move together, at transaction group boundaries.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{read_lines, write_lines, Fields};
use crate::coordinate::Coordinate;
use crate::error::Result;

/// Where the apply worker should halt on its own
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopCondition {
    #[default]
    None,
    /// Halt before the first data event at or past this source position
    AtSourceCoordinate(Coordinate),
    /// Halt before the first data event at or past this relay position
    AtRelayCoordinate(Coordinate),
}

impl StopCondition {
    /// True once an event at `relay`/`source` reaches the target
    pub fn reached(&self, relay: &Coordinate, source: &Coordinate) -> bool {
        match self {
            StopCondition::None => false,
            StopCondition::AtSourceCoordinate(target) => source >= target,
            StopCondition::AtRelayCoordinate(target) => relay >= target,
        }
    }

    fn to_line(&self) -> String {
        match self {
            StopCondition::None => "none".to_string(),
            StopCondition::AtSourceCoordinate(c) => format!("source {} {}", c.file, c.offset),
            StopCondition::AtRelayCoordinate(c) => format!("relay {} {}", c.file, c.offset),
        }
    }

    fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim();
        if line == "none" {
            return Ok(StopCondition::None);
        }
        let (kind, rest) = line
            .split_once(' ')
            .ok_or_else(|| format!("unrecognised stop condition '{}'", line))?;
        let (file, offset) = rest
            .rsplit_once(' ')
            .ok_or_else(|| format!("stop condition '{}' lacks a position", line))?;
        let offset: u64 = offset
            .parse()
            .map_err(|_| format!("bad stop offset '{}'", offset))?;
        let at = Coordinate::new(file, offset);
        match kind {
            "source" => Ok(StopCondition::AtSourceCoordinate(at)),
            "relay" => Ok(StopCondition::AtRelayCoordinate(at)),
            other => Err(format!("unknown stop condition kind '{}'", other)),
        }
    }
}

/// Apply worker run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyRunState {
    #[default]
    Stopped,
    Running,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyState {
    /// Relay position of the next event to read
    pub event_cursor: Coordinate,
    /// Relay position just past the last fully applied group
    pub group_cursor: Coordinate,
    /// Source position matching `group_cursor`
    pub source_mirror: Coordinate,
    /// Whole groups still to skip
    pub skip_counter: u32,
    /// Retries spent on the current group
    pub retry_count: u32,
    pub stop_condition: StopCondition,
    /// Runtime only, never persisted
    pub run_state: ApplyRunState,
}

impl ApplyState {
    /// Fresh state positioned at the start of `relay_start`
    pub fn starting_at(relay_start: Coordinate, source: Coordinate) -> Self {
        Self {
            event_cursor: relay_start.clone(),
            group_cursor: relay_start,
            source_mirror: source,
            ..Self::default()
        }
    }

    pub fn to_lines(&self) -> Vec<String> {
        vec![
            self.group_cursor.file.clone(),
            self.group_cursor.offset.to_string(),
            self.source_mirror.file.clone(),
            self.source_mirror.offset.to_string(),
            self.event_cursor.file.clone(),
            self.event_cursor.offset.to_string(),
            self.skip_counter.to_string(),
            self.retry_count.to_string(),
            self.stop_condition.to_line(),
        ]
    }

    pub fn from_lines(path: &Path, values: Vec<String>) -> Result<Self> {
        let mut f = Fields::new(path, values);
        let group_cursor = Coordinate::new(f.string("relay log file")?, f.number("relay log pos")?);
        let source_mirror = Coordinate::new(f.string("source log file")?, f.number("source log pos")?);

        // The event cursor is informational; restart always resumes at the group cursor
        let event_file = f.next_opt();
        let event_pos = f.number_or("event pos", group_cursor.offset)?;
        let event_cursor = match event_file {
            Some(file) if !file.is_empty() => Coordinate::new(file, event_pos),
            _ => group_cursor.clone(),
        };
        let skip_counter = f.number_or("skip counter", 0)?;
        let retry_count = f.number_or("retry count", 0)?;
        let stop_condition = match f.next_opt() {
            None => StopCondition::None,
            Some(line) => StopCondition::parse(&line).map_err(|e| f.error("stop condition", &e))?,
        };

        Ok(Self {
            event_cursor,
            group_cursor,
            source_mirror,
            skip_counter,
            retry_count,
            stop_condition,
            run_state: ApplyRunState::Stopped,
        })
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        match read_lines(path)? {
            Some(values) => Self::from_lines(path, values).map(Some),
            None => Ok(None),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_lines(path, &self.to_lines())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_every_persisted_field_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apply-state.info");
        let state = ApplyState {
            event_cursor: Coordinate::new("relay.000003", 2048),
            group_cursor: Coordinate::new("relay.000003", 1000),
            source_mirror: Coordinate::new("log.000012", 88_000),
            skip_counter: 2,
            retry_count: 1,
            stop_condition: StopCondition::AtSourceCoordinate(Coordinate::new("log.000013", 4)),
            run_state: ApplyRunState::Running,
        };
        state.save(&path).unwrap();

        let loaded = ApplyState::load(&path).unwrap().unwrap();
        assert_eq!(
            loaded,
            ApplyState {
                run_state: ApplyRunState::Stopped,
                ..state
            }
        );
    }

    #[test]
    fn test_stop_condition_lines() {
        let relay = StopCondition::AtRelayCoordinate(Coordinate::new("relay.000001", 77));
        assert_eq!(relay.to_line(), "relay relay.000001 77");
        assert_eq!(StopCondition::parse("relay relay.000001 77").unwrap(), relay);
        assert_eq!(StopCondition::parse("none").unwrap(), StopCondition::None);
        assert!(StopCondition::parse("later maybe").is_err());
    }

    #[test]
    fn test_stop_condition_reached() {
        let cond = StopCondition::AtRelayCoordinate(Coordinate::new("relay.000002", 100));
        let source = Coordinate::new("log.000001", 10);
        assert!(!cond.reached(&Coordinate::new("relay.000001", 5000), &source));
        assert!(cond.reached(&Coordinate::new("relay.000002", 100), &source));
        assert!(!StopCondition::None.reached(&Coordinate::default(), &source));
    }
}
