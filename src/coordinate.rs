//! Log Coordinates
//!
//! A coordinate names a byte position inside a segmented log as
//! `(segment file name, byte offset)`.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of the magic header that precedes the first event of every segment
pub const SEGMENT_HEADER_SIZE: u64 = 4;

/// A `(file, offset)` position in a segmented log
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    /// Segment file name (no directory component)
    pub file: String,
    /// Byte offset inside the segment
    pub offset: u64,
}

impl Coordinate {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// Coordinate of the first event in `file`
    pub fn start_of(file: impl Into<String>) -> Self {
        Self::new(file, SEGMENT_HEADER_SIZE)
    }

    /// True when no file has been recorded yet
    pub fn is_unset(&self) -> bool {
        self.file.is_empty()
    }

    /// Same file, different offset
    pub fn with_offset(&self, offset: u64) -> Self {
        Self::new(self.file.clone(), offset)
    }

    /// Sequence number embedded in the file name suffix
    pub fn sequence(&self) -> Option<u64> {
        file_sequence(&self.file)
    }
}

/// Parse the numeric suffix after the last `.` of a segment name
pub fn file_sequence(name: &str) -> Option<u64> {
    let (_, suffix) = name.rsplit_once('.')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Order two segment names by embedded sequence number, lexically otherwise
pub fn compare_files(a: &str, b: &str) -> Ordering {
    match (file_sequence(a), file_sequence(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

impl Ord for Coordinate {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_files(&self.file, &other.file).then(self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for Coordinate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_by_sequence_then_offset() {
        let a = Coordinate::new("relay.000009", 900);
        let b = Coordinate::new("relay.000010", 4);
        let c = Coordinate::new("relay.000010", 120);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.sequence(), Some(9));
    }

    #[test]
    fn test_sequence_beats_lexical_order() {
        // "log.10" sorts before "log.9" lexically
        let nine = Coordinate::new("log.9", 4);
        let ten = Coordinate::new("log.10", 4);
        assert!(nine < ten);
    }

    #[test]
    fn test_names_without_suffix_fall_back_to_lexical() {
        assert_eq!(file_sequence("relay"), None);
        assert_eq!(compare_files("a-log", "b-log"), Ordering::Less);
        assert!(Coordinate::default().is_unset());
    }
}
