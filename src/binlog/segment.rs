//! Segment File I/O
//!
//! A segment starts with a 4-byte magic, followed by back-to-back event
//! frames. The first frame is always a format handshake whose `IN_USE` flag
//! is set while the segment is open for writing.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::coordinate::SEGMENT_HEADER_SIZE;
use crate::error::{Error, Result};
use crate::event::{self, flags, LogEvent, CHECKSUM_LEN, HEADER_LEN};

/// Magic bytes at the start of each segment file
pub const MAGIC: &[u8; 4] = b"\xfeWRL";

/// Largest frame a reader will accept
pub(crate) const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Segment open for appending
pub(crate) struct SegmentWriter {
    pub name: String,
    path: PathBuf,
    file: File,
    /// Bytes written so far, including the magic
    pub size: u64,
}

impl SegmentWriter {
    /// Create a new segment containing the magic only
    pub fn create(path: PathBuf, name: String) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(MAGIC)?;

        Ok(Self {
            name,
            path,
            file,
            size: SEGMENT_HEADER_SIZE,
        })
    }

    /// Reopen an existing segment, cutting off any torn tail
    ///
    /// Returns the writer and the number of bytes discarded.
    pub fn recover(path: PathBuf, name: String) -> Result<(Self, u64)> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        check_magic(&mut file, &path)?;

        let len = file.metadata()?.len();
        let valid = scan_valid_prefix(&mut file, len)?;
        if valid < len {
            tracing::warn!(
                "Truncating torn tail of {} from {} to {} bytes",
                path.display(),
                len,
                valid
            );
            file.set_len(valid)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid))?;

        Ok((
            Self {
                name,
                path,
                file,
                size: valid,
            },
            len - valid,
        ))
    }

    /// Append one encoded frame
    pub fn append(&mut self, frame: &[u8]) -> Result<u64> {
        self.file.seek(SeekFrom::Start(self.size))?;
        self.file.write_all(frame)?;
        self.size += frame.len() as u64;
        Ok(self.size)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Set or clear the in-use flag on the leading format handshake
    pub fn set_in_use(&mut self, in_use: bool) -> Result<()> {
        if self.size <= SEGMENT_HEADER_SIZE {
            return Ok(());
        }
        let frame = read_frame(&mut self.file, SEGMENT_HEADER_SIZE, self.size)?;
        let mut bytes = frame.to_vec();
        let current = u16::from_le_bytes([bytes[17], bytes[18]]);
        let updated = if in_use {
            current | flags::IN_USE
        } else {
            current & !flags::IN_USE
        };
        if updated == current {
            return Ok(());
        }
        bytes[17..19].copy_from_slice(&updated.to_le_bytes());
        event::restamp_checksum(&mut bytes);

        self.file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE))?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    /// Cut the segment back to `offset`
    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        self.file.set_len(offset)?;
        self.file.sync_all()?;
        self.size = offset;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn check_magic(file: &mut File, path: &Path) -> Result<()> {
    let mut magic = [0u8; 4];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut magic).map_err(|_| {
        Error::Checkpoint(format!("{} is too short to be a segment", path.display()))
    })?;
    if &magic != MAGIC {
        return Err(Error::Checkpoint(format!(
            "{} has invalid segment magic",
            path.display()
        )));
    }
    Ok(())
}

/// Length of the prefix made of whole, checksum-valid frames
fn scan_valid_prefix(file: &mut File, len: u64) -> Result<u64> {
    let mut pos = SEGMENT_HEADER_SIZE;
    while pos < len {
        match read_frame(file, pos, len) {
            Ok(frame) if LogEvent::decode(&frame).is_ok() => pos += frame.len() as u64,
            _ => break,
        }
    }
    Ok(pos)
}

/// Read the raw frame starting at `pos`, refusing to cross `limit`
pub(crate) fn read_frame(file: &mut File, pos: u64, limit: u64) -> Result<Bytes> {
    let malformed = |reason: String| Error::MalformedEvent {
        file: String::new(),
        offset: pos,
        reason,
    };

    if pos + (HEADER_LEN as u64) > limit {
        return Err(malformed("truncated header".into()));
    }
    let mut header = [0u8; HEADER_LEN];
    file.seek(SeekFrom::Start(pos))?;
    file.read_exact(&mut header)?;

    let total = event::frame_len(&header).unwrap_or(0);
    if total < HEADER_LEN + CHECKSUM_LEN || total > MAX_FRAME_LEN {
        return Err(malformed(format!("implausible frame length {}", total)));
    }
    if pos + total as u64 > limit {
        return Err(malformed("truncated frame".into()));
    }

    let mut frame = vec![0u8; total];
    frame[..HEADER_LEN].copy_from_slice(&header);
    file.read_exact(&mut frame[HEADER_LEN..])?;
    Ok(Bytes::from(frame))
}

/// Read the first event of a segment (its format handshake)
pub fn read_first_event(path: &Path) -> Result<LogEvent> {
    let mut file = File::open(path)?;
    check_magic(&mut file, path)?;
    let len = file.metadata()?.len();
    let frame = read_frame(&mut file, SEGMENT_HEADER_SIZE, len)?;
    LogEvent::decode(&frame).map_err(|reason| Error::MalformedEvent {
        file: path.display().to_string(),
        offset: SEGMENT_HEADER_SIZE,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use tempfile::tempdir;

    #[test]
    fn test_recover_cuts_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.000001");

        let mut seg = SegmentWriter::create(path.clone(), "relay.000001".into()).unwrap();
        let handshake = LogEvent::new(Event::format_handshake(), 1, 0).encode();
        let good = seg.append(&handshake).unwrap();
        // Half of a frame, as left behind by a crash mid-write
        seg.append(&handshake[..10]).unwrap();
        drop(seg);

        let (seg, discarded) = SegmentWriter::recover(path, "relay.000001".into()).unwrap();
        assert_eq!(seg.size, good);
        assert_eq!(discarded, 10);
    }

    #[test]
    fn test_in_use_flag_toggles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.000001");

        let mut seg = SegmentWriter::create(path.clone(), "log.000001".into()).unwrap();
        seg.append(&LogEvent::new(Event::format_handshake(), 1, 0).encode())
            .unwrap();
        seg.set_in_use(true).unwrap();
        assert!(read_first_event(&path).unwrap().header.has_flag(flags::IN_USE));

        seg.set_in_use(false).unwrap();
        assert!(!read_first_event(&path).unwrap().header.has_flag(flags::IN_USE));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.000001");
        std::fs::write(&path, b"nope-not-a-segment").unwrap();
        assert!(SegmentWriter::recover(path, "log.000001".into()).is_err());
    }
}
