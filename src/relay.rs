//! Relay Log
//!
//! A replica's local copy of the source stream: an [`EventLog`] of kind
//! `Relay` plus the bookkeeping shared by its single producer (the I/O
//! worker) and single consumer (the apply worker): purge pins, the space
//! limit and the "space available" signal.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::binlog::{EventLog, LogKind, LogOptions, LogReader};
use crate::coordinate::Coordinate;
use crate::error::{Error, Result};
use crate::event::LogEvent;

/// Relay log settings
#[derive(Debug, Clone)]
pub struct RelayLogOptions {
    pub basename: String,
    pub max_segment_size: u64,
    /// Total bytes before the I/O worker throttles; 0 disables the limit
    pub space_limit: u64,
    /// Delete segments once the apply worker has consumed them
    pub purge: bool,
    pub fsync: bool,
    pub server_id: u32,
}

/// Checkpointed positions that keep segments alive
#[derive(Debug, Default)]
struct Pins {
    io: Coordinate,
    apply: Coordinate,
}

pub struct RelayLog {
    log: Arc<EventLog>,
    space_limit: u64,
    purge: bool,
    space_available: Notify,
    pins: Mutex<Pins>,
    apply_parked: AtomicBool,
    forced_rotation: AtomicBool,
}

impl RelayLog {
    pub fn open(dir: impl Into<PathBuf>, options: RelayLogOptions) -> Result<Self> {
        let log = EventLog::open(
            dir,
            LogOptions {
                basename: options.basename,
                max_segment_size: options.max_segment_size,
                fsync: options.fsync,
                server_id: options.server_id,
                kind: LogKind::Relay,
            },
        )?;
        Ok(Self {
            log: Arc::new(log),
            space_limit: options.space_limit,
            purge: options.purge,
            space_available: Notify::new(),
            pins: Mutex::new(Pins::default()),
            apply_parked: AtomicBool::new(false),
            forced_rotation: AtomicBool::new(false),
        })
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub async fn append(&self, event: &LogEvent) -> Result<Coordinate> {
        self.log.append(event).await
    }

    /// Append a frame received from the primary unchanged
    pub async fn append_frame(&self, frame: &[u8]) -> Result<Coordinate> {
        self.log.append_frame(frame).await
    }

    pub async fn rotate(&self) -> Result<String> {
        self.log.rotate().await
    }

    pub async fn sync(&self) -> Result<()> {
        self.log.sync().await
    }

    pub fn end(&self) -> Coordinate {
        self.log.end()
    }

    /// Open a reader at `at`
    pub async fn reader(&self, at: &Coordinate) -> Result<LogReader> {
        LogReader::open(Arc::clone(&self.log), at).await
    }

    /// First readable coordinate
    pub async fn start(&self) -> Coordinate {
        self.log.first_coordinate().await
    }

    pub fn purge_enabled(&self) -> bool {
        self.purge
    }

    /// Record the I/O worker's last checkpointed relay position
    pub fn pin_io(&self, at: Coordinate) {
        self.pins.lock().io = at;
    }

    /// Record the apply worker's last checkpointed group position
    pub fn pin_apply(&self, at: Coordinate) {
        self.pins.lock().apply = at;
    }

    /// Delete segments that lie wholly before `at`
    ///
    /// Refused when either worker's checkpoint still points before `at`.
    pub async fn purge_up_to(&self, at: &Coordinate) -> Result<Vec<String>> {
        {
            let pins = self.pins.lock();
            for (owner, pin) in [("I/O", &pins.io), ("apply", &pins.apply)] {
                if !pin.is_unset() && at > pin {
                    return Err(Error::PurgeRefused(format!(
                        "{} (the {} worker checkpoint is at {})",
                        at, owner, pin
                    )));
                }
            }
        }

        let purged = self.log.purge_before(&at.file).await?;
        if !purged.is_empty() {
            tracing::debug!("Purged {} relay segment(s) before {}", purged.len(), at);
            self.forced_rotation.store(false, Ordering::SeqCst);
            self.space_available.notify_one();
        }
        Ok(purged)
    }

    pub fn total_size(&self) -> u64 {
        self.log.total_size()
    }

    pub fn over_limit(&self) -> bool {
        self.space_limit > 0 && self.log.total_size() >= self.space_limit
    }

    /// Set by the apply worker while it waits at the end of the log
    pub fn set_apply_parked(&self, parked: bool) {
        self.apply_parked.store(parked, Ordering::SeqCst);
        if parked {
            self.space_available.notify_one();
        }
    }

    /// Block until the I/O worker may append one more event
    ///
    /// When the apply worker has caught up and nothing can be purged, the
    /// log is rotated once so the consumer can move past the old segments,
    /// and events are admitted one at a time until space is freed.
    pub async fn wait_for_space(&self, cancel: &CancellationToken) -> Result<()> {
        let mut announced = false;
        loop {
            if !self.over_limit() {
                return Ok(());
            }
            if self.apply_parked.load(Ordering::SeqCst) {
                if !self.forced_rotation.swap(true, Ordering::SeqCst) {
                    let next = self.log.rotate().await?;
                    tracing::info!(
                        "Relay log over its space limit with the apply worker idle; rotated to {}",
                        next
                    );
                }
                return Ok(());
            }
            if !announced {
                tracing::info!(
                    "Relay log holds {} bytes (limit {}); waiting for the apply worker to free space",
                    self.total_size(),
                    self.space_limit
                );
                announced = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.space_available.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    /// Drop everything after `at`
    pub async fn truncate_to(&self, at: &Coordinate) -> Result<()> {
        self.log.truncate_to(at).await
    }

    /// Delete every segment and start over; returns the first coordinate
    pub async fn reset(&self) -> Result<Coordinate> {
        let first = self.log.reset().await?;
        *self.pins.lock() = Pins::default();
        self.forced_rotation.store(false, Ordering::SeqCst);
        Ok(Coordinate::start_of(first))
    }

    pub async fn close(&self) -> Result<()> {
        self.log.close(false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DataEvent, Event, GroupBoundary};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn options(space_limit: u64) -> RelayLogOptions {
        RelayLogOptions {
            basename: "relay".to_string(),
            max_segment_size: 1 << 20,
            space_limit,
            purge: true,
            fsync: false,
            server_id: 2,
        }
    }

    fn row() -> LogEvent {
        LogEvent::new(
            Event::Data(DataEvent {
                boundary: GroupBoundary::standalone(),
                schema: "app".into(),
                table: None,
                payload: Bytes::from_static(&[0u8; 256]),
            }),
            1,
            0,
        )
    }

    #[tokio::test]
    async fn test_purge_refused_past_a_pin() {
        let dir = tempdir().unwrap();
        let relay = RelayLog::open(dir.path(), options(0)).unwrap();
        let first = relay.end();
        relay.rotate().await.unwrap();
        let second = relay.end();

        relay.pin_io(second.clone());
        relay.pin_apply(first);
        assert!(matches!(
            relay.purge_up_to(&second).await,
            Err(Error::PurgeRefused(_))
        ));

        relay.pin_apply(second.clone());
        assert_eq!(relay.purge_up_to(&second).await.unwrap(), vec!["relay.000001"]);
    }

    #[tokio::test]
    async fn test_space_limit_waits_for_purge() {
        let dir = tempdir().unwrap();
        let relay = Arc::new(RelayLog::open(dir.path(), options(600)).unwrap());
        for _ in 0..3 {
            relay.append(&row()).await.unwrap();
        }
        relay.rotate().await.unwrap();
        assert!(relay.over_limit());

        let cancel = CancellationToken::new();
        let waiter = {
            let relay = Arc::clone(&relay);
            let cancel = cancel.clone();
            tokio::spawn(async move { relay.wait_for_space(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let end = relay.end();
        relay.pin_apply(end.clone());
        relay.pin_io(end.clone());
        relay.purge_up_to(&end).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_parked_consumer_forces_one_rotation() {
        let dir = tempdir().unwrap();
        let relay = RelayLog::open(dir.path(), options(300)).unwrap();
        relay.append(&row()).await.unwrap();
        relay.append(&row()).await.unwrap();
        relay.set_apply_parked(true);

        let cancel = CancellationToken::new();
        relay.wait_for_space(&cancel).await.unwrap();
        relay.wait_for_space(&cancel).await.unwrap();
        assert_eq!(relay.log().segments().await.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let dir = tempdir().unwrap();
        let relay = RelayLog::open(dir.path(), options(100)).unwrap();
        relay.append(&row()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            relay.wait_for_space(&cancel).await,
            Err(Error::Cancelled)
        ));
    }
}
