//! Frame and artifact types.
//!
//! A `Frame` is owned by the receive path only until it is handed to the
//! sink. A `CaptureArtifact` is the file the sink produced from it.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Instant;

/// One received frame: opaque encoded bytes plus the capture timestamp the
/// stream reported for it.
#[derive(Clone)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(timestamp: DateTime<Utc>, data: Vec<u8>) -> Self {
        Self { timestamp, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// Payload bytes stay out of logs.
impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("timestamp", &self.timestamp)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A persisted frame. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureArtifact {
    pub path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub bytes: u64,
}

impl CaptureArtifact {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

/// Monotonic time source for window bookkeeping.
///
/// The window threshold and idle watchdog read time through this trait so
/// they can be driven by a manual clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
