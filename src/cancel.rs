//! Cooperative cancellation.
//!
//! A `CancellationSignal` is a set-once stop flag shared between the
//! connect/receive loop, the per-frame callback, the idle watchdog and the
//! process shutdown handler. It only ever moves from unset to set, so a
//! single atomic is enough; the first writer also records why it fired.
//!
//! Blocking operations honour the signal by polling it at least every
//! [`POLL_INTERVAL`].

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on how long a cooperative wait goes without checking the signal.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

const UNSET: u8 = 0;

/// Why a signal fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// The capture window reached its elapsed-time threshold.
    Threshold,
    /// No frame arrived within the idle timeout.
    IdleTimeout,
    /// The connect loop ran out of retry budget.
    RetriesExhausted,
    /// External process shutdown (Ctrl-C, host unload).
    Shutdown,
}

impl CancelReason {
    fn to_u8(self) -> u8 {
        match self {
            CancelReason::Threshold => 1,
            CancelReason::IdleTimeout => 2,
            CancelReason::RetriesExhausted => 3,
            CancelReason::Shutdown => 4,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CancelReason::Threshold),
            2 => Some(CancelReason::IdleTimeout),
            3 => Some(CancelReason::RetriesExhausted),
            4 => Some(CancelReason::Shutdown),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    reason: AtomicU8,
    parent: Option<CancellationSignal>,
}

/// Monotonic, cloneable stop signal.
///
/// A child signal (see [`CancellationSignal::child`]) reports cancelled when
/// either itself or any ancestor has fired, so one check covers both the
/// window-local and the process-wide stop paths.
#[derive(Clone, Debug)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                reason: AtomicU8::new(UNSET),
                parent: None,
            }),
        }
    }

    /// Create a signal that also fires whenever `self` fires.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                reason: AtomicU8::new(UNSET),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Fire the signal. Returns `true` if this call performed the transition;
    /// later calls keep the first reason.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.inner
            .reason
            .compare_exchange(UNSET, reason.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// The reason recorded by whichever signal in the chain fired. Ancestors
    /// win over the local reason so an external shutdown is always visible.
    pub fn reason(&self) -> Option<CancelReason> {
        if let Some(parent) = &self.inner.parent {
            if let Some(reason) = parent.reason() {
                return Some(reason);
            }
        }
        CancelReason::from_u8(self.inner.reason.load(Ordering::Acquire))
    }

    /// Sleep for `duration` unless the signal fires first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if cancelled.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }

    /// Block until the signal fires.
    pub fn wait(&self) -> CancelReason {
        loop {
            if let Some(reason) = self.reason() {
                return reason;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}
