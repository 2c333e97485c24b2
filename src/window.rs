//! Capture window controller.
//!
//! Drives one capture window through
//! `Idle -> Connecting -> Receiving -> (Retrying <-> Connecting) -> Terminated`.
//!
//! The elapsed-time threshold is checked in the per-frame callback: the
//! first frame delivered at or after `start + threshold` fires the window's
//! cancellation signal and is dropped, and the in-flight receive unwinds on
//! its next poll. A frame already being written when another path fires the
//! signal may still land on disk.
//!
//! Because the threshold only advances on frame arrival, an optional idle
//! watchdog thread cancels the window when a connected session delivers no
//! frame for `idle_timeout` (measured from the connect or the last frame).
//! The watchdog is disarmed while connecting or retrying, so an unbounded
//! retry policy is never cut short by it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::{CancelReason, CancellationSignal, POLL_INTERVAL};
use crate::frame::{Clock, Frame, SystemClock};
use crate::session::{ConnectionParameters, SessionConnector, SessionError, StreamClient};
use crate::sink::FrameSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowState {
    Idle,
    Connecting,
    Receiving,
    Retrying,
    Terminated,
}

/// Why a window terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowOutcome {
    ThresholdReached,
    IdleTimeout,
    RetriesExhausted,
    Shutdown,
}

impl From<CancelReason> for WindowOutcome {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Threshold => WindowOutcome::ThresholdReached,
            CancelReason::IdleTimeout => WindowOutcome::IdleTimeout,
            CancelReason::RetriesExhausted => WindowOutcome::RetriesExhausted,
            CancelReason::Shutdown => WindowOutcome::Shutdown,
        }
    }
}

/// Fixed-interval reconnect policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// Consecutive failed connect attempts tolerated before the window gives
    /// up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WindowSettings {
    pub output_dir: PathBuf,
    pub threshold: Duration,
    pub retry: RetryPolicy,
    /// Cancel the window after this long without a frame. `None` disables.
    pub idle_timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct WindowReport {
    pub outcome: WindowOutcome,
    pub connect_attempts: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub write_failures: u64,
    pub transitions: Vec<WindowState>,
    pub elapsed: Duration,
}

#[derive(Default)]
struct FrameCounters {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

pub struct CaptureWindowController {
    settings: WindowSettings,
    sink: FrameSink,
    clock: Arc<dyn Clock>,
    state: WindowState,
    transitions: Vec<WindowState>,
}

impl CaptureWindowController {
    pub fn new(settings: WindowSettings, sink: FrameSink) -> Self {
        Self::with_clock(settings, sink, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: WindowSettings, sink: FrameSink, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            sink,
            clock,
            state: WindowState::Idle,
            transitions: vec![WindowState::Idle],
        }
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    fn transition(&mut self, next: WindowState) {
        if self.state != next {
            log::debug!("capture window: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        self.transitions.push(next);
    }

    /// Run one capture window to `Terminated`.
    ///
    /// Returns once the window's cancellation signal has fired (threshold,
    /// idle watchdog, exhausted retries, or an ancestor shutdown signal) and
    /// the session has been disconnected. Retryable connection failures never
    /// escape this call.
    pub fn run<C: StreamClient>(
        &mut self,
        connector: &mut SessionConnector<C>,
        params: &ConnectionParameters,
        cancel: &CancellationSignal,
    ) -> WindowReport {
        let start = self.clock.now();
        self.transition(WindowState::Connecting);
        log::info!(
            "capture window started: threshold={:?}, output={}",
            self.settings.threshold,
            self.settings.output_dir.display()
        );

        let counters = FrameCounters::default();
        let last_frame: Mutex<Option<Instant>> = Mutex::new(None);
        let window_done = CancellationSignal::new();
        let attempts_before = connector.attempts();

        std::thread::scope(|scope| {
            if let Some(idle_timeout) = self.settings.idle_timeout {
                let clock = Arc::clone(&self.clock);
                let last_frame = &last_frame;
                let window_done = &window_done;
                scope.spawn(move || {
                    idle_watchdog(clock.as_ref(), last_frame, idle_timeout, cancel, window_done)
                });
            }

            self.drive(connector, params, cancel, start, &counters, &last_frame);
            window_done.cancel(CancelReason::Shutdown);
        });

        connector.disconnect();
        self.transition(WindowState::Terminated);

        let outcome = cancel
            .reason()
            .map(WindowOutcome::from)
            .unwrap_or(WindowOutcome::Shutdown);
        let report = WindowReport {
            outcome,
            connect_attempts: connector.attempts() - attempts_before,
            frames_written: counters.written.load(Ordering::Relaxed),
            frames_dropped: counters.dropped.load(Ordering::Relaxed),
            write_failures: counters.failed.load(Ordering::Relaxed),
            transitions: self.transitions.clone(),
            elapsed: self.clock.now().saturating_duration_since(start),
        };
        log::info!(
            "capture window terminated ({:?}): {} frames written, {} write failures, {} connect attempts",
            report.outcome,
            report.frames_written,
            report.write_failures,
            report.connect_attempts
        );
        report
    }

    fn drive<C: StreamClient>(
        &mut self,
        connector: &mut SessionConnector<C>,
        params: &ConnectionParameters,
        cancel: &CancellationSignal,
        start: Instant,
        counters: &FrameCounters,
        last_frame: &Mutex<Option<Instant>>,
    ) {
        let mut failed_attempts: u32 = 0;
        loop {
            match connector.connect(params, cancel) {
                Ok(()) => {
                    failed_attempts = 0;
                    set_idle_mark(last_frame, Some(self.clock.now()));
                }
                Err(SessionError::Cancelled) => return,
                Err(e) => {
                    failed_attempts += 1;
                    log::warn!("connect failed: {:#}", e);
                    if !self.retry(cancel, failed_attempts) {
                        return;
                    }
                    continue;
                }
            }

            self.transition(WindowState::Receiving);
            let mut on_frame = |frame: Frame| {
                self.on_frame(frame, cancel, start, counters, last_frame);
            };
            let result = connector.receive(cancel, &mut on_frame);
            set_idle_mark(last_frame, None);

            match result {
                Err(SessionError::Cancelled) => return,
                Ok(()) => log::warn!("stream closed by peer"),
                Err(e) => log::warn!("receive failed: {:#}", e),
            }
            if !self.retry(cancel, failed_attempts) {
                return;
            }
        }
    }

    /// Per-frame callback: threshold check, then persist.
    fn on_frame(
        &self,
        frame: Frame,
        cancel: &CancellationSignal,
        start: Instant,
        counters: &FrameCounters,
        last_frame: &Mutex<Option<Instant>>,
    ) {
        let now = self.clock.now();
        set_idle_mark(last_frame, Some(now));
        if now.saturating_duration_since(start) >= self.settings.threshold
            && cancel.cancel(CancelReason::Threshold)
        {
            log::info!("capture threshold reached, stopping window");
        }
        if cancel.is_cancelled() {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.sink.write(&frame, &self.settings.output_dir) {
            Ok(artifact) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
                log::debug!("snapshot saved to {}", artifact.path.display());
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("failed to persist frame {:?}: {}", frame.timestamp, e);
            }
        }
    }

    /// Enter `Retrying`, wait out the delay and decide whether to reconnect.
    fn retry(&mut self, cancel: &CancellationSignal, failed_attempts: u32) -> bool {
        self.transition(WindowState::Retrying);
        if let Some(max) = self.settings.retry.max_attempts {
            if failed_attempts >= max {
                log::error!("giving up after {} failed connect attempts", failed_attempts);
                cancel.cancel(CancelReason::RetriesExhausted);
                return false;
            }
        }
        if !cancel.wait_timeout(self.settings.retry.delay) {
            return false;
        }
        self.transition(WindowState::Connecting);
        true
    }
}

fn set_idle_mark(last_frame: &Mutex<Option<Instant>>, mark: Option<Instant>) {
    if let Ok(mut last) = last_frame.lock() {
        *last = mark;
    }
}

/// Cancels the window once a live session has been silent for
/// `idle_timeout`. `None` in `last_frame` means no session is live.
fn idle_watchdog(
    clock: &dyn Clock,
    last_frame: &Mutex<Option<Instant>>,
    idle_timeout: Duration,
    cancel: &CancellationSignal,
    window_done: &CancellationSignal,
) {
    while !window_done.is_cancelled() && !cancel.is_cancelled() {
        let last = match last_frame.lock() {
            Ok(last) => *last,
            Err(_) => return,
        };
        let idle = last.map(|last| clock.now().saturating_duration_since(last));
        if idle.is_some_and(|idle| idle >= idle_timeout) {
            if cancel.cancel(CancelReason::IdleTimeout) {
                log::warn!("no frames for {:?}, stopping window", idle_timeout);
            }
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reasons_map_to_outcomes() {
        assert_eq!(
            WindowOutcome::from(CancelReason::Threshold),
            WindowOutcome::ThresholdReached
        );
        assert_eq!(
            WindowOutcome::from(CancelReason::Shutdown),
            WindowOutcome::Shutdown
        );
    }

    #[test]
    fn default_retry_policy_is_unbounded_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay, Duration::from_secs(1));
        assert_eq!(policy.max_attempts, None);
    }
}
