//! Streaming session layer.
//!
//! This module provides:
//! - `StreamClient`: the seam to a streaming-session protocol implementation
//! - `SessionConnector`: owns one client and at most one live session
//! - `RtspClient`: the concrete client, backed by a synthetic `stub://`
//!   source or GStreamer (feature: rtsp-gstreamer)
//!
//! Every blocking call takes the window's `CancellationSignal` and must
//! return within one poll interval of it firing.

mod connector;
mod error;
pub mod rtsp;

pub use connector::{CaptureSession, SessionConnector};
pub use error::SessionError;
pub use rtsp::RtspClient;

use anyhow::{anyhow, Result};
use url::Url;

use crate::cancel::CancellationSignal;
use crate::frame::Frame;

/// Which RTP transport the session should negotiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RtpTransport {
    #[default]
    Udp,
    Tcp,
}

impl std::str::FromStr for RtpTransport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(RtpTransport::Udp),
            "tcp" => Ok(RtpTransport::Tcp),
            other => Err(anyhow!("unknown RTP transport '{}'; expected udp or tcp", other)),
        }
    }
}

impl std::fmt::Display for RtpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RtpTransport::Udp => write!(f, "udp"),
            RtpTransport::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a client needs to open a session.
#[derive(Clone, Debug)]
pub struct ConnectionParameters {
    pub uri: Url,
    pub credentials: Credentials,
    pub transport: RtpTransport,
}

/// Streaming-session protocol client.
///
/// Implementations own the transport. `receive` delivers frames to
/// `on_frame` one at a time, in delivery order, and never overlaps calls.
pub trait StreamClient {
    /// Open a session. Must fail with `SessionError::Cancelled` without any
    /// network I/O if `cancel` has already fired.
    fn connect(
        &mut self,
        params: &ConnectionParameters,
        cancel: &CancellationSignal,
    ) -> Result<(), SessionError>;

    /// Deliver frames until the peer closes the session (`Ok`), a fatal
    /// protocol error occurs, `cancel` fires (`Cancelled`), or an internal
    /// wait expires (`ReceiveTimeout`).
    fn receive(
        &mut self,
        cancel: &CancellationSignal,
        on_frame: &mut dyn FnMut(Frame),
    ) -> Result<(), SessionError>;

    /// Tear down the current session, if any. Idempotent.
    fn disconnect(&mut self);
}

impl<C: StreamClient + ?Sized> StreamClient for Box<C> {
    fn connect(
        &mut self,
        params: &ConnectionParameters,
        cancel: &CancellationSignal,
    ) -> Result<(), SessionError> {
        (**self).connect(params, cancel)
    }

    fn receive(
        &mut self,
        cancel: &CancellationSignal,
        on_frame: &mut dyn FnMut(Frame),
    ) -> Result<(), SessionError> {
        (**self).receive(cancel, on_frame)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}
