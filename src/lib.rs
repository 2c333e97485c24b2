//! Camera capture module.
//!
//! Captures frames from a networked camera over RTSP for a bounded capture
//! window, persists each frame as its own file, then hands the files to an
//! upload client.
//!
//! # Flow
//!
//! `Orchestrator` -> `CaptureWindowController` -> `SessionConnector`
//! (connect, receive) -> `FrameSink` (per frame) -> window ends ->
//! `UploadCoordinator` -> `UploadClient`.
//!
//! # Module Structure
//!
//! - `cancel`: set-once cancellation signal shared by every blocking path
//! - `frame`: `Frame`, `CaptureArtifact`, `Clock`
//! - `sink`: frame persistence
//! - `session`: stream client seam, session connector, RTSP backends
//! - `window`: capture window state machine, retry policy, idle watchdog
//! - `upload`: upload coordinator and the MQTT upload client
//! - `orchestrator`: capture-then-upload sequencing
//! - `config`: file + environment configuration

pub mod cancel;
pub mod config;
pub mod frame;
pub mod orchestrator;
pub mod session;
pub mod sink;
pub mod upload;
pub mod window;

pub use cancel::{CancelReason, CancellationSignal};
pub use config::CaptureConfig;
pub use frame::{CaptureArtifact, Clock, Frame, SystemClock};
pub use orchestrator::{Orchestrator, RunReport};
pub use session::{
    rtsp::RtspClientConfig, CaptureSession, ConnectionParameters, Credentials, RtpTransport,
    RtspClient, SessionConnector, SessionError, StreamClient,
};
pub use sink::FrameSink;
pub use upload::{
    MqttUploadClient, UploadClient, UploadConnection, UploadCoordinator, UploadError,
    UploadOutcome,
};
pub use window::{
    CaptureWindowController, RetryPolicy, WindowOutcome, WindowReport, WindowSettings,
    WindowState,
};
