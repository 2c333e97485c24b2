//! RTSP stream client.
//!
//! `RtspClient` picks a backend from the stream URI:
//! - `stub://...` synthetic frames, for running without a camera
//! - `rtsp://` / `rtsps://` GStreamer (feature: rtsp-gstreamer)
//!
//! The synthetic backend understands two query parameters:
//! `fps` (default 10) and `frames` (close the session after that many
//! frames; unlimited when absent).

use anyhow::Result;
#[cfg(not(feature = "rtsp-gstreamer"))]
use anyhow::anyhow;
use chrono::Utc;
use std::time::Duration;
use url::Url;

use super::{ConnectionParameters, SessionError, StreamClient};
use crate::cancel::CancellationSignal;
use crate::frame::Frame;

const DEFAULT_SYNTHETIC_FPS: u32 = 10;

/// Tunables shared by all backends.
#[derive(Clone, Debug)]
pub struct RtspClientConfig {
    /// How long `connect` waits for the session to start playing.
    pub connect_timeout: Duration,
    /// How long `receive` waits without a frame before reporting a timeout.
    pub frame_timeout: Duration,
}

impl Default for RtspClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            frame_timeout: Duration::from_secs(5),
        }
    }
}

pub struct RtspClient {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticSession),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(gst::GstreamerSession),
}

impl RtspClient {
    pub fn new(uri: &Url, config: RtspClientConfig) -> Result<Self> {
        if uri.scheme() == "stub" {
            return Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticSession::new(uri, config)),
            });
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(Self {
                backend: RtspBackend::Gstreamer(gst::GstreamerSession::new(config)?),
            })
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            let _ = config;
            Err(anyhow!(
                "{} streams require the rtsp-gstreamer feature",
                uri.scheme()
            ))
        }
    }

    /// Frames delivered across all sessions of this client.
    pub fn frames_received(&self) -> u64 {
        match &self.backend {
            RtspBackend::Synthetic(session) => session.frames_sent,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(session) => session.frames_received(),
        }
    }
}

impl StreamClient for RtspClient {
    fn connect(
        &mut self,
        params: &ConnectionParameters,
        cancel: &CancellationSignal,
    ) -> Result<(), SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        match &mut self.backend {
            RtspBackend::Synthetic(session) => session.connect(params),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(session) => session.connect(params, cancel),
        }
    }

    fn receive(
        &mut self,
        cancel: &CancellationSignal,
        on_frame: &mut dyn FnMut(Frame),
    ) -> Result<(), SessionError> {
        match &mut self.backend {
            RtspBackend::Synthetic(session) => session.receive(cancel, on_frame),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(session) => session.receive(cancel, on_frame),
        }
    }

    fn disconnect(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(session) => session.disconnect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(session) => session.disconnect(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticSession {
    interval: Duration,
    frame_limit: Option<u64>,
    frame_timeout: Duration,
    connected: bool,
    frames_in_session: u64,
    frames_sent: u64,
}

impl SyntheticSession {
    fn new(uri: &Url, config: RtspClientConfig) -> Self {
        let mut fps = DEFAULT_SYNTHETIC_FPS;
        let mut frame_limit = None;
        for (key, value) in uri.query_pairs() {
            match key.as_ref() {
                "fps" => fps = value.parse().unwrap_or(DEFAULT_SYNTHETIC_FPS).max(1),
                "frames" => frame_limit = value.parse().ok(),
                _ => {}
            }
        }
        Self {
            interval: Duration::from_millis(1000 / fps as u64),
            frame_limit,
            frame_timeout: config.frame_timeout,
            connected: false,
            frames_in_session: 0,
            frames_sent: 0,
        }
    }

    fn connect(&mut self, params: &ConnectionParameters) -> Result<(), SessionError> {
        self.connected = true;
        self.frames_in_session = 0;
        log::info!("RtspClient: connected to {} (synthetic)", params.uri);
        Ok(())
    }

    fn receive(
        &mut self,
        cancel: &CancellationSignal,
        on_frame: &mut dyn FnMut(Frame),
    ) -> Result<(), SessionError> {
        if !self.connected {
            return Err(SessionError::Protocol("session not connected".to_string()));
        }
        if self.interval > self.frame_timeout {
            if !cancel.wait_timeout(self.frame_timeout) {
                return Err(SessionError::Cancelled);
            }
            return Err(SessionError::ReceiveTimeout);
        }
        loop {
            if self
                .frame_limit
                .is_some_and(|limit| self.frames_in_session >= limit)
            {
                log::info!("RtspClient: synthetic stream ended");
                return Ok(());
            }
            if !cancel.wait_timeout(self.interval) {
                return Err(SessionError::Cancelled);
            }
            self.frames_in_session += 1;
            self.frames_sent += 1;
            on_frame(Frame::new(Utc::now(), synthetic_payload(self.frames_sent)));
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// PNG signature followed by the frame counter; enough for downstream
/// tooling to tell frames apart.
fn synthetic_payload(counter: u64) -> Vec<u8> {
    let mut data = vec![0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
    data.extend_from_slice(&counter.to_be_bytes());
    data
}

// ----------------------------------------------------------------------------
// Production RTSP session using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
mod gst {
    use anyhow::{Context, Result};
    use chrono::Utc;
    use gstreamer::prelude::*;
    use std::time::Instant;

    use super::RtspClientConfig;
    use crate::cancel::{CancellationSignal, POLL_INTERVAL};
    use crate::frame::Frame;
    use crate::session::{ConnectionParameters, RtpTransport, SessionError};

    pub(super) struct GstreamerSession {
        config: RtspClientConfig,
        pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
        frames_received: u64,
    }

    impl GstreamerSession {
        pub(super) fn new(config: RtspClientConfig) -> Result<Self> {
            gstreamer::init().context("initialize gstreamer")?;
            Ok(Self {
                config,
                pipeline: None,
                frames_received: 0,
            })
        }

        pub(super) fn frames_received(&self) -> u64 {
            self.frames_received
        }

        pub(super) fn connect(
            &mut self,
            params: &ConnectionParameters,
            cancel: &CancellationSignal,
        ) -> Result<(), SessionError> {
            self.disconnect();
            let (pipeline, appsink) = build_pipeline(params)
                .map_err(|e| SessionError::Protocol(format!("{:#}", e)))?;

            pipeline
                .set_state(gstreamer::State::Playing)
                .map_err(|e| SessionError::Protocol(format!("start pipeline: {}", e)))?;
            self.pipeline = Some((pipeline.clone(), appsink));

            let bus = pipeline
                .bus()
                .ok_or_else(|| SessionError::Protocol("pipeline has no bus".to_string()))?;
            let deadline = Instant::now() + self.config.connect_timeout;
            while Instant::now() < deadline {
                if cancel.is_cancelled() {
                    self.disconnect();
                    return Err(SessionError::Cancelled);
                }
                let Some(message) = bus.timed_pop(clock_time(POLL_INTERVAL)) else {
                    continue;
                };
                use gstreamer::MessageView;
                match message.view() {
                    MessageView::Error(err) => {
                        self.disconnect();
                        return Err(map_bus_error(err));
                    }
                    MessageView::StateChanged(change)
                        if change.current() == gstreamer::State::Playing
                            && message.src() == Some(pipeline.upcast_ref::<gstreamer::Object>()) =>
                    {
                        log::info!("RtspClient: connected to {}", params.uri);
                        return Ok(());
                    }
                    _ => {}
                }
            }
            self.disconnect();
            Err(SessionError::Protocol(
                "timed out negotiating RTSP session".to_string(),
            ))
        }

        pub(super) fn receive(
            &mut self,
            cancel: &CancellationSignal,
            on_frame: &mut dyn FnMut(Frame),
        ) -> Result<(), SessionError> {
            let Some((pipeline, appsink)) = self.pipeline.clone() else {
                return Err(SessionError::Protocol("session not connected".to_string()));
            };
            let mut last_frame_at = Instant::now();
            loop {
                if cancel.is_cancelled() {
                    return Err(SessionError::Cancelled);
                }
                if let Some(bus) = pipeline.bus() {
                    while let Some(message) = bus.pop() {
                        use gstreamer::MessageView;
                        match message.view() {
                            MessageView::Error(err) => return Err(map_bus_error(err)),
                            MessageView::Eos(..) => return Ok(()),
                            _ => {}
                        }
                    }
                }

                match appsink.try_pull_sample(clock_time(POLL_INTERVAL)) {
                    Some(sample) => {
                        let buffer = sample.buffer().ok_or_else(|| {
                            SessionError::Protocol("sample missing buffer".to_string())
                        })?;
                        let map = buffer.map_readable().map_err(|e| {
                            SessionError::Protocol(format!("map buffer: {}", e))
                        })?;
                        self.frames_received += 1;
                        last_frame_at = Instant::now();
                        on_frame(Frame::new(Utc::now(), map.as_slice().to_vec()));
                    }
                    None if appsink.is_eos() => return Ok(()),
                    None if last_frame_at.elapsed() >= self.config.frame_timeout => {
                        return Err(SessionError::ReceiveTimeout);
                    }
                    None => {}
                }
            }
        }

        pub(super) fn disconnect(&mut self) {
            if let Some((pipeline, _)) = self.pipeline.take() {
                if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                    log::warn!("RtspClient: failed to stop pipeline: {}", e);
                }
            }
        }
    }

    impl Drop for GstreamerSession {
        fn drop(&mut self) {
            self.disconnect();
        }
    }

    fn build_pipeline(
        params: &ConnectionParameters,
    ) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
        let protocols = match params.transport {
            RtpTransport::Udp => "udp",
            RtpTransport::Tcp => "tcp",
        };
        let description = format!(
            "rtspsrc name=src location={} latency=0 protocols={} ! decodebin ! videoconvert ! \
             pngenc ! appsink name=appsink sync=false max-buffers=4",
            params.uri, protocols
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        if !params.credentials.is_empty() {
            let src = pipeline
                .by_name("src")
                .context("rtspsrc element missing from pipeline")?;
            src.set_property("user-id", params.credentials.username.as_str());
            src.set_property("user-pw", params.credentials.password.as_str());
        }

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;
        Ok((pipeline, appsink))
    }

    fn map_bus_error(err: &gstreamer::message::Error) -> SessionError {
        let message = format!(
            "gstreamer error from {:?}: {}",
            err.src().map(|s| s.path_string()),
            err.error()
        );
        match err.error().kind::<gstreamer::ResourceError>() {
            Some(gstreamer::ResourceError::NotAuthorized) => SessionError::Authentication(message),
            _ => SessionError::Protocol(message),
        }
    }

    fn clock_time(duration: std::time::Duration) -> gstreamer::ClockTime {
        gstreamer::ClockTime::from_mseconds(duration.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use crate::session::{Credentials, RtpTransport};

    fn params(uri: &str) -> ConnectionParameters {
        ConnectionParameters {
            uri: Url::parse(uri).unwrap(),
            credentials: Credentials::default(),
            transport: RtpTransport::Udp,
        }
    }

    #[test]
    fn synthetic_stream_closes_after_frame_limit() -> Result<()> {
        let p = params("stub://camera?fps=100&frames=3");
        let mut client = RtspClient::new(&p.uri, RtspClientConfig::default())?;
        let cancel = CancellationSignal::new();
        client.connect(&p, &cancel)?;

        let mut frames = Vec::new();
        client.receive(&cancel, &mut |frame| frames.push(frame))?;

        assert_eq!(frames.len(), 3);
        assert_eq!(client.frames_received(), 3);
        assert!(frames.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        Ok(())
    }

    #[test]
    fn synthetic_stream_stops_on_cancel() -> Result<()> {
        let p = params("stub://camera?fps=100");
        let mut client = RtspClient::new(&p.uri, RtspClientConfig::default())?;
        let cancel = CancellationSignal::new();
        client.connect(&p, &cancel)?;

        let signal = cancel.clone();
        let mut count = 0;
        let result = client.receive(&cancel, &mut |_frame| {
            count += 1;
            if count == 2 {
                signal.cancel(CancelReason::Threshold);
            }
        });

        assert_eq!(result, Err(SessionError::Cancelled));
        assert_eq!(count, 2);
        Ok(())
    }

    #[test]
    fn connect_when_cancelled_is_rejected() -> Result<()> {
        let p = params("stub://camera");
        let mut client = RtspClient::new(&p.uri, RtspClientConfig::default())?;
        let cancel = CancellationSignal::new();
        cancel.cancel(CancelReason::Shutdown);
        assert_eq!(client.connect(&p, &cancel), Err(SessionError::Cancelled));
        Ok(())
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn real_rtsp_requires_feature() {
        let uri = Url::parse("rtsp://192.0.2.1:8554/raw").unwrap();
        assert!(RtspClient::new(&uri, RtspClientConfig::default()).is_err());
    }
}
