use std::time::Instant;

use super::{ConnectionParameters, SessionError, StreamClient};
use crate::cancel::CancellationSignal;
use crate::frame::Frame;

/// Bookkeeping for the one live session.
#[derive(Clone, Debug)]
pub struct CaptureSession {
    /// Connect attempt that opened this session (1-based).
    pub attempt: u64,
    pub created_at: Instant,
    pub cancel: CancellationSignal,
}

/// Owns one stream client and at most one live `CaptureSession`.
///
/// The session is disposed on disconnect, on any receive failure and on
/// cancellation. Opening a new one disposes the previous one first.
pub struct SessionConnector<C: StreamClient> {
    client: C,
    session: Option<CaptureSession>,
    attempts: u64,
}

impl<C: StreamClient> SessionConnector<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            session: None,
            attempts: 0,
        }
    }

    /// Open a session. Performs no I/O if `cancel` has already fired.
    pub fn connect(
        &mut self,
        params: &ConnectionParameters,
        cancel: &CancellationSignal,
    ) -> Result<(), SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        self.disconnect();

        self.attempts += 1;
        log::info!(
            "connecting to {} (attempt {}, transport {})",
            params.uri,
            self.attempts,
            params.transport
        );
        if let Err(e) = self.client.connect(params, cancel) {
            self.client.disconnect();
            return Err(e);
        }

        self.session = Some(CaptureSession {
            attempt: self.attempts,
            created_at: Instant::now(),
            cancel: cancel.clone(),
        });
        log::info!("connected to {}", params.uri);
        Ok(())
    }

    /// Receive frames on the live session until it ends.
    ///
    /// Internal receive timeouts are absorbed and the wait resumes, unless
    /// `cancel` has fired, in which case the result is `Cancelled`.
    pub fn receive(
        &mut self,
        cancel: &CancellationSignal,
        on_frame: &mut dyn FnMut(Frame),
    ) -> Result<(), SessionError> {
        if self.session.is_none() {
            return Err(SessionError::Protocol("no live session".to_string()));
        }

        let result = loop {
            match self.client.receive(cancel, on_frame) {
                Err(SessionError::ReceiveTimeout) if !cancel.is_cancelled() => {
                    log::debug!("receive wait expired, still waiting for frames");
                }
                Err(SessionError::ReceiveTimeout) => break Err(SessionError::Cancelled),
                Ok(()) if cancel.is_cancelled() => break Err(SessionError::Cancelled),
                other => break other,
            }
        };

        self.disconnect();
        result
    }

    /// Dispose the live session, if any.
    pub fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            log::debug!(
                "disposing session from attempt {} after {:?}",
                session.attempt,
                session.created_at.elapsed()
            );
            self.client.disconnect();
        }
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Connect attempts made so far, including ones short-circuited by the client.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

impl<C: StreamClient> Drop for SessionConnector<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use crate::session::{Credentials, RtpTransport};
    use chrono::Utc;
    use url::Url;

    #[derive(Default)]
    struct FakeClient {
        connects: u32,
        disconnects: u32,
        receive_script: Vec<Result<(), SessionError>>,
        frames_per_receive: usize,
    }

    impl StreamClient for FakeClient {
        fn connect(
            &mut self,
            _params: &ConnectionParameters,
            cancel: &CancellationSignal,
        ) -> Result<(), SessionError> {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            self.connects += 1;
            Ok(())
        }

        fn receive(
            &mut self,
            _cancel: &CancellationSignal,
            on_frame: &mut dyn FnMut(Frame),
        ) -> Result<(), SessionError> {
            for _ in 0..self.frames_per_receive {
                on_frame(Frame::new(Utc::now(), vec![1, 2, 3]));
            }
            if self.receive_script.is_empty() {
                Ok(())
            } else {
                self.receive_script.remove(0)
            }
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
        }
    }

    fn params() -> ConnectionParameters {
        ConnectionParameters {
            uri: Url::parse("stub://camera").unwrap(),
            credentials: Credentials::default(),
            transport: RtpTransport::Udp,
        }
    }

    #[test]
    fn connect_after_cancel_performs_no_io() {
        let cancel = CancellationSignal::new();
        cancel.cancel(CancelReason::Shutdown);
        let mut connector = SessionConnector::new(FakeClient::default());

        assert_eq!(connector.connect(&params(), &cancel), Err(SessionError::Cancelled));
        assert_eq!(connector.client().connects, 0);
        assert_eq!(connector.attempts(), 0);
        assert!(!connector.is_connected());
    }

    #[test]
    fn reconnect_disposes_previous_session() {
        let cancel = CancellationSignal::new();
        let mut connector = SessionConnector::new(FakeClient::default());

        connector.connect(&params(), &cancel).unwrap();
        assert_eq!(connector.session().unwrap().attempt, 1);
        connector.connect(&params(), &cancel).unwrap();
        assert_eq!(connector.session().unwrap().attempt, 2);
        assert_eq!(connector.client().disconnects, 1);
    }

    #[test]
    fn receive_timeouts_are_absorbed_until_peer_closes() {
        let cancel = CancellationSignal::new();
        let client = FakeClient {
            receive_script: vec![
                Err(SessionError::ReceiveTimeout),
                Err(SessionError::ReceiveTimeout),
                Ok(()),
            ],
            frames_per_receive: 1,
            ..FakeClient::default()
        };
        let mut connector = SessionConnector::new(client);
        connector.connect(&params(), &cancel).unwrap();

        let mut frames = 0;
        let result = connector.receive(&cancel, &mut |_frame| frames += 1);

        assert_eq!(result, Ok(()));
        assert_eq!(frames, 3);
        assert!(!connector.is_connected());
    }

    #[test]
    fn receive_timeout_after_cancel_reports_cancelled() {
        let cancel = CancellationSignal::new();
        let client = FakeClient {
            receive_script: vec![Err(SessionError::ReceiveTimeout)],
            frames_per_receive: 1,
            ..FakeClient::default()
        };
        let mut connector = SessionConnector::new(client);
        connector.connect(&params(), &cancel).unwrap();

        let signal = cancel.clone();
        let result = connector.receive(&cancel, &mut |_frame| {
            signal.cancel(CancelReason::Threshold);
        });
        assert_eq!(result, Err(SessionError::Cancelled));
    }

    #[test]
    fn receive_without_session_is_protocol_error() {
        let cancel = CancellationSignal::new();
        let mut connector = SessionConnector::new(FakeClient::default());
        let result = connector.receive(&cancel, &mut |_frame| {});
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }
}
