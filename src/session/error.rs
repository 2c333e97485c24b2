/// Failures a stream client reports to the session layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionError {
    /// Credentials were rejected. Retried: credentials may be refreshed out
    /// of band and the camera cannot always be told apart from a flaky
    /// negotiation.
    Authentication(String),
    /// Negotiation or transport failure.
    Protocol(String),
    /// The cancellation signal was observed.
    Cancelled,
    /// An internal receive wait expired without a frame.
    ReceiveTimeout,
}

impl SessionError {
    /// Whether the window controller should wait and reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Authentication(_) | SessionError::Protocol(_)
        )
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Authentication(msg) => write!(f, "authentication failed: {}", msg),
            SessionError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            SessionError::Cancelled => write!(f, "cancelled"),
            SessionError::ReceiveTimeout => write!(f, "timed out waiting for frames"),
        }
    }
}

impl std::error::Error for SessionError {}
