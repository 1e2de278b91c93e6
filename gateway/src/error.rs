use http::StatusCode;

/// Broad classification of a request-pipeline failure. The kind drives
/// metrics labels and log levels; the HTTP status on [`ChainError`] drives
/// the wire response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing, malformed, unknown, or revoked credential (400/401/403).
    ClientAuth,
    /// Authenticated but not authorized for this API/version/path (403).
    Policy,
    /// Rate or quota exceeded (429).
    RateExceeded,
    /// Upstream unreachable or timed out (502/503/504).
    UpstreamUnavailable,
    /// Internal-loop depth ceiling exceeded (500).
    LoopOverflow,
    /// Anything else (500).
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClientAuth => "client_auth",
            ErrorKind::Policy => "policy",
            ErrorKind::RateExceeded => "rate_exceeded",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::LoopOverflow => "loop_overflow",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Error returned by a pipeline step to short-circuit the chain.
///
/// The terminal error handler renders `{"error": "<message>"}` with the
/// carried status and no downstream step runs.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ChainError {
    pub kind: ErrorKind,
    pub status: StatusCode,
    pub message: String,
}

impl ChainError {
    pub fn auth(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ClientAuth,
            status,
            message: message.into(),
        }
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Policy,
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::RateExceeded,
            status: StatusCode::TOO_MANY_REQUESTS,
            message: message.into(),
        }
    }

    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::UpstreamUnavailable,
            status,
            message: message.into(),
        }
    }

    pub fn loop_overflow(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::LoopOverflow,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

/// Storage-layer failure. Transient errors are logged and treated as cache
/// misses for negative caches, and as 5xx on session-required paths.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
