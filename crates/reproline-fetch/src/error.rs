//! Error type for the acquisition path.
//!
//! Every failure a fetch attempt can produce collapses into [`FetchError`],
//! and the error itself knows whether retrying can help. The rest of the
//! pipeline uses `anyhow`; this enum exists because the resilience layer
//! branches on failure class, not just on "failed".

use std::fmt;
use std::io;
use std::time::Duration;

/// One failed fetch attempt.
#[derive(Debug)]
pub enum FetchError {
    /// HTTP-level failure. `status` is `None` for connection-level errors
    /// (refused, reset, DNS) that never produced a response.
    Http {
        status: Option<u16>,
        message: String,
        /// Server-provided throttle hint, from a `Retry-After` header.
        retry_after: Option<Duration>,
    },
    /// The per-request deadline elapsed.
    Timeout(Duration),
    Io(io::Error),
    /// The circuit breaker refused the call without touching the network.
    BreakerOpen { remaining: Duration },
    /// The run's cancel token tripped.
    Cancelled,
    /// A response arrived but could not be decoded.
    Malformed(String),
}

impl FetchError {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        FetchError::Http {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
            retry_after: None,
        }
    }

    /// Whether another attempt could plausibly succeed. Throttling (429),
    /// server-side errors, connection-level failures, timeouts, and
    /// non-fatal I/O errors are transient; everything else is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http { status, .. } => {
                matches!(status, None | Some(429) | Some(500..=599))
            }
            FetchError::Timeout(_) => true,
            FetchError::Io(e) => e.kind() != io::ErrorKind::StorageFull,
            FetchError::BreakerOpen { .. } | FetchError::Cancelled | FetchError::Malformed(_) => {
                false
            }
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short class label recorded in fallback diagnostics.
    pub fn class(&self) -> &'static str {
        match self {
            FetchError::Http {
                status: Some(429), ..
            } => "http_throttled",
            FetchError::Http {
                status: Some(s), ..
            } if (500..=599).contains(s) => "http_server",
            FetchError::Http {
                status: Some(_), ..
            } => "http_client",
            FetchError::Http { status: None, .. } => "http_connect",
            FetchError::Timeout(_) => "timeout",
            FetchError::Io(_) => "io",
            FetchError::BreakerOpen { .. } => "breaker_open",
            FetchError::Cancelled => "cancelled",
            FetchError::Malformed(_) => "malformed",
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Http {
                status: Some(status),
                message,
                ..
            } => write!(f, "HTTP {status}: {message}"),
            FetchError::Http {
                status: None,
                message,
                ..
            } => write!(f, "connection failed: {message}"),
            FetchError::Timeout(limit) => {
                write!(f, "request deadline of {:.1}s elapsed", limit.as_secs_f64())
            }
            FetchError::Io(err) => write!(f, "I/O error: {err}"),
            FetchError::BreakerOpen { remaining } => write!(
                f,
                "circuit breaker open for another {:.1}s",
                remaining.as_secs_f64()
            ),
            FetchError::Cancelled => f.write_str("cancelled"),
            FetchError::Malformed(detail) => write!(f, "malformed response: {detail}"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        FetchError::Io(err)
    }
}
