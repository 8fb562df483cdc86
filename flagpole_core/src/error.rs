use std::sync::Arc;

/// Result type used throughout the SDK for operations that can fail with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur inside the SDK runtime.
///
/// These are infrastructure errors (network, configuration, lifecycle). Flag evaluation problems
/// are not represented here; they surface through [`crate::eval::Reason::Error`] so that
/// evaluation never fails the caller.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base/stream/events URI configuration.
    #[error("invalid service URI configuration")]
    InvalidUri(#[source] url::ParseError),

    /// The SDK key contains characters that cannot be sent in an HTTP header.
    #[error("SDK key is not a valid header value")]
    InvalidSdkKey,

    /// The request was rejected with a status that will never succeed on retry (401, 403, and
    /// most other 4xx). The owning subsystem shuts down when it sees this.
    #[error("received HTTP {0}, giving up permanently")]
    UnrecoverableResponse(u16),

    /// The service answered with a status we don't handle (retried by the caller).
    #[error("unexpected HTTP response status {0}")]
    UnexpectedResponse(u16),

    /// The service sent a body that could not be decoded.
    #[error("malformed service response: {0}")]
    MalformedResponse(String),

    /// A worker thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl Error {
    /// Classifies an HTTP status per the retry policy: 401/403 and every other 4xx except
    /// 400, 408 and 429 are permanent failures; everything else is worth retrying.
    pub fn for_status(status: u16) -> Error {
        if http_status_is_unrecoverable(status) {
            Error::UnrecoverableResponse(status)
        } else {
            Error::UnexpectedResponse(status)
        }
    }

    /// True if this error means the owning subsystem should stop trying.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::UnrecoverableResponse(_))
    }
}

pub(crate) fn http_status_is_unrecoverable(status: u16) -> bool {
    match status {
        400 | 408 | 429 => false,
        s => (400..500).contains(&s),
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(401, true)]
    #[test_case(403, true)]
    #[test_case(404, true)]
    #[test_case(400, false)]
    #[test_case(408, false)]
    #[test_case(429, false)]
    #[test_case(500, false)]
    #[test_case(503, false)]
    fn status_classification(status: u16, unrecoverable: bool) {
        assert_eq!(http_status_is_unrecoverable(status), unrecoverable);
        assert_eq!(Error::for_status(status).is_unrecoverable(), unrecoverable);
    }
}
