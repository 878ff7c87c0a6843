use reqwest::StatusCode;
use std::error::Error as StdError;

/// Coarse classification of a [`DownloadError`], used by reporters and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Decode,
    Io,
    Cancelled,
}

/// Transport-level failure class of a network error.
///
/// Derived by walking the error's source chain; reqwest does not expose DNS
/// or routing failures directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// The host name could not be resolved.
    UnknownHost,
    /// The host or its network is unreachable.
    Unreachable,
    Timeout,
    /// The connection was refused, reset or aborted.
    Connection,
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("transfer manager has been shut down")]
    Shutdown,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("partial transfer for {url}: expected {expected} bytes, got {received}")]
    PartialTransfer {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("response body exceeds the {limit} byte limit")]
    BodyTooLarge { limit: usize },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled | Self::Shutdown => ErrorKind::Cancelled,
            Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::InvalidUrl { .. }
            | Self::PartialTransfer { .. } => ErrorKind::Network,
            Self::Decryption { .. } | Self::BodyTooLarge { .. } => ErrorKind::Decode,
            Self::Io { .. } | Self::Configuration { .. } | Self::Internal { .. } => ErrorKind::Io,
        }
    }

    /// Transport failure class, `None` for errors that did not come from the wire.
    pub fn transport_failure(&self) -> Option<TransportFailure> {
        match self {
            Self::Network { source } => Some(classify_reqwest_error(source)),
            _ => None,
        }
    }

    /// Whether a whole transfer attempt that ended with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::Shutdown
            | Self::InvalidUrl { .. }
            | Self::BodyTooLarge { .. }
            | Self::Decryption { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || crate::retry::RETRYABLE_STATUS_CODES.contains(&status.as_u16())
            }
            Self::Network { source } => !matches!(
                classify_reqwest_error(source),
                TransportFailure::UnknownHost | TransportFailure::Unreachable
            ),
            Self::Io { .. } | Self::PartialTransfer { .. } => true,
        }
    }
}

/// Classify a reqwest error by its source chain.
pub fn classify_reqwest_error(err: &reqwest::Error) -> TransportFailure {
    if err.is_timeout() {
        return TransportFailure::Timeout;
    }

    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::HostUnreachable | std::io::ErrorKind::NetworkUnreachable => {
                    return TransportFailure::Unreachable;
                }
                std::io::ErrorKind::TimedOut => return TransportFailure::Timeout,
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => return TransportFailure::Connection,
                _ => {}
            }
        }
        if is_dns_failure_message(&cause.to_string()) {
            return TransportFailure::UnknownHost;
        }
        source = cause.source();
    }

    if err.is_connect() || err.is_request() || err.is_body() {
        TransportFailure::Connection
    } else {
        TransportFailure::Other
    }
}

/// Check if an error message comes from a failed name lookup
fn is_dns_failure_message(message: &str) -> bool {
    message.contains("dns error")
        || message.contains("failed to lookup address")
        || message.contains("Name or service not known")
        || message.contains("No such host is known")
        || message.contains("nodename nor servname provided")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_retryability() {
        let retry = |code: u16| {
            DownloadError::http_status(StatusCode::from_u16(code).unwrap(), "http://x/", "GET")
                .is_retryable()
        };
        assert!(retry(500));
        assert!(retry(502));
        assert!(retry(429));
        assert!(retry(408));
        assert!(!retry(404));
        assert!(!retry(403));
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        assert!(!DownloadError::Cancelled.is_retryable());
        assert!(!DownloadError::Shutdown.is_retryable());
        assert!(!DownloadError::decryption("bad padding").is_retryable());
        assert!(DownloadError::from(std::io::Error::other("disk")).is_retryable());
    }

    #[test]
    fn kinds() {
        assert_eq!(DownloadError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(DownloadError::decryption("x").kind(), ErrorKind::Decode);
        assert_eq!(
            DownloadError::from(std::io::Error::other("disk")).kind(),
            ErrorKind::Io
        );
    }

    #[test]
    fn dns_messages() {
        assert!(is_dns_failure_message(
            "dns error: failed to lookup address information: Name or service not known"
        ));
        assert!(!is_dns_failure_message("connection reset by peer"));
    }
}
