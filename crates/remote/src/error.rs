//! Errors from the remote API layer.
//!
//! The fetcher never lets a failure escape as a panic or an unclassified
//! error: every failure becomes data for the polling loop's backoff
//! decision.

use harvest_core::backoff::{is_throttle_message, is_throttle_status};

/// Errors from remote API calls.
#[derive(Debug, thiserror::Error)]
pub enum RemoteApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote returned a non-2xx status code.
    #[error("remote API error ({code}): {body}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Raw response body for classification and debugging.
        body: String,
    },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Coarse classification driving the backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network-level failure; retried with error backoff.
    Transport,
    /// The endpoint is rate limiting or blocking the caller (403/429/503
    /// or a recognizable message). Takes the error-backoff path from the
    /// first occurrence.
    Throttled,
    /// Any other non-2xx response.
    Server,
    /// Unparseable body; treated as an empty poll, never fatal.
    Malformed,
}

impl RemoteApiError {
    /// Classify this error for the backoff policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteApiError::Transport(_) => ErrorClass::Transport,
            RemoteApiError::Status { code, body } => {
                if is_throttle_status(*code) || is_throttle_message(body) {
                    ErrorClass::Throttled
                } else {
                    ErrorClass::Server
                }
            }
            RemoteApiError::Malformed(_) => ErrorClass::Malformed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(code: u16, body: &str) -> RemoteApiError {
        RemoteApiError::Status { code, body: body.into() }
    }

    #[test]
    fn throttle_status_codes_classified() {
        assert_eq!(status_error(429, "").class(), ErrorClass::Throttled);
        assert_eq!(status_error(403, "").class(), ErrorClass::Throttled);
        assert_eq!(status_error(503, "").class(), ErrorClass::Throttled);
    }

    #[test]
    fn throttle_message_classified_regardless_of_code() {
        assert_eq!(
            status_error(400, "rate limit exceeded for key").class(),
            ErrorClass::Throttled,
        );
    }

    #[test]
    fn generic_server_error_classified() {
        assert_eq!(status_error(500, "internal error").class(), ErrorClass::Server);
        assert_eq!(status_error(404, "not found").class(), ErrorClass::Server);
    }

    #[test]
    fn transport_error_classified() {
        // Build a reqwest error from an invalid URL.
        let req_err = reqwest::Client::new().get("://bad").build().unwrap_err();
        assert_eq!(RemoteApiError::Transport(req_err).class(), ErrorClass::Transport);
    }

    #[test]
    fn malformed_body_classified() {
        let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        assert_eq!(RemoteApiError::Malformed(serde_err).class(), ErrorClass::Malformed);
    }

    #[test]
    fn status_error_display() {
        let err = status_error(502, "bad gateway");
        assert_eq!(err.to_string(), "remote API error (502): bad gateway");
    }
}
