/// Top-level error type for the public client API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input (empty question, bad path, etc.).
    #[error("validation error: {0}")]
    Validation(String),
    /// Network or stream I/O failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Backend answered with a non-success status or an `error` field.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },
    /// The stream carried an explicit `error` record.
    #[error("stream failed: {message}")]
    StreamFailed { message: String },
    /// The stream was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Message used when the backend gives no usable error text.
pub(crate) const GENERIC_FAILURE: &str = "Unknown error";

impl ClientError {
    pub(crate) fn api(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            GENERIC_FAILURE.to_string()
        } else {
            message
        };
        Self::Api { status, message }
    }

    pub(crate) fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Returns `true` for failures a caller may reasonably retry as a whole
    /// request (transport errors and 5xx responses).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(value: reqwest::Error) -> Self {
        if let Some(status) = value.status() {
            return Self::api(status.as_u16(), value.to_string());
        }
        // The exchange worked but the body was not what we expected; retrying
        // would fetch the same body again.
        if value.is_decode() {
            return Self::protocol_msg(format!("invalid response body: {value}"));
        }
        Self::transport(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_message_falls_back_to_generic() {
        let err = ClientError::api(502, "  ");
        assert_eq!(
            err,
            ClientError::Api {
                status: 502,
                message: GENERIC_FAILURE.into()
            }
        );
    }

    #[test]
    fn retryable_covers_transport_and_server_errors_only() {
        assert!(ClientError::transport("reset").is_retryable());
        assert!(ClientError::api(503, "busy").is_retryable());
        assert!(!ClientError::api(400, "bad").is_retryable());
        assert!(
            !ClientError::StreamFailed {
                message: "x".into()
            }
            .is_retryable()
        );
        assert!(!ClientError::protocol_msg("invalid response body").is_retryable());
    }
}
