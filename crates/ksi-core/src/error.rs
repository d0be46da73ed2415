//! Wire-level error taxonomy.
//!
//! These codes surface in the `{error: {code, message}}` envelope sent to
//! clients. Service crates keep their own `thiserror` enums internally and
//! map to one of these codes at the boundary.

use serde::{Deserialize, Serialize};

/// Error codes visible on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Transport received a line that is not valid JSON.
    InvalidJson,
    /// Envelope is missing the `event` field or it is malformed.
    InvalidEvent,
    /// Event schema validation rejected the payload.
    Validation,
    /// Unknown composition, session, subscription, or agent.
    NotFound,
    /// A handler raised and no peer produced a result.
    HandlerError,
    /// Correlation future expired before a response arrived.
    Timeout,
    /// The LLM provider failed; the message carries stderr.
    ProviderError,
    /// The request was explicitly cancelled.
    Cancelled,
    /// Unexpected internal failure.
    InternalError,
}

impl ErrorCode {
    /// Wire representation of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidJson => "INVALID_JSON",
            Self::InvalidEvent => "INVALID_EVENT",
            Self::Validation => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
            Self::HandlerError => "HANDLER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_screaming_case() {
        let json = serde_json::to_string(&ErrorCode::InvalidJson).unwrap();
        assert_eq!(json, "\"INVALID_JSON\"");
        let back: ErrorCode = serde_json::from_str("\"PROVIDER_ERROR\"").unwrap();
        assert_eq!(back, ErrorCode::ProviderError);
    }

    #[test]
    fn test_as_str_matches_serde() {
        for code in [
            ErrorCode::InvalidJson,
            ErrorCode::InvalidEvent,
            ErrorCode::Validation,
            ErrorCode::NotFound,
            ErrorCode::HandlerError,
            ErrorCode::Timeout,
            ErrorCode::ProviderError,
            ErrorCode::Cancelled,
            ErrorCode::InternalError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
