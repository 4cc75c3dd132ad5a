//! Error taxonomy carried over the wire and surfaced to clients.
//!
//! The enumeration is partitioned by audience: `EXTERNAL_*` kinds reach the
//! client (and drive the accept layer's HTTP status), `INTERNAL_*` kinds are
//! logged and never leak payload detail. On the wire, errors are plain
//! strings in the response frame's error field; receivers map unknown
//! strings to [`ErrorKind::InternalError`].

use thiserror::Error;

/// Business error strings the datastore writes into response frames.
/// These are shorthands for their `EXTERNAL_*` counterparts and map back
/// onto them in [`ErrorKind::from_wire`].
pub const WIRE_INVALID_AUTH: &str = "INVALID_AUTH";
pub const WIRE_NO_CREDITS: &str = "NO_CREDITS";
pub const WIRE_INTERNAL_ERROR: &str = "INTERNAL_ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("EXTERNAL_NO_CREDITS")]
    ExternalNoCredits,
    #[error("EXTERNAL_BUFFER_OVERFLOW")]
    ExternalBufferOverflow,
    #[error("EXTERNAL_INVALID_AUTH")]
    ExternalInvalidAuth,

    #[error("INTERNAL_ENV_KEY_NOT_FOUND")]
    InternalEnvKeyNotFound,
    #[error("INTERNAL_ZMQ_NOT_CONNECTED")]
    InternalZmqNotConnected,
    #[error("INTERNAL_ZMQ_REQUEST_TIMEOUT")]
    InternalZmqRequestTimeout,
    #[error("INTERNAL_ZMQ_DESTROYED")]
    InternalZmqDestroyed,
    #[error("INTERNAL_ZMQ_INVALID_RESPONSE")]
    InternalZmqInvalidResponse,
    #[error("INTERNAL_ZMQ_NO_PENDING_REQUEST")]
    InternalZmqNoPendingRequest,
    #[error("INTERNAL_ZMQ_DECODE_FAILED")]
    InternalZmqDecodeFailed,
    #[error("INTERNAL_ERROR")]
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ExternalNoCredits => "EXTERNAL_NO_CREDITS",
            ErrorKind::ExternalBufferOverflow => "EXTERNAL_BUFFER_OVERFLOW",
            ErrorKind::ExternalInvalidAuth => "EXTERNAL_INVALID_AUTH",
            ErrorKind::InternalEnvKeyNotFound => "INTERNAL_ENV_KEY_NOT_FOUND",
            ErrorKind::InternalZmqNotConnected => "INTERNAL_ZMQ_NOT_CONNECTED",
            ErrorKind::InternalZmqRequestTimeout => "INTERNAL_ZMQ_REQUEST_TIMEOUT",
            ErrorKind::InternalZmqDestroyed => "INTERNAL_ZMQ_DESTROYED",
            ErrorKind::InternalZmqInvalidResponse => "INTERNAL_ZMQ_INVALID_RESPONSE",
            ErrorKind::InternalZmqNoPendingRequest => "INTERNAL_ZMQ_NO_PENDING_REQUEST",
            ErrorKind::InternalZmqDecodeFailed => "INTERNAL_ZMQ_DECODE_FAILED",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Maps a wire error string to a local kind. The datastore's business
    /// shorthands are recognized; anything unknown becomes `INTERNAL_ERROR`.
    pub fn from_wire(s: &str) -> ErrorKind {
        match s {
            WIRE_INVALID_AUTH | "EXTERNAL_INVALID_AUTH" => ErrorKind::ExternalInvalidAuth,
            WIRE_NO_CREDITS | "EXTERNAL_NO_CREDITS" => ErrorKind::ExternalNoCredits,
            "EXTERNAL_BUFFER_OVERFLOW" => ErrorKind::ExternalBufferOverflow,
            "INTERNAL_ENV_KEY_NOT_FOUND" => ErrorKind::InternalEnvKeyNotFound,
            "INTERNAL_ZMQ_NOT_CONNECTED" => ErrorKind::InternalZmqNotConnected,
            "INTERNAL_ZMQ_REQUEST_TIMEOUT" => ErrorKind::InternalZmqRequestTimeout,
            "INTERNAL_ZMQ_DESTROYED" => ErrorKind::InternalZmqDestroyed,
            "INTERNAL_ZMQ_INVALID_RESPONSE" => ErrorKind::InternalZmqInvalidResponse,
            "INTERNAL_ZMQ_NO_PENDING_REQUEST" => ErrorKind::InternalZmqNoPendingRequest,
            "INTERNAL_ZMQ_DECODE_FAILED" => ErrorKind::InternalZmqDecodeFailed,
            _ => ErrorKind::InternalError,
        }
    }

    /// Whether this kind is safe to surface to the end client.
    pub fn is_external(self) -> bool {
        matches!(
            self,
            ErrorKind::ExternalNoCredits
                | ErrorKind::ExternalBufferOverflow
                | ErrorKind::ExternalInvalidAuth
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        for kind in [
            ErrorKind::ExternalNoCredits,
            ErrorKind::ExternalBufferOverflow,
            ErrorKind::ExternalInvalidAuth,
            ErrorKind::InternalEnvKeyNotFound,
            ErrorKind::InternalZmqNotConnected,
            ErrorKind::InternalZmqRequestTimeout,
            ErrorKind::InternalZmqDestroyed,
            ErrorKind::InternalZmqInvalidResponse,
            ErrorKind::InternalZmqNoPendingRequest,
            ErrorKind::InternalZmqDecodeFailed,
            ErrorKind::InternalError,
        ] {
            assert_eq!(ErrorKind::from_wire(kind.as_str()), kind);
        }
    }

    #[test]
    fn test_business_shorthands_map_to_external_kinds() {
        assert_eq!(
            ErrorKind::from_wire(WIRE_INVALID_AUTH),
            ErrorKind::ExternalInvalidAuth
        );
        assert_eq!(
            ErrorKind::from_wire(WIRE_NO_CREDITS),
            ErrorKind::ExternalNoCredits
        );
    }

    #[test]
    fn test_unknown_maps_to_internal_error() {
        assert_eq!(
            ErrorKind::from_wire("SOMETHING_NEW"),
            ErrorKind::InternalError
        );
    }

    #[test]
    fn test_audience_partition() {
        assert!(ErrorKind::ExternalNoCredits.is_external());
        assert!(ErrorKind::ExternalBufferOverflow.is_external());
        assert!(!ErrorKind::InternalZmqRequestTimeout.is_external());
        assert!(!ErrorKind::InternalError.is_external());
    }
}
