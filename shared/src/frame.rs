//! Pipe-delimited framing codec.
//!
//! A request frame is `<correlation-id>|<TYPE>|<arg1>|<arg2>|...`; a response
//! frame is `<correlation-id>|<error>|<field1>|...` where an empty error
//! string signals success. Fields must not contain the delimiter, with one
//! exception: opaque blob fields (session/conversation data). The decoder
//! reassembles a blob that contains delimiters by assigning the declared
//! fields from both ends of the split and joining whatever is left over back
//! into the last string-typed field.

use crate::schema::{FieldKind, FieldSpec, Lane, MessageType};
use thiserror::Error;

pub const DELIMITER: char = '|';

/// Send and receive high-water mark for the IPC transport, in frames.
pub const IPC_HIGH_WATER: usize = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame has no correlation id")]
    MissingCorrelationId,
    #[error("correlation id is not a decimal integer: {0}")]
    BadCorrelationId(String),
    #[error("frame has no message type")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("{ty}: expected {expected} fields, got {got}")]
    TooFewFields {
        ty: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("field {name} is not a decimal integer: {value}")]
    BadNumber { name: &'static str, value: String },
    #[error("frame has trailing fields that fit no declared slot")]
    TrailingFields,
}

/// A decoded `id|TYPE|args...` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub correlation_id: u64,
    pub msg_type: MessageType,
    pub args: Vec<String>,
}

impl RequestFrame {
    /// Positional argument accessor; panics on schema mismatch, which is a
    /// programming error because decode already validated arity.
    pub fn arg(&self, idx: usize) -> &str {
        &self.args[idx]
    }

    pub fn num_arg(&self, idx: usize) -> i64 {
        // Validated at decode time.
        self.args[idx].parse().unwrap_or(0)
    }
}

/// A decoded `id|error|fields...` frame. `error.is_empty()` means success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub correlation_id: u64,
    pub error: String,
    pub fields: Vec<String>,
}

impl ResponseFrame {
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }

    pub fn field(&self, idx: usize) -> &str {
        self.fields.get(idx).map(String::as_str).unwrap_or("")
    }

    pub fn num_field(&self, idx: usize) -> i64 {
        self.field(idx).parse().unwrap_or(0)
    }
}

pub fn encode_request(correlation_id: u64, msg_type: MessageType, args: &[&str]) -> String {
    let mut out = format!("{correlation_id}{DELIMITER}{}", msg_type.as_str());
    for arg in args {
        out.push(DELIMITER);
        out.push_str(arg);
    }
    out
}

pub fn encode_response(correlation_id: u64, error: &str, fields: &[&str]) -> String {
    let mut out = format!("{correlation_id}{DELIMITER}{error}");
    for field in fields {
        out.push(DELIMITER);
        out.push_str(field);
    }
    out
}

pub fn decode_request(raw: &str) -> Result<RequestFrame, FrameError> {
    let (id_str, rest) = raw
        .split_once(DELIMITER)
        .ok_or(FrameError::MissingCorrelationId)?;
    let correlation_id = id_str
        .parse::<u64>()
        .map_err(|_| FrameError::BadCorrelationId(id_str.to_string()))?;

    let (type_str, arg_str) = match rest.split_once(DELIMITER) {
        Some((t, a)) => (t, Some(a)),
        None => (rest, None),
    };
    if type_str.is_empty() {
        return Err(FrameError::MissingType);
    }
    let msg_type = MessageType::from_wire(type_str)
        .ok_or_else(|| FrameError::UnknownType(type_str.to_string()))?;

    let specs = msg_type.request_args();
    let args = decode_fields(msg_type.as_str(), arg_str, specs)?;
    Ok(RequestFrame {
        correlation_id,
        msg_type,
        args,
    })
}

/// Decodes a response frame against the field schema of `msg_type`.
///
/// When the error string is non-empty the sender may have truncated the
/// field list, so arity is not enforced; on success every declared field
/// must be present.
pub fn decode_response(raw: &str, msg_type: MessageType) -> Result<ResponseFrame, FrameError> {
    debug_assert_eq!(msg_type.lane(), Lane::Request);
    let (id_str, rest) = raw
        .split_once(DELIMITER)
        .ok_or(FrameError::MissingCorrelationId)?;
    let correlation_id = id_str
        .parse::<u64>()
        .map_err(|_| FrameError::BadCorrelationId(id_str.to_string()))?;

    let (error, field_str) = match rest.split_once(DELIMITER) {
        Some((e, f)) => (e.to_string(), Some(f)),
        None => (rest.to_string(), None),
    };

    if !error.is_empty() {
        let fields = field_str
            .map(|f| f.split(DELIMITER).map(str::to_string).collect())
            .unwrap_or_default();
        return Ok(ResponseFrame {
            correlation_id,
            error,
            fields,
        });
    }

    let fields = decode_fields(msg_type.as_str(), field_str, msg_type.response_fields())?;
    Ok(ResponseFrame {
        correlation_id,
        error,
        fields,
    })
}

/// Peels the leading correlation id off a raw frame without decoding the
/// rest. Used by the receive loop to route before the schema is known.
pub fn peek_correlation_id(raw: &str) -> Result<u64, FrameError> {
    let id_str = raw.split(DELIMITER).next().unwrap_or("");
    id_str
        .parse::<u64>()
        .map_err(|_| FrameError::BadCorrelationId(id_str.to_string()))
}

/// Splits `field_str` into exactly `specs.len()` fields.
///
/// Surplus pieces are folded back into the last string-typed field: declared
/// fields before it are taken from the front of the split, declared fields
/// after it (always numeric) from the back, and everything between is joined
/// with the delimiter again. This is what lets an opaque blob carry `|`.
fn decode_fields(
    ty: &'static str,
    field_str: Option<&str>,
    specs: &[FieldSpec],
) -> Result<Vec<String>, FrameError> {
    let expected = specs.len();
    if expected == 0 {
        return match field_str {
            None => Ok(Vec::new()),
            Some(_) => Err(FrameError::TrailingFields),
        };
    }

    let raw = field_str.ok_or(FrameError::TooFewFields {
        ty,
        expected,
        got: 0,
    })?;
    let parts: Vec<&str> = raw.split(DELIMITER).collect();
    if parts.len() < expected {
        return Err(FrameError::TooFewFields {
            ty,
            expected,
            got: parts.len(),
        });
    }

    let fields: Vec<String> = if parts.len() == expected {
        parts.iter().map(|p| p.to_string()).collect()
    } else {
        let blob_idx = specs
            .iter()
            .rposition(|s| s.kind == FieldKind::Str)
            .ok_or(FrameError::TrailingFields)?;
        let surplus = parts.len() - expected;
        let mut fields = Vec::with_capacity(expected);
        fields.extend(parts[..blob_idx].iter().map(|p| p.to_string()));
        fields.push(parts[blob_idx..=blob_idx + surplus].join("|"));
        fields.extend(parts[blob_idx + surplus + 1..].iter().map(|p| p.to_string()));
        fields
    };

    for (spec, value) in specs.iter().zip(&fields) {
        if spec.kind == FieldKind::Num && value.parse::<i64>().is_err() {
            return Err(FrameError::BadNumber {
                name: spec.name,
                value: value.clone(),
            });
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let raw = encode_request(7, MessageType::ValidateAndLoad, &["rslive_v1_abc", "S1"]);
        assert_eq!(raw, "7|VALIDATE_AND_LOAD|rslive_v1_abc|S1");
        let frame = decode_request(&raw).unwrap();
        assert_eq!(frame.correlation_id, 7);
        assert_eq!(frame.msg_type, MessageType::ValidateAndLoad);
        assert_eq!(frame.args, vec!["rslive_v1_abc", "S1"]);
    }

    #[test]
    fn test_oneway_round_trip_with_numbers() {
        let raw = encode_request(
            3,
            MessageType::UpdateUsage,
            &["acct-1", "S1", "OPENAI", "50", "100"],
        );
        let frame = decode_request(&raw).unwrap();
        assert_eq!(frame.num_arg(3), 50);
        assert_eq!(frame.num_arg(4), 100);
    }

    #[test]
    fn test_blob_tail_recombines_delimiters() {
        let blob = r#"{"type":"session.update"}|with|pipes|"#;
        let raw = encode_request(9, MessageType::SaveSession, &["acct-1", "S1", blob]);
        let frame = decode_request(&raw).unwrap();
        assert_eq!(frame.arg(2), blob);
    }

    #[test]
    fn test_conversation_blob_with_newlines_and_pipes() {
        let blob = "user:look | here\nagent:ok";
        let raw = encode_request(1, MessageType::AppendConversation, &["a", "s", blob]);
        let frame = decode_request(&raw).unwrap();
        assert_eq!(frame.arg(2), blob);
    }

    #[test]
    fn test_too_few_fields_rejected() {
        let err = decode_request("4|VALIDATE_AND_LOAD|only-key").unwrap_err();
        assert!(matches!(err, FrameError::TooFewFields { got: 1, .. }));
        let err = decode_request("4|GET_CREDITS").unwrap_err();
        assert!(matches!(err, FrameError::TooFewFields { got: 0, .. }));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = decode_request("4|DROP_TABLES|x").unwrap_err();
        assert_eq!(err, FrameError::UnknownType("DROP_TABLES".to_string()));
    }

    #[test]
    fn test_bad_number_rejected() {
        let raw = encode_request(
            3,
            MessageType::UpdateUsage,
            &["acct-1", "S1", "OPENAI", "fifty", "100"],
        );
        let err = decode_request(&raw).unwrap_err();
        assert!(matches!(err, FrameError::BadNumber { name: "inputTokens", .. }));
    }

    #[test]
    fn test_response_round_trip() {
        let raw = encode_response(12, "", &["acct-1", "{\"type\":\"session.update\"}", "950"]);
        let frame = decode_response(&raw, MessageType::ValidateAndLoad).unwrap();
        assert!(frame.is_ok());
        assert_eq!(frame.field(0), "acct-1");
        assert_eq!(frame.num_field(2), 950);
    }

    #[test]
    fn test_response_blob_with_pipes_before_numeric_field() {
        // sessionData sits before credits, so the decoder must pull credits
        // off the back and fold the surplus into the blob.
        let blob = "instructions with | a pipe";
        let raw = encode_response(5, "", &["acct-1", blob, "1000"]);
        let frame = decode_response(&raw, MessageType::ValidateAndLoad).unwrap();
        assert_eq!(frame.field(1), blob);
        assert_eq!(frame.num_field(2), 1000);
    }

    #[test]
    fn test_error_response_tolerates_short_fields() {
        let raw = encode_response(8, "INVALID_AUTH", &[]);
        let frame = decode_response(&raw, MessageType::ValidateAndLoad).unwrap();
        assert!(!frame.is_ok());
        assert_eq!(frame.error, "INVALID_AUTH");
        assert_eq!(frame.field(2), "");
        assert_eq!(frame.num_field(2), 0);
    }

    #[test]
    fn test_success_response_missing_fields_rejected() {
        let err = decode_response("8||acct-1", MessageType::ValidateAndLoad).unwrap_err();
        assert!(matches!(err, FrameError::TooFewFields { .. }));
    }

    #[test]
    fn test_peek_correlation_id() {
        assert_eq!(peek_correlation_id("42|GET_CREDITS|a").unwrap(), 42);
        assert!(peek_correlation_id("nope|x").is_err());
    }
}
