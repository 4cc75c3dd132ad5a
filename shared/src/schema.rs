//! Central message schema for the gateway <-> datastore protocol.
//!
//! Every message type declares its delivery lane, its ordered request
//! arguments, and (for request/response types) its ordered response fields.
//! The codec in [`crate::frame`] validates frames against these specs, so
//! adding a message type means adding it here and nowhere else.

/// Which delivery lane a message type travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Correlated request/response; the caller registers a pending record
    /// and waits for a reply frame carrying the same correlation id.
    Request,
    /// Fire-and-forget; no pending record, no reply, failures log only.
    Oneway,
}

/// Declared type of a single frame field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Arbitrary UTF-8 not containing the delimiter, except when it is the
    /// final field of a frame (opaque blob tail).
    Str,
    /// Decimal integer.
    Num,
}

/// One named, typed field in a request or response frame.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn str_field(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Str,
    }
}

const fn num_field(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Num,
    }
}

/// All message types spoken over the IPC socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ValidateAndLoad,
    GetCredits,
    UpdateUsage,
    SaveSession,
    AppendConversation,
}

const VALIDATE_AND_LOAD_ARGS: &[FieldSpec] = &[str_field("apiKey"), str_field("sessionId")];
const VALIDATE_AND_LOAD_FIELDS: &[FieldSpec] = &[
    str_field("accountId"),
    str_field("sessionData"),
    num_field("credits"),
];

const GET_CREDITS_ARGS: &[FieldSpec] = &[str_field("accountId")];
const GET_CREDITS_FIELDS: &[FieldSpec] = &[num_field("credits")];

const UPDATE_USAGE_ARGS: &[FieldSpec] = &[
    str_field("accountId"),
    str_field("sessionId"),
    str_field("provider"),
    num_field("inputTokens"),
    num_field("outputTokens"),
];

const SAVE_SESSION_ARGS: &[FieldSpec] = &[
    str_field("accountId"),
    str_field("sessionId"),
    str_field("sessionData"),
];

const APPEND_CONVERSATION_ARGS: &[FieldSpec] = &[
    str_field("accountId"),
    str_field("sessionId"),
    str_field("conversationData"),
];

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::ValidateAndLoad,
        MessageType::GetCredits,
        MessageType::UpdateUsage,
        MessageType::SaveSession,
        MessageType::AppendConversation,
    ];

    /// Wire name carried in the second field of a request frame.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::ValidateAndLoad => "VALIDATE_AND_LOAD",
            MessageType::GetCredits => "GET_CREDITS",
            MessageType::UpdateUsage => "UPDATE_USAGE",
            MessageType::SaveSession => "SAVE_SESSION",
            MessageType::AppendConversation => "APPEND_CONVERSATION",
        }
    }

    pub fn from_wire(name: &str) -> Option<MessageType> {
        MessageType::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn lane(self) -> Lane {
        match self {
            MessageType::ValidateAndLoad | MessageType::GetCredits => Lane::Request,
            MessageType::UpdateUsage
            | MessageType::SaveSession
            | MessageType::AppendConversation => Lane::Oneway,
        }
    }

    /// Ordered request argument specs (everything after `id|TYPE|`).
    pub fn request_args(self) -> &'static [FieldSpec] {
        match self {
            MessageType::ValidateAndLoad => VALIDATE_AND_LOAD_ARGS,
            MessageType::GetCredits => GET_CREDITS_ARGS,
            MessageType::UpdateUsage => UPDATE_USAGE_ARGS,
            MessageType::SaveSession => SAVE_SESSION_ARGS,
            MessageType::AppendConversation => APPEND_CONVERSATION_ARGS,
        }
    }

    /// Ordered response field specs (everything after `id|error|`).
    /// Empty for oneway types, which never produce a reply.
    pub fn response_fields(self) -> &'static [FieldSpec] {
        match self {
            MessageType::ValidateAndLoad => VALIDATE_AND_LOAD_FIELDS,
            MessageType::GetCredits => GET_CREDITS_FIELDS,
            MessageType::UpdateUsage
            | MessageType::SaveSession
            | MessageType::AppendConversation => &[],
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_round_trip() {
        for ty in MessageType::ALL {
            assert_eq!(MessageType::from_wire(ty.as_str()), Some(ty));
        }
        assert_eq!(MessageType::from_wire("NOT_A_TYPE"), None);
    }

    #[test]
    fn test_lanes() {
        assert_eq!(MessageType::ValidateAndLoad.lane(), Lane::Request);
        assert_eq!(MessageType::GetCredits.lane(), Lane::Request);
        assert_eq!(MessageType::UpdateUsage.lane(), Lane::Oneway);
        assert_eq!(MessageType::SaveSession.lane(), Lane::Oneway);
        assert_eq!(MessageType::AppendConversation.lane(), Lane::Oneway);
    }

    #[test]
    fn test_oneway_types_have_no_response_fields() {
        for ty in MessageType::ALL {
            if ty.lane() == Lane::Oneway {
                assert!(ty.response_fields().is_empty(), "{ty} should not reply");
            } else {
                assert!(!ty.response_fields().is_empty());
            }
        }
    }

    #[test]
    fn test_opaque_blobs_are_final_args() {
        // Blob-carrying fields must travel last so the decoder can recombine
        // a tail that itself contains the delimiter.
        let save = MessageType::SaveSession.request_args();
        assert_eq!(save.last().unwrap().name, "sessionData");
        let append = MessageType::AppendConversation.request_args();
        assert_eq!(append.last().unwrap().name, "conversationData");
        let load = MessageType::ValidateAndLoad.response_fields();
        // credits is numeric and cannot contain the delimiter, so sessionData
        // one slot earlier is safe only because credits always parses; the
        // decoder special-cases this (see frame::decode_response).
        assert_eq!(load[1].name, "sessionData");
    }
}
