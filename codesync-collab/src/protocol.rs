//! JSON envelope protocol for project collaboration.
//!
//! Wire format: one JSON object per WebSocket text frame.
//! ```text
//! {
//!   "type":      "cursor_position",   ← closed set, see EnvelopeKind
//!   "projectId": "42",
//!   "userId":    "7",
//!   "userName":  "Ada",
//!   "timestamp": 1718000000123,       ← ms, strictly increasing per sender
//!   "fileId":    "main.js",           ┐
//!   "line":      5,                   ├ payload fields
//!   "column":    3                    ┘
//! }
//! ```
//!
//! The relay backend nests server-originated payloads under a `data`
//! object and emits numeric ids; [`Envelope::decode`] accepts both shapes.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Ids arrive as JSON strings or numbers depending on the sender.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(text) => text,
            RawId::Unsigned(n) => n.to_string(),
            RawId::Signed(n) => n.to_string(),
        }
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                RawId::deserialize(deserializer).map(|raw| Self(raw.into_string()))
            }
        }
    };
}

string_id!(
    /// Identity of a participant, unique within a project session.
    ParticipantId
);
string_id!(
    /// Identity of a project file.
    FileId
);
string_id!(
    /// Identity of a project; one collaboration socket per project.
    ProjectId
);

/// Envelope types. Closed set: anything else fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    UserJoined,
    UserLeft,
    UsersList,
    CursorPosition,
    FileSelection,
    CodeChange,
    FileSaved,
    UserTyping,
    ChatMessage,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 9] = [
        EnvelopeKind::UserJoined,
        EnvelopeKind::UserLeft,
        EnvelopeKind::UsersList,
        EnvelopeKind::CursorPosition,
        EnvelopeKind::FileSelection,
        EnvelopeKind::CodeChange,
        EnvelopeKind::FileSaved,
        EnvelopeKind::UserTyping,
        EnvelopeKind::ChatMessage,
    ];

    /// The `type` tag used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::UserJoined => "user_joined",
            EnvelopeKind::UserLeft => "user_left",
            EnvelopeKind::UsersList => "users_list",
            EnvelopeKind::CursorPosition => "cursor_position",
            EnvelopeKind::FileSelection => "file_selection",
            EnvelopeKind::CodeChange => "code_change",
            EnvelopeKind::FileSaved => "file_saved",
            EnvelopeKind::UserTyping => "user_typing",
            EnvelopeKind::ChatMessage => "chat_message",
        }
    }

    /// Parse a wire `type` tag.
    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }

    /// Kinds a client may send. Roster kinds are produced by the relay only.
    pub fn is_client_originated(self) -> bool {
        !matches!(
            self,
            EnvelopeKind::UserJoined | EnvelopeKind::UserLeft | EnvelopeKind::UsersList
        )
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Participant as announced by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl ParticipantInfo {
    /// Participant info without a colour.
    pub fn new(id: impl Into<ParticipantId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: None,
        }
    }
}

/// Type-specific envelope body.
///
/// Line and column stay signed on the wire so that invalid remote
/// positions can be recognised and rejected rather than failing decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Payload {
    UserJoined {
        user: ParticipantInfo,
    },
    /// The leaving participant is the envelope's `userId`.
    UserLeft,
    UsersList {
        users: Vec<ParticipantInfo>,
    },
    CursorPosition {
        file_id: FileId,
        line: i64,
        column: i64,
    },
    FileSelection {
        file_id: FileId,
        #[serde(default)]
        file_name: String,
    },
    CodeChange {
        file_id: FileId,
        content: String,
    },
    FileSaved {
        file_id: FileId,
        #[serde(default)]
        file_name: String,
        content: String,
    },
    UserTyping {
        file_id: FileId,
        is_typing: bool,
    },
    ChatMessage {
        message: String,
    },
}

impl Payload {
    /// The wire `type` this payload serializes under.
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Payload::UserJoined { .. } => EnvelopeKind::UserJoined,
            Payload::UserLeft => EnvelopeKind::UserLeft,
            Payload::UsersList { .. } => EnvelopeKind::UsersList,
            Payload::CursorPosition { .. } => EnvelopeKind::CursorPosition,
            Payload::FileSelection { .. } => EnvelopeKind::FileSelection,
            Payload::CodeChange { .. } => EnvelopeKind::CodeChange,
            Payload::FileSaved { .. } => EnvelopeKind::FileSaved,
            Payload::UserTyping { .. } => EnvelopeKind::UserTyping,
            Payload::ChatMessage { .. } => EnvelopeKind::ChatMessage,
        }
    }
}

/// The wire unit. Immutable once sent; no identity, no deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub project_id: ProjectId,
    #[serde(default)]
    pub user_id: ParticipantId,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        self.payload.kind()
    }

    /// Whether this envelope was sent by `participant`.
    pub fn is_from(&self, participant: &ParticipantId) -> bool {
        &self.user_id == participant
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Classify a JSON text frame into a typed envelope.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let mut value: Value =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let object = value.as_object_mut().ok_or(ProtocolError::NotAnObject)?;

        // Hoist `data.*` (backend shape) unless the top level already has the key.
        if let Some(Value::Object(data)) = object.remove("data") {
            for (key, field) in data {
                object.entry(key).or_insert(field);
            }
        }
        object.retain(|_, field| !field.is_null());

        let tag = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        let kind = EnvelopeKind::from_wire(tag)
            .ok_or_else(|| ProtocolError::UnknownType(tag.to_string()))?;

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind: kind.as_str(),
            reason: e.to_string(),
        })
    }
}

/// Who is speaking on a collaboration socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub project_id: ProjectId,
    pub project_name: String,
    pub user_id: ParticipantId,
    pub user_name: String,
}

impl SessionIdentity {
    pub fn new(
        project_id: impl Into<ProjectId>,
        user_id: impl Into<ParticipantId>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            project_name: String::new(),
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }

    /// Display name of the project, informational only.
    pub fn with_project_name(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = project_name.into();
        self
    }
}

/// Stamps outgoing payloads with the session identity and a send time.
pub struct EnvelopeCodec {
    identity: SessionIdentity,
    last_timestamp: i64,
}

impl EnvelopeCodec {
    pub fn new(identity: SessionIdentity) -> Self {
        Self {
            identity,
            last_timestamp: 0,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Wall-clock milliseconds, forced strictly past the previous stamp.
    pub fn stamp(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last_timestamp = now.max(self.last_timestamp + 1);
        self.last_timestamp
    }

    /// Wrap a payload with identity and a fresh timestamp.
    pub fn envelope(&mut self, payload: Payload) -> Envelope {
        let timestamp = self.stamp();
        Envelope {
            project_id: self.identity.project_id.clone(),
            user_id: self.identity.user_id.clone(),
            user_name: self.identity.user_name.clone(),
            timestamp,
            payload,
        }
    }

    /// Stamp and serialize a payload.
    pub fn encode(&mut self, payload: Payload) -> Result<String, ProtocolError> {
        self.envelope(payload).encode()
    }

    /// Same as [`Envelope::decode`]; the codec holds no decode state.
    pub fn decode(frame: &str) -> Result<Envelope, ProtocolError> {
        Envelope::decode(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no type tag")]
    MissingType,
    #[error("unknown envelope type {0:?}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> SessionIdentity {
        SessionIdentity::new("42", "7", "Ada").with_project_name("demo")
    }

    #[test]
    fn test_encode_carries_identity_and_camel_case_fields() {
        let mut codec = EnvelopeCodec::new(identity());
        let frame = codec
            .encode(Payload::CursorPosition {
                file_id: FileId::from("main.js"),
                line: 5,
                column: 3,
            })
            .unwrap();

        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "cursor_position");
        assert_eq!(value["projectId"], "42");
        assert_eq!(value["userId"], "7");
        assert_eq!(value["userName"], "Ada");
        assert_eq!(value["fileId"], "main.js");
        assert_eq!(value["line"], 5);
        assert_eq!(value["column"], 3);
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_codec_timestamps_strictly_increase() {
        let mut codec = EnvelopeCodec::new(identity());
        let mut previous = 0;
        for _ in 0..100 {
            let envelope = codec.envelope(Payload::ChatMessage {
                message: "hi".into(),
            });
            assert!(envelope.timestamp > previous);
            previous = envelope.timestamp;
        }
    }

    #[test]
    fn test_decode_client_frame() {
        let frame = r#"{"type":"code_change","fileId":"app.py","content":"print(1)",
            "userId":"3","userName":"Bob","projectId":"42","timestamp":10}"#;
        let envelope = Envelope::decode(frame).unwrap();

        assert_eq!(envelope.kind(), EnvelopeKind::CodeChange);
        assert_eq!(envelope.user_id, ParticipantId::from("3"));
        assert_eq!(envelope.timestamp, 10);
        assert_eq!(
            envelope.payload,
            Payload::CodeChange {
                file_id: FileId::from("app.py"),
                content: "print(1)".into(),
            }
        );
    }

    #[test]
    fn test_decode_backend_nested_join_with_numeric_ids() {
        let frame = r##"{"type":"user_joined","projectId":"1","userId":"5",
            "fileId":null,"content":"User joined the collaboration","timestamp":99,
            "data":{"user":{"id":5,"name":"Eve","fullName":"Eve","color":"#3b82f6"}}}"##;
        let envelope = Envelope::decode(frame).unwrap();

        match envelope.payload {
            Payload::UserJoined { user } => {
                assert_eq!(user.id, ParticipantId::from("5"));
                assert_eq!(user.name, "Eve");
                assert_eq!(user.color.as_deref(), Some("#3b82f6"));
            }
            other => panic!("expected user_joined, got {other:?}"),
        }
        assert_eq!(envelope.user_name, "");
    }

    #[test]
    fn test_decode_user_left() {
        let frame = r#"{"type":"user_left","userId":"9","projectId":"1","timestamp":5}"#;
        let envelope = Envelope::decode(frame).unwrap();
        assert_eq!(envelope.payload, Payload::UserLeft);
        assert_eq!(envelope.user_id, ParticipantId::from("9"));
    }

    #[test]
    fn test_decode_users_list() {
        let frame = r#"{"type":"users_list","users":[{"id":1,"name":"A"},{"id":"2","name":"B"}]}"#;
        let envelope = Envelope::decode(frame).unwrap();
        match envelope.payload {
            Payload::UsersList { users } => {
                let ids: Vec<&str> = users.iter().map(|u| u.id.as_str()).collect();
                assert_eq!(ids, vec!["1", "2"]);
            }
            other => panic!("expected users_list, got {other:?}"),
        }
        assert!(envelope.user_id.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Envelope::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(Envelope::decode("[1,2]"), Err(ProtocolError::NotAnObject));
        assert_eq!(
            Envelope::decode(r#"{"fileId":"a"}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            Envelope::decode(r#"{"type":"teleport"}"#),
            Err(ProtocolError::UnknownType("teleport".into()))
        );
    }

    #[test]
    fn test_decode_rejects_missing_payload_field() {
        let result = Envelope::decode(r#"{"type":"cursor_position","fileId":"a","line":1}"#);
        match result {
            Err(ProtocolError::InvalidPayload { kind, .. }) => assert_eq!(kind, "cursor_position"),
            other => panic!("expected invalid payload, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_position_survives_decode() {
        let envelope =
            Envelope::decode(r#"{"type":"cursor_position","fileId":"a","line":-1,"column":0}"#)
                .unwrap();
        assert_eq!(
            envelope.payload,
            Payload::CursorPosition {
                file_id: FileId::from("a"),
                line: -1,
                column: 0,
            }
        );
    }

    #[test]
    fn test_kind_wire_tags() {
        for kind in EnvelopeKind::ALL {
            assert_eq!(EnvelopeKind::from_wire(kind.as_str()), Some(kind));
        }
        assert!(EnvelopeKind::CodeChange.is_client_originated());
        assert!(!EnvelopeKind::UsersList.is_client_originated());
    }

    #[test]
    fn test_typing_field_name() {
        let mut codec = EnvelopeCodec::new(identity());
        let frame = codec
            .encode(Payload::UserTyping {
                file_id: FileId::from("x.js"),
                is_typing: true,
            })
            .unwrap();
        assert!(frame.contains(r#""isTyping":true"#));
        assert!(frame.contains(r#""type":"user_typing""#));
    }
}
