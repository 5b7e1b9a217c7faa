//! Binary wire protocol for the collaboration session.
//!
//! Messages are bincode-encoded serde enums carried in WebSocket binary
//! frames — one enum per direction:
//!
//! ```text
//! ClientMessage: Join | Leave | Submit | SyncRequest | Cursor | Typing | Ping
//! ServerMessage: JoinReply | Committed | UserJoined | UserLeft
//!              | CursorChanged | UserTyping | SyncSnapshot
//!              | SyncOperations | Pong | Error
//! ```
//!
//! Submitted components cross the wire as loose DTOs (`count`/`text` as
//! options, counts signed) and are validated when lowered into the domain
//! type. Validation is fail-fast: the first bad component rejects the whole
//! submission before any transformation runs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::ConnectionEntry;
use crate::transform::{Operation, OperationComponent};

// ───────────────────────────────────────────────────────────────────
// Component DTOs and validation
// ───────────────────────────────────────────────────────────────────

/// Wire tag for an operation component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    Retain,
    Insert,
    Delete,
}

/// Loose wire shape of a component. Counts are signed and optional so
/// hostile or buggy clients are rejected by validation instead of failing
/// to decode with an opaque error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDto {
    pub kind: ComponentKind,
    pub count: Option<i64>,
    pub text: Option<String>,
}

impl ComponentDto {
    pub fn retain(count: i64) -> Self {
        Self {
            kind: ComponentKind::Retain,
            count: Some(count),
            text: None,
        }
    }

    pub fn insert(text: impl Into<String>) -> Self {
        Self {
            kind: ComponentKind::Insert,
            count: None,
            text: Some(text.into()),
        }
    }

    pub fn delete(count: i64) -> Self {
        Self {
            kind: ComponentKind::Delete,
            count: Some(count),
            text: None,
        }
    }

    /// Lower into the domain type, enforcing the component invariants.
    fn into_component(self, index: usize) -> Result<OperationComponent, ValidationError> {
        match self.kind {
            ComponentKind::Retain | ComponentKind::Delete => {
                let count = self.count.ok_or(ValidationError::MissingCount { index })?;
                if count < 0 {
                    return Err(ValidationError::NegativeCount { index, count });
                }
                Ok(match self.kind {
                    ComponentKind::Retain => OperationComponent::Retain(count as u64),
                    _ => OperationComponent::Delete(count as u64),
                })
            }
            ComponentKind::Insert => {
                let text = self.text.ok_or(ValidationError::MissingText { index })?;
                Ok(OperationComponent::Insert(text))
            }
        }
    }

    /// Encode a committed domain component for broadcast. Infallible: the
    /// domain type cannot express an invalid component.
    pub fn from_component(component: &OperationComponent) -> Self {
        match component {
            OperationComponent::Retain(n) => Self::retain(*n as i64),
            OperationComponent::Insert(text) => Self::insert(text.clone()),
            OperationComponent::Delete(n) => Self::delete(*n as i64),
        }
    }
}

/// Component validation failures. Fatal to the single submission, never to
/// the connection or the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Retain/Delete carried a negative count.
    NegativeCount { index: usize, count: i64 },
    /// Retain/Delete without a count.
    MissingCount { index: usize },
    /// Insert without text (empty text is legal, absent text is not).
    MissingText { index: usize },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::NegativeCount { index, count } => {
                write!(f, "Component {index} has negative count {count}")
            }
            ValidationError::MissingCount { index } => {
                write!(f, "Component {index} is missing a count")
            }
            ValidationError::MissingText { index } => {
                write!(f, "Component {index} is missing insert text")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

// ───────────────────────────────────────────────────────────────────
// Submit / committed operation shapes
// ───────────────────────────────────────────────────────────────────

/// A client's operation submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitDto {
    pub operation_id: Uuid,
    pub base_version: u64,
    pub components: Vec<ComponentDto>,
}

impl SubmitDto {
    /// Validate and lower into a domain [`Operation`].
    ///
    /// Fail-fast: the first invalid component aborts the whole lowering
    /// and nothing downstream (transform, log) ever sees partial input.
    pub fn into_operation(
        self,
        document_id: Uuid,
        user_id: Uuid,
    ) -> Result<Operation, ValidationError> {
        let mut components = Vec::with_capacity(self.components.len());
        for (index, dto) in self.components.into_iter().enumerate() {
            components.push(dto.into_component(index)?);
        }
        Ok(Operation::new(
            self.operation_id,
            document_id,
            user_id,
            self.base_version,
            components,
        ))
    }
}

/// A committed operation as broadcast to document participants and
/// returned to the submitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedOp {
    pub operation_id: Uuid,
    pub user_id: Uuid,
    pub base_version: u64,
    pub components: Vec<ComponentDto>,
}

impl CommittedOp {
    pub fn from_operation(op: &Operation) -> Self {
        Self {
            operation_id: op.id,
            user_id: op.user_id,
            base_version: op.base_version,
            components: op.components.iter().map(ComponentDto::from_component).collect(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence shapes
// ───────────────────────────────────────────────────────────────────

/// Presence entry as shown to other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantDto {
    pub user_id: Uuid,
    pub display_name: String,
    /// RGBA color for cursor/selection rendering.
    pub color: [f32; 4],
    pub is_typing: bool,
}

impl ParticipantDto {
    pub fn from_entry(entry: &ConnectionEntry) -> Self {
        Self {
            user_id: entry.user_id,
            display_name: entry.display_name.clone(),
            color: entry.color.to_array(),
            is_typing: entry.is_typing,
        }
    }
}

/// Cursor position and optional selection range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPositionDto {
    pub position: u64,
    pub has_selection: bool,
    pub selection_start: Option<u64>,
    pub selection_end: Option<u64>,
}

// ───────────────────────────────────────────────────────────────────
// Top-level messages
// ───────────────────────────────────────────────────────────────────

/// Messages from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join a document session. Must precede any other document message.
    Join {
        document_id: Uuid,
        user_id: Uuid,
        display_name: String,
    },
    /// Leave the current document session (clean exit).
    Leave,
    /// Submit an edit operation.
    Submit(SubmitDto),
    /// Request catch-up from the given version.
    SyncRequest { client_version: u64 },
    /// Cursor moved / selection changed.
    Cursor(CursorPositionDto),
    /// Typing started or stopped.
    Typing { is_typing: bool },
    /// Heartbeat.
    Ping,
}

/// Error categories carried on the wire. Every handler failure is mapped
/// to exactly one of these — raw internal errors never reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Document does not exist. Terminal — stop retrying.
    NotFound,
    /// Caller may not access the document. Terminal.
    PermissionDenied,
    /// Document lock stayed busy. Transient — safe to retry as-is.
    LockTimeout,
    /// Malformed operation. Fatal to this submission only.
    Validation,
    /// Log append failed; committed state unchanged, safe to retry.
    Storage,
    /// Request cancelled before completion.
    Cancelled,
    /// Document message sent while not joined to any document.
    NotJoined,
    /// Undecodable or out-of-order protocol frame.
    Protocol,
}

/// Messages from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Join succeeded: current content, version, and who is here.
    JoinReply {
        content: String,
        version: u64,
        participants: Vec<ParticipantDto>,
    },
    /// An operation was committed (sent to everyone on the document,
    /// including the submitter, who uses it as the submit acknowledgment).
    Committed(CommittedOp),
    /// A user joined the document.
    UserJoined(ParticipantDto),
    /// A user left the document.
    UserLeft { user_id: Uuid },
    /// A collaborator's cursor moved.
    CursorChanged {
        user_id: Uuid,
        cursor: CursorPositionDto,
    },
    /// A collaborator started or stopped typing.
    UserTyping { user_id: Uuid, is_typing: bool },
    /// Catch-up response: full snapshot (pending replay was empty or too
    /// large to stream).
    SyncSnapshot { content: String, version: u64 },
    /// Catch-up response: incremental replay in ascending version order.
    SyncOperations { operations: Vec<CommittedOp> },
    /// Heartbeat response.
    Pong,
    /// A request failed. `message` is short and user-safe.
    Error { code: ErrorCode, message: String },
}

/// Protocol errors (framing layer).
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

impl ServerMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Build a coded error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::OperationComponent;

    #[test]
    fn test_client_message_roundtrip() {
        let msg = ClientMessage::Join {
            document_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            display_name: "Alice".to_string(),
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_submit_roundtrip() {
        let msg = ClientMessage::Submit(SubmitDto {
            operation_id: Uuid::new_v4(),
            base_version: 7,
            components: vec![
                ComponentDto::retain(3),
                ComponentDto::insert("hello"),
                ComponentDto::delete(2),
            ],
        });
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_server_message_roundtrip() {
        let msg = ServerMessage::Committed(CommittedOp {
            operation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            base_version: 12,
            components: vec![ComponentDto::retain(5), ComponentDto::insert("x")],
        });
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ClientMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ServerMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_lowering_valid_submit() {
        let dto = SubmitDto {
            operation_id: Uuid::new_v4(),
            base_version: 4,
            components: vec![
                ComponentDto::retain(3),
                ComponentDto::insert(""),
                ComponentDto::delete(0),
            ],
        };
        let doc = Uuid::new_v4();
        let user = Uuid::new_v4();
        let op = dto.clone().into_operation(doc, user).unwrap();

        assert_eq!(op.id, dto.operation_id);
        assert_eq!(op.document_id, doc);
        assert_eq!(op.user_id, user);
        assert_eq!(op.base_version, 4);
        assert_eq!(
            op.components,
            vec![
                OperationComponent::Retain(3),
                OperationComponent::Insert(String::new()),
                OperationComponent::Delete(0),
            ]
        );
    }

    #[test]
    fn test_negative_count_fails_fast() {
        for dto in [ComponentDto::retain(-1), ComponentDto::delete(-5)] {
            let submit = SubmitDto {
                operation_id: Uuid::new_v4(),
                base_version: 0,
                components: vec![ComponentDto::retain(2), dto],
            };
            let err = submit
                .into_operation(Uuid::new_v4(), Uuid::new_v4())
                .unwrap_err();
            assert!(matches!(err, ValidationError::NegativeCount { index: 1, .. }));
        }
    }

    #[test]
    fn test_missing_fields_fail() {
        let no_count = SubmitDto {
            operation_id: Uuid::new_v4(),
            base_version: 0,
            components: vec![ComponentDto {
                kind: ComponentKind::Retain,
                count: None,
                text: None,
            }],
        };
        assert!(matches!(
            no_count.into_operation(Uuid::new_v4(), Uuid::new_v4()),
            Err(ValidationError::MissingCount { index: 0 })
        ));

        let no_text = SubmitDto {
            operation_id: Uuid::new_v4(),
            base_version: 0,
            components: vec![ComponentDto {
                kind: ComponentKind::Insert,
                count: None,
                text: None,
            }],
        };
        assert!(matches!(
            no_text.into_operation(Uuid::new_v4(), Uuid::new_v4()),
            Err(ValidationError::MissingText { index: 0 })
        ));
    }

    #[test]
    fn test_committed_op_mirrors_operation() {
        let op = Operation::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            9,
            vec![
                OperationComponent::Retain(1),
                OperationComponent::Insert("ab".to_string()),
            ],
        );
        let committed = CommittedOp::from_operation(&op);
        assert_eq!(committed.operation_id, op.id);
        assert_eq!(committed.user_id, op.user_id);
        assert_eq!(committed.base_version, 9);
        assert_eq!(
            committed.components,
            vec![ComponentDto::retain(1), ComponentDto::insert("ab")]
        );
    }

    #[test]
    fn test_cursor_message_roundtrip() {
        let msg = ClientMessage::Cursor(CursorPositionDto {
            position: 42,
            has_selection: true,
            selection_start: Some(40),
            selection_end: Some(55),
        });
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_error_reply_shape() {
        let msg = ServerMessage::error(ErrorCode::LockTimeout, "document busy, retry");
        match &msg {
            ServerMessage::Error { code, message } => {
                assert_eq!(*code, ErrorCode::LockTimeout);
                assert_eq!(message, "document busy, retry");
            }
            other => panic!("Expected error, got {other:?}"),
        }
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}
