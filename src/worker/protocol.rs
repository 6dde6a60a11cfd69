//! Protocol types for worker communication.
//!
//! A call names an operation, carries its arguments as JSON values, and
//! optionally targets a prepared statement. Every call gets exactly one
//! reply. Over a byte stream, both are wrapped in frames carrying a
//! correlation id, one JSON object per line.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::core::{CoreError, StatementId};

/// Operation that creates the worker's database core.
pub const CONSTRUCTOR: &str = "constructor";

// ============================================================================
// Call/Reply Envelope
// ============================================================================

/// A call sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Operation name (e.g., "prepare", "step").
    pub operation: String,
    /// Positional arguments.
    #[serde(default)]
    pub arguments: Vec<JsonValue>,
    /// Target statement, for statement operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_id: Option<StatementId>,
}

impl CallEnvelope {
    pub fn new(operation: impl Into<String>, arguments: Vec<JsonValue>) -> Self {
        Self {
            operation: operation.into(),
            arguments,
            statement_id: None,
        }
    }

    pub fn on_statement(
        statement_id: StatementId,
        operation: impl Into<String>,
        arguments: Vec<JsonValue>,
    ) -> Self {
        Self {
            operation: operation.into(),
            arguments,
            statement_id: Some(statement_id),
        }
    }

    pub fn constructor() -> Self {
        Self::new(CONSTRUCTOR, Vec::new())
    }

    pub fn is_constructor(&self) -> bool {
        self.operation == CONSTRUCTOR && self.statement_id.is_none()
    }
}

/// A failed call, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Stable error name (e.g., "AlreadyMounted").
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Where the error was raised, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorDescriptor {
    /// Describe a core error raised while running `operation`.
    pub fn from_core(err: &CoreError, operation: &str) -> Self {
        let message = err.to_string();
        let stack = format!(
            "{}: {}\n    at {} ({})",
            err.name(),
            message,
            operation,
            err.family().as_str()
        );
        Self {
            name: err.name().to_string(),
            message,
            stack: Some(stack),
        }
    }
}

/// The single reply to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// `false` on the wire when the call succeeded.
    #[serde(with = "error_or_false")]
    pub error: Option<ErrorDescriptor>,
    /// Operation output (null when the operation returns nothing).
    #[serde(default)]
    pub output: JsonValue,
}

impl ReplyEnvelope {
    pub fn ok(output: JsonValue) -> Self {
        Self {
            error: None,
            output,
        }
    }

    pub fn err(error: ErrorDescriptor) -> Self {
        Self {
            error: Some(error),
            output: JsonValue::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

mod error_or_false {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Flag(bool),
        Error(ErrorDescriptor),
    }

    pub fn serialize<S: Serializer>(
        error: &Option<ErrorDescriptor>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match error {
            Some(e) => e.serialize(serializer),
            None => serializer.serialize_bool(false),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ErrorDescriptor>, D::Error> {
        match Wire::deserialize(deserializer)? {
            Wire::Flag(false) => Ok(None),
            Wire::Flag(true) => Err(serde::de::Error::custom(
                "error flag must be false or an error object",
            )),
            Wire::Error(e) => Ok(Some(e)),
        }
    }
}

// ============================================================================
// Operation Whitelists
// ============================================================================

/// Operations callable on the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseOp {
    Mount,
    Close,
    Run,
    Execute,
    Prepare,
    Export,
    Wipe,
    SaveChanges,
    GetRowsModified,
    IsOpen,
}

impl DatabaseOp {
    pub const ALL: [DatabaseOp; 10] = [
        DatabaseOp::Mount,
        DatabaseOp::Close,
        DatabaseOp::Run,
        DatabaseOp::Execute,
        DatabaseOp::Prepare,
        DatabaseOp::Export,
        DatabaseOp::Wipe,
        DatabaseOp::SaveChanges,
        DatabaseOp::GetRowsModified,
        DatabaseOp::IsOpen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseOp::Mount => "mount",
            DatabaseOp::Close => "close",
            DatabaseOp::Run => "run",
            DatabaseOp::Execute => "execute",
            DatabaseOp::Prepare => "prepare",
            DatabaseOp::Export => "export",
            DatabaseOp::Wipe => "wipe",
            DatabaseOp::SaveChanges => "saveChanges",
            DatabaseOp::GetRowsModified => "getRowsModified",
            DatabaseOp::IsOpen => "isOpen",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }
}

/// Operations callable on a prepared statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementOp {
    Bind,
    Step,
    Get,
    GetColumnNames,
    GetAsObject,
    Reset,
    Free,
    Run,
}

impl StatementOp {
    pub const ALL: [StatementOp; 8] = [
        StatementOp::Bind,
        StatementOp::Step,
        StatementOp::Get,
        StatementOp::GetColumnNames,
        StatementOp::GetAsObject,
        StatementOp::Reset,
        StatementOp::Free,
        StatementOp::Run,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementOp::Bind => "bind",
            StatementOp::Step => "step",
            StatementOp::Get => "get",
            StatementOp::GetColumnNames => "getColumnNames",
            StatementOp::GetAsObject => "getAsObject",
            StatementOp::Reset => "reset",
            StatementOp::Free => "free",
            StatementOp::Run => "run",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }
}

// ============================================================================
// Stream Frames
// ============================================================================

/// A call on a byte stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFrame {
    /// Correlation id, echoed by the reply.
    pub id: String,
    #[serde(flatten)]
    pub call: CallEnvelope,
}

/// A reply on a byte stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: String,
    #[serde(flatten)]
    pub reply: ReplyEnvelope,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_wire_shape() {
        let call = CallEnvelope::new("prepare", vec![json!("SELECT ?"), json!([1])]);
        assert_eq!(
            serde_json::to_string(&call).unwrap(),
            r#"{"operation":"prepare","arguments":["SELECT ?",[1]]}"#
        );
        let call = CallEnvelope::on_statement(3, "step", vec![]);
        assert_eq!(
            serde_json::to_string(&call).unwrap(),
            r#"{"operation":"step","arguments":[],"statement_id":3}"#
        );
    }

    #[test]
    fn test_reply_error_is_false_on_success() {
        let reply = ReplyEnvelope::ok(json!(3));
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"error":false,"output":3}"#
        );
        let back: ReplyEnvelope = serde_json::from_str(r#"{"error":false}"#).unwrap();
        assert!(back.is_ok());
        assert_eq!(back.output, JsonValue::Null);
        assert!(serde_json::from_str::<ReplyEnvelope>(r#"{"error":true}"#).is_err());
    }

    #[test]
    fn test_reply_error_round_trips_through_frame() {
        let descriptor = ErrorDescriptor::from_core(&CoreError::StatementClosed, "step");
        let frame = ReplyFrame {
            id: "abc".into(),
            reply: ReplyEnvelope::err(descriptor.clone()),
        };
        let text = serde_json::to_string(&frame).unwrap();
        let back: ReplyFrame = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, "abc");
        assert_eq!(back.reply.error, Some(descriptor));
    }

    #[test]
    fn test_call_frame_flattens_envelope() {
        let text = r#"{"id":"1","operation":"get","arguments":[[1]],"statement_id":7}"#;
        let frame: CallFrame = serde_json::from_str(text).unwrap();
        assert_eq!(frame.call.statement_id, Some(7));
        assert_eq!(frame.call.arguments, vec![json!([1])]);
    }

    #[test]
    fn test_whitelists_are_disjoint_by_owner() {
        assert_eq!(DatabaseOp::from_name("saveChanges"), Some(DatabaseOp::SaveChanges));
        assert_eq!(DatabaseOp::from_name("step"), None);
        assert_eq!(StatementOp::from_name("getAsObject"), Some(StatementOp::GetAsObject));
        assert_eq!(StatementOp::from_name("__proto__"), None);
        assert_eq!(DatabaseOp::from_name("constructor"), None);
    }
}
