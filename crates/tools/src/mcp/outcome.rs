use serde_json::Value;
use thiserror::Error;

/// What a successful `tools/call` produced.
///
/// Results are tagged rather than guessed: `structuredContent`, or a text item
/// that is a JSON object/array, becomes `Structured`; any other text (JSON
/// scalars included) is kept verbatim as `Text`.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolPayload {
    Structured(Value),
    Text(String),
}

impl ToolPayload {
    pub fn from_text(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(v @ (Value::Object(_) | Value::Array(_))) => ToolPayload::Structured(v),
            _ => ToolPayload::Text(text.to_string()),
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            ToolPayload::Structured(v) => Some(v),
            ToolPayload::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ToolPayload::Text(s) => Some(s),
            ToolPayload::Structured(_) => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            ToolPayload::Structured(v) => v,
            ToolPayload::Text(s) => Value::String(s),
        }
    }
}

/// Failure classes a capability call can end in. None of them poison the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("connection to backend '{0}' lost")]
    ConnectionLost(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("tool '{0}' not found in any backend")]
    ToolNotFound(String),

    #[error("backend '{0}' is not registered")]
    BackendNotFound(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Payload(ToolPayload),
    /// The call succeeded but carried no text.
    NoResult,
    Failed(CallError),
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, CallOutcome::Failed(_))
    }

    pub fn payload(&self) -> Option<&ToolPayload> {
        match self {
            CallOutcome::Payload(p) => Some(p),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CallError> {
        match self {
            CallOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            CallOutcome::Payload(p) => Some(p.into_value()),
            _ => None,
        }
    }

    /// Interpret the result the way the accessibility driver reports success:
    /// only a structured `{"success": true}` counts.
    pub fn reported_success(&self) -> bool {
        match self {
            CallOutcome::Payload(ToolPayload::Structured(v)) => {
                v.get("success").and_then(Value::as_bool) == Some(true)
            }
            _ => false,
        }
    }

    /// A structured `{"success": false}` answer.
    pub fn reported_refusal(&self) -> bool {
        match self {
            CallOutcome::Payload(ToolPayload::Structured(v)) => {
                v.get("success").and_then(Value::as_bool) == Some(false)
            }
            _ => false,
        }
    }
}
