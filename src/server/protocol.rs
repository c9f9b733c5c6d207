//! Protocol message definitions
//!
//! Defines the JSON messages exchanged between the relay and its clients:
//! inbound command envelopes, response envelopes sent back to the
//! originator, and server-pushed stream messages (welcome, frames).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::Role;

/// Current protocol version, announced in the welcome message
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Command Envelope
// ============================================================================

/// Inbound command sent by either role
///
/// Routing uses `action` when it is present and non-empty, otherwise
/// `command`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CommandEnvelope {
    /// Command identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Optional action identifier, takes precedence over `command`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Command-specific parameters
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl CommandEnvelope {
    /// Create an envelope for a plain command with no parameters
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            action: None,
            params: Map::new(),
        }
    }

    /// Attach parameters to the envelope
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Parse and validate an envelope from a raw text payload
    pub fn decode(raw: &str) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(ProtocolError::InvalidMessage(
                "envelope must be a JSON object".to_string(),
            ));
        }

        let envelope: Self = serde_json::from_value(value)?;
        if envelope.dispatch_key().is_none() {
            return Err(ProtocolError::InvalidMessage(
                "envelope has neither a command nor an action".to_string(),
            ));
        }
        Ok(envelope)
    }

    /// The routing key: `action` wins, `command` is the fallback
    pub fn dispatch_key(&self) -> Option<&str> {
        non_empty(self.action.as_deref()).or_else(|| non_empty(self.command.as_deref()))
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn non_empty(key: Option<&str>) -> Option<&str> {
    key.filter(|k| !k.trim().is_empty())
}

// ============================================================================
// Response Envelope
// ============================================================================

/// Outcome carried by a response envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Stable error codes for programmatic handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No execution-side connection is registered
    ExecutionDisconnected,
    /// Sending to the counterpart connection failed or timed out
    TransportError,
    /// The command is not accepted from the issuing role
    InvalidOrigin,
    /// Internal server error
    InternalError,
}

/// Response sent back to the connection that issued a command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    /// OK or ERROR
    pub status: ResponseStatus,
    /// Human-readable summary
    pub message: String,
    /// Optional result payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error code, present on errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl ResponseEnvelope {
    /// Create a success response
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            message: message.into(),
            data: None,
            code: None,
        }
    }

    /// Create a success response carrying data
    pub fn ok_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok(message)
        }
    }

    /// Create an error response with code
    pub fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: message.into(),
            data: None,
            code: Some(code),
        }
    }

    /// Whether this is a success response
    #[allow(dead_code)]
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Serialize the response to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Stream Messages
// ============================================================================

/// Messages pushed by the server outside the request/response cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Sent once after a connection is registered
    Welcome {
        /// Server protocol version
        version: u32,
        /// Role bound to this connection
        role: Role,
        /// Identifier assigned to this connection
        connection_id: Uuid,
    },

    /// One rendered frame, base64 encoded
    Frame {
        /// Encoded image bytes
        data: String,
    },
}

impl StreamMessage {
    /// Create a Welcome message
    pub fn welcome(role: Role, connection_id: Uuid) -> Self {
        StreamMessage::Welcome {
            version: PROTOCOL_VERSION,
            role,
            connection_id,
        }
    }

    /// Create a Frame message from raw image bytes
    pub fn frame(bytes: &[u8]) -> Self {
        StreamMessage::Frame {
            data: STANDARD.encode(bytes),
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================
