//! Protocol message definitions
//!
//! Two incompatible wire protocols, parsed by separate session loops:
//!
//! - the room protocol (`ClientMessage` / `ServerMessage`), spoken on `/ws/{code}`
//! - the lobby protocol (`LobbyMessage` / `LobbyEnvelope`), spoken on `/ws`
//!
//! All messages are JSON objects discriminated by a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Maximum display name length (characters, after trimming)
pub const MAX_USERNAME_LENGTH: usize = 32;

/// Maximum chat message length (characters)
pub const MAX_CHAT_LENGTH: usize = 2000;

/// Maximum length of a color string
pub const MAX_COLOR_LENGTH: usize = 32;

/// Maximum brush size
pub const MAX_BRUSH_SIZE: f64 = 200.0;

/// Default stroke color
pub const DEFAULT_COLOR: &str = "#000000";

/// Default brush size
pub const DEFAULT_BRUSH_SIZE: f64 = 2.0;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Drawing
// ============================================================================

/// One line segment of a stroke, the unit of the canvas log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DrawOp {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_brush_size")]
    pub size: f64,
}

fn default_color() -> String {
    DEFAULT_COLOR.to_string()
}

fn default_brush_size() -> f64 {
    DEFAULT_BRUSH_SIZE
}

impl DrawOp {
    /// Create a segment with the default color and brush size
    pub fn line(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            x0,
            y0,
            x1,
            y1,
            color: default_color(),
            size: DEFAULT_BRUSH_SIZE,
        }
    }

    /// Set the stroke color
    #[cfg(test)]
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        if ![self.x0, self.y0, self.x1, self.y1].iter().all(|c| c.is_finite()) {
            return Err(ProtocolError::ValidationError(
                "coordinates must be finite numbers".to_string(),
            ));
        }
        if self.color.is_empty() || self.color.len() > MAX_COLOR_LENGTH {
            return Err(ProtocolError::ValidationError(format!(
                "color must be between 1 and {} bytes",
                MAX_COLOR_LENGTH
            )));
        }
        if !(self.size > 0.0 && self.size <= MAX_BRUSH_SIZE) {
            return Err(ProtocolError::ValidationError(format!(
                "size must be in (0, {}]",
                MAX_BRUSH_SIZE
            )));
        }
        Ok(())
    }
}

fn validate_chat(text: &str) -> ProtocolResult<()> {
    if text.chars().count() > MAX_CHAT_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "message exceeds maximum length of {} characters",
            MAX_CHAT_LENGTH
        )));
    }
    Ok(())
}

fn validate_username(name: &str) -> ProtocolResult<()> {
    if name.trim().chars().count() > MAX_USERNAME_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "username exceeds maximum length of {} characters",
            MAX_USERNAME_LENGTH
        )));
    }
    Ok(())
}

// ============================================================================
// Room Protocol: Client Messages
// ============================================================================

/// Messages sent from a room participant to the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Change the sender's display name
    UsernameChange { username: String },

    /// Draw one segment on the shared canvas
    Draw(DrawOp),

    /// Wipe the shared canvas
    ClearCanvas,

    /// Post a chat message
    Chat { message: String },

    /// Any other `type`; ignored
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Parse and validate a client message from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let message: Self = serde_json::from_str(json)?;
        message.validate()?;
        Ok(message)
    }

    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::UsernameChange { username } => validate_username(username),
            ClientMessage::Draw(op) => op.validate(),
            ClientMessage::Chat { message } => validate_chat(message),
            ClientMessage::ClearCanvas | ClientMessage::Unknown => Ok(()),
        }
    }
}

// ============================================================================
// Room Protocol: Server Messages
// ============================================================================

/// Messages sent from the server to room participants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full canvas log, sent once to a joiner before any live draw
    CanvasState { operations: Vec<DrawOp> },

    /// A participant joined the room
    UserJoined {
        user_id: Uuid,
        username: String,
        user_count: usize,
    },

    /// A participant left the room
    UserLeft {
        user_id: Uuid,
        username: String,
        user_count: usize,
    },

    /// A segment drawn by another participant
    Draw {
        user_id: Uuid,
        #[serde(flatten)]
        op: DrawOp,
    },

    /// Another participant wiped the canvas
    ClearCanvas { user_id: Uuid },

    /// Human-readable notice from the server
    SystemMessage { message: String },

    /// Chat message, delivered to the sender as well
    Chat {
        user_id: Uuid,
        username: String,
        message: String,
    },

    /// Fatal error, the connection is closed afterwards
    Error { message: String },
}

impl ServerMessage {
    /// Create a SystemMessage
    pub fn system(message: impl Into<String>) -> Self {
        ServerMessage::SystemMessage {
            message: message.into(),
        }
    }

    /// Create an Error message
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Lobby Protocol
// ============================================================================

/// Messages sent from a lobby participant to the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyMessage {
    Username {
        #[serde(default)]
        username: String,
    },
    /// The whole drawing object, passed on to other participants as received
    #[serde(skip)]
    Draw(Map<String, Value>),
    Clear,
    Text { content: String },
    #[serde(other)]
    Unknown,
}

impl LobbyMessage {
    /// Interpret a raw lobby frame
    ///
    /// Anything that is not a JSON object is taken as plain chat text. A JSON
    /// object with a known `type` but bad fields is an error. Drawing objects
    /// are kept whole, whatever fields they carry.
    pub fn parse(raw: &str) -> ProtocolResult<Self> {
        let message = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(object)) if object.get("type").and_then(Value::as_str) == Some("draw") => {
                LobbyMessage::Draw(object)
            }
            Ok(value @ Value::Object(_)) => serde_json::from_value(value)?,
            _ => LobbyMessage::Text {
                content: raw.to_string(),
            },
        };
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            LobbyMessage::Username { username } => validate_username(username),
            LobbyMessage::Text { content } => validate_chat(content),
            LobbyMessage::Draw(_) | LobbyMessage::Clear | LobbyMessage::Unknown => Ok(()),
        }
    }
}

/// Payload of a lobby envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LobbyData {
    Notice(String),
    Relay(Map<String, Value>),
}

/// Outbound lobby envelope
///
/// `Sent` marks the sender's own copy of a message, `Received` everyone else's.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LobbyEnvelope {
    Sent(LobbyData),
    Received(LobbyData),
}

impl LobbyEnvelope {
    /// A notice as seen by others
    pub fn received(notice: impl Into<String>) -> Self {
        LobbyEnvelope::Received(LobbyData::Notice(notice.into()))
    }

    /// A notice as seen by its sender
    pub fn sent(notice: impl Into<String>) -> Self {
        LobbyEnvelope::Sent(LobbyData::Notice(notice.into()))
    }

    /// A drawing object as seen by others
    pub fn relay(object: Map<String, Value>) -> Self {
        LobbyEnvelope::Received(LobbyData::Relay(object))
    }

    /// A canvas clear as seen by others
    pub fn clear() -> Self {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::from("clear"));
        Self::relay(object)
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
