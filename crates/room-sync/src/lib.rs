//! Collaborative code rooms
//! Room content and presence live in a realtime room store; this crate
//! holds the session controller that binds a room to local editor state,
//! the store protocols, and a WebSocket server/client for them.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod document;
pub use document::*;

mod store;
pub use store::*;

mod presence;
pub use presence::*;

mod debounce;
pub use debounce::*;

mod echo;
pub use echo::*;

mod session;
pub use session::*;

mod sync;
pub use sync::*;

mod server;
pub use server::*;

mod client;
pub use client::*;

mod routes;
pub use routes::*;

mod config;
pub use config::*;

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("store error: {0}")]
    StoreError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("invalid room id: {0:?}")]
    InvalidRoomId(String),

    #[error("invalid route: {0}")]
    InvalidRoute(String),

    #[error("no room is open")]
    RoomNotOpen,

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandbox::SandboxError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RoomError {
    fn from(e: serde_json::Error) -> Self {
        RoomError::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RoomError>;

/// Server-assigned point in time
pub type ServerTimestamp = chrono::DateTime<chrono::Utc>;

const MAX_ROOM_ID_LEN: usize = 128;

/// Opaque room identifier.
///
/// Generated ids are UUIDs, but anything a user types is accepted as long
/// as it can live in a single URL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_ROOM_ID_LEN
            && !id
                .chars()
                .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '?' | '#'));

        if valid {
            Ok(Self(id))
        } else {
            Err(RoomError::InvalidRoomId(id))
        }
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Room id typed into a join form: surrounding whitespace is ignored,
    /// blank input means "no room"
    pub fn from_user_input(input: &str) -> Option<Self> {
        Self::new(input.trim()).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = RoomError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

/// Identifier of one editing session (one open tab / terminal),
/// random and stable for the session's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_validation() {
        assert!(RoomId::new("abc-123").is_ok());
        assert!(RoomId::new("").is_err());
        assert!(RoomId::new("a/b").is_err());
        assert!(RoomId::new("a b").is_err());
        assert!(RoomId::new("a?b").is_err());
        assert!(RoomId::new("x".repeat(MAX_ROOM_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_room_id_from_user_input() {
        assert_eq!(
            RoomId::from_user_input("  my-room \n"),
            Some(RoomId::new("my-room").unwrap())
        );
        assert_eq!(RoomId::from_user_input("   "), None);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = RoomId::generate();
        let b = RoomId::generate();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_room_id_serde_validates() {
        let id: RoomId = serde_json::from_str("\"room-1\"").unwrap();
        assert_eq!(id.as_str(), "room-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"room-1\"");
        assert!(serde_json::from_str::<RoomId>("\"a/b\"").is_err());
    }
}
