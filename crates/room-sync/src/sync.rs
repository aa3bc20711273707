/// WebSocket synchronization protocol between room clients and the room server
use serde::{Deserialize, Serialize};

use crate::{PresenceEntry, PresenceHandle, Result, RoomDocument, RoomId, RoomPatch, SessionId};

/// Correlates a response with its request, chosen by the client
pub type RequestId = u64;

/// Identifies one subscription on a connection, chosen by the client
pub type SubscriptionId = u64;

/// Message types exchanged between client and server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncMessage {
    // Room documents
    #[serde(rename = "get_room")]
    GetRoom {
        request_id: RequestId,
        room_id: RoomId,
    },

    #[serde(rename = "room")]
    Room {
        request_id: RequestId,
        document: Option<RoomDocument>,
    },

    #[serde(rename = "create_room")]
    CreateRoom {
        request_id: RequestId,
        room_id: RoomId,
        content: String,
    },

    #[serde(rename = "room_created")]
    RoomCreated { request_id: RequestId, created: bool },

    #[serde(rename = "upsert_merge")]
    UpsertMerge {
        request_id: RequestId,
        room_id: RoomId,
        patch: RoomPatch,
    },

    #[serde(rename = "ack")]
    Ack { request_id: RequestId },

    // Presence
    #[serde(rename = "add_presence")]
    AddPresence {
        request_id: RequestId,
        room_id: RoomId,
        session_id: SessionId,
    },

    #[serde(rename = "presence_added")]
    PresenceAdded {
        request_id: RequestId,
        handle: PresenceHandle,
    },

    #[serde(rename = "remove_presence")]
    RemovePresence {
        request_id: RequestId,
        handle: PresenceHandle,
    },

    // Subscriptions
    #[serde(rename = "subscribe_room")]
    SubscribeRoom {
        subscription_id: SubscriptionId,
        room_id: RoomId,
    },

    #[serde(rename = "room_changed")]
    RoomChanged {
        subscription_id: SubscriptionId,
        document: RoomDocument,
    },

    #[serde(rename = "subscribe_presence")]
    SubscribePresence {
        subscription_id: SubscriptionId,
        room_id: RoomId,
    },

    #[serde(rename = "presence_snapshot")]
    PresenceSnapshot {
        subscription_id: SubscriptionId,
        entries: Vec<PresenceEntry>,
    },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { subscription_id: SubscriptionId },

    // Error handling
    #[serde(rename = "error")]
    Error {
        request_id: Option<RequestId>,
        message: String,
    },

    // Heartbeat
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,
}

impl SyncMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Request this message answers, if it is a response
    pub fn response_to(&self) -> Option<RequestId> {
        match self {
            SyncMessage::Room { request_id, .. }
            | SyncMessage::RoomCreated { request_id, .. }
            | SyncMessage::Ack { request_id }
            | SyncMessage::PresenceAdded { request_id, .. } => Some(*request_id),
            SyncMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_messages_are_tagged() {
        let msg = SyncMessage::UpsertMerge {
            request_id: 7,
            room_id: RoomId::new("r").unwrap(),
            patch: RoomPatch::content("x"),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "upsert_merge",
                "request_id": 7,
                "room_id": "r",
                "patch": { "content": "x" }
            })
        );

        let ping = SyncMessage::from_json(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, SyncMessage::Ping);
    }

    #[test]
    fn test_invalid_room_id_rejected_on_decode() {
        let text = r#"{"type":"get_room","request_id":1,"room_id":"a/b"}"#;
        assert!(SyncMessage::from_json(text).is_err());
    }

    #[test]
    fn test_response_correlation() {
        assert_eq!(SyncMessage::Ack { request_id: 3 }.response_to(), Some(3));
        assert_eq!(
            SyncMessage::Error {
                request_id: None,
                message: "bad".to_string()
            }
            .response_to(),
            None
        );
        assert_eq!(SyncMessage::Pong.response_to(), None);
        assert_eq!(
            SyncMessage::Unsubscribe { subscription_id: 1 }.response_to(),
            None
        );
    }
}
