/// Room document model
/// A room is one text buffer plus server-assigned timestamps
use serde::{Deserialize, Serialize};

use crate::ServerTimestamp;

/// Content a room is created with
pub const DEFAULT_ROOM_CONTENT: &str = "// New collaborative file\n";

/// Stored state of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDocument {
    /// Shared text buffer
    pub content: String,

    /// Set once, when the document is first written
    pub created_at: ServerTimestamp,

    /// Set by every merge write; never moves backwards
    pub updated_at: Option<ServerTimestamp>,

    /// Incremented on every accepted write
    pub version: u64,
}

impl RoomDocument {
    /// Fresh document as written by room creation
    pub fn new(content: impl Into<String>, now: ServerTimestamp) -> Self {
        Self {
            content: content.into(),
            created_at: now,
            updated_at: None,
            version: 1,
        }
    }

    /// Document produced by a merge write to a room that did not exist
    pub fn from_patch(patch: RoomPatch, now: ServerTimestamp) -> Self {
        Self {
            content: patch.content.unwrap_or_default(),
            created_at: now,
            updated_at: Some(now),
            version: 1,
        }
    }

    /// Whole-document merge: present fields overwrite, the server stamps
    /// `updated_at`
    pub fn merge(&mut self, patch: RoomPatch, now: ServerTimestamp) {
        if let Some(content) = patch.content {
            self.content = content;
        }

        self.updated_at = Some(match self.updated_at {
            Some(previous) if previous > now => previous,
            _ => now,
        });
        self.version += 1;
    }
}

/// Partial document for `upsert_merge`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl RoomPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_merge_overwrites_content_and_stamps() {
        let created = Utc::now();
        let mut doc = RoomDocument::new(DEFAULT_ROOM_CONTENT, created);
        assert_eq!(doc.version, 1);
        assert!(doc.updated_at.is_none());

        let later = created + Duration::seconds(5);
        doc.merge(RoomPatch::content("let x = 1;"), later);

        assert_eq!(doc.content, "let x = 1;");
        assert_eq!(doc.created_at, created);
        assert_eq!(doc.updated_at, Some(later));
        assert_eq!(doc.version, 2);
    }

    #[test]
    fn test_updated_at_is_monotonic() {
        let now = Utc::now();
        let mut doc = RoomDocument::new("", now);
        doc.merge(RoomPatch::content("a"), now + Duration::seconds(10));

        // A skewed clock must not move the stamp backwards
        doc.merge(RoomPatch::content("b"), now);
        assert_eq!(doc.updated_at, Some(now + Duration::seconds(10)));
        assert_eq!(doc.content, "b");
    }

    #[test]
    fn test_empty_patch_keeps_content() {
        let now = Utc::now();
        let mut doc = RoomDocument::new("keep", now);
        doc.merge(RoomPatch::default(), now);
        assert_eq!(doc.content, "keep");
        assert_eq!(doc.version, 2);
    }

    #[test]
    fn test_patch_serialization_omits_missing_fields() {
        assert_eq!(serde_json::to_string(&RoomPatch::default()).unwrap(), "{}");
        assert_eq!(
            serde_json::to_string(&RoomPatch::content("x")).unwrap(),
            r#"{"content":"x"}"#
        );
    }
}
