/// Presence Registry protocol and its in-memory implementation
/// Each session adds one entry per room on join and removes it on leave;
/// subscribers receive the full live entry set on every change
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::{Result, RoomId, ServerTimestamp, SessionId, Subscription};

/// One participant present in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub session_id: SessionId,

    /// Server-assigned
    pub joined_at: ServerTimestamp,
}

/// Reference to an entry, owned by the session that added it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceHandle {
    pub room_id: RoomId,
    pub entry_id: Uuid,
}

#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    async fn add(&self, room_id: &RoomId, session_id: SessionId) -> Result<PresenceHandle>;

    /// Removing an entry that is already gone is not an error
    async fn remove(&self, handle: &PresenceHandle) -> Result<()>;

    /// Current entry set first, then the full set after every change
    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription<Vec<PresenceEntry>>>;
}

#[derive(Default)]
struct PresenceSlot {
    // Join order
    entries: Vec<(Uuid, PresenceEntry)>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Vec<PresenceEntry>>>,
}

impl PresenceSlot {
    fn snapshot(&self) -> Vec<PresenceEntry> {
        self.entries.iter().map(|(_, entry)| entry.clone()).collect()
    }

    fn notify(&mut self) {
        let snapshot = self.snapshot();
        self.subscribers
            .retain(|_, tx| tx.send(snapshot.clone()).is_ok());
    }

    fn is_unused(&self) -> bool {
        self.entries.is_empty() && self.subscribers.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<RoomId, PresenceSlot>,
    next_subscriber: u64,
}

/// Process-local presence registry. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryPresenceRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl MemoryPresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self, room_id: &RoomId) -> Vec<PresenceEntry> {
        self.state
            .lock()
            .rooms
            .get(room_id)
            .map(PresenceSlot::snapshot)
            .unwrap_or_default()
    }
}

#[async_trait]
impl PresenceRegistry for MemoryPresenceRegistry {
    async fn add(&self, room_id: &RoomId, session_id: SessionId) -> Result<PresenceHandle> {
        let entry_id = Uuid::new_v4();
        let entry = PresenceEntry {
            session_id,
            joined_at: chrono::Utc::now(),
        };

        let mut state = self.state.lock();
        let slot = state.rooms.entry(room_id.clone()).or_default();
        slot.entries.push((entry_id, entry));
        slot.notify();
        debug!(
            "Session {} present in room {} ({} online)",
            session_id,
            room_id,
            slot.entries.len()
        );

        Ok(PresenceHandle {
            room_id: room_id.clone(),
            entry_id,
        })
    }

    async fn remove(&self, handle: &PresenceHandle) -> Result<()> {
        let mut state = self.state.lock();
        let Some(slot) = state.rooms.get_mut(&handle.room_id) else {
            return Ok(());
        };

        let before = slot.entries.len();
        slot.entries.retain(|(id, _)| *id != handle.entry_id);
        if slot.entries.len() != before {
            slot.notify();
        }
        if slot.is_unused() {
            state.rooms.remove(&handle.room_id);
        }
        Ok(())
    }

    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription<Vec<PresenceEntry>>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut state = self.state.lock();
            let id = state.next_subscriber;
            state.next_subscriber += 1;

            let slot = state.rooms.entry(room_id.clone()).or_default();
            let _ = tx.send(slot.snapshot());
            slot.subscribers.insert(id, tx);
            id
        };

        let state = Arc::clone(&self.state);
        let room_id = room_id.clone();
        Ok(Subscription::new(rx, move || {
            let mut state = state.lock();
            if let Some(slot) = state.rooms.get_mut(&room_id) {
                slot.subscribers.remove(&id);
                if slot.is_unused() {
                    state.rooms.remove(&room_id);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entry_visible_after_add_gone_after_remove() {
        let registry = MemoryPresenceRegistry::new();
        let room = RoomId::new("p1").unwrap();
        let me = SessionId::new();

        let mut sub = registry.subscribe(&room).await.unwrap();
        assert!(sub.recv().await.unwrap().is_empty());

        let handle = registry.add(&room, me).await.unwrap();
        let snapshot = sub.recv().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].session_id, me);

        registry.remove(&handle).await.unwrap();
        assert!(sub.recv().await.unwrap().is_empty());
        assert!(registry.entries(&room).is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = MemoryPresenceRegistry::new();
        let room = RoomId::new("p2").unwrap();

        let handle = registry.add(&room, SessionId::new()).await.unwrap();
        registry.remove(&handle).await.unwrap();
        registry.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_entries_keep_join_order() {
        let registry = MemoryPresenceRegistry::new();
        let room = RoomId::new("p3").unwrap();
        let (a, b) = (SessionId::new(), SessionId::new());

        registry.add(&room, a).await.unwrap();
        let hb = registry.add(&room, b).await.unwrap();
        registry.add(&room, a).await.unwrap();

        let sessions: Vec<_> = registry
            .entries(&room)
            .into_iter()
            .map(|e| e.session_id)
            .collect();
        assert_eq!(sessions, vec![a, b, a]);

        registry.remove(&hb).await.unwrap();
        assert_eq!(registry.entries(&room).len(), 2);
    }

    #[tokio::test]
    async fn test_rooms_are_independent() {
        let registry = MemoryPresenceRegistry::new();
        let r1 = RoomId::new("p4").unwrap();
        let r2 = RoomId::new("p5").unwrap();

        registry.add(&r1, SessionId::new()).await.unwrap();
        let mut sub = registry.subscribe(&r2).await.unwrap();
        assert!(sub.recv().await.unwrap().is_empty());
        assert!(sub.try_recv().is_none());
    }
}
