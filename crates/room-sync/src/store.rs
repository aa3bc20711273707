/// Room Store protocol and its in-memory implementation
/// Key-value documents keyed by room id, with push-based change
/// notification to every subscriber (the writer included)
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Result, RoomDocument, RoomId, RoomPatch};

/// Live feed of change notifications.
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`])
/// detaches it from its source.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next notification; `None` once the source has gone away.
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Realtime document store holding one document per room.
///
/// Writes are last-write-wins whole-document merges; a client's own
/// successive writes to a room are applied in the order issued.
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get(&self, room_id: &RoomId) -> Result<Option<RoomDocument>>;

    /// Merge `patch` into the room, creating it when absent.
    /// The store stamps `updated_at`.
    async fn upsert_merge(&self, room_id: &RoomId, patch: RoomPatch) -> Result<()>;

    /// Subscribe to the room. The current document, if any, is delivered
    /// first, then one notification per write.
    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription<RoomDocument>>;

    /// Create the room with `content` unless it exists. Returns whether
    /// this call created it.
    ///
    /// The default is check-then-create: two racing creators may both
    /// write, the last write wins, which is harmless when both carry the
    /// same default content. Stores that can do better override it.
    async fn create_if_absent(&self, room_id: &RoomId, content: &str) -> Result<bool> {
        if self.get(room_id).await?.is_some() {
            return Ok(false);
        }
        self.upsert_merge(room_id, RoomPatch::content(content)).await?;
        Ok(true)
    }
}

#[derive(Default)]
struct RoomSlot {
    document: Option<RoomDocument>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<RoomDocument>>,
}

impl RoomSlot {
    fn notify(&mut self) {
        if let Some(doc) = &self.document {
            self.subscribers.retain(|_, tx| tx.send(doc.clone()).is_ok());
        }
    }
}

#[derive(Default)]
struct StoreState {
    rooms: HashMap<RoomId, RoomSlot>,
    next_subscriber: u64,
}

/// Process-local room store. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryRoomStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rooms that hold a document
    pub fn room_count(&self) -> usize {
        self.state
            .lock()
            .rooms
            .values()
            .filter(|slot| slot.document.is_some())
            .count()
    }

    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.state
            .lock()
            .rooms
            .get(room_id)
            .map(|slot| slot.subscribers.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn get(&self, room_id: &RoomId) -> Result<Option<RoomDocument>> {
        Ok(self
            .state
            .lock()
            .rooms
            .get(room_id)
            .and_then(|slot| slot.document.clone()))
    }

    async fn upsert_merge(&self, room_id: &RoomId, patch: RoomPatch) -> Result<()> {
        let now = chrono::Utc::now();
        let mut state = self.state.lock();
        let slot = state.rooms.entry(room_id.clone()).or_default();

        match slot.document.as_mut() {
            Some(doc) => doc.merge(patch, now),
            None => slot.document = Some(RoomDocument::from_patch(patch, now)),
        }
        slot.notify();
        Ok(())
    }

    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription<RoomDocument>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut state = self.state.lock();
            let id = state.next_subscriber;
            state.next_subscriber += 1;

            let slot = state.rooms.entry(room_id.clone()).or_default();
            if let Some(doc) = &slot.document {
                let _ = tx.send(doc.clone());
            }
            slot.subscribers.insert(id, tx);
            id
        };
        debug!("Room {} subscriber {} attached", room_id, id);

        let state = Arc::clone(&self.state);
        let room_id = room_id.clone();
        Ok(Subscription::new(rx, move || {
            let mut state = state.lock();
            if let Some(slot) = state.rooms.get_mut(&room_id) {
                slot.subscribers.remove(&id);
                if slot.document.is_none() && slot.subscribers.is_empty() {
                    state.rooms.remove(&room_id);
                }
            }
        }))
    }

    async fn create_if_absent(&self, room_id: &RoomId, content: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let slot = state.rooms.entry(room_id.clone()).or_default();

        if slot.document.is_some() {
            return Ok(false);
        }

        slot.document = Some(RoomDocument::new(content, chrono::Utc::now()));
        slot.notify();
        debug!("Created room {}", room_id);
        Ok(true)
    }
}
