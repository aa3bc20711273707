/// Room Session Controller
/// Binds one room at a time to the local edit buffer, the live presence
/// set and the sandbox output, and owns every subscription for the
/// session's lifetime
use sandbox::{ExecutorState, OutputChange, OutputLog, SandboxMessage, SandboxedExecutor};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::{
    share_link, DebouncedWriter, EchoSuppressor, PresenceEntry, PresenceHandle,
    PresenceRegistry, Result, RoomDocument, RoomError, RoomId, RoomPatch, RoomStore,
    SessionConfig, SessionId, Subscription,
};

/// Something that happened to the session, returned by
/// [`RoomSession::next_event`] after it has been applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A store notification replaced the local buffer
    ContentReplaced { content: String },

    /// The store's echo of our own write was discarded
    EchoSuppressed,

    /// The live presence set changed
    PresenceChanged { online: usize },

    /// A debounced write landed in the store
    Persisted { room_id: RoomId },

    /// A debounced write failed; the local buffer stays authoritative
    WriteFailed { room_id: RoomId, message: String },

    /// Sandbox output changed
    Output(OutputChange),

    /// A store subscription ended, usually because the connection dropped
    SubscriptionClosed,

    /// The isolated context exited
    SandboxExited,
}

struct WriteOutcome {
    room_id: RoomId,
    result: Result<()>,
}

struct OpenRoom {
    room_id: RoomId,
    content: Option<Subscription<RoomDocument>>,
    presence: Option<Subscription<Vec<PresenceEntry>>>,
    presence_handle: Option<PresenceHandle>,
    persist_tx: mpsc::UnboundedSender<String>,
}

enum Wake {
    Content(Option<RoomDocument>),
    Presence(Option<Vec<PresenceEntry>>),
    Deadline,
    Written(WriteOutcome),
    Sandbox(Option<SandboxMessage>),
}

pub struct RoomSession {
    store: Arc<dyn RoomStore>,
    presence: Arc<dyn PresenceRegistry>,
    executor: SandboxedExecutor,
    config: SessionConfig,
    session_id: SessionId,
    room: Option<OpenRoom>,
    content: String,
    echo: EchoSuppressor,
    writer: DebouncedWriter,
    online: Vec<PresenceEntry>,
    outcomes_tx: mpsc::UnboundedSender<WriteOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<WriteOutcome>,
    sandbox_open: bool,
}

impl RoomSession {
    pub fn new(
        store: Arc<dyn RoomStore>,
        presence: Arc<dyn PresenceRegistry>,
        executor: SandboxedExecutor,
        config: SessionConfig,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        Self {
            store,
            presence,
            executor,
            session_id: SessionId::new(),
            room: None,
            content: String::new(),
            echo: EchoSuppressor::new(),
            writer: DebouncedWriter::new(config.debounce()),
            online: Vec::new(),
            outcomes_tx,
            outcomes_rx,
            sandbox_open: true,
            config,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room.as_ref().map(|room| &room.room_id)
    }

    pub fn is_open(&self) -> bool {
        self.room.is_some()
    }

    /// The local edit buffer
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn online(&self) -> &[PresenceEntry] {
        &self.online
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    pub fn output(&self) -> &OutputLog {
        self.executor.output()
    }

    pub fn executor_state(&self) -> ExecutorState {
        self.executor.state()
    }

    pub fn has_pending_write(&self) -> bool {
        self.writer.is_pending()
    }

    pub fn is_present(&self) -> bool {
        self.room
            .as_ref()
            .map(|room| room.presence_handle.is_some())
            .unwrap_or(false)
    }

    pub fn share_link(&self) -> Option<String> {
        self.room_id()
            .map(|room_id| share_link(&self.config.origin, room_id))
    }

    /// Bind the session to `room_id`, creating the room with default
    /// content if needed. Any previously open room is closed first;
    /// reopening the current room is a no-op.
    pub async fn open(&mut self, room_id: RoomId) -> Result<()> {
        if self.room_id() == Some(&room_id) {
            return Ok(());
        }
        self.close().await;

        info!("Session {} opening room {}", self.session_id, room_id);
        self.content = self.config.loading_text.clone();
        self.echo = EchoSuppressor::new();

        match self
            .store
            .create_if_absent(&room_id, &self.config.default_content)
            .await
        {
            Ok(true) => info!("Created room {}", room_id),
            Ok(false) => debug!("Room {} already exists", room_id),
            Err(e) => warn!("Failed to ensure room {} exists: {}", room_id, e),
        }

        let content = self.store.subscribe(&room_id).await?;
        let presence = self.presence.subscribe(&room_id).await?;
        let persist_tx = spawn_persister(
            Arc::clone(&self.store),
            room_id.clone(),
            self.outcomes_tx.clone(),
        );

        self.room = Some(OpenRoom {
            room_id,
            content: Some(content),
            presence: Some(presence),
            presence_handle: None,
            persist_tx,
        });

        if let Err(e) = self.join_presence().await {
            warn!("Failed to join presence: {}", e);
        }
        Ok(())
    }

    /// Leave the current room: a pending edit is written to it, the
    /// presence entry is removed and both subscriptions are dropped
    pub async fn close(&mut self) {
        if let Err(e) = self.leave_presence().await {
            warn!("Failed to leave presence: {}", e);
        }

        let Some(room) = self.room.take() else {
            return;
        };

        if let Some(payload) = self.writer.flush() {
            if room.persist_tx.send(payload).is_err() {
                warn!("Dropped pending edit for room {}", room.room_id);
            }
        }

        self.echo = EchoSuppressor::new();
        self.online.clear();
        info!("Session {} closed room {}", self.session_id, room.room_id);
    }

    /// Add this session's presence entry to the open room
    pub async fn join_presence(&mut self) -> Result<()> {
        let room = self.room.as_mut().ok_or(RoomError::RoomNotOpen)?;
        if room.presence_handle.is_some() {
            return Ok(());
        }

        let handle = self.presence.add(&room.room_id, self.session_id).await?;
        room.presence_handle = Some(handle);
        Ok(())
    }

    /// Remove this session's presence entry, if it has one
    pub async fn leave_presence(&mut self) -> Result<()> {
        let Some(room) = self.room.as_mut() else {
            return Ok(());
        };
        let Some(handle) = room.presence_handle.take() else {
            return Ok(());
        };

        if let Err(e) = self.presence.remove(&handle).await {
            room.presence_handle = Some(handle);
            return Err(e);
        }
        Ok(())
    }

    /// The user edited the buffer: reflect it immediately, arm echo
    /// suppression and schedule a debounced write
    pub fn on_local_edit(&mut self, content: impl Into<String>) {
        let content = content.into();
        self.content.clone_from(&content);

        if self.room.is_some() {
            self.echo.arm();
            self.writer.schedule(content, Instant::now());
        }
    }

    /// A store notification for the open room arrived
    pub fn on_remote_content_changed(&mut self, content: String) -> SessionEvent {
        if self.echo.disarm() {
            debug!("Discarding echo of local write");
            return SessionEvent::EchoSuppressed;
        }

        self.content.clone_from(&content);
        SessionEvent::ContentReplaced { content }
    }

    /// Execute the current buffer in the sandbox
    pub async fn run(&mut self) -> Result<()> {
        self.executor.run(&self.content).await?;
        Ok(())
    }

    /// Wait for the next store notification, timer, write outcome or
    /// sandbox message, apply it, and report what happened.
    ///
    /// Returns `None` once nothing can happen any more (no room open and
    /// the sandbox has exited).
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let deadline = self.writer.deadline();
            if self.room.is_none() && !self.sandbox_open && deadline.is_none() {
                return None;
            }

            let wake = {
                let (content, presence) = match self.room.as_mut() {
                    Some(room) => (room.content.as_mut(), room.presence.as_mut()),
                    None => (None, None),
                };
                let sandbox_open = self.sandbox_open;
                let executor = &mut self.executor;
                let outcomes = &mut self.outcomes_rx;

                tokio::select! {
                    doc = recv_or_pending(content) => Wake::Content(doc),
                    entries = recv_or_pending(presence) => Wake::Presence(entries),
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Deadline,
                    Some(outcome) = outcomes.recv() => Wake::Written(outcome),
                    msg = executor.next_message(), if sandbox_open => Wake::Sandbox(msg),
                }
            };

            match wake {
                Wake::Content(Some(doc)) => return Some(self.on_remote_content_changed(doc.content)),
                Wake::Content(None) => {
                    warn!("Room content subscription closed");
                    if let Some(room) = self.room.as_mut() {
                        room.content = None;
                    }
                    return Some(SessionEvent::SubscriptionClosed);
                }
                Wake::Presence(Some(entries)) => {
                    self.online = entries;
                    return Some(SessionEvent::PresenceChanged {
                        online: self.online.len(),
                    });
                }
                Wake::Presence(None) => {
                    warn!("Presence subscription closed");
                    if let Some(room) = self.room.as_mut() {
                        room.presence = None;
                    }
                    return Some(SessionEvent::SubscriptionClosed);
                }
                Wake::Deadline => self.fire_write(),
                Wake::Written(outcome) => {
                    return Some(match outcome.result {
                        Ok(()) => SessionEvent::Persisted {
                            room_id: outcome.room_id,
                        },
                        Err(e) => SessionEvent::WriteFailed {
                            room_id: outcome.room_id,
                            message: e.to_string(),
                        },
                    });
                }
                Wake::Sandbox(Some(msg)) => {
                    return Some(SessionEvent::Output(self.executor.apply(msg)));
                }
                Wake::Sandbox(None) => {
                    self.sandbox_open = false;
                    return Some(SessionEvent::SandboxExited);
                }
            }
        }
    }

    fn fire_write(&mut self) {
        let Some(payload) = self.writer.take_due(Instant::now()) else {
            return;
        };

        match &self.room {
            Some(room) => {
                debug!("Writing {} bytes to room {}", payload.len(), room.room_id);
                if room.persist_tx.send(payload).is_err() {
                    warn!("Persister for room {} is gone", room.room_id);
                }
            }
            None => warn!("Debounced write fired with no room open"),
        }
    }
}

impl Drop for RoomSession {
    // Abrupt teardown: hand off what we can, without waiting for it
    fn drop(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };

        if let Some(payload) = self.writer.flush() {
            let _ = room.persist_tx.send(payload);
        }

        let (Some(handle), Ok(runtime)) =
            (room.presence_handle, tokio::runtime::Handle::try_current())
        else {
            return;
        };

        let presence = Arc::clone(&self.presence);
        runtime.spawn(async move {
            if let Err(e) = presence.remove(&handle).await {
                debug!("Presence cleanup on drop failed: {}", e);
            }
        });
    }
}

async fn recv_or_pending<T>(subscription: Option<&mut Subscription<T>>) -> Option<T> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Writes for one room, applied in the order they were issued. The task
/// ends once the sender is dropped and the queue is drained.
fn spawn_persister(
    store: Arc<dyn RoomStore>,
    room_id: RoomId,
    outcomes: mpsc::UnboundedSender<WriteOutcome>,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(content) = rx.recv().await {
            let result = store
                .upsert_merge(&room_id, RoomPatch::content(content))
                .await;
            if let Err(e) = &result {
                warn!("Error writing room {}: {}", room_id, e);
            }
            let _ = outcomes.send(WriteOutcome {
                room_id: room_id.clone(),
                result,
            });
        }
        debug!("Persister for room {} finished", room_id);
    });

    tx
}
