/// Room client
/// A [`RoomStore`] and [`PresenceRegistry`] backed by a WebSocket
/// connection to a [`crate::RoomServer`].
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::http::header::LOCATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    room_path, PresenceEntry, PresenceHandle, PresenceRegistry, RequestId, Result, RoomDocument,
    RoomError, RoomId, RoomPatch, RoomStore, Route, SessionId, Subscription, SubscriptionId,
    SyncMessage,
};

const MAX_REDIRECTS: usize = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct ClientInner {
    tx: mpsc::UnboundedSender<Message>,
    connected: AtomicBool,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<SyncMessage>>>,
    rooms: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<RoomDocument>>>,
    presence: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<Vec<PresenceEntry>>>>,
    request_timeout: Duration,
}

impl ClientInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, msg: &SyncMessage) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(RoomError::NetworkError("connection closed".to_string()));
        }
        self.tx
            .send(Message::Text(msg.to_json()?))
            .map_err(|_| RoomError::NetworkError("connection closed".to_string()))
    }

    async fn request(&self, build: impl FnOnce(RequestId) -> SyncMessage) -> Result<SyncMessage> {
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        if let Err(e) = self.send(&build(request_id)) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(SyncMessage::Error { message, .. })) => Err(RoomError::StoreError(message)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RoomError::NetworkError(
                "connection closed before response".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                Err(RoomError::Timeout(format!(
                    "no response to request {} within {:?}",
                    request_id, self.request_timeout
                )))
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let msg = match SyncMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Invalid message from server: {}", e);
                return;
            }
        };

        match msg {
            SyncMessage::RoomChanged {
                subscription_id,
                document,
            } => {
                if let Some(tx) = self.rooms.lock().get(&subscription_id) {
                    let _ = tx.send(document);
                }
            }
            SyncMessage::PresenceSnapshot {
                subscription_id,
                entries,
            } => {
                if let Some(tx) = self.presence.lock().get(&subscription_id) {
                    let _ = tx.send(entries);
                }
            }
            SyncMessage::Ping => {
                let _ = self.send(&SyncMessage::Pong);
            }
            SyncMessage::Error {
                request_id: None,
                message,
            } => warn!("Server error: {}", message),
            other => match other.response_to() {
                Some(request_id) => match self.pending.lock().remove(&request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(other);
                    }
                    None => debug!("Dropping late response to request {}", request_id),
                },
                None => debug!("Ignoring unexpected message: {:?}", other),
            },
        }
    }

    /// Fail outstanding requests and end every subscription
    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.pending.lock().clear();
        self.rooms.lock().clear();
        self.presence.lock().clear();
    }
}

fn unexpected(response: SyncMessage) -> RoomError {
    RoomError::NetworkError(format!("unexpected response: {:?}", response))
}

#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<ClientInner>,
}

impl RemoteStore {
    /// Connect to a room server.
    ///
    /// With `room_id` of `None` the server picks a fresh room by
    /// redirecting; the room finally joined is returned alongside.
    pub async fn connect(
        server_url: &str,
        room_id: Option<&RoomId>,
        request_timeout: Duration,
    ) -> Result<(Self, RoomId)> {
        let base = Url::parse(server_url)
            .map_err(|e| RoomError::NetworkError(format!("{}: {}", server_url, e)))?;
        let path = room_id.map(room_path).unwrap_or_else(|| "/".to_string());
        let mut url = base
            .join(&path)
            .map_err(|e| RoomError::NetworkError(e.to_string()))?;

        for _ in 0..=MAX_REDIRECTS {
            let attempt = tokio::time::timeout(
                request_timeout,
                tokio_tungstenite::connect_async(url.as_str()),
            )
            .await
            .map_err(|_| RoomError::Timeout(format!("connecting to {}", url)))?;

            match attempt {
                Ok((ws_stream, _)) => {
                    let room_id = match Route::parse(url.path())? {
                        Route::Room(room_id) => room_id,
                        Route::Landing => {
                            return Err(RoomError::InvalidRoute(
                                "server accepted the landing route".to_string(),
                            ))
                        }
                    };
                    info!("Connected to {} (room {})", url, room_id);
                    return Ok((Self::start(ws_stream, request_timeout), room_id));
                }
                Err(WsError::Http(response)) if response.status().is_redirection() => {
                    let location = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|value| value.to_str().ok())
                        .ok_or_else(|| {
                            RoomError::NetworkError("redirect without location".to_string())
                        })?;
                    url = url
                        .join(location)
                        .map_err(|e| RoomError::NetworkError(e.to_string()))?;
                    debug!("Following redirect to {}", url);
                }
                Err(WsError::Http(response)) => {
                    return Err(RoomError::NetworkError(format!(
                        "{} rejected with status {}",
                        url,
                        response.status()
                    )))
                }
                Err(e) => return Err(RoomError::NetworkError(e.to_string())),
            }
        }

        Err(RoomError::NetworkError(format!(
            "too many redirects from {}",
            server_url
        )))
    }

    fn start(ws_stream: WsStream, request_timeout: Duration) -> Self {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            tx,
            connected: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            rooms: Mutex::new(HashMap::new()),
            presence: Mutex::new(HashMap::new()),
            request_timeout,
        });

        // Writer ends once every handle to the client is gone
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("Failed to send message: {}", e);
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                let Some(inner) = weak.upgrade() else { break };
                match msg {
                    Ok(Message::Text(text)) => inner.dispatch(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Connection to room server lost: {}", e);
                        break;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.disconnect();
            }
            debug!("Room client reader stopped");
        });

        Self { inner }
    }

    /// False once the server has closed the connection or it broke
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire) && !self.inner.tx.is_closed()
    }
}

#[async_trait]
impl RoomStore for RemoteStore {
    async fn get(&self, room_id: &RoomId) -> Result<Option<RoomDocument>> {
        let room_id = room_id.clone();
        match self
            .inner
            .request(|request_id| SyncMessage::GetRoom {
                request_id,
                room_id,
            })
            .await?
        {
            SyncMessage::Room { document, .. } => Ok(document),
            other => Err(unexpected(other)),
        }
    }

    async fn upsert_merge(&self, room_id: &RoomId, patch: RoomPatch) -> Result<()> {
        let room_id = room_id.clone();
        match self
            .inner
            .request(|request_id| SyncMessage::UpsertMerge {
                request_id,
                room_id,
                patch,
            })
            .await?
        {
            SyncMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription<RoomDocument>> {
        let subscription_id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.rooms.lock().insert(subscription_id, tx);

        if let Err(e) = self.inner.send(&SyncMessage::SubscribeRoom {
            subscription_id,
            room_id: room_id.clone(),
        }) {
            self.inner.rooms.lock().remove(&subscription_id);
            return Err(e);
        }

        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(rx, move || {
            inner.rooms.lock().remove(&subscription_id);
            let _ = inner.send(&SyncMessage::Unsubscribe { subscription_id });
        }))
    }

    async fn create_if_absent(&self, room_id: &RoomId, content: &str) -> Result<bool> {
        let room_id = room_id.clone();
        let content = content.to_string();
        match self
            .inner
            .request(|request_id| SyncMessage::CreateRoom {
                request_id,
                room_id,
                content,
            })
            .await?
        {
            SyncMessage::RoomCreated { created, .. } => Ok(created),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl PresenceRegistry for RemoteStore {
    async fn add(&self, room_id: &RoomId, session_id: SessionId) -> Result<PresenceHandle> {
        let room_id = room_id.clone();
        match self
            .inner
            .request(|request_id| SyncMessage::AddPresence {
                request_id,
                room_id,
                session_id,
            })
            .await?
        {
            SyncMessage::PresenceAdded { handle, .. } => Ok(handle),
            other => Err(unexpected(other)),
        }
    }

    async fn remove(&self, handle: &PresenceHandle) -> Result<()> {
        let handle = handle.clone();
        match self
            .inner
            .request(|request_id| SyncMessage::RemovePresence { request_id, handle })
            .await?
        {
            SyncMessage::Ack { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription<Vec<PresenceEntry>>> {
        let subscription_id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.presence.lock().insert(subscription_id, tx);

        if let Err(e) = self.inner.send(&SyncMessage::SubscribePresence {
            subscription_id,
            room_id: room_id.clone(),
        }) {
            self.inner.presence.lock().remove(&subscription_id);
            return Err(e);
        }

        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(rx, move || {
            inner.presence.lock().remove(&subscription_id);
            let _ = inner.send(&SyncMessage::Unsubscribe { subscription_id });
        }))
    }
}
