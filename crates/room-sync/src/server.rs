/// Room server
/// Hosts the room store and presence registry for WebSocket clients.
/// The handshake path is routed: `/room/{id}` is accepted, `/` redirects to
/// a freshly generated room, anything else is not found.
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::LOCATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::{
    MemoryPresenceRegistry, MemoryRoomStore, PresenceHandle, PresenceRegistry, Result, RoomId,
    RoomStore, Route, RouteTarget, Subscription, SubscriptionId, SyncMessage,
};

type Tx = mpsc::UnboundedSender<Message>;

/// State of one client connection
struct Connection {
    addr: SocketAddr,
    tx: Tx,
    subscriptions: HashMap<SubscriptionId, JoinHandle<()>>,
    /// Presence entries added over this connection
    presence: HashSet<PresenceHandle>,
}

impl Connection {
    fn new(addr: SocketAddr, tx: Tx) -> Self {
        Self {
            addr,
            tx,
            subscriptions: HashMap::new(),
            presence: HashSet::new(),
        }
    }

    fn send(&self, msg: &SyncMessage) {
        match msg.to_json() {
            Ok(json) => {
                if self.tx.send(Message::Text(json)).is_err() {
                    debug!("Send to {} failed: channel closed", self.addr);
                }
            }
            Err(e) => error!("Failed to serialize message: {}", e),
        }
    }

    /// Pump a store subscription to the client until it is unsubscribed
    fn forward<T: Send + 'static>(
        &mut self,
        subscription_id: SubscriptionId,
        mut subscription: Subscription<T>,
        wrap: impl Fn(T) -> SyncMessage + Send + 'static,
    ) {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = subscription.recv().await {
                let json = match wrap(item).to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize notification: {}", e);
                        continue;
                    }
                };
                if tx.send(Message::Text(json)).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.subscriptions.insert(subscription_id, task) {
            previous.abort();
        }
    }

    fn unsubscribe(&mut self, subscription_id: SubscriptionId) {
        if let Some(task) = self.subscriptions.remove(&subscription_id) {
            task.abort();
        }
    }
}

#[derive(Default)]
pub struct RoomServer {
    store: MemoryRoomStore,
    presence: MemoryPresenceRegistry,
}

impl RoomServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &MemoryRoomStore {
        &self.store
    }

    pub fn presence(&self) -> &MemoryPresenceRegistry {
        &self.presence
    }

    /// Accept connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("Room server listening on: {}", addr);
        }

        while let Ok((stream, addr)) = listener.accept().await {
            debug!("New connection from: {}", addr);
            tokio::spawn(Arc::clone(&self).handle_connection(stream, addr));
        }

        Ok(())
    }

    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut room: Option<RoomId> = None;
        let route_handshake = |request: &Request, response: Response| {
            route_request(request.uri().path()).map(|room_id| {
                room = Some(room_id);
                response
            })
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, route_handshake).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("WebSocket handshake with {} not completed: {}", addr, e);
                return;
            }
        };

        let room = room.map(|r| r.to_string()).unwrap_or_default();
        info!("WebSocket connection established: {} (room {})", addr, room);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Task to send messages to client
        let send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = ws_sender.send(msg).await {
                    debug!("Failed to send message: {}", e);
                    break;
                }
            }
        });

        let mut conn = Connection::new(addr, tx);

        while let Some(msg) = ws_receiver.next().await {
            let msg = match msg {
                Ok(m) => m,
                Err(e) => {
                    warn!("Error receiving from {}: {}", addr, e);
                    break;
                }
            };

            match msg {
                Message::Text(text) => {
                    let reply = match SyncMessage::from_json(&text) {
                        Ok(request) => self.handle_sync_message(&mut conn, request).await,
                        Err(e) => Some(SyncMessage::Error {
                            request_id: None,
                            message: e.to_string(),
                        }),
                    };
                    if let Some(reply) = reply {
                        conn.send(&reply);
                    }
                }
                Message::Ping(data) => {
                    let _ = conn.tx.send(Message::Pong(data));
                }
                Message::Close(_) => {
                    debug!("Client {} requested close", addr);
                    break;
                }
                _ => {}
            }
        }

        self.cleanup(conn).await;
        send_task.abort();
        info!("Connection closed: {} (room {})", addr, room);
    }

    async fn handle_sync_message(
        &self,
        conn: &mut Connection,
        msg: SyncMessage,
    ) -> Option<SyncMessage> {
        match msg {
            SyncMessage::GetRoom {
                request_id,
                room_id,
            } => Some(respond(
                request_id,
                self.store
                    .get(&room_id)
                    .await
                    .map(|document| SyncMessage::Room {
                        request_id,
                        document,
                    }),
            )),

            SyncMessage::CreateRoom {
                request_id,
                room_id,
                content,
            } => Some(respond(
                request_id,
                self.store
                    .create_if_absent(&room_id, &content)
                    .await
                    .map(|created| SyncMessage::RoomCreated {
                        request_id,
                        created,
                    }),
            )),

            SyncMessage::UpsertMerge {
                request_id,
                room_id,
                patch,
            } => {
                debug!("Merge into room {} from {}", room_id, conn.addr);
                Some(respond(
                    request_id,
                    self.store
                        .upsert_merge(&room_id, patch)
                        .await
                        .map(|()| SyncMessage::Ack { request_id }),
                ))
            }

            SyncMessage::AddPresence {
                request_id,
                room_id,
                session_id,
            } => Some(respond(
                request_id,
                self.presence
                    .add(&room_id, session_id)
                    .await
                    .map(|handle| {
                        conn.presence.insert(handle.clone());
                        SyncMessage::PresenceAdded { request_id, handle }
                    }),
            )),

            SyncMessage::RemovePresence { request_id, handle } => {
                conn.presence.remove(&handle);
                Some(respond(
                    request_id,
                    self.presence
                        .remove(&handle)
                        .await
                        .map(|()| SyncMessage::Ack { request_id }),
                ))
            }

            SyncMessage::SubscribeRoom {
                subscription_id,
                room_id,
            } => match self.store.subscribe(&room_id).await {
                Ok(subscription) => {
                    conn.forward(subscription_id, subscription, move |document| {
                        SyncMessage::RoomChanged {
                            subscription_id,
                            document,
                        }
                    });
                    None
                }
                Err(e) => Some(subscribe_failed(subscription_id, e)),
            },

            SyncMessage::SubscribePresence {
                subscription_id,
                room_id,
            } => match self.presence.subscribe(&room_id).await {
                Ok(subscription) => {
                    conn.forward(subscription_id, subscription, move |entries| {
                        SyncMessage::PresenceSnapshot {
                            subscription_id,
                            entries,
                        }
                    });
                    None
                }
                Err(e) => Some(subscribe_failed(subscription_id, e)),
            },

            SyncMessage::Unsubscribe { subscription_id } => {
                conn.unsubscribe(subscription_id);
                None
            }

            SyncMessage::Ping => Some(SyncMessage::Pong),

            SyncMessage::Pong => None,

            other => {
                warn!("Unexpected message from {}: {:?}", conn.addr, other);
                Some(SyncMessage::Error {
                    request_id: None,
                    message: "unexpected message".to_string(),
                })
            }
        }
    }

    /// Drop the connection's subscriptions and the presence entries it
    /// added; a client that vanished without leaving is not left online
    async fn cleanup(&self, mut conn: Connection) {
        for (_, task) in conn.subscriptions.drain() {
            task.abort();
        }

        for handle in conn.presence.drain() {
            debug!(
                "Removing presence {} in room {} left by {}",
                handle.entry_id, handle.room_id, conn.addr
            );
            if let Err(e) = self.presence.remove(&handle).await {
                warn!("Failed to remove presence entry: {}", e);
            }
        }
    }
}

fn respond(request_id: u64, result: Result<SyncMessage>) -> SyncMessage {
    result.unwrap_or_else(|e| SyncMessage::Error {
        request_id: Some(request_id),
        message: e.to_string(),
    })
}

fn subscribe_failed(subscription_id: SubscriptionId, e: crate::RoomError) -> SyncMessage {
    SyncMessage::Error {
        request_id: None,
        message: format!("subscription {} failed: {}", subscription_id, e),
    }
}

/// Decide the handshake outcome for a request path
fn route_request(path: &str) -> std::result::Result<RoomId, ErrorResponse> {
    let route = Route::parse(path).map_err(|_| {
        debug!("Rejecting handshake for unknown path {}", path);
        http_response(StatusCode::NOT_FOUND, None)
    })?;

    match route.resolve() {
        RouteTarget::Session(room_id) => Ok(room_id),
        RouteTarget::Redirect(target) => {
            let location = target.path();
            debug!("Redirecting {} to {}", path, location);
            Err(http_response(StatusCode::TEMPORARY_REDIRECT, Some(&location)))
        }
    }
}

fn http_response(status: StatusCode, location: Option<&str>) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;

    if let Some(location) = location {
        match HeaderValue::from_str(location) {
            Ok(value) => {
                response.headers_mut().insert(LOCATION, value);
            }
            Err(_) => *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_request_accepts_rooms() {
        assert_eq!(
            route_request("/room/abc").unwrap(),
            RoomId::new("abc").unwrap()
        );
    }

    #[test]
    fn test_route_request_redirects_landing() {
        let response = route_request("/").unwrap_err();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

        let location = response.headers().get(LOCATION).unwrap().to_str().unwrap();
        match Route::parse(location).unwrap() {
            Route::Room(id) => assert!(uuid::Uuid::parse_str(id.as_str()).is_ok()),
            Route::Landing => panic!("redirected to landing"),
        }
    }

    #[test]
    fn test_route_request_rejects_unknown() {
        let response = route_request("/admin").unwrap_err();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
