use room_sync::*;
use sandbox::{ChannelContext, ContextPeer, SandboxedExecutor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{http::StatusCode, Error as WsError};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server() -> (Arc<RoomServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let server = Arc::new(RoomServer::new());
    tokio::spawn(Arc::clone(&server).serve(listener));
    (server, format!("ws://{}", addr))
}

async fn connect(url: &str, room: &RoomId) -> RemoteStore {
    let (store, joined) = RemoteStore::connect(url, Some(room), TIMEOUT).await.unwrap();
    assert_eq!(&joined, room);
    store
}

fn new_session(remote: &RemoteStore) -> (RoomSession, ContextPeer) {
    let (context, peer) = ChannelContext::pair();
    let config = SessionConfig {
        debounce_ms: 50,
        ..SessionConfig::default()
    };
    let session = RoomSession::new(
        Arc::new(remote.clone()),
        Arc::new(remote.clone()),
        SandboxedExecutor::new(context),
        config,
    );
    (session, peer)
}

async fn wait_for(
    session: &mut RoomSession,
    done: impl Fn(&SessionEvent, &RoomSession) -> bool,
) {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = session.next_event().await.expect("session ended");
            if done(&event, session) {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for session event");
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_landing_redirects_to_fresh_room() {
    let (_server, url) = start_server().await;

    let (_a, first) = RemoteStore::connect(&url, None, TIMEOUT).await.unwrap();
    let (_b, second) = RemoteStore::connect(&url, None, TIMEOUT).await.unwrap();

    assert!(uuid::Uuid::parse_str(first.as_str()).is_ok());
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let (_server, url) = start_server().await;

    match tokio_tungstenite::connect_async(format!("{}/settings", url)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::NOT_FOUND),
        other => panic!("expected 404, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_remote_store_round_trip() {
    let (server, url) = start_server().await;
    let room = RoomId::new("round-trip").unwrap();
    let store = connect(&url, &room).await;

    assert_eq!(store.get(&room).await.unwrap(), None);
    assert!(store.create_if_absent(&room, "start").await.unwrap());
    assert!(!store.create_if_absent(&room, "other").await.unwrap());

    store
        .upsert_merge(&room, RoomPatch::content("changed"))
        .await
        .unwrap();
    let doc = store.get(&room).await.unwrap().unwrap();
    assert_eq!(doc.content, "changed");
    assert_eq!(doc.version, 2);
    assert!(doc.updated_at.is_some());

    assert_eq!(server.store().room_count(), 1);
}

#[tokio::test]
async fn test_racing_remote_creators_create_once() {
    let (server, url) = start_server().await;
    let room = RoomId::new("race").unwrap();
    let a = connect(&url, &room).await;
    let b = connect(&url, &room).await;

    let (ra, rb) = tokio::join!(
        a.create_if_absent(&room, "from a"),
        b.create_if_absent(&room, "from b")
    );
    assert_ne!(ra.unwrap(), rb.unwrap());

    let doc = server.store().get(&room).await.unwrap().unwrap();
    assert_eq!(doc.version, 1);
}

#[tokio::test]
async fn test_sessions_converge_over_the_network() {
    let (_server, url) = start_server().await;
    let room = RoomId::new("pair").unwrap();
    let (mut alice, _pa) = new_session(&connect(&url, &room).await);
    let (mut bob, _pb) = new_session(&connect(&url, &room).await);

    alice.open(room.clone()).await.unwrap();
    bob.open(room.clone()).await.unwrap();
    wait_for(&mut alice, |_, s| {
        s.content() == DEFAULT_ROOM_CONTENT && s.online_count() == 2
    })
    .await;
    wait_for(&mut bob, |_, s| {
        s.content() == DEFAULT_ROOM_CONTENT && s.online_count() == 2
    })
    .await;

    alice.on_local_edit("console.log('hi')");
    wait_for(&mut alice, |e, _| matches!(e, SessionEvent::Persisted { .. })).await;
    wait_for(&mut bob, |e, _| {
        matches!(e, SessionEvent::ContentReplaced { content } if content == "console.log('hi')")
    })
    .await;

    bob.on_local_edit("return 42");
    wait_for(&mut bob, |e, _| matches!(e, SessionEvent::Persisted { .. })).await;
    wait_for(&mut alice, |e, _| {
        matches!(e, SessionEvent::ContentReplaced { content } if content == "return 42")
    })
    .await;

    assert_eq!(alice.content(), bob.content());
}

#[tokio::test]
async fn test_presence_follows_leave() {
    let (server, url) = start_server().await;
    let room = RoomId::new("presence").unwrap();
    let (mut alice, _pa) = new_session(&connect(&url, &room).await);
    let (mut bob, _pb) = new_session(&connect(&url, &room).await);

    alice.open(room.clone()).await.unwrap();
    bob.open(room.clone()).await.unwrap();
    wait_for(&mut bob, |_, s| s.online_count() == 2).await;

    alice.close().await;
    wait_for(&mut bob, |e, _| {
        matches!(e, SessionEvent::PresenceChanged { online: 1 })
    })
    .await;

    let ids: Vec<_> = server
        .presence()
        .entries(&room)
        .into_iter()
        .map(|e| e.session_id)
        .collect();
    assert_eq!(ids, vec![bob.session_id()]);
}

#[tokio::test]
async fn test_disconnect_removes_presence() {
    let (server, url) = start_server().await;
    let room = RoomId::new("vanish").unwrap();

    let remote = connect(&url, &room).await;
    remote.add(&room, SessionId::new()).await.unwrap();
    assert_eq!(server.presence().entries(&room).len(), 1);

    drop(remote);
    let presence = server.presence().clone();
    eventually(|| presence.entries(&room).is_empty()).await;
}

#[tokio::test]
async fn test_unsubscribe_detaches_on_server() {
    let (server, url) = start_server().await;
    let room = RoomId::new("subs").unwrap();
    let remote = connect(&url, &room).await;

    let mut subscription = RoomStore::subscribe(&remote, &room).await.unwrap();
    remote.create_if_absent(&room, "x").await.unwrap();
    let doc = tokio::time::timeout(TIMEOUT, subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.content, "x");
    assert_eq!(server.store().subscriber_count(&room), 1);

    drop(subscription);
    let store = server.store().clone();
    eventually(|| store.subscriber_count(&room) == 0).await;
}

#[tokio::test]
async fn test_server_close_is_observed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.close(None).await.unwrap();
    });

    let room = RoomId::new("short-lived").unwrap();
    let remote = connect(&url, &room).await;
    let watched = remote.clone();
    eventually(move || !watched.is_connected()).await;

    assert!(remote.get(&room).await.is_err());
}
