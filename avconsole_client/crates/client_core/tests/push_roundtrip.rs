use client_core::config::ClientConfig;
use client_core::protocol::{PushEvent, PushMessage, User};
use client_core::push::{ChannelStatus, PushChannel};
use client_core::session::{SessionSource, SessionState};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::error::UrlError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

const WAIT: Duration = Duration::from_secs(5);

struct TestSession {
    token: &'static str,
    state: watch::Sender<SessionState>,
}

impl TestSession {
    fn new(token: &'static str, signed_in: bool) -> Arc<Self> {
        let initial = if signed_in { signed_in_state() } else { SessionState::SignedOut };
        let (state, _) = watch::channel(initial);
        Arc::new(Self { token, state })
    }
}

impl SessionSource for TestSession {
    fn access_token(&self) -> Option<String> {
        self.has_session().then(|| self.token.to_string())
    }

    fn has_session(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::SignedIn(_))
    }

    fn session_changes(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

fn signed_in_state() -> SessionState {
    let user: User = serde_json::from_value(serde_json::json!({ "id": "u1", "username": "ops", "role": "admin" })).unwrap();
    SessionState::SignedIn(user)
}

struct Server {
    port: u16,
    uris: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedReceiver<String>,
    close_first: Arc<Notify>,
}

/// Every connection gets one `command_executed` naming its sequence number.
/// The first one is closed from the server side on request; later ones stay
/// open and forward what the client sends.
async fn start_server() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (uri_tx, uris) = mpsc::unbounded_channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();
    let close_first = Arc::new(Notify::new());

    let close = close_first.clone();
    tokio::spawn(async move {
        let mut n = 0u32;
        while let Ok((stream, _)) = listener.accept().await {
            n += 1;
            let uri_tx = uri_tx.clone();
            let inbound_tx = inbound_tx.clone();
            let close = close.clone();
            tokio::spawn(async move {
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    let _ = uri_tx.send(req.uri().to_string());
                    Ok(resp)
                };
                let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
                let event = serde_json::json!({
                    "type": "command_executed",
                    "timestamp": "2026-01-11T10:00:00Z",
                    "data": { "user_id": "u1", "username": format!("conn{n}"), "command": "player.play" }
                });
                ws.send(Message::Text(event.to_string().into())).await.unwrap();

                if n == 1 {
                    close.notified().await;
                    let _ = ws.close(None).await;
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        let _ = inbound_tx.send(text.as_str().to_string());
                    }
                }
            });
        }
    });

    Server {
        port,
        uris,
        inbound,
        close_first,
    }
}

async fn next_username(events: &mut broadcast::Receiver<PushMessage>) -> String {
    let msg = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    match msg.event {
        PushEvent::CommandExecuted(c) => c.username,
        other => panic!("unexpected event {other:?}"),
    }
}

async fn wait_status(rx: &mut watch::Receiver<ChannelStatus>, want: ChannelStatus) {
    timeout(WAIT, rx.wait_for(|s| *s == want)).await.unwrap().unwrap();
}

#[tokio::test]
async fn connects_with_token_and_reconnects_after_server_close() {
    let mut server = start_server().await;
    let config = ClientConfig::new(format!("http://127.0.0.1:{}", server.port));
    let channel = PushChannel::spawn(config, TestSession::new("secret token", true));
    let mut events = channel.subscribe();
    let mut status = channel.watch_status();
    assert_eq!(channel.status(), ChannelStatus::Disconnected);

    channel.connect().await.unwrap();
    let uri = timeout(WAIT, server.uris.recv()).await.unwrap().unwrap();
    assert_eq!(uri, "/ws?token=secret+token");
    wait_status(&mut status, ChannelStatus::Connected).await;
    assert_eq!(next_username(&mut events).await, "conn1");

    // Server drops us; the first retry comes after about a second.
    server.close_first.notify_one();
    let uri = timeout(WAIT, server.uris.recv()).await.unwrap().unwrap();
    assert!(uri.starts_with("/ws?token="));
    assert_eq!(next_username(&mut events).await, "conn2");
    wait_status(&mut status, ChannelStatus::Connected).await;

    channel
        .send(serde_json::json!({ "type": "ping" }))
        .await
        .unwrap();
    let echoed = timeout(WAIT, server.inbound.recv()).await.unwrap().unwrap();
    assert_eq!(echoed, r#"{"type":"ping"}"#);

    channel.disconnect().await.unwrap();
    wait_status(&mut status, ChannelStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(server.uris.try_recv().is_err(), "teardown must not reconnect");

    channel.shutdown().await;
}

#[tokio::test]
async fn visibility_reconnects_immediately() {
    let mut server = start_server().await;
    let config = ClientConfig::new(format!("http://127.0.0.1:{}", server.port));
    let channel = PushChannel::spawn(config, TestSession::new("t", true));
    let mut status = channel.watch_status();

    channel.connect().await.unwrap();
    timeout(WAIT, server.uris.recv()).await.unwrap().unwrap();
    wait_status(&mut status, ChannelStatus::Connected).await;

    server.close_first.notify_one();
    wait_status(&mut status, ChannelStatus::Disconnected).await;
    channel.visibility_changed(true).await.unwrap();

    // Well inside the one-second backoff.
    timeout(Duration::from_millis(500), server.uris.recv())
        .await
        .unwrap()
        .unwrap();
    wait_status(&mut status, ChannelStatus::Connected).await;

    channel.shutdown().await;
}

#[tokio::test]
async fn disconnect_and_shutdown_are_served_during_a_stalled_handshake() {
    // Accepts TCP and never answers the upgrade.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let config = ClientConfig::new(format!("http://127.0.0.1:{port}"));
    let channel = PushChannel::spawn(config, TestSession::new("t", true));
    let mut status = channel.watch_status();

    channel.connect().await.unwrap();
    wait_status(&mut status, ChannelStatus::Connecting).await;
    channel.disconnect().await.unwrap();
    wait_status(&mut status, ChannelStatus::Disconnected).await;

    channel.connect().await.unwrap();
    wait_status(&mut status, ChannelStatus::Connecting).await;
    timeout(Duration::from_secs(3), channel.shutdown()).await.unwrap();
}

#[tokio::test]
async fn signing_in_starts_the_channel() {
    let mut server = start_server().await;
    let session = TestSession::new("fresh", false);
    let config = ClientConfig::new(format!("http://127.0.0.1:{}", server.port));
    let channel = PushChannel::spawn(config, session.clone());
    let mut status = channel.watch_status();

    session.state.send_replace(signed_in_state());

    let uri = timeout(WAIT, server.uris.recv()).await.unwrap().unwrap();
    assert_eq!(uri, "/ws?token=fresh");
    wait_status(&mut status, ChannelStatus::Connected).await;

    channel.shutdown().await;
}

#[tokio::test]
async fn signing_out_tears_down_without_reconnect() {
    let mut server = start_server().await;
    let session = TestSession::new("t", true);
    let config = ClientConfig::new(format!("http://127.0.0.1:{}", server.port));
    let channel = PushChannel::spawn(config, session.clone());
    let mut status = channel.watch_status();

    channel.connect().await.unwrap();
    timeout(WAIT, server.uris.recv()).await.unwrap().unwrap();
    wait_status(&mut status, ChannelStatus::Connected).await;

    session.state.send_replace(SessionState::Expired);
    wait_status(&mut status, ChannelStatus::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(server.uris.try_recv().is_err(), "expired session must not reconnect");

    channel.shutdown().await;
}

#[tokio::test]
async fn secure_push_url_gets_a_tls_handshake() {
    // Plain TCP: the TLS handshake fails, but it has to be attempted.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let url = ClientConfig::new(format!("https://127.0.0.1:{port}"))
        .push_url("t")
        .unwrap();
    assert_eq!(url.scheme(), "wss");
    let err = match timeout(WAIT, tokio_tungstenite::connect_async(url.as_str())).await.unwrap() {
        Ok(_) => panic!("plain TCP accepted a TLS handshake"),
        Err(e) => e,
    };
    assert!(
        !matches!(err, WsError::Url(UrlError::TlsFeatureNotEnabled)),
        "wss unsupported: {err}"
    );
}
