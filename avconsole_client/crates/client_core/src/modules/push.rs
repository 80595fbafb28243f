//! Push channel: one websocket to `/ws?token=...` kept alive by a small actor.
//!
//! The actor owns the socket and a [`ReconnectState`]; everything else talks to
//! it through [`PushChannel`]. Reconnects are driven by the close path only:
//! an error marks the status but the following close decides whether to retry.
//! The actor also follows the session: signing in starts the channel, signing
//! out or expiring tears it down.

use crate::modules::backoff::Backoff;
use crate::modules::config::{redact_token, ClientConfig};
use crate::modules::protocol::{PushEvent, PushMessage};
use crate::modules::session::{SessionSource, SessionState};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const EVENT_BUFFER: usize = 64;
const COMMAND_BUFFER: usize = 32;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push channel has shut down")]
    Closed,
}

#[derive(Debug)]
pub enum PushCommand {
    Connect,
    Disconnect,
    Visibility(bool),
    Send(serde_json::Value),
    Shutdown,
}

/// Connection status plus retry bookkeeping, free of any I/O.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    status: ChannelStatus,
    backoff: Backoff,
    timer_armed: bool,
}

impl Default for ReconnectState {
    fn default() -> Self {
        Self {
            status: ChannelStatus::Disconnected,
            backoff: Backoff::new(MAX_RECONNECT_ATTEMPTS),
            timer_armed: false,
        }
    }
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    pub fn timer_armed(&self) -> bool {
        self.timer_armed
    }

    pub fn on_connecting(&mut self) {
        self.status = ChannelStatus::Connecting;
        self.timer_armed = false;
    }

    pub fn on_open(&mut self) {
        self.status = ChannelStatus::Connected;
        self.backoff.reset();
    }

    pub fn on_error(&mut self) {
        self.status = ChannelStatus::Error;
    }

    /// Returns the reconnect delay when one should be scheduled.
    pub fn on_close(&mut self, has_session: bool) -> Option<Duration> {
        self.status = ChannelStatus::Disconnected;
        self.timer_armed = false;
        if !has_session {
            return None;
        }
        let delay = self.backoff.next_delay()?;
        self.timer_armed = true;
        Some(delay)
    }

    /// True when becoming visible should reconnect right away, skipping any
    /// pending backoff.
    pub fn on_visible(&mut self, visible: bool, has_session: bool) -> bool {
        if visible && has_session && self.status == ChannelStatus::Disconnected {
            self.timer_armed = false;
            true
        } else {
            false
        }
    }

    pub fn teardown(&mut self) {
        self.status = ChannelStatus::Disconnected;
        self.timer_armed = false;
    }
}

/// Handle to the push actor.
pub struct PushChannel {
    commands: mpsc::Sender<PushCommand>,
    status: watch::Receiver<ChannelStatus>,
    events: broadcast::Sender<PushMessage>,
    task: JoinHandle<()>,
}

impl PushChannel {
    /// Starts the actor on the current runtime. It stays idle until
    /// [`PushChannel::connect`] or the next sign-in.
    pub fn spawn(config: ClientConfig, session: Arc<dyn SessionSource>) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status) = watch::channel(ChannelStatus::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let actor = Actor {
            rx,
            sessions: session.session_changes(),
            follow_session: true,
            state: ReconnectState::new(),
            status_tx,
            events: events.clone(),
            config,
            session,
            wanted: false,
            retry_at: None,
        };
        let task = tokio::spawn(actor.run());

        Self {
            commands,
            status,
            events,
            task,
        }
    }

    async fn command(&self, cmd: PushCommand) -> Result<(), PushError> {
        self.commands.send(cmd).await.map_err(|_| PushError::Closed)
    }

    pub async fn connect(&self) -> Result<(), PushError> {
        self.command(PushCommand::Connect).await
    }

    /// Closes the socket and cancels any pending reconnect.
    pub async fn disconnect(&self) -> Result<(), PushError> {
        self.command(PushCommand::Disconnect).await
    }

    pub async fn visibility_changed(&self, visible: bool) -> Result<(), PushError> {
        self.command(PushCommand::Visibility(visible)).await
    }

    /// Dropped with a warning unless connected.
    pub async fn send(&self, message: serde_json::Value) -> Result<(), PushError> {
        self.command(PushCommand::Send(message)).await
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushMessage> {
        self.events.subscribe()
    }

    pub async fn shutdown(self) {
        let _ = self.commands.send(PushCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("push actor ended abnormally: {e}");
        }
    }
}

enum ConnectionEnd {
    Closed,
    TornDown,
    Exit,
}

struct Actor {
    rx: mpsc::Receiver<PushCommand>,
    sessions: watch::Receiver<SessionState>,
    follow_session: bool,
    state: ReconnectState,
    status_tx: watch::Sender<ChannelStatus>,
    events: broadcast::Sender<PushMessage>,
    config: ClientConfig,
    session: Arc<dyn SessionSource>,
    wanted: bool,
    retry_at: Option<Instant>,
}

impl Actor {
    fn publish(&self) {
        let status = self.state.status();
        self.status_tx.send_if_modified(|s| {
            if *s == status {
                false
            } else {
                *s = status;
                true
            }
        });
    }

    fn failed(&mut self) -> ConnectionEnd {
        self.state.on_error();
        self.publish();
        ConnectionEnd::Closed
    }

    /// `Some(true)` on sign-in, `Some(false)` on sign-out or expiry, `None`
    /// once the session side is gone.
    fn session_transition(&mut self, changed: Result<(), watch::error::RecvError>) -> Option<bool> {
        if changed.is_err() {
            self.follow_session = false;
            return None;
        }
        let signed_in = matches!(*self.sessions.borrow_and_update(), SessionState::SignedIn(_));
        Some(signed_in)
    }

    fn stop(&mut self) {
        self.wanted = false;
        self.retry_at = None;
        self.state.teardown();
        self.publish();
    }

    async fn run(mut self) {
        let mut dial = false;
        loop {
            if dial {
                dial = false;
                self.retry_at = None;
                match self.connection().await {
                    ConnectionEnd::Exit => return,
                    ConnectionEnd::TornDown => {
                        self.stop();
                        info!("push channel closed");
                    }
                    ConnectionEnd::Closed => {
                        let keep = self.wanted && self.session.has_session();
                        if let Some(delay) = self.state.on_close(keep) {
                            info!(attempt = self.state.attempts(), ?delay, "push channel reconnect scheduled");
                            self.retry_at = Some(Instant::now() + delay);
                        } else if keep {
                            warn!("push channel gave up after {MAX_RECONNECT_ATTEMPTS} attempts");
                        }
                        self.publish();
                    }
                }
                continue;
            }

            let retry_at = self.retry_at;
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    None | Some(PushCommand::Shutdown) => return,
                    Some(PushCommand::Connect) => {
                        self.wanted = true;
                        dial = true;
                    }
                    Some(PushCommand::Disconnect) => self.stop(),
                    Some(PushCommand::Visibility(visible)) => {
                        if self.wanted && self.state.on_visible(visible, self.session.has_session()) {
                            debug!("visible again, reconnecting now");
                            dial = true;
                        }
                    }
                    Some(PushCommand::Send(_)) => warn!("push channel not connected, dropping outbound message"),
                },
                changed = self.sessions.changed(), if self.follow_session => match self.session_transition(changed) {
                    Some(true) => {
                        info!("signed in, starting push channel");
                        self.wanted = true;
                        dial = true;
                    }
                    Some(false) => {
                        if self.wanted {
                            info!("signed out, push channel stopped");
                        }
                        self.stop();
                    }
                    None => {}
                },
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    dial = true;
                }
            }
        }
    }

    /// One socket lifetime: dial, pump frames, report how it ended. Commands
    /// and session changes are served during the handshake too.
    async fn connection(&mut self) -> ConnectionEnd {
        self.state.on_connecting();
        self.publish();

        let Some(token) = self.session.access_token() else {
            debug!("no access token, push channel stays down");
            return ConnectionEnd::Closed;
        };
        let url = match self.config.push_url(&token) {
            Ok(url) => url,
            Err(e) => {
                warn!("bad push url: {e}");
                return self.failed();
            }
        };

        info!(url = %redact_token(&url), "connecting push channel");
        let handshake = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url.as_str()));
        tokio::pin!(handshake);
        let socket = loop {
            tokio::select! {
                res = &mut handshake => match res {
                    Ok(Ok((socket, _))) => break socket,
                    Ok(Err(e)) => {
                        warn!("push channel connect failed: {e}");
                        return self.failed();
                    }
                    Err(_) => {
                        warn!(timeout = ?CONNECT_TIMEOUT, "push channel handshake timed out");
                        return self.failed();
                    }
                },
                cmd = self.rx.recv() => match cmd {
                    None | Some(PushCommand::Shutdown) => return ConnectionEnd::Exit,
                    Some(PushCommand::Disconnect) => return ConnectionEnd::TornDown,
                    Some(PushCommand::Send(_)) => warn!("push channel not connected, dropping outbound message"),
                    Some(PushCommand::Connect) | Some(PushCommand::Visibility(_)) => {}
                },
                changed = self.sessions.changed(), if self.follow_session => {
                    if self.session_transition(changed) == Some(false) {
                        return ConnectionEnd::TornDown;
                    }
                }
            }
        };
        self.state.on_open();
        self.publish();
        info!("push channel connected");

        let (mut write, mut read) = socket.split();
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    None | Some(PushCommand::Shutdown) => {
                        let _ = write.send(Message::Close(None)).await;
                        return ConnectionEnd::Exit;
                    }
                    Some(PushCommand::Disconnect) => {
                        let _ = write.send(Message::Close(None)).await;
                        return ConnectionEnd::TornDown;
                    }
                    Some(PushCommand::Connect) | Some(PushCommand::Visibility(_)) => {}
                    Some(PushCommand::Send(value)) => {
                        if let Err(e) = write.send(Message::Text(value.to_string().into())).await {
                            warn!("push send failed: {e}");
                            return self.failed();
                        }
                    }
                },
                changed = self.sessions.changed(), if self.follow_session => {
                    if self.session_transition(changed) == Some(false) {
                        let _ = write.send(Message::Close(None)).await;
                        return ConnectionEnd::TornDown;
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.deliver(&text),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "push channel closed by server");
                        return ConnectionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("push channel error: {e}");
                        return self.failed();
                    }
                    None => return ConnectionEnd::Closed,
                },
            }
        }
    }

    fn deliver(&self, text: &str) {
        match serde_json::from_str::<PushMessage>(text) {
            Ok(msg) => {
                if matches!(msg.event, PushEvent::StatusUpdate { .. }) {
                    trace!(kind = msg.event.kind(), "push message");
                } else {
                    debug!(kind = msg.event.kind(), "push message");
                }
                // No subscribers is fine.
                let _ = self.events.send(msg);
            }
            Err(e) => warn!("undecodable push message: {e}"),
        }
    }
}
