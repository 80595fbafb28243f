use crate::modules::protocol::{CommandExecuted, PushEvent, PushMessage};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const CAPACITY: usize = 5;
pub const TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: u64,
    pub kind: String,
    pub title: String,
    pub description: String,
    pub timestamp: String,
    pub arrived_at: Instant,
}

/// Short-lived feed of recent push events, newest first.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    entries: VecDeque<Notification>,
    next_id: u64,
}

fn describe(event: &PushEvent) -> (String, String) {
    match event {
        PushEvent::CommandExecuted(c) => (
            "Command Executed".to_string(),
            format!("{} executed: {}", c.username, c.command),
        ),
        PushEvent::StatusUpdate { .. } => {
            ("Status Update".to_string(), "System status updated".to_string())
        }
        PushEvent::UserConnected(u) => ("User Connected".to_string(), format!("{} joined", u.username)),
        PushEvent::UserDisconnected(u) => ("User Disconnected".to_string(), format!("{} left", u.username)),
        PushEvent::Unknown { kind } => ("Notification".to_string(), kind.clone()),
    }
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: &PushMessage, now: Instant) -> u64 {
        let (title, description) = describe(&message.event);
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push_front(Notification {
            id,
            kind: message.event.kind().to_string(),
            title,
            description,
            timestamp: message.timestamp.clone(),
            arrived_at: now,
        });
        self.entries.truncate(CAPACITY);
        id
    }

    /// Echo for a preset the local operator just loaded; the backend does not
    /// send one back to the originating client.
    pub fn push_preset_loaded(&mut self, username: &str, preset_name: &str, now: Instant) -> u64 {
        let message = PushMessage {
            timestamp: String::new(),
            event: PushEvent::CommandExecuted(CommandExecuted {
                user_id: String::new(),
                username: username.to_string(),
                command: format!("Loaded Celebration: {preset_name}"),
                payload: None,
            }),
        };
        self.push(&message, now)
    }

    pub fn dismiss(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|n| n.id != id);
        self.entries.len() != before
    }

    /// Drops entries older than [`TTL`]; returns how many went.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|n| now.saturating_duration_since(n.arrived_at) < TTL);
        before - self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
