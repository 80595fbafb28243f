use crate::modules::playhead::PlayheadProjector;
use crate::modules::protocol::{PlayerState, PlayerStatus, RepeatMode};
use crate::modules::reconcile::ReconcilePolicy;
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportAction {
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    Seek(u64),
    Repeat(RepeatMode),
}

impl TransportAction {
    /// Play/pause/stop and repeat are plain state flips the backend stores as
    /// sent. Track changes and seeks land wherever the device puts them.
    pub fn policy(self) -> ReconcilePolicy {
        match self {
            TransportAction::Play
            | TransportAction::Pause
            | TransportAction::Stop
            | TransportAction::Repeat(_) => ReconcilePolicy::KeepOptimistic,
            TransportAction::Next | TransportAction::Previous | TransportAction::Seek(_) => {
                ReconcilePolicy::Refetch
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TransportAction::Play => "play",
            TransportAction::Pause => "pause",
            TransportAction::Stop => "stop",
            TransportAction::Next => "next",
            TransportAction::Previous => "previous",
            TransportAction::Seek(_) => "seek",
            TransportAction::Repeat(_) => "repeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTicket {
    pub action: TransportAction,
}

/// Optimistic player state: the last polled status with local transport
/// gestures applied on top, plus the playhead projection.
#[derive(Debug, Clone)]
pub struct PlayerController {
    status: PlayerStatus,
    playhead: PlayheadProjector,
    in_flight: u32,
}

impl PlayerController {
    pub fn new(now: Instant) -> Self {
        Self {
            status: PlayerStatus::default(),
            playhead: PlayheadProjector::new(now),
            in_flight: 0,
        }
    }

    pub fn status(&self) -> &PlayerStatus {
        &self.status
    }

    pub fn is_mutating(&self) -> bool {
        self.in_flight > 0
    }

    pub fn displayed_time(&self, now: Instant) -> u64 {
        self.playhead.displayed(now)
    }

    pub fn playhead(&self) -> &PlayheadProjector {
        &self.playhead
    }

    /// Repeat mode the repeat button would switch to.
    pub fn next_repeat(&self) -> RepeatMode {
        self.status.repeat_mode.next()
    }

    pub fn begin(&mut self, action: TransportAction, now: Instant) -> TransportTicket {
        let playing = self.status.state == PlayerState::Playing;
        match action {
            TransportAction::Play => {
                self.status.state = PlayerState::Playing;
                self.playhead.on_transport(true, None, now);
            }
            TransportAction::Pause => {
                self.status.state = PlayerState::Paused;
                self.playhead.on_transport(false, None, now);
            }
            TransportAction::Stop => {
                self.status.state = PlayerState::Stopped;
                self.status.current_time = Some(0);
                self.playhead.on_transport(false, Some(0), now);
            }
            TransportAction::Next | TransportAction::Previous => {
                self.status.current_time = Some(0);
                self.playhead.on_transport(playing, Some(0), now);
            }
            TransportAction::Seek(t) => {
                self.status.current_time = Some(t);
                self.playhead.on_transport(playing, Some(t), now);
            }
            TransportAction::Repeat(mode) => self.status.repeat_mode = mode,
        }
        self.in_flight += 1;
        debug!(action = action.name(), "transport pending");
        TransportTicket { action }
    }

    /// Returns what to do with the cached status now that the request is done.
    pub fn settle(&mut self, ticket: &TransportTicket, ok: bool) -> ReconcilePolicy {
        self.in_flight = self.in_flight.saturating_sub(1);
        if !ok {
            debug!(action = ticket.action.name(), "transport failed, keeping optimistic state");
        }
        ticket.action.policy()
    }

    /// Applies a polled status unless a transport request is outstanding.
    pub fn apply_poll(&mut self, status: PlayerStatus, now: Instant) -> bool {
        if self.is_mutating() {
            return false;
        }
        self.playhead.on_poll(&status, now);
        self.status = status;
        true
    }

    pub fn begin_seek(&mut self, now: Instant) {
        self.playhead.begin_seek(now);
    }

    pub fn update_seek(&mut self, value: u64) {
        self.playhead.update_seek(value);
    }

    /// Ends the seek gesture and starts the seek mutation.
    pub fn commit_seek(&mut self, now: Instant) -> Option<TransportTicket> {
        let target = self.playhead.commit_seek(now)?;
        Some(self.begin(TransportAction::Seek(target), now))
    }
}
