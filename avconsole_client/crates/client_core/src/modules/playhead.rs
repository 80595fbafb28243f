use crate::modules::protocol::{PlayerState, PlayerStatus};
use std::time::{Duration, Instant};

/// How long after a transport command the local projection beats the poll.
pub const GRACE_WINDOW: Duration = Duration::from_secs(10);

/// Elapsed-time display for the player.
///
/// Right after play/pause/seek/next/previous the backend's reported position
/// lags or jumps, so for [`GRACE_WINDOW`] the position is projected locally
/// from the anchor. After that the polled value wins and re-anchors. An active
/// seek gesture overrides both.
#[derive(Debug, Clone)]
pub struct PlayheadProjector {
    anchor_time: u64,
    anchor_at: Instant,
    total_time: Option<u64>,
    playing: bool,
    polled_time: u64,
    last_transport_at: Option<Instant>,
    seek_gesture: Option<u64>,
}

impl PlayheadProjector {
    pub fn new(now: Instant) -> Self {
        Self {
            anchor_time: 0,
            anchor_at: now,
            total_time: None,
            playing: false,
            polled_time: 0,
            last_transport_at: None,
            seek_gesture: None,
        }
    }

    pub fn in_grace(&self, now: Instant) -> bool {
        self.last_transport_at
            .is_some_and(|t| now.saturating_duration_since(t) < GRACE_WINDOW)
    }

    pub fn total_time(&self) -> Option<u64> {
        self.total_time
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn on_poll(&mut self, status: &PlayerStatus, now: Instant) {
        let time = status.current_time.unwrap_or(0);
        self.polled_time = time;
        if status.total_time.is_some() {
            self.total_time = status.total_time;
        }
        if self.in_grace(now) {
            return;
        }
        self.anchor_time = time;
        self.anchor_at = now;
        self.playing = status.state == PlayerState::Playing;
    }

    /// Records a transport command. `position` is where the command puts the
    /// playhead (seek target, 0 for next/previous); `None` keeps the current
    /// displayed position.
    pub fn on_transport(&mut self, playing: bool, position: Option<u64>, now: Instant) {
        let from = position.unwrap_or_else(|| self.projected(now));
        self.anchor_time = from;
        self.anchor_at = now;
        self.playing = playing;
        self.last_transport_at = Some(now);
    }

    fn projected(&self, now: Instant) -> u64 {
        if !self.in_grace(now) {
            return self.polled_time;
        }
        if !self.playing {
            return self.anchor_time;
        }
        let elapsed = now.saturating_duration_since(self.anchor_at).as_millis() / 1000;
        let t = self.anchor_time.saturating_add(elapsed as u64);
        match self.total_time {
            Some(total) => t.min(total),
            None => t,
        }
    }

    pub fn displayed(&self, now: Instant) -> u64 {
        self.seek_gesture.unwrap_or_else(|| self.projected(now))
    }

    pub fn begin_seek(&mut self, now: Instant) {
        self.seek_gesture = Some(self.projected(now));
    }

    pub fn update_seek(&mut self, value: u64) {
        let v = match self.total_time {
            Some(total) => value.min(total),
            None => value,
        };
        self.seek_gesture = Some(v);
    }

    pub fn is_seeking(&self) -> bool {
        self.seek_gesture.is_some()
    }

    /// Ends the gesture and anchors there. Returns the target to send.
    pub fn commit_seek(&mut self, now: Instant) -> Option<u64> {
        let target = self.seek_gesture.take()?;
        self.on_transport(self.playing, Some(target), now);
        Some(target)
    }

    pub fn cancel_seek(&mut self) {
        self.seek_gesture = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: PlayerState, t: u64, total: u64) -> PlayerStatus {
        PlayerStatus {
            state,
            current_time: Some(t),
            total_time: Some(total),
            ..Default::default()
        }
    }

    #[test]
    fn projects_linearly_inside_grace() {
        let t0 = Instant::now();
        let mut p = PlayheadProjector::new(t0);
        p.on_poll(&status(PlayerState::Paused, 40, 100), t0);
        p.on_transport(true, None, t0);

        assert_eq!(p.displayed(t0 + Duration::from_millis(999)), 40);
        assert_eq!(p.displayed(t0 + Duration::from_millis(3_500)), 43);

        // A lagging poll inside the window does not move the display.
        p.on_poll(&status(PlayerState::Paused, 0, 100), t0 + Duration::from_secs(4));
        assert_eq!(p.displayed(t0 + Duration::from_secs(5)), 45);
    }

    #[test]
    fn projection_clamps_to_total() {
        let t0 = Instant::now();
        let mut p = PlayheadProjector::new(t0);
        p.on_poll(&status(PlayerState::Playing, 95, 100), t0);
        p.on_transport(true, None, t0);
        assert_eq!(p.displayed(t0 + Duration::from_secs(9)), 100);
    }

    #[test]
    fn paused_in_grace_holds_anchor() {
        let t0 = Instant::now();
        let mut p = PlayheadProjector::new(t0);
        p.on_poll(&status(PlayerState::Playing, 12, 100), t0);
        p.on_transport(false, None, t0);
        assert_eq!(p.displayed(t0 + Duration::from_secs(6)), 12);
    }

    #[test]
    fn poll_wins_after_grace() {
        let t0 = Instant::now();
        let mut p = PlayheadProjector::new(t0);
        p.on_transport(true, Some(0), t0);
        let later = t0 + GRACE_WINDOW + Duration::from_secs(1);
        assert!(!p.in_grace(later));
        p.on_poll(&status(PlayerState::Playing, 30, 200), later);
        assert_eq!(p.displayed(later + Duration::from_secs(1)), 30);
    }

    #[test]
    fn seek_gesture_overrides_projection() {
        let t0 = Instant::now();
        let mut p = PlayheadProjector::new(t0);
        p.on_poll(&status(PlayerState::Playing, 10, 60), t0);
        p.on_transport(true, None, t0);

        p.begin_seek(t0 + Duration::from_secs(2));
        p.update_seek(90);
        assert_eq!(p.displayed(t0 + Duration::from_secs(3)), 60);
        p.update_seek(25);
        assert_eq!(p.displayed(t0 + Duration::from_secs(8)), 25);

        let at = t0 + Duration::from_secs(8);
        assert_eq!(p.commit_seek(at), Some(25));
        assert!(!p.is_seeking());
        assert_eq!(p.displayed(at + Duration::from_secs(2)), 27);
    }
}
