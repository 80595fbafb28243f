//! Application context: one value holding every client service, handed to
//! whatever front end drives it.

use crate::modules::api::DeviceApi;
use crate::modules::cache::{keys, QueryCache, QueryKey};
use crate::modules::config::ClientConfig;
use crate::modules::http::{ApiError, HttpTransport};
use crate::modules::notifications::{Notification, NotificationQueue};
use crate::modules::player::{PlayerController, TransportAction, TransportTicket};
use crate::modules::protocol::*;
use crate::modules::reconcile::{
    ControlReconciler, ControlValue, Field, MutationTicket, ReconcilePolicy, SettleAction,
};
use crate::modules::session::SessionManager;
use crate::modules::settings::Settings;
use crate::modules::store::KeyValueStore;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

fn lock<X>(m: &Mutex<X>) -> MutexGuard<'_, X> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An outstanding mutation on `state`. Settled explicitly once the request
/// returns; if the request future is dropped first, `abandon` runs instead so
/// poll suppression cannot outlive the caller.
struct InFlight<'a, S, K> {
    state: &'a Mutex<S>,
    ticket: K,
    abandon: fn(&mut S, &K),
    armed: bool,
}

impl<'a, S, K> InFlight<'a, S, K> {
    fn new(state: &'a Mutex<S>, ticket: K, abandon: fn(&mut S, &K)) -> Self {
        Self {
            state,
            ticket,
            abandon,
            armed: true,
        }
    }

    fn settle<R>(mut self, f: impl FnOnce(&mut S, &K) -> R) -> R {
        self.armed = false;
        f(&mut lock(self.state), &self.ticket)
    }
}

impl<S, K> Drop for InFlight<'_, S, K> {
    fn drop(&mut self) {
        if self.armed {
            (self.abandon)(&mut lock(self.state), &self.ticket);
        }
    }
}

fn abandon_control(controls: &mut ControlReconciler, ticket: &MutationTicket) {
    if let SettleAction::Refetch { primary, field } = controls.settle(ticket, false) {
        controls.abandon_refetch(&primary, field);
    }
}

fn abandon_read_back(controls: &mut ControlReconciler, slot: &(String, Field)) {
    controls.abandon_refetch(&slot.0, slot.1);
}

fn abandon_transport(player: &mut PlayerController, ticket: &TransportTicket) {
    player.settle(ticket, false);
}

pub struct Console<T: HttpTransport> {
    config: ClientConfig,
    session: Arc<SessionManager<T>>,
    api: DeviceApi<T>,
    cache: Arc<QueryCache>,
    controls: Mutex<ControlReconciler>,
    player: Mutex<PlayerController>,
    notifications: Mutex<NotificationQueue>,
    settings: Mutex<Settings>,
}

impl<T: HttpTransport> Console<T> {
    pub fn new(config: ClientConfig, transport: T, store: Arc<dyn KeyValueStore>) -> Self {
        let session = Arc::new(SessionManager::new(transport, store.clone(), config.api_url("")));
        let api = DeviceApi::new(session.clone(), config.clone());
        let cache = Arc::new(QueryCache::new(config.query_retries));
        Self {
            session,
            api,
            cache,
            controls: Mutex::new(ControlReconciler::new()),
            player: Mutex::new(PlayerController::new(Instant::now())),
            notifications: Mutex::new(NotificationQueue::new()),
            settings: Mutex::new(Settings::load(store)),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager<T>> {
        &self.session
    }

    pub fn api(&self) -> &DeviceApi<T> {
        &self.api
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    // --- session ---

    pub async fn login(&self, username: &str, password: &str) -> Result<User, ApiError> {
        self.session.login(username, password).await
    }

    pub async fn restore(&self) -> Option<User> {
        self.session.restore().await
    }

    /// Cached backend state belongs to the signed-in user; drop it.
    pub async fn logout(&self) {
        self.session.logout().await;
        self.cache.clear();
    }

    // --- push ---

    /// Turns an inbound push message into cache invalidations and a
    /// notification. Returns the invalidated prefixes.
    pub fn handle_push(&self, message: &PushMessage, now: Instant) -> Vec<QueryKey> {
        lock(&self.notifications).push(message, now);

        let hit = match &message.event {
            PushEvent::CommandExecuted(_) | PushEvent::StatusUpdate { .. } => vec![
                keys::controls(),
                keys::player_status(),
                keys::recorder_status(),
                keys::current_preset(),
                keys::system_status(),
            ],
            PushEvent::UserConnected(_) | PushEvent::UserDisconnected(_) => Vec::new(),
            PushEvent::Unknown { kind } => {
                debug!(kind = %kind, "ignoring unknown push event");
                Vec::new()
            }
        };
        for key in &hit {
            self.cache.invalidate(key);
        }
        hit
    }

    pub fn notifications(&self, now: Instant) -> Vec<Notification> {
        let mut queue = lock(&self.notifications);
        queue.prune(now);
        queue.entries().cloned().collect()
    }

    pub fn dismiss_notification(&self, id: u64) -> bool {
        lock(&self.notifications).dismiss(id)
    }

    // --- reads ---

    pub async fn version(&self) -> Result<VersionInfo, ApiError> {
        let api = &self.api;
        self.cache.query(&keys::version(), move || api.version()).await
    }

    pub async fn system_status(&self) -> Result<SystemStatus, ApiError> {
        let api = &self.api;
        self.cache
            .query(&keys::system_status(), move || api.system_status())
            .await
    }

    pub async fn presets(&self) -> Result<Vec<Preset>, ApiError> {
        let api = &self.api;
        self.cache.query(&keys::presets(), move || api.presets()).await
    }

    pub async fn current_preset(&self) -> Result<CurrentPreset, ApiError> {
        let api = &self.api;
        self.cache
            .query(&keys::current_preset(), move || api.current_preset())
            .await
    }

    /// Control definitions; also (re)registers them for id resolution.
    pub async fn controls(&self) -> Result<Vec<Control>, ApiError> {
        let api = &self.api;
        let controls = self.cache.query(&keys::controls(), move || api.controls()).await?;
        lock(&self.controls).register_controls(&controls);
        Ok(controls)
    }

    pub async fn sources(&self) -> Result<Vec<Source>, ApiError> {
        let api = &self.api;
        self.cache.query(&keys::player_sources(), move || api.sources()).await
    }

    pub async fn songs(&self) -> Result<Vec<Song>, ApiError> {
        let api = &self.api;
        self.cache.query(&keys::player_songs(), move || api.songs()).await
    }

    pub async fn recorder_status(&self) -> Result<RecorderStatus, ApiError> {
        let api = &self.api;
        self.cache
            .query(&keys::recorder_status(), move || api.recorder_status())
            .await
    }

    pub async fn users(&self) -> Result<Vec<User>, ApiError> {
        let api = &self.api;
        self.cache.query(&keys::users(), move || api.users()).await
    }

    /// Fresh reads for polling loops: each call goes to the backend whatever
    /// the cache holds.
    pub async fn poll_recorder_status(&self) -> Result<RecorderStatus, ApiError> {
        self.cache.invalidate(&keys::recorder_status());
        self.recorder_status().await
    }

    pub async fn poll_system_status(&self) -> Result<SystemStatus, ApiError> {
        self.cache.invalidate(&keys::system_status());
        self.system_status().await
    }

    pub async fn poll_current_preset(&self) -> Result<CurrentPreset, ApiError> {
        self.cache.invalidate(&keys::current_preset());
        self.current_preset().await
    }

    /// Polls player status. The result only reaches the player view when no
    /// transport request is outstanding.
    pub async fn refresh_player_status(&self) -> Result<PlayerStatus, ApiError> {
        let api = &self.api;
        let status = self
            .cache
            .fetch_with_retry(&keys::player_status(), move || api.player_status())
            .await?;
        if !lock(&self.player).apply_poll(status.clone(), Instant::now()) {
            debug!("player poll ignored while a transport request is pending");
        }
        Ok(status)
    }

    /// Reads every control's volume and mute and applies them as a poll.
    pub async fn refresh_control_values(&self) -> Result<Vec<ControlValue>, ApiError> {
        let unregistered = lock(&self.controls).controls().next().is_none();
        if unregistered {
            self.controls().await?;
        }
        let token = self.cache.begin_fetch(&keys::control_values());
        let defs: Vec<Control> = lock(&self.controls).controls().cloned().collect();

        let mut values = Vec::with_capacity(defs.len());
        for c in &defs {
            let volume = self.api.volume(&c.id).await?.value.as_level();
            let mute = match c.second_id.as_deref() {
                Some(second) => self.api.mute(second).await?.value.as_flag(),
                None => None,
            };
            values.push(ControlValue {
                id: c.id.clone(),
                volume,
                mute,
            });
        }

        if self.cache.complete_fetch(&token, values.clone()) {
            lock(&self.controls).apply_poll(values.clone());
        }
        Ok(values)
    }

    pub fn displayed_control(&self, id: &str) -> ControlValue {
        lock(&self.controls).displayed(id)
    }

    pub fn player_view(&self, now: Instant) -> (PlayerStatus, u64) {
        let player = lock(&self.player);
        (player.status().clone(), player.displayed_time(now))
    }

    // --- presets ---

    pub async fn load_preset(&self, id: &str) -> Result<(), ApiError> {
        self.api.load_preset(id).await?;

        for key in [keys::current_preset(), keys::controls(), keys::player()] {
            self.cache.invalidate(&key);
        }

        let name = self
            .cache
            .get::<Vec<Preset>>(&keys::presets())
            .and_then(|ps| ps.into_iter().find(|p| p.id == id).map(|p| p.name))
            .unwrap_or_else(|| id.to_string());
        let user = self
            .session
            .current_user()
            .map(|u| u.username)
            .unwrap_or_default();
        lock(&self.notifications).push_preset_loaded(&user, &name, Instant::now());
        info!(preset = %name, "preset loaded");
        Ok(())
    }

    // --- controls ---

    pub async fn set_volume(&self, id: &str, level: f64) -> Result<ControlValue, ApiError> {
        self.set_control(id, ControlReading::Level(level)).await
    }

    /// `id` may be the control id or its `secondId`.
    pub async fn set_mute(&self, id: &str, muted: bool) -> Result<ControlValue, ApiError> {
        self.set_control(id, ControlReading::Flag(muted)).await
    }

    async fn set_control(&self, id: &str, value: ControlReading) -> Result<ControlValue, ApiError> {
        self.cache.cancel(&keys::controls());
        let ticket = lock(&self.controls).begin(id, value);
        let primary = ticket.primary.clone();
        let pending = InFlight::new(&self.controls, ticket, abandon_control);

        let result = self.api.set_control(&pending.ticket.target, value).await;
        let ok = result.is_ok();
        let action = pending.settle(|c, t| c.settle(t, ok));

        if let SettleAction::Refetch { primary, field } = action {
            self.refetch_control(primary, field).await;
        }
        result?;
        Ok(self.displayed_control(&primary))
    }

    async fn refetch_control(&self, primary: String, field: Field) {
        let target = lock(&self.controls).target_id(&primary, field);
        let settling = InFlight::new(&self.controls, (primary, field), abandon_read_back);
        let read = match field {
            Field::Volume => self.api.volume(&target).await,
            Field::Mute => self.api.mute(&target).await,
        };
        settling.settle(|c, (primary, field)| match read {
            Ok(v) => c.apply_authoritative(&target, v.value),
            Err(e) => {
                warn!(control = %primary, "read-back failed: {e}");
                c.abandon_refetch(primary, *field);
            }
        });
    }

    // --- player ---

    pub async fn transport(&self, action: TransportAction) -> Result<(), ApiError> {
        self.cache.cancel(&keys::player_status());
        let ticket = lock(&self.player).begin(action, Instant::now());
        let pending = InFlight::new(&self.player, ticket, abandon_transport);
        let result = self.send_transport(action).await;
        let ok = result.is_ok();
        let policy = pending.settle(|p, t| p.settle(t, ok));

        if policy == ReconcilePolicy::Refetch {
            self.cache.invalidate(&keys::player_status());
            if let Err(e) = self.refresh_player_status().await {
                warn!("player read-back failed: {e}");
            }
        }
        result
    }

    async fn send_transport(&self, action: TransportAction) -> Result<(), ApiError> {
        match action {
            TransportAction::Play => self.api.play().await,
            TransportAction::Pause => self.api.pause().await,
            TransportAction::Stop => self.api.stop().await,
            TransportAction::Next => self.api.next().await,
            TransportAction::Previous => self.api.previous().await,
            TransportAction::Seek(t) => self.api.seek(t).await,
            TransportAction::Repeat(mode) => self.api.set_repeat(mode).await,
        }
    }

    /// Advances repeat mode `none -> song -> group -> none`.
    pub async fn cycle_repeat(&self) -> Result<RepeatMode, ApiError> {
        let mode = lock(&self.player).next_repeat();
        self.transport(TransportAction::Repeat(mode)).await?;
        Ok(mode)
    }

    pub fn begin_seek(&self) {
        lock(&self.player).begin_seek(Instant::now());
    }

    pub fn update_seek(&self, value: u64) {
        lock(&self.player).update_seek(value);
    }

    pub async fn commit_seek(&self) -> Result<Option<u64>, ApiError> {
        let Some(ticket) = lock(&self.player).commit_seek(Instant::now()) else {
            return Ok(None);
        };
        let action = ticket.action;
        let pending = InFlight::new(&self.player, ticket, abandon_transport);
        let TransportAction::Seek(target) = action else {
            return Ok(None);
        };
        self.cache.cancel(&keys::player_status());
        let result = self.api.seek(target).await;
        let ok = result.is_ok();
        pending.settle(|p, t| p.settle(t, ok));
        self.cache.invalidate(&keys::player_status());
        if let Err(e) = self.refresh_player_status().await {
            warn!("player read-back failed: {e}");
        }
        result.map(|()| Some(target))
    }

    pub async fn select_source(&self, id: &str) -> Result<(), ApiError> {
        self.api.select_source(id).await?;
        self.cache.invalidate(&keys::player_songs());
        self.cache.invalidate(&keys::player_status());
        Ok(())
    }

    pub async fn select_song(&self, id: &str) -> Result<(), ApiError> {
        self.api.select_song(id).await?;
        self.cache.invalidate(&keys::player_status());
        Ok(())
    }

    // --- recorder ---

    pub async fn start_recording(&self, filename: Option<String>) -> Result<(), ApiError> {
        self.api.start_recording(filename).await?;
        self.cache.invalidate(&keys::recorder_status());
        Ok(())
    }

    pub async fn stop_recording(&self) -> Result<(), ApiError> {
        self.api.stop_recording().await?;
        self.cache.invalidate(&keys::recorder_status());
        Ok(())
    }

    // --- users ---

    pub async fn create_user(&self, req: &CreateUserRequest) -> Result<(), ApiError> {
        self.api.create_user(req).await?;
        self.cache.invalidate(&keys::users());
        Ok(())
    }

    pub async fn delete_user(&self, id: &str) -> Result<(), ApiError> {
        self.api.delete_user(id).await?;
        self.cache.invalidate(&keys::users());
        Ok(())
    }

    // --- settings ---

    pub fn with_settings<R>(&self, f: impl FnOnce(&mut Settings) -> R) -> R {
        f(&mut lock(&self.settings))
    }
}
