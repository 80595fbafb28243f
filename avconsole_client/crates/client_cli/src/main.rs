use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::cache::keys;
use client_core::config::ClientConfig;
use client_core::console::Console;
use client_core::http::ReqwestTransport;
use client_core::player::TransportAction;
use client_core::protocol::{CreateUserRequest, PlayerState, UserRole};
use client_core::push::{ChannelStatus, PushChannel};
use client_core::session::{SessionSource, SessionState};
use client_core::store::JsonFileStore;
use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

type App = Console<ReqwestTransport>;

#[derive(Parser, Debug)]
#[command(name = "avconsole", about = "Operator console for the AV appliance")]
struct Args {
    /// Backend root, e.g. http://10.0.0.5:8000 (default: AVCONSOLE_SERVER_URL).
    #[arg(long, global = true)]
    server: Option<String>,

    /// Where tokens and display settings are kept (default: AVCONSOLE_STATE_FILE).
    #[arg(long, global = true, value_name = "PATH")]
    state_file: Option<PathBuf>,

    /// Print raw JSON instead of text.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        username: String,
        /// Falls back to AVCONSOLE_PASSWORD, then a prompt on stdin.
        #[arg(long)]
        password: Option<String>,
    },
    Logout,
    Whoami,
    Version,
    /// Aggregate device status.
    Status,
    Presets {
        #[command(subcommand)]
        cmd: PresetsCmd,
    },
    Controls {
        #[command(subcommand)]
        cmd: ControlsCmd,
    },
    Player {
        #[command(subcommand)]
        cmd: PlayerCmd,
    },
    Recorder {
        #[command(subcommand)]
        cmd: RecorderCmd,
    },
    Users {
        #[command(subcommand)]
        cmd: UsersCmd,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    /// Follow push events and the notification feed until Ctrl-C.
    Watch,
}

#[derive(Subcommand, Debug)]
enum PresetsCmd {
    List,
    Load { id: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnOff {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum ControlsCmd {
    List,
    Volume { id: String, value: f64 },
    /// `id` may be the fader id or its mute id.
    Mute { id: String, state: OnOff },
}

#[derive(Subcommand, Debug)]
enum PlayerCmd {
    Sources,
    Songs,
    Status,
    Source { id: String },
    Song { id: String },
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    Seek { seconds: u64 },
    /// Cycle repeat mode none -> song -> group.
    Repeat,
}

#[derive(Subcommand, Debug)]
enum RecorderCmd {
    Status,
    Start {
        #[arg(long)]
        filename: Option<String>,
    },
    Stop,
}

#[derive(Subcommand, Debug)]
enum UsersCmd {
    List,
    Create {
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long, value_parser = parse_role, default_value = "viewer")]
        role: UserRole,
        #[arg(long)]
        full_name: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum SettingsCmd {
    Show,
    Bg { hex: String },
    Highlight { hex: String },
    Backlight { level: i64 },
}

fn parse_role(s: &str) -> Result<UserRole, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "admin" => Ok(UserRole::Admin),
        "operator" => Ok(UserRole::Operator),
        "viewer" => Ok(UserRole::Viewer),
        other => Err(format!("unknown role {other:?} (admin, operator, viewer)")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = ClientConfig::from_env();
    if let Some(server) = args.server.as_deref() {
        config.server_url = server.trim().trim_end_matches('/').to_string();
    }
    if let Some(path) = args.state_file.clone() {
        config.state_path = path;
    }

    let store = JsonFileStore::open(&config.state_path)
        .with_context(|| format!("opening state file {}", config.state_path.display()))?;
    let transport = ReqwestTransport::new(config.http_timeout)?;
    let app = Console::new(config, transport, Arc::new(store));

    match args.command {
        Command::Login { username, password } => {
            let password = match password.or_else(|| std::env::var("AVCONSOLE_PASSWORD").ok()) {
                Some(p) => p,
                None => prompt("password: ")?,
            };
            let user = app.login(&username, &password).await?;
            eprintln!("signed in as {} ({})", user.username, user.role);
        }
        Command::Logout => {
            app.logout().await;
            eprintln!("signed out");
        }
        Command::Settings { cmd } => settings(&app, cmd, args.json)?,
        Command::Version => {
            let v = app.version().await?;
            emit(args.json, &v, || format!("{} (built {})", v.version, v.build_date))?;
        }
        other => {
            require_session(&app).await?;
            run(&app, other, args.json).await?;
        }
    }
    Ok(())
}

async fn require_session(app: &App) -> anyhow::Result<()> {
    if app.restore().await.is_none() {
        bail!("not signed in, run `avconsole login <username>` first");
    }
    Ok(())
}

async fn run(app: &App, command: Command, json: bool) -> anyhow::Result<()> {
    match command {
        Command::Whoami => {
            let user = app
                .session()
                .current_user()
                .ok_or_else(|| anyhow!("no user in session"))?;
            emit(json, &user, || format!("{} <{}> role={}", user.username, user.email, user.role))?;
        }
        Command::Status => {
            let s = app.system_status().await?;
            emit(json, &s, || {
                let preset = s.preset.as_ref().map(|p| p.name.as_str()).unwrap_or("-");
                let player = s.player.as_ref().map(|p| format!("{:?}", p.state)).unwrap_or_else(|| "-".into());
                let recorder = s.recorder.as_ref().map(|r| format!("{:?}", r.state)).unwrap_or_else(|| "-".into());
                format!("preset={preset} player={player} recorder={recorder} controls={}", s.controls.len())
            })?;
        }
        Command::Presets { cmd } => presets(app, cmd, json).await?,
        Command::Controls { cmd } => controls(app, cmd, json).await?,
        Command::Player { cmd } => player(app, cmd, json).await?,
        Command::Recorder { cmd } => recorder(app, cmd, json).await?,
        Command::Users { cmd } => users(app, cmd, json).await?,
        Command::Watch => watch(app).await?,
        Command::Login { .. } | Command::Logout | Command::Version | Command::Settings { .. } => {}
    }
    Ok(())
}

async fn presets(app: &App, cmd: PresetsCmd, json: bool) -> anyhow::Result<()> {
    match cmd {
        PresetsCmd::List => {
            let list = app.presets().await?;
            let current = app.current_preset().await.ok().and_then(|c| c.id);
            emit(json, &list, || {
                list.iter()
                    .map(|p| {
                        let mark = if current.as_deref() == Some(p.id.as_str()) { "*" } else { " " };
                        format!("{mark} {:<8} {}", p.id, p.name)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        PresetsCmd::Load { id } => {
            app.presets().await?;
            app.load_preset(&id).await?;
            print_feed(app);
        }
    }
    Ok(())
}

async fn controls(app: &App, cmd: ControlsCmd, json: bool) -> anyhow::Result<()> {
    app.controls().await?;
    match cmd {
        ControlsCmd::List => {
            let defs = app.controls().await?;
            let values = app.refresh_control_values().await?;
            emit(json, &values, || {
                defs.iter()
                    .map(|c| {
                        let v = app.displayed_control(&c.id);
                        let level = v.volume.map(|x| format!("{x:.1}")).unwrap_or_else(|| "-".into());
                        let muted = match v.mute {
                            Some(true) => "muted",
                            Some(false) => "",
                            None => "",
                        };
                        format!("{:<10} {:<20} {:>7}{} {}", c.id, c.name, level, c.unit.as_deref().unwrap_or(""), muted)
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        ControlsCmd::Volume { id, value } => {
            let shown = app.set_volume(&id, value).await?;
            emit(json, &shown.volume, || format!("{} volume {:?}", shown.id, shown.volume))?;
        }
        ControlsCmd::Mute { id, state } => {
            let shown = app.set_mute(&id, matches!(state, OnOff::On)).await?;
            emit(json, &shown.mute, || format!("{} mute {:?}", shown.id, shown.mute))?;
        }
    }
    Ok(())
}

async fn player(app: &App, cmd: PlayerCmd, json: bool) -> anyhow::Result<()> {
    let action = match cmd {
        PlayerCmd::Sources => {
            let list = app.sources().await?;
            return emit(json, &list, || {
                list.iter().map(|s| format!("{:<8} {} ({})", s.id, s.name, s.kind)).collect::<Vec<_>>().join("\n")
            });
        }
        PlayerCmd::Songs => {
            let list = app.songs().await?;
            return emit(json, &list, || {
                list.iter()
                    .map(|s| format!("{:<8} {} {}", s.id, s.title, s.duration.map(clock).unwrap_or_default()))
                    .collect::<Vec<_>>()
                    .join("\n")
            });
        }
        PlayerCmd::Status => {
            app.refresh_player_status().await?;
            let (status, elapsed) = app.player_view(Instant::now());
            return emit(json, &status, || player_line(&status, elapsed));
        }
        PlayerCmd::Source { id } => return Ok(app.select_source(&id).await?),
        PlayerCmd::Song { id } => return Ok(app.select_song(&id).await?),
        PlayerCmd::Repeat => {
            app.refresh_player_status().await?;
            let mode = app.cycle_repeat().await?;
            eprintln!("repeat {}", mode.as_str());
            return Ok(());
        }
        PlayerCmd::Play => TransportAction::Play,
        PlayerCmd::Pause => TransportAction::Pause,
        PlayerCmd::Stop => TransportAction::Stop,
        PlayerCmd::Next => TransportAction::Next,
        PlayerCmd::Previous => TransportAction::Previous,
        PlayerCmd::Seek { seconds } => TransportAction::Seek(seconds),
    };
    app.refresh_player_status().await?;
    app.transport(action).await?;
    let (status, elapsed) = app.player_view(Instant::now());
    eprintln!("{}", player_line(&status, elapsed));
    Ok(())
}

async fn recorder(app: &App, cmd: RecorderCmd, json: bool) -> anyhow::Result<()> {
    match cmd {
        RecorderCmd::Status => {
            let s = app.recorder_status().await?;
            emit(json, &s, || {
                format!(
                    "{:?} {} {}",
                    s.state,
                    s.current_time.map(clock).unwrap_or_default(),
                    s.filename.as_deref().unwrap_or("")
                )
            })?;
        }
        RecorderCmd::Start { filename } => app.start_recording(filename).await?,
        RecorderCmd::Stop => app.stop_recording().await?,
    }
    Ok(())
}

async fn users(app: &App, cmd: UsersCmd, json: bool) -> anyhow::Result<()> {
    match cmd {
        UsersCmd::List => {
            let list = app.users().await?;
            emit(json, &list, || {
                list.iter()
                    .map(|u| format!("{:<6} {:<16} {:<9} {}", u.id, u.username, u.role, u.name))
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        UsersCmd::Create {
            username,
            password,
            role,
            full_name,
            email,
        } => {
            app.create_user(&CreateUserRequest {
                username,
                password,
                role,
                full_name,
                email,
            })
            .await?;
        }
        UsersCmd::Delete { id } => app.delete_user(&id).await?,
    }
    Ok(())
}

fn settings(app: &App, cmd: SettingsCmd, json: bool) -> anyhow::Result<()> {
    app.with_settings(|s| -> anyhow::Result<()> {
        match cmd {
            SettingsCmd::Show => {}
            SettingsCmd::Bg { hex } => s.set_background_color(&hex)?,
            SettingsCmd::Highlight { hex } => s.set_highlight_color(&hex)?,
            SettingsCmd::Backlight { level } => {
                s.set_backlight_level(level)?;
            }
        }
        let view = serde_json::json!({
            "background_color": s.background_color(),
            "highlight_color": s.highlight_color(),
            "backlight_level": s.backlight_level(),
            "theme": s.theme_class(),
            "overlay_opacity": s.overlay_opacity(),
        });
        emit(json, &view, || {
            let vars = s
                .css_variables()
                .into_iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join("; ");
            format!("{vars}; backlight {}% ({} theme)", s.backlight_level(), s.theme_class())
        })
    })
}

async fn watch(app: &App) -> anyhow::Result<()> {
    let session: Arc<dyn SessionSource> = app.session().clone();
    let channel = PushChannel::spawn(app.config().clone(), session);
    let mut events = channel.subscribe();
    let mut status = channel.watch_status();
    let mut auth = app.session().subscribe();
    channel.connect().await?;

    let polls = app.config().polls;
    let mut player_tick = tokio::time::interval(polls.player_status);
    let mut recorder_tick = tokio::time::interval(polls.recorder_status);
    let mut system_tick = tokio::time::interval(polls.system_status);
    let mut preset_tick = tokio::time::interval(polls.current_preset);
    let mut prune_tick = tokio::time::interval(Duration::from_secs(1));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            msg = events.recv() => match msg {
                Ok(msg) => {
                    let hit = app.handle_push(&msg, Instant::now());
                    print_feed(app);
                    if hit.contains(&keys::controls()) {
                        if let Err(e) = app.refresh_control_values().await {
                            warn!("control refresh failed: {e}");
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => eprintln!("(skipped {n} events)"),
                Err(RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = *status.borrow_and_update();
                eprintln!("push channel: {}", channel_label(now));
            }
            changed = auth.changed() => {
                if changed.is_err() {
                    break;
                }
                if *auth.borrow_and_update() == SessionState::Expired {
                    eprintln!("session expired, sign in again");
                    break;
                }
            }
            _ = player_tick.tick() => match app.refresh_player_status().await {
                Ok(s) if s.state != PlayerState::NoMedia => {
                    let (shown, elapsed) = app.player_view(Instant::now());
                    eprintln!("{}", player_line(&shown, elapsed));
                }
                Ok(_) => {}
                Err(e) => warn!("player poll failed: {e}"),
            },
            _ = recorder_tick.tick() => match app.poll_recorder_status().await {
                Ok(r) => debug!(state = ?r.state, "recorder status"),
                Err(e) => warn!("recorder poll failed: {e}"),
            },
            _ = system_tick.tick() => {
                if let Err(e) = app.poll_system_status().await {
                    warn!("system status poll failed: {e}");
                }
            }
            _ = preset_tick.tick() => match app.poll_current_preset().await {
                Ok(p) => debug!(preset = %p.name, "current preset"),
                Err(e) => warn!("preset poll failed: {e}"),
            },
            _ = prune_tick.tick() => {
                app.notifications(Instant::now());
            }
        }
    }

    channel.shutdown().await;
    Ok(())
}

fn channel_label(status: ChannelStatus) -> &'static str {
    match status {
        ChannelStatus::Disconnected => "disconnected",
        ChannelStatus::Connecting => "connecting",
        ChannelStatus::Connected => "connected",
        ChannelStatus::Error => "error",
    }
}

fn print_feed(app: &App) {
    if let Some(n) = app.notifications(Instant::now()).first() {
        eprintln!("[{}] {}", n.title, n.description);
    }
}

fn player_line(status: &client_core::protocol::PlayerStatus, elapsed: u64) -> String {
    format!(
        "{:?} {} {}/{} repeat={}",
        status.state,
        status.song_title.as_deref().unwrap_or("-"),
        clock(elapsed),
        status.total_time.map(clock).unwrap_or_else(|| "--:--".into()),
        status.repeat_mode.as_str()
    )
}

fn clock(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
    let out = if json {
        serde_json::to_string_pretty(value)?
    } else {
        text()
    };
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{out}")?;
    Ok(())
}

fn prompt(label: &str) -> anyhow::Result<String> {
    eprint!("{label}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let line = line.trim_end_matches(['\r', '\n']).to_string();
    if line.is_empty() {
        bail!("no password given");
    }
    Ok(line)
}
