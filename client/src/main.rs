use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use url::Url;

use watchparty_client::api::{ApiClient, ApiError};
use watchparty_client::auth::{AuthContext, FileTokenStore, UserProfile};
use watchparty_client::channel::SyncChannel;
use watchparty_client::connection::{run_connection_loop, Backoff, ConnectionStatus, Endpoint};
use watchparty_client::constants::{LOCAL_API_URL, LOCAL_WS_URL, VERSION};
use watchparty_client::controls::ControlCommand;
use watchparty_client::invite::{build_invite_url, parse_invite_url};
use watchparty_client::media::{MediaController, SimulatedElement, SystemClock};
use watchparty_client::session::{
    JoinTarget, SessionCommand, SessionHandle, SessionUpdate, WatchSession,
};
use watchparty_client::storage::{data_directory, is_portable_mode, SessionStore};
use watchparty_client::synchronizer::Role;
use watchparty_client::utils::format_time;

/// Terminal watch-party client
#[derive(Parser, Debug)]
#[command(name = "watchparty-client", version, about)]
struct Cli {
    /// Relay WebSocket URLs, tried in order
    #[arg(
        long = "server",
        env = "WATCHPARTY_SERVER_URL",
        value_delimiter = ',',
        default_value = LOCAL_WS_URL
    )]
    servers: Vec<String>,

    /// REST API base URL
    #[arg(long, env = "WATCHPARTY_API_URL", default_value = LOCAL_API_URL)]
    api: String,

    /// Display name shown to the room
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    passcode: Option<String>,

    /// Member limit when creating a room
    #[arg(long)]
    capacity: Option<usize>,

    /// Length of the simulated video in seconds
    #[arg(long, default_value_t = 5400.0)]
    duration: f64,

    #[arg(long, default_value = "watchparty://demo")]
    source: String,

    /// Make play() fail like a blocked autoplay
    #[arg(long)]
    deny_autoplay: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Create a room and become its host
    Create,
    /// Join an existing room
    Join { room: String },
    /// Join through an invite link
    Invite { url: String },
    /// Resume the last saved session
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Input {
    Control(ControlCommand),
    Status,
    Stats,
    Invite,
    Sync,
    Reconnect,
    Leave,
    Help,
    Quit,
}

const HELP: &str = "commands: play | pause | toggle | seek <secs> | skip <±secs> | vol <0..1> | mute | fs | status | stats | sync | invite | reconnect | leave | quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchparty_client=debug,info".into()),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("watchparty-client {}", VERSION);
    tracing::debug!(
        "Data directory: {} (portable: {})",
        data_directory().display(),
        is_portable_mode()
    );

    let mut passcode = cli.passcode.clone();
    let target = match &cli.command {
        Command::Create => JoinTarget::Create {
            passcode: passcode.clone(),
            capacity: cli.capacity,
        },
        Command::Join { room } => JoinTarget::Join {
            room_id: room.clone(),
            passcode: passcode.clone(),
        },
        Command::Invite { url } => {
            let invite = parse_invite_url(url).context("Not a valid invite link")?;
            passcode = invite.passcode.or(passcode);
            JoinTarget::Join {
                room_id: invite.room_id,
                passcode: passcode.clone(),
            }
        }
        Command::Resume => JoinTarget::Resume,
    };

    let auth = Arc::new(AuthContext::new(Arc::new(
        FileTokenStore::default_location(),
    )));
    let api = ApiClient::new(&cli.api, Arc::clone(&auth))?;
    let profile = sign_in(&api, cli.name.as_deref()).await;
    let display_name = cli
        .name
        .clone()
        .or_else(|| profile.map(|p| p.display_name));

    let token = auth.access_token();
    let endpoints: Vec<Endpoint> = cli
        .servers
        .iter()
        .map(|url| {
            let mut endpoint = Endpoint::from_url(url);
            endpoint.url = with_token(url, token.as_deref());
            endpoint
        })
        .collect();

    let (mut element, media_events) =
        SimulatedElement::new(Arc::new(SystemClock::new()), cli.duration);
    element.set_autoplay_allowed(!cli.deny_autoplay);
    let mut controller = MediaController::new(element);
    controller
        .load(&cli.source)
        .with_context(|| format!("Failed to load {}", cli.source))?;

    let channel = SyncChannel::new();
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
    let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel::<()>();
    tokio::spawn(run_connection_loop(
        channel.clone(),
        endpoints,
        Backoff::default(),
        status_tx,
        reconnect_rx,
    ));

    let (session, mut handle) = WatchSession::new(
        controller,
        media_events,
        channel.clone(),
        status_rx.clone(),
        SessionStore::default_location(),
        target,
        display_name,
    );
    let session_task = tokio::spawn(session.run());

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status_rx = status_rx;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(Input::Quit) => break,
                    Ok(input) => {
                        handle_input(input, &handle, &channel, &reconnect_tx, passcode.as_deref())
                            .await
                    }
                    Err(e) => println!("{e}. {HELP}"),
                }
            }
            Some(update) = handle.updates.recv() => print_update(update),
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("[{}]", *status_rx.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.send(SessionCommand::Shutdown);
    drop(reconnect_tx);
    channel.disconnect();
    session_task.await??;
    Ok(())
}

/// Reuse stored tokens when the API accepts them, otherwise start a guest session
async fn sign_in(api: &ApiClient, name: Option<&str>) -> Option<UserProfile> {
    if api.auth().is_authenticated() {
        match api.me().await {
            Ok(profile) => return Some(profile),
            Err(ApiError::Unauthorized | ApiError::NoSession) => {
                tracing::info!("Stored session expired; signing in again");
            }
            Err(e) => {
                tracing::warn!("Could not verify stored session: {}", e);
                return None;
            }
        }
    }
    match api.login_guest(name).await {
        Ok(profile) => Some(profile),
        Err(e) => {
            tracing::warn!("Guest sign-in failed; continuing anonymously: {}", e);
            None
        }
    }
}

fn with_token(ws_url: &str, token: Option<&str>) -> String {
    let Some(token) = token else {
        return ws_url.to_string();
    };
    match Url::parse(ws_url) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("token", token);
            url.to_string()
        }
        Err(_) => ws_url.to_string(),
    }
}

fn parse_command(line: &str) -> Result<Input, String> {
    let mut parts = line.split_whitespace();
    let word = parts.next().unwrap_or_default().to_ascii_lowercase();
    let mut number = |what: &str| -> Result<f64, String> {
        parts
            .next()
            .ok_or_else(|| format!("`{word}` needs {what}"))?
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| format!("`{word}` needs {what}"))
    };

    let input = match word.as_str() {
        "play" => Input::Control(ControlCommand::Play),
        "pause" => Input::Control(ControlCommand::Pause),
        "toggle" | "p" => Input::Control(ControlCommand::TogglePlay),
        "seek" => Input::Control(ControlCommand::Seek(number("a time in seconds")?)),
        "skip" => Input::Control(ControlCommand::Skip(number("a number of seconds")?)),
        "vol" | "volume" => {
            Input::Control(ControlCommand::SetVolume(number("a level from 0 to 1")?))
        }
        "mute" => Input::Control(ControlCommand::ToggleMute),
        "fs" | "fullscreen" => Input::Control(ControlCommand::ToggleFullscreen),
        "status" => Input::Status,
        "stats" => Input::Stats,
        "invite" => Input::Invite,
        "sync" => Input::Sync,
        "reconnect" => Input::Reconnect,
        "leave" => Input::Leave,
        "help" | "?" => Input::Help,
        "quit" | "exit" | "q" => Input::Quit,
        other => return Err(format!("unknown command `{other}`")),
    };
    Ok(input)
}

async fn handle_input(
    input: Input,
    handle: &SessionHandle,
    channel: &SyncChannel,
    reconnect_tx: &mpsc::UnboundedSender<()>,
    passcode: Option<&str>,
) {
    match input {
        Input::Control(command) => {
            handle.send(SessionCommand::Control(command));
        }
        Input::Status => {
            let Some(report) = handle.report().await else {
                return;
            };
            let role = match report.role {
                Role::Host => "host",
                Role::Viewer => "viewer",
            };
            let playback = &report.playback;
            println!(
                "{} | room {} as {} | {:?} {} / {} | vol {:.0}%{}{}",
                report.connection,
                report.room_id.as_deref().unwrap_or("-"),
                role,
                playback.phase,
                format_time(playback.current_time),
                format_time(playback.duration),
                playback.volume * 100.0,
                if playback.is_muted { " (muted)" } else { "" },
                if playback.is_fullscreen { " [fullscreen]" } else { "" },
            );
            for member in &report.members {
                let marker = if member.is_host { " (host)" } else { "" };
                println!("  - {}{}", member.display_name, marker);
            }
        }
        Input::Stats => {
            let stats = channel.stats_snapshot();
            println!(
                "socket: {} msgs out ({} B), {} msgs in ({} B), {} dropped, rtt {}, reconnects {}",
                stats.messages_out,
                stats.bytes_out,
                stats.messages_in,
                stats.bytes_in,
                stats.dropped_out,
                stats
                    .last_rtt_ms
                    .map(|ms| format!("{ms:.0} ms"))
                    .unwrap_or_else(|| "-".into()),
                stats.reconnect_attempts,
            );
            if let Some(report) = handle.report().await {
                let sync = report.sync;
                println!(
                    "sync: {} sent, {} applied, {} corrections (streak {}), max drift {:.3}s",
                    sync.sent, sync.applied, sync.corrections, sync.correction_streak, sync.max_drift
                );
            }
        }
        Input::Invite => {
            let room = handle
                .report()
                .await
                .and_then(|r| r.room_id.map(|id| (id, r.passcode_enabled)));
            match room {
                Some((room_id, passcode_enabled)) => {
                    let code = passcode.filter(|_| passcode_enabled);
                    println!("{}", build_invite_url(&room_id, code));
                }
                None => println!("not in a room yet"),
            }
        }
        Input::Sync => {
            handle.send(SessionCommand::RequestSync);
        }
        Input::Reconnect => {
            let _ = reconnect_tx.send(());
        }
        Input::Leave => {
            handle.send(SessionCommand::Leave);
        }
        Input::Help => println!("{HELP}"),
        Input::Quit => {}
    }
}

fn print_update(update: SessionUpdate) {
    match update {
        SessionUpdate::Joined {
            room_id,
            role,
            passcode_enabled,
        } => {
            let lock = if passcode_enabled { " (passcode)" } else { "" };
            println!("joined room {room_id}{lock} as {role:?}");
        }
        SessionUpdate::Left => println!("left the room"),
        SessionUpdate::Rejected(reason) => println!("could not enter room: {reason}"),
        SessionUpdate::Members(members) => println!("{} in room", members.len()),
        SessionUpdate::RoleChanged(Role::Host) => println!("you are now the host"),
        SessionUpdate::RoleChanged(Role::Viewer) => println!("you are now a viewer"),
        SessionUpdate::Synced(outcome) if outcome.corrected => {
            println!("caught up with host ({:.2}s drift)", outcome.drift)
        }
        SessionUpdate::Synced(_) => {}
        SessionUpdate::ControlDisabled(_) => {
            println!("controls are disabled: only the host controls playback")
        }
        SessionUpdate::MediaFailed(e) => println!("player: {e}"),
        SessionUpdate::ServerError(message) => println!("server: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transport_commands() {
        assert_eq!(parse_command("play"), Ok(Input::Control(ControlCommand::Play)));
        assert_eq!(
            parse_command("  SEEK 95.5 "),
            Ok(Input::Control(ControlCommand::Seek(95.5)))
        );
        assert_eq!(
            parse_command("skip -10"),
            Ok(Input::Control(ControlCommand::Skip(-10.0)))
        );
        assert_eq!(
            parse_command("vol 0.25"),
            Ok(Input::Control(ControlCommand::SetVolume(0.25)))
        );
        assert_eq!(parse_command("q"), Ok(Input::Quit));
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_command("seek").is_err());
        assert!(parse_command("seek soon").is_err());
        assert!(parse_command("skip NaN").is_err());
        assert!(parse_command("rewind").is_err());
    }

    #[test]
    fn token_is_appended_to_socket_url() {
        assert_eq!(
            with_token("ws://localhost:3005/ws", Some("abc")),
            "ws://localhost:3005/ws?token=abc"
        );
        assert_eq!(with_token("ws://localhost:3005/ws", None), "ws://localhost:3005/ws");
    }

    #[test]
    fn server_list_accepts_fallbacks() {
        let cli = Cli::parse_from([
            "watchparty-client",
            "--server",
            "wss://relay.example.com/ws,ws://localhost:3005/ws",
            "join",
            "123-456",
        ]);
        assert_eq!(cli.servers.len(), 2);
        assert!(matches!(cli.command, Command::Join { ref room } if room == "123-456"));
    }
}
