//! Line-oriented command console.

use std::fmt::Write as _;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use duet_call::{SessionHandle, SessionNotice, SessionState, SessionStatus, format_duration};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

const HELP: &str = "\
commands:
  join     join the matchmaking queue
  leave    leave the queue
  end      hang up
  mute     toggle the microphone
  video    toggle the camera
  status   show the session
  refresh  get a new device token (used on the next connect)
  logout   forget the token and exit
  quit     exit, keeping the token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Join,
    Leave,
    End,
    Mute,
    Video,
    Status,
    Refresh,
    Logout,
    Quit,
    Help,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "join" | "j" => Self::Join,
            "leave" | "l" => Self::Leave,
            "end" | "hangup" => Self::End,
            "mute" | "m" => Self::Mute,
            "video" | "v" => Self::Video,
            "status" | "s" => Self::Status,
            "refresh" => Self::Refresh,
            "logout" => Self::Logout,
            "quit" | "exit" | "q" => Self::Quit,
            "help" | "?" => Self::Help,
            other => return Err(format!("unknown command `{other}`, try `help`")),
        })
    }
}

/// How the console ended.
pub enum Exit {
    Quit,
    LoggedOut,
}

pub async fn run(handle: SessionHandle) -> anyhow::Result<Exit> {
    let mut notices = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(Exit::Quit) };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match line.parse::<Command>() {
                    Ok(c) => c,
                    Err(e) => {
                        println!("{e}");
                        continue;
                    }
                };
                match command {
                    Command::Join => { handle.join_queue(); }
                    Command::Leave => { handle.leave_queue(); }
                    Command::End => { handle.end_call(); }
                    Command::Mute => { handle.toggle_mute(); }
                    Command::Video => { handle.toggle_video(); }
                    Command::Status => println!("{}", render(&handle.status(), Utc::now())),
                    Command::Refresh => match handle.refresh_token().await {
                        Ok(_) => println!("token refreshed; it will be used on the next connect"),
                        Err(e) => println!("refresh failed, keeping the old token: {e}"),
                    },
                    Command::Logout => {
                        handle.logout();
                        return Ok(Exit::LoggedOut);
                    }
                    Command::Quit => return Ok(Exit::Quit),
                    Command::Help => println!("{HELP}"),
                }
            }
            notice = notices.recv() => match notice {
                Ok(notice) => println!("{}", describe(&notice)),
                Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "Console fell behind on notices"),
                Err(RecvError::Closed) => return Ok(Exit::Quit),
            },
        }
    }
}

fn state_label(state: SessionState) -> &'static str {
    match state {
        SessionState::Disconnected => "disconnected",
        SessionState::Connecting => "connecting",
        SessionState::Connected => "connected",
        SessionState::Queued => "in queue",
        SessionState::Matched => "matched",
        SessionState::InCall => "in call",
        SessionState::Ended => "logged out",
    }
}

fn describe(notice: &SessionNotice) -> String {
    match notice {
        SessionNotice::StateChanged { to, .. } => format!("* {}", state_label(*to)),
        SessionNotice::Coordinator { message, .. } => format!("> {message}"),
        SessionNotice::CoordinatorError { message } => format!("! {message}"),
        SessionNotice::Reconnecting => "* connection lost, reconnecting".into(),
        SessionNotice::MediaToggled { kind, enabled } => {
            format!("* {kind:?} {}", if *enabled { "on" } else { "off" }).to_lowercase()
        }
        SessionNotice::CallFailed { reason } => format!("! call failed: {reason}"),
    }
}

fn render(status: &SessionStatus, now: DateTime<Utc>) -> String {
    let mut out = format!("state: {}", state_label(status.state));
    if !status.transport_open && status.state != SessionState::Ended {
        out.push_str(" (offline)");
    }
    if let Some(position) = status.queue_position {
        let _ = write!(out, "\nqueue position: {position}");
    }
    if let Some(call) = &status.call {
        let _ = write!(out, "\ncall: {} with {} ({:?})", call.call_id, call.partner_id, call.role);
    }
    if let Some(elapsed) = status.call_duration(now) {
        let _ = write!(out, "\nduration: {}", format_duration(elapsed));
    }
    if let Some(peer) = status.peer {
        let _ = write!(out, "\nmedia path: {peer:?}");
        let _ = write!(
            out,
            "\nmic: {}  camera: {}  remote tracks: {}",
            if status.muted { "muted" } else { "on" },
            if status.video_off { "off" } else { "on" },
            status.remote_tracks.len()
        );
    }
    if let Some(reason) = &status.failure {
        let _ = write!(out, "\nlast attempt failed: {reason} (type `join` to retry)");
    }
    out
}
