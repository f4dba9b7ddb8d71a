use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::alerts::rules::RuleConfig;
use crate::config::Config;

/// Operator commands, applied by the pipeline between transactions.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    /// Drop one branch's signature, history window and alert dedup state.
    ResetBranch(String),
    ResetAll,
    /// Swap in a new alert rule table.
    Reconfigure(Vec<RuleConfig>),
    SetGateway { id: String, healthy: bool },
    /// Log the last `n` stored risk scores.
    RecentScores(usize),
    /// Log per-branch routing advice.
    Report,
}

/// What one line of operator input asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlLine {
    Command(AdminCommand),
    Reload,
    Empty,
}

pub fn parse_line(line: &str) -> Result<ControlLine, String> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let command = match word {
        "" => return Ok(ControlLine::Empty),
        "reload" => return Ok(ControlLine::Reload),
        "reset" if !rest.is_empty() => AdminCommand::ResetBranch(rest.to_string()),
        "reset" => return Err("usage: reset <branch>".into()),
        "reset-all" => AdminCommand::ResetAll,
        "report" => AdminCommand::Report,
        "recent" if rest.is_empty() => AdminCommand::RecentScores(10),
        "recent" => AdminCommand::RecentScores(
            rest.parse()
                .map_err(|_| format!("recent: {rest:?} is not a count"))?,
        ),
        "gateway" => {
            let mut parts = rest.split_whitespace();
            let (Some(id), Some(state), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err("usage: gateway <id> up|down".into());
            };
            let healthy = match state {
                "up" => true,
                "down" => false,
                other => return Err(format!("gateway: unknown state {other:?}")),
            };
            AdminCommand::SetGateway {
                id: id.to_string(),
                healthy,
            }
        }
        other => return Err(format!("unknown command {other:?}")),
    };
    Ok(ControlLine::Command(command))
}

/// Reload the config file and turn its rule table into a command. A file that
/// fails validation leaves the running rules alone.
fn reload(path: &Path) -> Option<AdminCommand> {
    match Config::load(path) {
        Ok(config) => Some(AdminCommand::Reconfigure(config.alerts.rules)),
        Err(e) => {
            error!("Config reload rejected: {e}");
            None
        }
    }
}

/// Read operator commands from stdin until EOF or Ctrl-C. SIGHUP reloads the
/// config file.
pub async fn run(config_path: PathBuf, admin: mpsc::UnboundedSender<AdminCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut hangup = hangup_signal();

    loop {
        let command = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    Ok(ControlLine::Command(cmd)) => Some(cmd),
                    Ok(ControlLine::Reload) => reload(&config_path),
                    Ok(ControlLine::Empty) => None,
                    Err(e) => {
                        warn!("{e}");
                        None
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Stopped reading commands: {e}");
                    break;
                }
            },
            _ = wait_hangup(&mut hangup) => {
                info!("SIGHUP received, reloading {}", config_path.display());
                reload(&config_path)
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        if let Some(command) = command {
            if admin.send(command).is_err() {
                break;
            }
        }
    }
}

#[cfg(unix)]
type Hangup = Option<tokio::signal::unix::Signal>;

#[cfg(unix)]
fn hangup_signal() -> Hangup {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::hangup()) {
        Ok(sig) => Some(sig),
        Err(e) => {
            warn!("Failed to register SIGHUP handler: {e}");
            None
        }
    }
}

#[cfg(unix)]
async fn wait_hangup(sig: &mut Hangup) {
    if let Some(sig) = sig {
        if sig.recv().await.is_some() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(not(unix))]
type Hangup = ();

#[cfg(not(unix))]
fn hangup_signal() -> Hangup {}

#[cfg(not(unix))]
async fn wait_hangup(_: &mut Hangup) {
    std::future::pending::<()>().await
}
