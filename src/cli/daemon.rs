//! Daemon CLI commands for inspecting and cleaning the registry.

use chrono::Utc;
use serde::Serialize;

use crate::daemon::diagnostics::process_alive;
use crate::daemon::info::{DaemonExpirationStatus, DaemonInfo, DaemonStopEvent};
use crate::daemon::parameters::DaemonParameters;
use crate::daemon::registry::{DaemonRegistry, FileRegistry};
use crate::error::Result;
use crate::output::{self, Output};

pub struct DaemonStatusOutput {
    pub daemons: Vec<(DaemonInfo, Option<bool>)>,
    pub stop_events: Vec<DaemonStopEvent>,
}

#[derive(Serialize)]
struct DaemonStatusJson<'a> {
    daemons: Vec<DaemonJson<'a>>,
    stop_events: &'a [DaemonStopEvent],
}

#[derive(Serialize)]
struct DaemonJson<'a> {
    #[serde(flatten)]
    info: &'a DaemonInfo,
    alive: Option<bool>,
}

impl Output for DaemonStatusOutput {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&DaemonStatusJson {
            daemons: self
                .daemons
                .iter()
                .map(|(info, alive)| DaemonJson {
                    info,
                    alive: *alive,
                })
                .collect(),
            stop_events: &self.stop_events,
        })
        .unwrap_or_default()
    }

    fn to_text(&self) -> String {
        if self.daemons.is_empty() && self.stop_events.is_empty() {
            return "No daemons registered.".to_string();
        }

        let mut lines = Vec::new();
        if self.daemons.is_empty() {
            lines.push("No daemons registered.".to_string());
        } else {
            lines.push("Registered daemons:".to_string());
            for (info, alive) in &self.daemons {
                let liveness = match alive {
                    Some(true) => "alive",
                    Some(false) => "dead",
                    None => "unknown",
                };
                lines.push(format!(
                    "  {} pid {} ({}, {}) at {}",
                    info.id,
                    info.pid,
                    info.state.label(),
                    liveness,
                    info.socket_path.display()
                ));
            }
        }
        if !self.stop_events.is_empty() {
            lines.push("Recent stop events:".to_string());
            for event in self.stop_events.iter().rev().take(5) {
                lines.push(format!(
                    "  {} {} ({:?}): {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.daemon_id,
                    event.status,
                    event.reason
                ));
            }
        }
        lines.join("\n")
    }
}

pub struct PurgeOutput {
    pub evicted: Vec<String>,
}

#[derive(Serialize)]
struct PurgeJson<'a> {
    evicted: &'a [String],
}

impl Output for PurgeOutput {
    fn to_json(&self) -> String {
        serde_json::to_string_pretty(&PurgeJson {
            evicted: &self.evicted,
        })
        .unwrap_or_default()
    }

    fn to_text(&self) -> String {
        if self.evicted.is_empty() {
            "Nothing to purge.".to_string()
        } else {
            format!("Evicted {} dead daemon(s): {}", self.evicted.len(), self.evicted.join(", "))
        }
    }
}

pub async fn status(json: bool) -> Result<()> {
    let parameters = DaemonParameters::from_env()?;
    let registry = FileRegistry::new(parameters.registry_path());

    let daemons = registry
        .list()?
        .into_iter()
        .map(|info| {
            let alive = process_alive(info.pid);
            (info, alive)
        })
        .collect();

    let status = DaemonStatusOutput {
        daemons,
        stop_events: registry.stop_events()?,
    };
    output::print(&status, json);
    Ok(())
}

pub async fn purge(json: bool) -> Result<()> {
    let parameters = DaemonParameters::from_env()?;
    let registry = FileRegistry::new(parameters.registry_path());

    let mut evicted = Vec::new();
    for info in registry.list()? {
        if process_alive(info.pid) == Some(false) {
            registry.remove(&info.id)?;
            registry.record_stop_event(&DaemonStopEvent {
                daemon_id: info.id.clone(),
                timestamp: Utc::now(),
                status: DaemonExpirationStatus::Evicted,
                reason: "process is gone".into(),
            })?;
            // best effort: the socket file is useless without its daemon
            let _ = std::fs::remove_file(&info.socket_path);
            evicted.push(info.id);
        }
    }

    output::print(&PurgeOutput { evicted }, json);
    Ok(())
}
