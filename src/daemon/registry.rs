//! The daemon registry: which daemons exist and where to reach them.
//!
//! Persisted as a single JSON document next to the daemon directory. Writes
//! go through a sibling temp file and an atomic rename so concurrent readers
//! never observe a torn document.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::daemon::info::{DaemonInfo, DaemonState, DaemonStopEvent};
use crate::error::{AnvilError, Result};

/// How many stop events the registry retains.
const MAX_STOP_EVENTS: usize = 32;

/// Registry operations the connector depends on.
pub trait DaemonRegistry: Send + Sync {
    fn list(&self) -> Result<Vec<DaemonInfo>>;
    fn register(&self, info: &DaemonInfo) -> Result<()>;
    /// Remove an entry. Removing an id that is not present is not an error.
    fn remove(&self, daemon_id: &str) -> Result<()>;
    fn update_state(&self, daemon_id: &str, state: DaemonState) -> Result<()>;
    fn record_stop_event(&self, event: &DaemonStopEvent) -> Result<()>;
    fn stop_events(&self) -> Result<Vec<DaemonStopEvent>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    daemons: Vec<DaemonInfo>,
    #[serde(default)]
    stop_events: Vec<DaemonStopEvent>,
}

/// JSON-file-backed registry at `~/.anvil/registry.json`.
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<RegistryDocument> {
        if !self.path.exists() {
            return Ok(RegistryDocument::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| {
            AnvilError::Registry(format!(
                "could not parse registry at {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn save(&self, document: &RegistryDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify(&self, mutate: impl FnOnce(&mut RegistryDocument)) -> Result<()> {
        let mut document = self.load()?;
        mutate(&mut document);
        self.save(&document)
    }
}

impl DaemonRegistry for FileRegistry {
    fn list(&self) -> Result<Vec<DaemonInfo>> {
        Ok(self.load()?.daemons)
    }

    fn register(&self, info: &DaemonInfo) -> Result<()> {
        self.modify(|doc| {
            doc.daemons.retain(|d| d.id != info.id);
            doc.daemons.push(info.clone());
        })
    }

    fn remove(&self, daemon_id: &str) -> Result<()> {
        self.modify(|doc| doc.daemons.retain(|d| d.id != daemon_id))
    }

    fn update_state(&self, daemon_id: &str, state: DaemonState) -> Result<()> {
        let mut document = self.load()?;
        let daemon = document
            .daemons
            .iter_mut()
            .find(|d| d.id == daemon_id)
            .ok_or_else(|| {
                AnvilError::Registry(format!("daemon {} is not registered", daemon_id))
            })?;
        daemon.state = state;
        self.save(&document)
    }

    fn record_stop_event(&self, event: &DaemonStopEvent) -> Result<()> {
        self.modify(|doc| {
            doc.stop_events.push(event.clone());
            let excess = doc.stop_events.len().saturating_sub(MAX_STOP_EVENTS);
            doc.stop_events.drain(..excess);
        })
    }

    fn stop_events(&self) -> Result<Vec<DaemonStopEvent>> {
        Ok(self.load()?.stop_events)
    }
}
