use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::MIN_POLL_INTERVAL_SECS;
use crate::error::{AppError, Result};
use crate::types::WatchDefinition;

#[derive(Deserialize)]
struct WatchFile {
    #[serde(default)]
    watches: Vec<WatchDefinition>,
}

/// Holds the live set of active watch definitions as an immutable snapshot.
/// Reload parses and validates the whole file first, then swaps the Arc;
/// in-flight work keeps reading its old snapshot untouched.
pub struct WatchRegistry {
    watches_file: PathBuf,
    snapshot: RwLock<Arc<Vec<WatchDefinition>>>,
}

impl WatchRegistry {
    /// Load the watch file and build the initial snapshot. Errors here are
    /// fatal to startup.
    pub fn load(watches_file: impl Into<PathBuf>) -> Result<Self> {
        let watches_file = watches_file.into();
        let watches = read_watch_file(&watches_file)?;
        info!(
            watches = watches.len(),
            file = %watches_file.display(),
            "Watch registry loaded"
        );
        Ok(Self {
            watches_file,
            snapshot: RwLock::new(Arc::new(watches)),
        })
    }

    /// Current active watch set. Cheap Arc clone; callers iterate their own
    /// snapshot and are unaffected by a concurrent reload.
    pub fn snapshot(&self) -> Arc<Vec<WatchDefinition>> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<WatchDefinition> {
        self.snapshot().iter().find(|w| w.name == name).cloned()
    }

    /// Re-read the watch file and atomically replace the snapshot. On any
    /// parse or validation error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<Arc<Vec<WatchDefinition>>> {
        let watches = read_watch_file(&self.watches_file)?;
        let next = Arc::new(watches);
        let mut guard = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = next.clone();
        info!(watches = next.len(), "Watch registry reloaded");
        Ok(next)
    }
}

fn read_watch_file(path: &PathBuf) -> Result<Vec<WatchDefinition>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        AppError::WatchFile(format!("cannot read {}: {e}", path.display()))
    })?;
    parse_watch_file(&text)
}

fn parse_watch_file(text: &str) -> Result<Vec<WatchDefinition>> {
    let file: WatchFile = toml::from_str(text)
        .map_err(|e| AppError::WatchFile(format!("invalid TOML: {e}")))?;

    let mut names = HashSet::new();
    let mut watches = Vec::with_capacity(file.watches.len());

    for mut watch in file.watches {
        validate_watch(&watch)?;
        if !names.insert(watch.name.clone()) {
            return Err(AppError::WatchFile(format!(
                "duplicate watch name: {}",
                watch.name
            )));
        }
        if !watch.active {
            continue;
        }
        if watch.polling_interval_secs < MIN_POLL_INTERVAL_SECS {
            warn!(
                watch = %watch.name,
                interval = watch.polling_interval_secs,
                floor = MIN_POLL_INTERVAL_SECS,
                "Polling interval below floor, clamping"
            );
            watch.polling_interval_secs = MIN_POLL_INTERVAL_SECS;
        }
        watches.push(watch);
    }
    Ok(watches)
}

fn validate_watch(watch: &WatchDefinition) -> Result<()> {
    if watch.name.trim().is_empty() {
        return Err(AppError::WatchFile("watch with empty name".to_string()));
    }
    if watch.domain.trim().is_empty() || watch.query.trim().is_empty() {
        return Err(AppError::WatchFile(format!(
            "watch {} needs a domain and a query",
            watch.name
        )));
    }
    if !(watch.max_price.is_finite() && watch.max_price > 0.0) {
        return Err(AppError::WatchFile(format!(
            "watch {} needs a positive max_price",
            watch.name
        )));
    }
    if let Some(min) = watch.min_price {
        if min > watch.max_price {
            return Err(AppError::WatchFile(format!(
                "watch {}: min_price exceeds max_price",
                watch.name
            )));
        }
    }
    Ok(())
}
