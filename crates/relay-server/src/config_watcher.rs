//! Hot reload of operator display names.
//!
//! A `notify` watcher on the config file's directory feeds raw change events
//! into a tokio task. The task waits for the file to go quiet, parses it, and
//! publishes the `displayNames` map only when it differs from the last one.
//! Every other setting needs a restart.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};

pub type DisplayNames = HashMap<String, String>;

/// Quiet period after the last event before the file is re-read.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Keeps the watch alive; dropping it stops publishing.
pub struct DisplayNameWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for DisplayNameWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watch `path` and send each new display-name map on `tx`.
///
/// `current` is the map already in effect; rewrites that leave it unchanged
/// publish nothing. Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns `RelayError::Config` if the file's directory does not exist, or
/// `RelayError::Watcher` if the watch cannot be installed.
pub fn watch_display_names(
    path: PathBuf,
    current: DisplayNames,
    tx: mpsc::UnboundedSender<DisplayNames>,
) -> Result<DisplayNameWatcher> {
    let Some(dir) = path.parent().filter(|dir| dir.is_dir()) else {
        return Err(RelayError::Config(format!(
            "cannot watch {}: parent directory does not exist",
            path.display()
        )));
    };
    let Some(file_name) = path.file_name().map(OsStr::to_owned) else {
        return Err(RelayError::Config(format!(
            "cannot watch {}: not a file path",
            path.display()
        )));
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) if touches(&event, &file_name) => {
                let _ = event_tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!("Config watcher error: {}", e),
        }
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    info!("Watching {} for display name changes", path.display());

    let task = tokio::spawn(reload_loop(path, current, event_rx, tx));
    Ok(DisplayNameWatcher {
        _watcher: watcher,
        task,
    })
}

fn touches(event: &Event, file_name: &OsStr) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name))
}

async fn reload_loop(
    path: PathBuf,
    mut current: DisplayNames,
    mut events: mpsc::UnboundedReceiver<()>,
    tx: mpsc::UnboundedSender<DisplayNames>,
) {
    while events.recv().await.is_some() {
        // Editors save in bursts of events.
        while let Ok(Some(())) = tokio::time::timeout(SETTLE_DELAY, events.recv()).await {}

        let names = match RelayConfig::load(&path) {
            Ok(config) => config.display_names,
            Err(e) => {
                warn!("Ignoring config change: {}", e);
                continue;
            }
        };
        if names == current {
            debug!("Config rewritten without display name changes");
            continue;
        }

        current.clone_from(&names);
        if tx.send(names).is_err() {
            break;
        }
    }
    debug!("Display name watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn names(pairs: &[(&str, &str)]) -> DisplayNames {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_publishes_changed_display_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"displayNames": {"A": "One"}}"#).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = watch_display_names(path.clone(), names(&[("A", "One")]), tx).unwrap();

        std::fs::write(&path, r#"{"displayNames": {"A": "Two", "B": "Lobby"}}"#).unwrap();

        let published = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(published, names(&[("A", "Two"), ("B", "Lobby")]));
    }

    #[tokio::test]
    async fn test_skips_unchanged_and_malformed_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"displayNames": {"A": "One"}}"#).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = watch_display_names(path.clone(), names(&[("A", "One")]), tx).unwrap();

        std::fs::write(
            &path,
            r#"{"sweepIntervalSecs": 15, "displayNames": {"A": "One"}}"#,
        )
        .unwrap();
        tokio::time::sleep(SETTLE_DELAY * 3).await;
        std::fs::write(&path, "{ not json").unwrap();
        tokio::time::sleep(SETTLE_DELAY * 3).await;
        assert!(rx.try_recv().is_err());

        std::fs::write(&path, r#"{"displayNames": {"A": "Three"}}"#).unwrap();
        let published = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(published, names(&[("A", "Three")]));
    }

    #[tokio::test]
    async fn test_ignores_other_files_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{}").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = watch_display_names(path.clone(), DisplayNames::new(), tx).unwrap();

        std::fs::write(dir.path().join("notes.json"), r#"{"displayNames": {"A": "x"}}"#)
            .unwrap();
        tokio::time::sleep(SETTLE_DELAY * 3).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent").join("config.json");
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = watch_display_names(path, DisplayNames::new(), tx);
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}
