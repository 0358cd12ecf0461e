//! Key map directory watcher for hot-reload support

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::KeyMapStore;

/// Watches the maps directory and yields a freshly loaded store after changes
///
/// Only devices attached after a reload pick up the new maps.
pub struct KeyMapWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<KeyMapStore>,
}

impl KeyMapWatcher {
    pub fn new(dir: PathBuf) -> Result<Self> {
        let (tx, rx) = mpsc::channel(10);

        // notify callbacks run on their own OS thread, not in Tokio context
        let runtime_handle = tokio::runtime::Handle::current();
        let reload_dir = dir.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        debug!("Key map directory changed: {:?}", event.paths);

                        let dir = reload_dir.clone();
                        let tx = tx.clone();

                        runtime_handle.spawn(async move {
                            // Debounce: wait a bit for file writes to complete
                            tokio::time::sleep(Duration::from_millis(100)).await;

                            match KeyMapStore::load(dir).await {
                                Ok(store) => {
                                    info!("Key maps reloaded ({} map(s))", store.len());
                                    if let Err(e) = tx.send(store).await {
                                        error!("Failed to send key map update: {}", e);
                                    }
                                }
                                Err(e) => {
                                    warn!("Failed to reload key maps (keeping old maps): {}", e);
                                }
                            }
                        });
                    }
                }
                Err(e) => {
                    error!("Watch error: {}", e);
                }
            }
        })?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch key map directory: {}", dir.display()))?;

        info!("Key map watcher started for: {}", dir.display());

        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for the next reloaded store
    /// Returns None if the watcher has been closed
    pub async fn next_store(&mut self) -> Option<KeyMapStore> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_key_map_watcher_reloads_on_new_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut watcher = KeyMapWatcher::new(temp_dir.path().to_path_buf())?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(
            temp_dir.path().join("pad.yml"),
            "identification:\n  real_name: \"Pad\"\nnotes:\n  16: 60\n",
        )?;

        // A reload can fire on file creation, before the content is written
        let reloaded = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match watcher.next_store().await {
                    Some(store) if store.find_config("Pad").is_some() => return Some(store),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await
        .expect("no reload with the new map within 5s")
        .expect("watcher closed");

        let config = reloaded.find_config("Pad").unwrap();
        assert_eq!(config.notes.get(&16), Some(&60));

        Ok(())
    }

    #[tokio::test]
    async fn test_watching_missing_directory_fails() {
        assert!(KeyMapWatcher::new(PathBuf::from("/nonexistent/keyboard-midi/maps")).is_err());
    }
}
