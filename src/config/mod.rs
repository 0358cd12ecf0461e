//! Key map configuration
//!
//! Handles loading, parsing, and hot-reloading of the YAML key maps. Each file
//! in the maps directory describes one keyboard model, matched against the
//! device's display name. `default.yml` (or the built-in default) applies to
//! keyboards without a dedicated map.

pub mod watcher;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::engine::ControlAction;
use crate::error::{Error, Result};

pub use watcher::KeyMapWatcher;

/// Built-in fallback map, used when the maps directory has no `default.yml`
const BUILTIN_DEFAULT: &str = include_str!("../../maps/default.yml");

/// File stem of the fallback map inside the maps directory
const DEFAULT_STEM: &str = "default";

/// One key map file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyMapConfig {
    #[serde(default)]
    pub identification: Identification,
    /// Key code → note number
    #[serde(default)]
    pub notes: BTreeMap<u8, u8>,
    /// Key code → control action
    #[serde(default)]
    pub control: BTreeMap<u8, ControlAction>,
    #[serde(default)]
    pub options: MapOptions,
    /// Port names to connect the device's output port to
    #[serde(default)]
    pub auto_connect: Vec<String>,
}

/// Device matching and display names
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Identification {
    /// Kernel display name this map applies to (exact match)
    #[serde(default)]
    pub real_name: String,
    /// Port name base; falls back to the device name
    #[serde(default)]
    pub nice_name: String,
}

/// Per-device behaviour options
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MapOptions {
    #[serde(default)]
    pub midi_jam_mode: DuplicatePolicy,
    /// Fixed Note-On velocity; omitted means humanized (random 64-126)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<u8>,
    /// Semitone intervals sounded in parallel with every note
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<i8>,
}

/// How repeated triggers of an already-sounding note are handled
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Every press sends Note-On, every release sends Note-Off
    Always,
    /// A note sounds once while any key holds it
    #[default]
    Never,
    /// Only the press that started a note can end it
    NewPressesOnly,
}

impl KeyMapConfig {
    /// Parse a key map from YAML text
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// The map compiled into the binary
    pub fn builtin_default() -> Result<Self> {
        Self::from_yaml(BUILTIN_DEFAULT, Path::new("<builtin default.yml>"))
    }

    /// Name used for the device's output port
    pub fn port_name(&self, device_name: &str) -> String {
        let base = if self.identification.nice_name.trim().is_empty() {
            device_name.trim()
        } else {
            self.identification.nice_name.trim()
        };
        // ':' separates client and port in JACK names
        let name = base.replace(':', "-");
        if name.is_empty() {
            "keyboard".to_string()
        } else {
            name
        }
    }
}

/// All key maps of the maps directory
#[derive(Debug, Clone)]
pub struct KeyMapStore {
    dir: PathBuf,
    maps: Vec<Arc<KeyMapConfig>>,
    default: Arc<KeyMapConfig>,
}

impl KeyMapStore {
    /// Load every `*.yml`/`*.yaml` file from `dir`
    ///
    /// Invalid files are skipped with a warning. A missing directory leaves
    /// only the built-in default map.
    pub async fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut maps = Vec::new();
        let mut default = None;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!(
                    "Key map directory {} unreadable ({}), using built-in default map",
                    dir.display(),
                    e
                );
                None
            }
        };

        let mut paths = Vec::new();
        if let Some(entries) = entries.as_mut() {
            while let Some(entry) = entries.next_entry().await.map_err(|e| Error::Config {
                path: dir.clone(),
                message: e.to_string(),
            })? {
                let path = entry.path();
                let is_yaml = matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yml") | Some("yaml")
                );
                if is_yaml {
                    paths.push(path);
                }
            }
        }
        paths.sort();

        for path in paths {
            let text = match fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Skipping key map {}: {}", path.display(), e);
                    continue;
                }
            };
            let config = match KeyMapConfig::from_yaml(&text, &path) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Skipping {}", e);
                    continue;
                }
            };

            if path.file_stem().and_then(|s| s.to_str()) == Some(DEFAULT_STEM) {
                debug!("Default key map loaded from {}", path.display());
                default = Some(Arc::new(config));
            } else {
                debug!(
                    "Key map {} loaded for \"{}\"",
                    path.display(),
                    config.identification.real_name
                );
                maps.push(Arc::new(config));
            }
        }

        let default = match default {
            Some(default) => default,
            None => Arc::new(KeyMapConfig::builtin_default()?),
        };

        info!("Loaded {} key map(s) from {}", maps.len(), dir.display());
        Ok(Self { dir, maps, default })
    }

    /// Store holding only the given maps (no directory)
    pub fn from_maps(maps: Vec<KeyMapConfig>, default: KeyMapConfig) -> Self {
        Self {
            dir: PathBuf::new(),
            maps: maps.into_iter().map(Arc::new).collect(),
            default: Arc::new(default),
        }
    }

    /// Map whose `real_name` equals the device display name
    pub fn find_config(&self, device_name: &str) -> Option<Arc<KeyMapConfig>> {
        self.maps
            .iter()
            .find(|m| m.identification.real_name == device_name)
            .cloned()
    }

    /// Matching map, or the default one (`false` in the second field)
    pub fn resolve(&self, device_name: &str) -> (Arc<KeyMapConfig>, bool) {
        match self.find_config(device_name) {
            Some(config) => {
                info!("Key map found for \"{}\"", device_name);
                (config, true)
            }
            None => {
                warn!("No key map for \"{}\", using default map", device_name);
                (self.default.clone(), false)
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
