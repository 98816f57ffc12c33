use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hotkey::ListenerOptions;
use crate::orchestrator::OrchestratorOptions;

pub const APP_DIR_NAME: &str = "display-hotkeys";
const SETTINGS_FILE_NAME: &str = "settings.json";
const PROFILES_FILE_NAME: &str = "profiles.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Profile file to load. Defaults to `profiles.json` next to the settings file.
    pub profiles_path: Option<PathBuf>,

    /// Default log filter; `RUST_LOG` takes precedence.
    pub log_level: String,

    /// Activations waiting behind the one in flight before callers are back-pressured.
    pub activation_queue_capacity: usize,

    /// Hotkey presses buffered between the listener thread and the pipeline.
    pub event_channel_capacity: usize,

    /// How long the listener thread waits on the native queue before checking for commands.
    pub listener_poll_ms: u64,

    /// Finished activations kept for diagnostics.
    pub history_limit: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            profiles_path: None,
            log_level: "info".to_string(),
            activation_queue_capacity: 32,
            event_channel_capacity: 64,
            listener_poll_ms: 50,
            history_limit: 50,
        }
    }
}

impl AppSettings {
    /// Profile file to use, relative paths resolved against `config_dir`.
    pub fn profiles_file(&self, config_dir: &Path) -> PathBuf {
        match &self.profiles_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => config_dir.join(path),
            None => config_dir.join(PROFILES_FILE_NAME),
        }
    }

    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            poll_interval: Duration::from_millis(self.listener_poll_ms.max(1)),
            event_capacity: self.event_channel_capacity.max(1),
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            queue_capacity: self.activation_queue_capacity.max(1),
            history_limit: self.history_limit.max(1),
        }
    }
}

/// Per-user configuration directory, e.g. `%APPDATA%\display-hotkeys`.
pub fn config_dir() -> Result<PathBuf, String> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| "Could not determine config directory".to_string())
}

/// Directory for rotated log files, e.g. `%LOCALAPPDATA%\display-hotkeys\logs`.
pub fn log_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join(APP_DIR_NAME).join("logs"))
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join(SETTINGS_FILE_NAME)
}

/// Load settings from `path`. Never fails: problems fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // rename() does not replace an existing file on Windows.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))
}
