use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use control_core::DEFAULT_SEND_TIMEOUT;
use serde::Deserialize;
use shared::domain::ConnectionMode;
use storage::{CONFIG_FILE, POSITIONS_FILE, ROUTINES_FILE};
use tracing::warn;

pub const SETTINGS_FILE: &str = "armctl.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub serial_port: Option<String>,
    pub mode: ConnectionMode,
    pub send_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("Recursos"),
            serial_port: None,
            mode: ConnectionMode::Serial,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl Settings {
    pub fn positions_path(&self) -> PathBuf {
        self.data_dir.join(POSITIONS_FILE)
    }

    pub fn routines_path(&self) -> PathBuf {
        self.data_dir.join(ROUTINES_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    data_dir: Option<PathBuf>,
    serial_port: Option<String>,
    mode: Option<String>,
    send_timeout_ms: Option<u64>,
}

/// Defaults, then `armctl.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let file = match fs::read_to_string(SETTINGS_FILE) {
        Ok(raw) => Some(raw),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
        Err(error) => {
            warn!(file = SETTINGS_FILE, %error, "could not read settings file");
            None
        }
    };
    resolve_settings(file.as_deref(), |key| std::env::var(key).ok())
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    Ok(resolve_settings(Some(&raw), |key| std::env::var(key).ok()))
}

fn resolve_settings(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<FileSettings>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.data_dir {
                    settings.data_dir = v;
                }
                if let Some(v) = file_cfg.serial_port {
                    settings.serial_port = Some(v);
                }
                if let Some(v) = file_cfg.mode {
                    apply_mode(&mut settings, &v);
                }
                if let Some(v) = file_cfg.send_timeout_ms {
                    settings.send_timeout = Duration::from_millis(v);
                }
            }
            Err(error) => warn!(%error, "ignoring malformed settings file"),
        }
    }

    for key in ["ARMCTL_DATA_DIR", "APP__DATA_DIR"] {
        if let Some(v) = env(key) {
            settings.data_dir = PathBuf::from(v);
        }
    }
    for key in ["ARMCTL_SERIAL_PORT", "APP__SERIAL_PORT"] {
        if let Some(v) = env(key) {
            settings.serial_port = Some(v);
        }
    }
    for key in ["ARMCTL_MODE", "APP__MODE"] {
        if let Some(v) = env(key) {
            apply_mode(&mut settings, &v);
        }
    }
    for key in ["ARMCTL_SEND_TIMEOUT_MS", "APP__SEND_TIMEOUT_MS"] {
        if let Some(v) = env(key) {
            if let Ok(parsed) = v.trim().parse::<u64>() {
                settings.send_timeout = Duration::from_millis(parsed);
            }
        }
    }

    settings
}

fn apply_mode(settings: &mut Settings, raw: &str) {
    match raw.parse() {
        Ok(mode) => settings.mode = mode,
        Err(error) => warn!(%error, "keeping connection mode {}", settings.mode),
    }
}
