//! Settings management for serterm.
//!
//! This module provides:
//! - TOML settings file loading from `~/.serterm/config.toml`
//! - A static field table used for display and `set <field> <value>`
//! - Change notification to subscribers
//!
//! # Configuration File
//!
//! ```toml
//! port_name = "COM7"
//! baud_rate = 115200
//!
//! # none, odd, even
//! parity = "none"
//!
//! # one, two
//! stop_bits = "one"
//!
//! # Receive format; "str" shows incoming bytes as text
//! format = "2xu16 f32"
//!
//! read_timeout_ms = 1000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::codec::format::{self, RAW_TEXT_SENTINEL};
use crate::core::port::{Parity, PortConfig, StopBits};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown setting '{0}'")]
    UnknownField(String),

    #[error("Invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Invalid receive format\n{0}")]
    InvalidFormat(String),

    #[error("Could not determine config path")]
    NoConfigDir,

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Persisted terminal settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub port_name: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Receive format specification
    pub format: String,
    pub read_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port_name: default_port_name().to_string(),
            baud_rate: 9600,
            parity: Parity::None,
            stop_bits: StopBits::One,
            format: RAW_TEXT_SENTINEL.to_string(),
            read_timeout_ms: 1000,
        }
    }
}

fn default_port_name() -> &'static str {
    if cfg!(windows) {
        "COM1"
    } else {
        "/dev/ttyUSB0"
    }
}

impl Settings {
    /// Load settings from file, falling back to defaults
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) if path.exists() => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Ignoring {}: {}", path.display(), e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse settings, resetting an unusable format to raw text
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut settings: Settings = toml::from_str(content)?;
        if settings.format.trim().is_empty() {
            settings.format = RAW_TEXT_SENTINEL.to_string();
        } else if format::validate(&settings.format).contains(&true) {
            warn!("Invalid format '{}' in settings, using raw text", settings.format);
            settings.format = RAW_TEXT_SENTINEL.to_string();
        }
        Ok(settings)
    }

    /// Save settings to file
    pub fn save(&self) -> Result<()> {
        let path = Self::get_config_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        info!("Settings saved to {}", path.display());
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    fn get_config_path() -> Option<PathBuf> {
        let dir = data_dir()?;
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }
        Some(dir.join("config.toml"))
    }

    /// Connection parameters for the session
    pub fn port_config(&self) -> PortConfig {
        PortConfig {
            port_name: self.port_name.clone(),
            baud_rate: self.baud_rate,
            parity: self.parity,
            stop_bits: self.stop_bits,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

/// Which part of the settings a change touched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsChange {
    /// Port name, baud rate, parity, stop bits or timeout
    Connection,
    Format,
}

/// One user-editable setting
pub struct Field {
    pub name: &'static str,
    pub label: &'static str,
    pub get: fn(&Settings) -> String,
    pub set: fn(&mut Settings, &str) -> Result<SettingsChange>,
}

pub static FIELDS: &[Field] = &[
    Field {
        name: "port",
        label: "Port name",
        get: |s| s.port_name.clone(),
        set: set_port,
    },
    Field {
        name: "baud",
        label: "Baud rate",
        get: |s| s.baud_rate.to_string(),
        set: set_baud,
    },
    Field {
        name: "parity",
        label: "Parity",
        get: |s| s.parity.to_string(),
        set: set_parity,
    },
    Field {
        name: "stopbits",
        label: "Stop bits",
        get: |s| s.stop_bits.to_string(),
        set: set_stop_bits,
    },
    Field {
        name: "format",
        label: "Receive format",
        get: |s| s.format.clone(),
        set: set_format,
    },
    Field {
        name: "timeout",
        label: "Read timeout (ms)",
        get: |s| s.read_timeout_ms.to_string(),
        set: set_timeout,
    },
];

/// Look up a field by name, case-insensitively
pub fn field(name: &str) -> Option<&'static Field> {
    FIELDS.iter().find(|f| f.name.eq_ignore_ascii_case(name))
}

fn set_port(s: &mut Settings, value: &str) -> Result<SettingsChange> {
    if value.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "port",
            value: value.to_string(),
        });
    }
    s.port_name = value.to_string();
    Ok(SettingsChange::Connection)
}

fn set_baud(s: &mut Settings, value: &str) -> Result<SettingsChange> {
    s.baud_rate = value
        .parse()
        .ok()
        .filter(|&baud: &u32| baud > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: "baud",
            value: value.to_string(),
        })?;
    Ok(SettingsChange::Connection)
}

fn set_parity(s: &mut Settings, value: &str) -> Result<SettingsChange> {
    s.parity = Parity::parse(value).ok_or_else(|| ConfigError::InvalidValue {
        field: "parity",
        value: value.to_string(),
    })?;
    Ok(SettingsChange::Connection)
}

fn set_stop_bits(s: &mut Settings, value: &str) -> Result<SettingsChange> {
    s.stop_bits = StopBits::parse(value).ok_or_else(|| ConfigError::InvalidValue {
        field: "stopbits",
        value: value.to_string(),
    })?;
    Ok(SettingsChange::Connection)
}

fn set_format(s: &mut Settings, value: &str) -> Result<SettingsChange> {
    if let Some(markers) = format::error_markers(value) {
        let words: Vec<&str> = value.split_whitespace().collect();
        return Err(ConfigError::InvalidFormat(format!("{}\n{}", words.join(" "), markers)));
    }
    s.format = if value.trim().is_empty() {
        RAW_TEXT_SENTINEL.to_string()
    } else {
        value.trim().to_string()
    };
    Ok(SettingsChange::Format)
}

fn set_timeout(s: &mut Settings, value: &str) -> Result<SettingsChange> {
    s.read_timeout_ms = value.parse().map_err(|_| ConfigError::InvalidValue {
        field: "timeout",
        value: value.to_string(),
    })?;
    Ok(SettingsChange::Connection)
}

/// Owns the live settings and tells subscribers what changed
pub struct SettingsStore {
    settings: Settings,
    subscribers: Vec<Sender<SettingsChange>>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            subscribers: Vec::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subscribe(&mut self) -> Receiver<SettingsChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Update one field by name and notify subscribers
    ///
    /// A rejected value leaves the settings untouched.
    pub fn set(&mut self, name: &str, value: &str) -> Result<SettingsChange> {
        let field = field(name).ok_or_else(|| ConfigError::UnknownField(name.to_string()))?;

        let mut updated = self.settings.clone();
        let change = (field.set)(&mut updated, value)?;
        if updated == self.settings {
            return Ok(change);
        }
        self.settings = updated;
        info!("Setting {} = {}", field.name, (field.get)(&self.settings));

        self.subscribers.retain(|tx| tx.send(change).is_ok());
        Ok(change)
    }

    /// Label/value pairs in table order
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        FIELDS
            .iter()
            .map(|f| (f.label, (f.get)(&self.settings)))
            .collect()
    }
}

/// `~/.serterm`, home of the settings file and the log
pub fn data_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".serterm"))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
