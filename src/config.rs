//! Simulator configuration
//!
//! The configuration record the simulator boots from, the `ConfigStore`
//! boundary trait and two stores: TOML-file-backed for the CLI and
//! in-memory for tests and embedders.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::domain::meter::AutoMeterConfig;
use crate::support::errors::{SimResult, SimulatorError};

/// The only protocol this simulator speaks.
pub const OCPP_VERSION: &str = "OCPP-1.6J";

fn default_ocpp_version() -> String {
    OCPP_VERSION.to_string()
}

fn default_connector_count() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> u64 {
    300
}

/// HTTP Basic credentials for the WebSocket upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// The immutable BootNotification record sent on every boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootInfo {
    pub vendor: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iccid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
}

impl Default for BootInfo {
    fn default() -> Self {
        Self {
            vendor: "cp-sim".to_string(),
            model: "Simulator".to_string(),
            serial_number: None,
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        }
    }
}

/// Everything a charge point instance needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatorConfig {
    pub cp_id: String,
    #[serde(default = "default_connector_count")]
    pub connector_count: u32,
    /// Base URL; the charge point id is appended.
    pub ws_url: String,
    #[serde(default = "default_ocpp_version")]
    pub ocpp_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
    /// Auto-meter started when a transaction begins charging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_meter_value: Option<AutoMeterConfig>,
    #[serde(default)]
    pub boot_notification: BootInfo,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    /// Return connectors to Available after stop/boot.
    #[serde(default = "default_true")]
    pub auto_reset_to_available: bool,
    /// Fallback heartbeat period; the BootNotification response interval
    /// overrides it.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl SimulatorConfig {
    pub fn new(cp_id: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            cp_id: cp_id.into(),
            connector_count: 1,
            ws_url: ws_url.into(),
            ocpp_version: OCPP_VERSION.to_string(),
            basic_auth: None,
            auto_meter_value: None,
            boot_notification: BootInfo::default(),
            tag_ids: Vec::new(),
            auto_reset_to_available: true,
            heartbeat_interval_secs: 300,
        }
    }

    /// Startup validation; failures here are fatal.
    pub fn validate(&self) -> SimResult<()> {
        if self.cp_id.trim().is_empty() {
            return Err(SimulatorError::Config("cpId must not be empty".into()));
        }
        if self.ws_url.trim().is_empty() {
            return Err(SimulatorError::Config("wsURL must not be empty".into()));
        }
        if !self.ws_url.starts_with("ws://") && !self.ws_url.starts_with("wss://") {
            return Err(SimulatorError::Config(format!(
                "wsURL must start with ws:// or wss://, got {}",
                self.ws_url
            )));
        }
        if self.connector_count == 0 {
            return Err(SimulatorError::Config("connectorNumber must be at least 1".into()));
        }
        Ok(())
    }
}

// ── Config store boundary ──────────────────────────────────────

type ConfigListener = Box<dyn Fn(&SimulatorConfig) + Send + Sync>;

/// Persistence boundary for the simulator configuration.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> SimResult<Option<SimulatorConfig>>;
    fn save(&self, config: &SimulatorConfig) -> SimResult<()>;
    /// Register a listener invoked after every successful save.
    fn subscribe(&self, listener: ConfigListener);
}

/// TOML file store used by the CLI.
pub struct TomlConfigStore {
    path: PathBuf,
    listeners: Mutex<Vec<ConfigListener>>,
}

impl TomlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), listeners: Mutex::new(Vec::new()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for TomlConfigStore {
    fn load(&self) -> SimResult<Option<SimulatorConfig>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| SimulatorError::Config(format!("{}: {e}", self.path.display())))?;
        let config: SimulatorConfig = toml::from_str(&raw)
            .map_err(|e| SimulatorError::Config(format!("{}: {e}", self.path.display())))?;
        Ok(Some(config))
    }

    fn save(&self, config: &SimulatorConfig) -> SimResult<()> {
        let raw = toml::to_string_pretty(config)
            .map_err(|e| SimulatorError::Config(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SimulatorError::Config(format!("{}: {e}", parent.display())))?;
        }
        std::fs::write(&self.path, raw)
            .map_err(|e| SimulatorError::Config(format!("{}: {e}", self.path.display())))?;
        for listener in self.listeners.lock().unwrap().iter() {
            listener(config);
        }
        Ok(())
    }

    fn subscribe(&self, listener: ConfigListener) {
        self.listeners.lock().unwrap().push(listener);
    }
}

/// In-memory store for tests and embedders.
#[derive(Default)]
pub struct MemoryConfigStore {
    config: Mutex<Option<SimulatorConfig>>,
    listeners: Mutex<Vec<ConfigListener>>,
}

impl MemoryConfigStore {
    pub fn new(config: Option<SimulatorConfig>) -> Self {
        Self { config: Mutex::new(config), listeners: Mutex::new(Vec::new()) }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> SimResult<Option<SimulatorConfig>> {
        Ok(self.config.lock().unwrap().clone())
    }

    fn save(&self, config: &SimulatorConfig) -> SimResult<()> {
        *self.config.lock().unwrap() = Some(config.clone());
        for listener in self.listeners.lock().unwrap().iter() {
            listener(config);
        }
        Ok(())
    }

    fn subscribe(&self, listener: ConfigListener) {
        self.listeners.lock().unwrap().push(listener);
    }
}

/// Default CLI config location: `~/.config/cp-sim/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cp-sim")
        .join("config.toml")
}
