//! Configuration
//!
//! Two documents are involved in a run:
//!
//! - Connection settings (`~/.snapcg/config.toml`), overridable from the
//!   environment and the command line:
//!
//! ```toml
//! [array]
//! api_url = "https://192.168.1.100:8443/devmgr/v2"
//! ssid = "1"
//! username = "admin"
//! password = "secret"
//! validate_certs = true
//! timeout_secs = 60
//! ```
//!
//! - The desired configuration passed to `snapcg apply`:
//!
//! ```toml
//! state = "present"
//! type = "group"
//! group_name = "g1"
//!
//! [[volumes]]
//! volume = "vol1"
//! reserve_capacity_pct = 20
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use snapcg_array::HttpTransportConfig;
use snapcg_core::{
    ReserveFullPolicy, RollbackPriority, SnapError, DEFAULT_ALERT_THRESHOLD_PCT,
    DEFAULT_MAXIMUM_SNAPSHOTS, DEFAULT_RESERVE_CAPACITY_PCT,
};

use crate::request::{GroupSettings, Operation, PitSelector, VolumeSpec};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for SnapError {
    fn from(err: ConfigError) -> Self {
        SnapError::Validation(err.to_string())
    }
}

// =============================================================================
// CONNECTION SETTINGS
// =============================================================================

/// Contents of `~/.snapcg/config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapcgConfig {
    #[serde(default)]
    pub array: ArraySettings,
}

/// Array connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArraySettings {
    /// REST API root
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Storage system id
    #[serde(default = "default_ssid")]
    pub ssid: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_validate_certs")]
    pub validate_certs: bool,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

const DEFAULT_API_URL: &str = "https://localhost:8443/devmgr/v2";
const DEFAULT_SSID: &str = "1";
const DEFAULT_USERNAME: &str = "admin";

impl Default for ArraySettings {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            ssid: default_ssid(),
            username: default_username(),
            password: default_password(),
            validate_certs: default_validate_certs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_url() -> String {
    std::env::var("SNAPCG_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string())
}

fn default_ssid() -> String {
    std::env::var("SNAPCG_SSID").unwrap_or_else(|_| DEFAULT_SSID.to_string())
}

fn default_username() -> String {
    std::env::var("SNAPCG_API_USERNAME").unwrap_or_else(|_| DEFAULT_USERNAME.to_string())
}

fn default_password() -> String {
    std::env::var("SNAPCG_API_PASSWORD").unwrap_or_default()
}

fn default_validate_certs() -> bool {
    std::env::var("SNAPCG_VALIDATE_CERTS")
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(true)
}

fn default_timeout_secs() -> u64 {
    60
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl ArraySettings {
    /// Built-in settings, ignoring the environment
    pub fn builtin() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ssid: DEFAULT_SSID.to_string(),
            username: DEFAULT_USERNAME.to_string(),
            password: String::new(),
            validate_certs: true,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Apply environment overrides on top of values read from a file
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SNAPCG_API_URL") {
            self.api_url = v;
        }
        if let Ok(v) = std::env::var("SNAPCG_SSID") {
            self.ssid = v;
        }
        if let Ok(v) = std::env::var("SNAPCG_API_USERNAME") {
            self.username = v;
        }
        if let Ok(v) = std::env::var("SNAPCG_API_PASSWORD") {
            self.password = v;
        }
        if let Some(v) = std::env::var("SNAPCG_VALIDATE_CERTS").ok().and_then(|v| parse_bool(&v)) {
            self.validate_certs = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ConfigError::ValidationError(format!(
                "api_url must start with http:// or https://, got [{}]",
                self.api_url
            )));
        }
        if self.ssid.is_empty() {
            return Err(ConfigError::ValidationError("ssid must not be empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Transport parameters for these settings
    pub fn transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            api_url: self.api_url.clone(),
            ssid: self.ssid.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            validate_certs: self.validate_certs,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

impl SnapcgConfig {
    /// Starting point for a new settings file; secrets from the environment
    /// are never written out
    pub fn template() -> Self {
        Self {
            array: ArraySettings::builtin(),
        }
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut config: SnapcgConfig = toml::from_str(&content)?;
        config.array.apply_env();
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Config directory (`~/.snapcg/`)
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".snapcg"))
        .ok_or_else(|| ConfigError::ValidationError("Could not determine home directory".to_string()))
}

/// Default config file path
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

// =============================================================================
// DESIRED CONFIGURATION
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Present,
    Absent,
    Rollback,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Group,
    Pit,
    View,
}

/// Volume entry of a desired configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeEntry {
    pub volume: String,
    #[serde(default = "default_reserve_capacity_pct")]
    pub reserve_capacity_pct: u32,
    #[serde(default)]
    pub preferred_reserve_storage_pool: Option<String>,
    #[serde(default = "default_true")]
    pub snapshot_volume_writable: bool,
    #[serde(default)]
    pub snapshot_volume_validate: bool,
}

fn default_reserve_capacity_pct() -> u32 {
    DEFAULT_RESERVE_CAPACITY_PCT
}

fn default_maximum_snapshots() -> u32 {
    DEFAULT_MAXIMUM_SNAPSHOTS
}

fn default_alert_threshold_pct() -> u32 {
    DEFAULT_ALERT_THRESHOLD_PCT
}

fn default_true() -> bool {
    true
}

/// Desired configuration document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredConfig {
    #[serde(default)]
    pub state: DesiredState,

    #[serde(default, rename = "type")]
    pub target: TargetKind,

    pub group_name: String,

    #[serde(default)]
    pub volumes: Vec<VolumeEntry>,

    #[serde(default = "default_maximum_snapshots")]
    pub maximum_snapshots: u32,

    #[serde(default = "default_alert_threshold_pct")]
    pub alert_threshold_pct: u32,

    #[serde(default)]
    pub reserve_capacity_full_policy: ReserveFullPolicy,

    #[serde(default)]
    pub rollback_priority: RollbackPriority,

    #[serde(default = "default_true")]
    pub rollback_backup: bool,

    #[serde(default)]
    pub pit_name: Option<String>,

    #[serde(default)]
    pub pit_description: Option<String>,

    #[serde(default)]
    pub pit_timestamp: Option<String>,

    #[serde(default)]
    pub view_name: Option<String>,
}

impl DesiredConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    fn volume_specs(&self) -> Vec<VolumeSpec> {
        self.volumes
            .iter()
            .map(|v| VolumeSpec {
                name: v.volume.clone(),
                reserve_capacity_pct: v.reserve_capacity_pct,
                preferred_pool: v.preferred_reserve_storage_pool.clone(),
                writable: v.snapshot_volume_writable,
                validate: v.snapshot_volume_validate,
            })
            .collect()
    }

    fn selector(&self) -> Result<Option<PitSelector>, SnapError> {
        PitSelector::from_parts(self.pit_name.as_deref(), self.pit_timestamp.as_deref())
    }

    fn require_selector(&self) -> Result<PitSelector, SnapError> {
        self.selector()?.ok_or_else(|| {
            SnapError::Validation(format!(
                "Either pit_name or pit_timestamp must be defined. Group [{}]",
                self.group_name
            ))
        })
    }

    fn view(&self) -> Result<String, SnapError> {
        self.view_name
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                SnapError::Validation(format!(
                    "view_name must be defined for a snapshot view. Group [{}]",
                    self.group_name
                ))
            })
    }

    /// Convert into a validated operation
    pub fn into_operation(self) -> Result<Operation, SnapError> {
        let group = self.group_name.clone();

        let operation = match (self.state, self.target) {
            (DesiredState::Present, TargetKind::Group) => Operation::EnsureGroup {
                group,
                settings: GroupSettings {
                    alert_threshold_pct: self.alert_threshold_pct,
                    maximum_snapshots: self.maximum_snapshots,
                    rollback_priority: self.rollback_priority,
                    full_policy: self.reserve_capacity_full_policy,
                },
                volumes: self.volume_specs(),
            },
            (DesiredState::Absent, TargetKind::Group) => Operation::RemoveGroup { group },
            (DesiredState::Present, TargetKind::Pit) => {
                if self.pit_timestamp.is_some() {
                    return Err(SnapError::Validation(format!(
                        "pit_timestamp cannot be set when creating snapshot images; use pit_name. Group [{}]",
                        group
                    )));
                }
                Operation::CreatePit {
                    group,
                    name: self.pit_name.clone().filter(|n| !n.is_empty()),
                    description: self.pit_description.clone().unwrap_or_default(),
                }
            }
            (DesiredState::Absent, TargetKind::Pit) => Operation::RemovePit {
                selector: self.require_selector()?,
                group,
            },
            (DesiredState::Present, TargetKind::View) => Operation::EnsureView {
                view: self.view()?,
                selector: self.require_selector()?,
                volumes: self.volume_specs(),
                group,
            },
            (DesiredState::Absent, TargetKind::View) => Operation::RemoveView {
                view: self.view()?,
                group,
            },
            (DesiredState::Rollback, _) => Operation::Rollback {
                selector: self.require_selector()?,
                volumes: self.volume_specs(),
                priority: self.rollback_priority,
                backup: self.rollback_backup,
                group,
            },
        };

        operation.validate()?;
        Ok(operation)
    }
}
