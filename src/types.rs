use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid configuration for '{interface}': {}", violations.join("; "))]
    InvalidConfig {
        interface: String,
        violations: Vec<String>,
    },
    #[error("Missing link '{0}'")]
    LinkMissing(String),
    #[error("Command '{command}' failed with exit code {} and output: {output}", status.map_or_else(|| "none".to_string(), |s| s.to_string()))]
    CommandFailed {
        command: String,
        status: Option<i32>,
        output: String,
    },
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),
    #[error("No interfaces to manage anymore")]
    NoInterfaces,
    #[error("Signal dispatch error: {0}")]
    SignalDispatch(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// --- Configuration Types ---

/// Per-interface configuration as it appears in the YAML file.
///
/// Fields stay loosely typed so that validation can report every
/// violation individually instead of failing the whole parse.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RawInterfaceConfig {
    #[serde(default)]
    pub primary_ip: Option<serde_yaml::Value>,
    #[serde(default)]
    pub secondary_ips: Option<serde_yaml::Value>,
    #[serde(default)]
    pub default_route: Option<serde_yaml::Value>,
    #[serde(default)]
    pub hotplug: Option<serde_yaml::Value>,
}

/// Validated desired state of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub primary_ip: String,
    pub secondary_ips: Vec<String>,
    pub default_route: Option<String>,
    pub hotplug: bool,
}

impl InterfaceConfig {
    /// Primary followed by the secondaries, in configuration order.
    pub fn all_addresses(&self) -> Vec<&str> {
        std::iter::once(self.primary_ip.as_str())
            .chain(self.secondary_ips.iter().map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub interfaces: BTreeMap<String, RawInterfaceConfig>,
}

// --- Runtime State ---

/// Last observed presence of an interface's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkPresence {
    #[default]
    Unknown,
    Present,
    Absent,
}

impl From<bool> for LinkPresence {
    fn from(has_link: bool) -> Self {
        if has_link {
            LinkPresence::Present
        } else {
            LinkPresence::Absent
        }
    }
}

// --- Commands ---

/// Requests latched from the host environment and acted upon once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Reload,
    Shutdown,
}

// --- Type Aliases ---
pub type Result<T> = std::result::Result<T, AppError>;
