//! Proxy settings: TOML file + CLI overrides.
//!
//! Everything here tunes the runtime; the forwarding rules themselves live in
//! the rule file (see [`hft_core::rules`]).

use hft_core::control::{DEFAULT_BASE_PORT, DEFAULT_CONTROL_PORT};
use hft_core::{HftError, HftResult};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub proxy: ProxySection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[proxy]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxySection {
    /// Address every rule's listening socket binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    /// Rule file loaded at startup.
    #[serde(default)]
    pub rules: Option<String>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            rules: None,
        }
    }
}

/// `[relay]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 0 means unbounded.
    #[serde(default = "default_max_sessions_per_rule")]
    pub max_sessions_per_rule: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_sessions_per_rule: default_max_sessions_per_rule(),
        }
    }
}

/// `[control]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlSection {
    /// Defaults to every interface so remote desks can request ports; set
    /// `127.0.0.1` to keep the control plane local.
    #[serde(default = "default_control_bind")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            bind_addr: default_control_bind(),
            port: default_control_port(),
            base_port: default_base_port(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSection {
    /// When set, logs are also written to a daily-rolling file here.
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_listen_addr() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}
fn default_control_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_buffer_size() -> usize {
    8192
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_max_sessions_per_rule() -> usize {
    1024
}
fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}
fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}
fn default_request_timeout_ms() -> u64 {
    5_000
}

/// Relay tuning handed to every listener and session.
#[derive(Debug, Clone, Copy)]
pub struct RelayTuning {
    /// Copy-loop buffer size. Smaller buffers add less latency per hop at
    /// the cost of more syscalls.
    pub buffer_size: usize,
    pub connect_timeout: Duration,
    /// `None` means unbounded.
    pub max_sessions_per_rule: Option<usize>,
}

impl Default for RelayTuning {
    fn default() -> Self {
        let relay = RelaySection::default();
        Self {
            buffer_size: relay.buffer_size,
            connect_timeout: Duration::from_millis(relay.connect_timeout_ms),
            max_sessions_per_rule: Some(relay.max_sessions_per_rule),
        }
    }
}

/// Command-line values that take precedence over the settings file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub rules: Option<String>,
    pub control_port: Option<u16>,
    pub base_port: Option<u16>,
    pub buffer_size: Option<usize>,
    pub max_sessions_per_rule: Option<usize>,
    pub log_dir: Option<String>,
}

/// Resolved settings (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub listen_addr: IpAddr,
    pub rules_path: Option<PathBuf>,
    pub relay: RelayTuning,
    pub control_bind: IpAddr,
    pub control_port: u16,
    pub base_port: u16,
    pub request_timeout: Duration,
    pub log_dir: Option<PathBuf>,
    /// Settings file that was read; `None` when defaults were used.
    pub loaded_from: Option<PathBuf>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::resolve(SettingsFile::default(), CliOverrides::default(), None)
    }
}

impl ProxySettings {
    /// Load settings from a TOML file (defaults when it does not exist), then
    /// apply CLI overrides and validate.
    ///
    /// Runs before logging is initialised, so nothing is logged here; the
    /// caller reports [`loaded_from`](Self::loaded_from) once it is.
    ///
    /// # Errors
    ///
    /// An unreadable or malformed file, or values that fail validation.
    pub fn load(path: Option<&Path>, cli: CliOverrides) -> HftResult<Self> {
        let (file, loaded_from) = match path.map(expand_tilde) {
            Some(expanded) if expanded.exists() => {
                let content = std::fs::read_to_string(&expanded)?;
                let file = toml::from_str::<SettingsFile>(&content)
                    .map_err(|e| HftError::Other(format!("settings parse error: {e}")))?;
                (file, Some(expanded))
            }
            _ => (SettingsFile::default(), None),
        };

        let settings = Self::resolve(file, cli, loaded_from);
        settings.validate()?;
        Ok(settings)
    }

    fn resolve(file: SettingsFile, cli: CliOverrides, loaded_from: Option<PathBuf>) -> Self {
        let rules = cli.rules.or(file.proxy.rules);
        let buffer_size = cli.buffer_size.unwrap_or(file.relay.buffer_size);
        let max_sessions = cli
            .max_sessions_per_rule
            .unwrap_or(file.relay.max_sessions_per_rule);
        let log_dir = cli.log_dir.or(file.log.directory);

        Self {
            listen_addr: file.proxy.listen_addr,
            rules_path: rules.as_deref().map(expand_tilde_str),
            relay: RelayTuning {
                buffer_size,
                connect_timeout: Duration::from_millis(file.relay.connect_timeout_ms),
                max_sessions_per_rule: (max_sessions > 0).then_some(max_sessions),
            },
            control_bind: file.control.bind_addr,
            control_port: cli.control_port.unwrap_or(file.control.port),
            base_port: cli.base_port.unwrap_or(file.control.base_port),
            request_timeout: Duration::from_millis(file.control.request_timeout_ms),
            log_dir: log_dir.as_deref().map(expand_tilde_str),
            loaded_from,
        }
    }

    fn validate(&self) -> HftResult<()> {
        if self.relay.buffer_size == 0 {
            return Err(HftError::Other("relay.buffer_size must be greater than 0".into()));
        }
        if self.base_port == 0 {
            return Err(HftError::Other("control.base_port must be greater than 0".into()));
        }
        if self.relay.connect_timeout.is_zero() {
            return Err(HftError::Other("relay.connect_timeout_ms must be greater than 0".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(HftError::Other("control.request_timeout_ms must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
