use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::Result;
use crate::paths::Paths;

/// An extra line-protocol backend to register after the accessibility driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendEntry {
    /// Registry name. Derived from the executable when omitted.
    #[serde(default)]
    pub name: Option<String>,
    /// Whitespace-separated command line, e.g. `node server.js`.
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendsConfig {
    /// Override for the accessibility driver command line.
    #[serde(default)]
    pub accessibility_server: Option<String>,
    /// Register the accessibility driver at all (off on non-macOS hosts).
    #[serde(default = "default_enable_accessibility")]
    pub enable_accessibility: bool,
    #[serde(default)]
    pub servers: Vec<BackendEntry>,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Per-response read deadline; `None` blocks until the backend answers.
    #[serde(default)]
    pub response_timeout_ms: Option<u64>,
}

fn default_enable_accessibility() -> bool {
    cfg!(target_os = "macos")
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            accessibility_server: None,
            enable_accessibility: default_enable_accessibility(),
            servers: Vec::new(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            response_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_attach_ports")]
    pub attach_ports: Vec<u16>,
    #[serde(default = "default_port_scan_start")]
    pub port_scan_start: u16,
    #[serde(default = "default_port_scan_count")]
    pub port_scan_count: u16,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    #[serde(default)]
    pub executable_path: Option<String>,
    #[serde(default)]
    pub profile_dir: Option<String>,
    #[serde(default)]
    pub bundled_engine_path: Option<String>,
    /// Substring the debug endpoint's product string must contain to be attached to.
    #[serde(default = "default_product_match")]
    pub product_match: String,
}

fn default_ttl_secs() -> u64 {
    1800
}

fn default_max_memory_mb() -> u64 {
    1024
}

fn default_attach_ports() -> Vec<u16> {
    vec![9222, 9223, 9224, 9225]
}

fn default_port_scan_start() -> u16 {
    9222
}

fn default_port_scan_count() -> u16 {
    20
}

fn default_launch_timeout_secs() -> u64 {
    15
}

fn default_product_match() -> String {
    "chrome".to_string()
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_memory_mb: default_max_memory_mb(),
            attach_ports: default_attach_ports(),
            port_scan_start: default_port_scan_start(),
            port_scan_count: default_port_scan_count(),
            launch_timeout_secs: default_launch_timeout_secs(),
            executable_path: None,
            profile_dir: None,
            bundled_engine_path: None,
            product_match: default_product_match(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillsConfig {
    /// Base32 shared secret used for payload key derivation.
    #[serde(default = "default_secret")]
    pub secret: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub stop_on_failure: bool,
    #[serde(default = "default_steps_back")]
    pub steps_back: u32,
    #[serde(default = "default_steps_forward")]
    pub steps_forward: u32,
    /// Optional operation budget for the script engine. 0 = unlimited.
    #[serde(default)]
    pub max_operations: u64,
}

fn default_secret() -> String {
    "somestupidsecret".to_string()
}

fn default_timeout_ms() -> u64 {
    25_000
}

fn default_steps_back() -> u32 {
    2
}

fn default_steps_forward() -> u32 {
    4
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
            timeout_ms: default_timeout_ms(),
            stop_on_failure: false,
            steps_back: default_steps_back(),
            steps_forward: default_steps_forward(),
            max_operations: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Clear the driver's captured events every N polls.
    #[serde(default = "default_clear_every")]
    pub clear_every: u32,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_clear_every() -> u32 {
    10
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            clear_every: default_clear_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            debug!(path = %config_path.display(), "Loading config");
            Self::load(&config_path)
        } else {
            debug!(path = %config_path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Command line of the accessibility driver: explicit override, else the located build.
    pub fn accessibility_command(&self, paths: &Paths) -> String {
        match &self.backends.accessibility_server {
            Some(cmd) if !cmd.trim().is_empty() => cmd.clone(),
            _ => paths.accessibility_server().to_string_lossy().into_owned(),
        }
    }
}
