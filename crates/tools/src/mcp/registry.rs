use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sisypho_core::config::BackendsConfig;
use sisypho_core::{Config, Error, Paths, Result};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::{ConnectionState, McpClient, ToolDescriptor};
use super::outcome::{CallError, CallOutcome};

/// Registry handle shared by capability wrappers; the lock serializes calls.
pub type SharedRegistry = Arc<Mutex<BackendRegistry>>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub name: String,
    pub state: ConnectionState,
    pub tool_count: usize,
}

/// Ordered set of named backends. Registration order decides tool routing.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<McpClient>,
    initialized: bool,
    shutdown_grace: Option<Duration>,
    response_timeout: Option<Duration>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply per-client timeouts from config to every backend added afterwards.
    pub fn with_config(config: &BackendsConfig) -> Self {
        Self {
            backends: Vec::new(),
            initialized: false,
            shutdown_grace: Some(Duration::from_millis(config.shutdown_grace_ms)),
            response_timeout: config.response_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Registry with the accessibility driver (when enabled) and every configured server.
    pub fn from_config(config: &Config, paths: &Paths) -> Self {
        let mut registry = Self::with_config(&config.backends);
        if config.backends.enable_accessibility {
            let command = config.accessibility_command(paths);
            if let Err(e) = registry.add_backend(&command, Some("accessibility")) {
                warn!(error = %e, "Skipping accessibility backend");
            }
        }
        for entry in &config.backends.servers {
            if let Err(e) = registry.add_backend(&entry.command, entry.name.as_deref()) {
                warn!(command = %entry.command, error = %e, "Skipping configured backend");
            }
        }
        registry
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(Mutex::new(self))
    }

    /// Register a backend. Rejects duplicate names without touching the existing one.
    pub fn add_backend(&mut self, command_line: &str, name: Option<&str>) -> Result<String> {
        let name = match name {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            _ => default_backend_name(command_line).ok_or_else(|| {
                Error::Backend(format!("cannot derive a name from '{}'", command_line))
            })?,
        };
        if self.backends.iter().any(|b| b.name() == name) {
            warn!(backend = %name, "Backend already registered");
            return Err(Error::Backend(format!("backend '{}' already registered", name)));
        }

        let mut client = McpClient::new(&name, command_line).with_response_timeout(self.response_timeout);
        if let Some(grace) = self.shutdown_grace {
            client = client.with_shutdown_grace(grace);
        }
        debug!(backend = %name, command = command_line, "Backend registered");
        self.backends.push(client);
        self.initialized = false;
        Ok(name)
    }

    /// Start every backend. One failure does not stop the others; returns true only
    /// if all of them are ready.
    pub async fn initialize_all(&mut self) -> bool {
        let mut all_ok = true;
        for backend in self.backends.iter_mut() {
            if let Err(e) = backend.start().await {
                warn!(backend = %backend.name(), error = %e, "Backend failed to initialize");
                all_ok = false;
            }
        }
        self.initialized = true;
        let ready = self.backends.iter().filter(|b| b.is_ready()).count();
        info!(ready, total = self.backends.len(), "Backends initialized");
        all_ok
    }

    /// Name of the first registered backend exposing `tool_name`.
    pub async fn resolve(&mut self, tool_name: &str) -> Option<String> {
        if !self.initialized {
            self.initialize_all().await;
        }
        self.backends
            .iter()
            .find(|b| b.has_tool(tool_name))
            .map(|b| b.name().to_string())
    }

    /// Route a call. Unknown tool and unknown backend come back as failures.
    pub async fn call(&mut self, tool_name: &str, arguments: Value, backend: Option<&str>) -> CallOutcome {
        let target = match backend {
            Some(name) => name.to_string(),
            None => match self.resolve(tool_name).await {
                Some(name) => name,
                None => {
                    warn!(tool = tool_name, "Tool not found in any backend");
                    return CallOutcome::Failed(CallError::ToolNotFound(tool_name.to_string()));
                }
            },
        };

        let Some(client) = self.backends.iter_mut().find(|b| b.name() == target) else {
            warn!(backend = %target, tool = tool_name, "Unknown backend");
            return CallOutcome::Failed(CallError::BackendNotFound(target.clone()));
        };
        debug!(backend = %target, tool = tool_name, "Dispatching tool call");
        client.call(tool_name, arguments).await
    }

    /// Stop and forget every backend. Safe to call repeatedly.
    pub async fn cleanup(&mut self) {
        for mut backend in self.backends.drain(..) {
            backend.stop().await;
        }
        self.initialized = false;
    }

    pub fn backends(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|b| BackendStatus {
                name: b.name().to_string(),
                state: b.state(),
                tool_count: b.tools().len(),
            })
            .collect()
    }

    pub fn all_tools(&self) -> HashMap<String, Vec<ToolDescriptor>> {
        self.backends
            .iter()
            .map(|b| (b.name().to_string(), b.tools().to_vec()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// File stem of the executable: `/opt/bin/AccessibilityMCPServer` → `AccessibilityMCPServer`.
pub fn default_backend_name(command_line: &str) -> Option<String> {
    let program = command_line.split_whitespace().next()?;
    Path::new(program)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_backend_name() {
        assert_eq!(
            default_backend_name("/usr/local/bin/AccessibilityMCPServer").as_deref(),
            Some("AccessibilityMCPServer")
        );
        assert_eq!(default_backend_name("servers/mail.py --stdio").as_deref(), Some("mail"));
        assert_eq!(default_backend_name("   "), None);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = BackendRegistry::new();
        assert_eq!(registry.add_backend("/bin/echo", None).unwrap(), "echo");
        assert!(registry.add_backend("/usr/bin/echo", None).is_err());
        assert!(registry.add_backend("/usr/bin/other", Some("echo")).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_backend_is_failure() {
        let mut registry = BackendRegistry::new();
        let outcome = registry.call("a", json!({}), Some("missing")).await;
        assert_eq!(
            outcome,
            CallOutcome::Failed(CallError::BackendNotFound("missing".into()))
        );
    }

    #[tokio::test]
    async fn test_cleanup_idempotent() {
        let mut registry = BackendRegistry::new();
        registry.add_backend("/nonexistent/backend", None).unwrap();
        assert!(!registry.initialize_all().await);
        registry.cleanup().await;
        registry.cleanup().await;
        assert!(registry.is_empty());
    }
}
