//! One live browser plus the resources it owns.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::discovery::OutputTail;
use super::page::BrowserPage;
use super::profile::EphemeralProfile;

const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// A controllable browser page and whatever had to be created to get it.
///
/// `process` is `None` when attached to a browser someone else started; such a
/// browser is never closed by us.
pub struct BrowserSession {
    tier: String,
    executable_path: Option<PathBuf>,
    profile: Option<EphemeralProfile>,
    debug_port: u16,
    process: Option<Child>,
    output: Option<OutputTail>,
    pub(crate) created_at: Instant,
    page: Arc<dyn BrowserPage>,
}

impl BrowserSession {
    pub fn new(tier: &str, debug_port: u16, page: Arc<dyn BrowserPage>) -> Self {
        Self {
            tier: tier.to_string(),
            executable_path: None,
            profile: None,
            debug_port,
            process: None,
            output: None,
            created_at: Instant::now(),
            page,
        }
    }

    /// Own a launched browser whose stdout/stderr are drained into `output`.
    pub fn with_process(mut self, executable: PathBuf, process: Child, output: OutputTail) -> Self {
        self.executable_path = Some(executable);
        self.process = Some(process);
        self.output = Some(output);
        self
    }

    pub fn with_profile(mut self, profile: EphemeralProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn debug_port(&self) -> u16 {
        self.debug_port
    }

    pub fn executable_path(&self) -> Option<&PathBuf> {
        self.executable_path.as_ref()
    }

    pub fn profile_dir(&self) -> Option<PathBuf> {
        self.profile.as_ref().map(|p| p.user_data_dir().to_path_buf())
    }

    pub fn owns_process(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Child::id)
    }

    /// Recent stdout/stderr of an owned browser.
    pub fn output_tail(&self) -> Option<String> {
        self.output.as_ref().map(OutputTail::text)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn page(&self) -> &dyn BrowserPage {
        self.page.as_ref()
    }

    /// Resident memory of the owned browser process, where the platform lets us see it.
    pub async fn memory_mb(&self) -> Option<u64> {
        process_memory_mb(self.pid()?).await
    }

    /// Terminate an owned browser (graceful close, then kill) and delete its profile copy.
    pub async fn close(mut self) {
        if let Some(mut child) = self.process.take() {
            if let Err(e) = self.page.close_browser().await {
                debug!(error = %e, "Browser.close failed, browser may already be gone");
            }
            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "Browser exited"),
                Ok(Err(e)) => warn!(error = %e, "Waiting for browser failed"),
                Err(_) => {
                    let output = self.output_tail().unwrap_or_default();
                    warn!(
                        port = self.debug_port,
                        output = crate::safe_truncate(&output, 500),
                        "Browser did not exit in time, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Killing browser failed");
                    }
                }
            }
        }
        if let Some(profile) = self.profile.take() {
            profile.remove();
        }
        info!(tier = %self.tier, port = self.debug_port, "Browser session closed");
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(child) = self.process.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Snapshot of a session's health, as reported by status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub tier: String,
    pub debug_port: u16,
    pub age_secs: u64,
    pub open: bool,
    pub responsive: bool,
    pub memory_mb: Option<u64>,
    pub owns_process: bool,
    pub profile_dir: Option<String>,
    pub executable: Option<String>,
    pub current_url: Option<String>,
}

#[cfg(unix)]
pub async fn process_memory_mb(pid: u32) -> Option<u64> {
    let output = tokio::process::Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let rss_kb: u64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    Some(rss_kb / 1024)
}

#[cfg(not(unix))]
pub async fn process_memory_mb(_pid: u32) -> Option<u64> {
    None
}
