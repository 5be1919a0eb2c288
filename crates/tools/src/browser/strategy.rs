//! Browser acquisition tiers.
//!
//! Each tier is an `AcquireStrategy`; the manager walks them in order and keeps
//! the first session any of them produces.

use async_trait::async_trait;
use sisypho_core::config::BrowserConfig;
use sisypho_core::{Error, Paths, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::discovery::{
    build_launch_args, find_available_port, find_browser_executable, find_bundled_engine,
    get_page_ws_url, query_debug_endpoint, user_profile_dir, wait_for_debug_port, OutputTail,
};
use super::page::CdpPage;
use super::profile::EphemeralProfile;
use super::session::BrowserSession;

#[async_trait]
pub trait AcquireStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce a live session or explain why this tier cannot.
    async fn attempt(&self) -> Result<BrowserSession>;
}

/// Port range and patience shared by every launching tier.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub port_scan_start: u16,
    pub port_scan_count: u16,
    pub launch_timeout: Duration,
}

impl From<&BrowserConfig> for LaunchSettings {
    fn from(config: &BrowserConfig) -> Self {
        Self {
            port_scan_start: config.port_scan_start,
            port_scan_count: config.port_scan_count,
            launch_timeout: Duration::from_secs(config.launch_timeout_secs),
        }
    }
}

/// The standard chain: attach, cloned profile, profile-less, bundled engine.
pub fn standard_chain(config: &BrowserConfig, paths: &Paths) -> Vec<Box<dyn AcquireStrategy>> {
    let settings = LaunchSettings::from(config);
    let bundled_root = config
        .bundled_engine_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.browsers_dir());
    vec![
        Box::new(AttachExisting {
            ports: config.attach_ports.clone(),
            product_match: config.product_match.clone(),
        }),
        Box::new(LaunchClonedProfile {
            executable_override: config.executable_path.clone(),
            profile_override: config.profile_dir.clone().map(PathBuf::from),
            settings: settings.clone(),
        }),
        Box::new(LaunchProfileless {
            executable_override: config.executable_path.clone(),
            settings: settings.clone(),
        }),
        Box::new(LaunchBundled {
            engine_root: bundled_root,
            settings,
        }),
    ]
}

/// Tier 1: a browser already listening on a known debug port.
pub struct AttachExisting {
    pub ports: Vec<u16>,
    pub product_match: String,
}

#[async_trait]
impl AcquireStrategy for AttachExisting {
    fn name(&self) -> &'static str {
        "attach"
    }

    async fn attempt(&self) -> Result<BrowserSession> {
        let wanted = self.product_match.to_lowercase();
        for &port in &self.ports {
            let Some(info) = query_debug_endpoint(port).await else {
                continue;
            };
            if !info.browser.to_lowercase().contains(&wanted) {
                debug!(port, browser = %info.browser, "Debug port belongs to another product");
                continue;
            }
            let ws_url = get_page_ws_url(port).await?;
            let page = CdpPage::attach(&ws_url).await?;
            info!(port, browser = %info.browser, "Attached to running browser");
            return Ok(BrowserSession::new(self.name(), port, Arc::new(page)));
        }
        Err(Error::NotFound(format!(
            "no debuggable {} on ports {:?}",
            self.product_match, self.ports
        )))
    }
}

/// Tier 2: real browser, cloned copy of the user's profile.
pub struct LaunchClonedProfile {
    pub executable_override: Option<String>,
    pub profile_override: Option<PathBuf>,
    pub settings: LaunchSettings,
}

#[async_trait]
impl AcquireStrategy for LaunchClonedProfile {
    fn name(&self) -> &'static str {
        "cloned-profile"
    }

    async fn attempt(&self) -> Result<BrowserSession> {
        let executable = find_browser_executable(self.executable_override.as_deref())
            .ok_or_else(|| Error::NotFound("browser executable".into()))?;
        let source = self
            .profile_override
            .clone()
            .or_else(user_profile_dir)
            .ok_or_else(|| Error::NotFound("user profile directory".into()))?;
        let profile = EphemeralProfile::clone_from(&source)?;
        launch(self.name(), &executable, profile, &self.settings).await
    }
}

/// Tier 3: real browser, fresh empty profile.
pub struct LaunchProfileless {
    pub executable_override: Option<String>,
    pub settings: LaunchSettings,
}

#[async_trait]
impl AcquireStrategy for LaunchProfileless {
    fn name(&self) -> &'static str {
        "profileless"
    }

    async fn attempt(&self) -> Result<BrowserSession> {
        let executable = find_browser_executable(self.executable_override.as_deref())
            .ok_or_else(|| Error::NotFound("browser executable".into()))?;
        launch(self.name(), &executable, EphemeralProfile::scratch()?, &self.settings).await
    }
}

/// Tier 4: bundled Chromium, headful, fresh profile.
pub struct LaunchBundled {
    pub engine_root: PathBuf,
    pub settings: LaunchSettings,
}

#[async_trait]
impl AcquireStrategy for LaunchBundled {
    fn name(&self) -> &'static str {
        "bundled"
    }

    async fn attempt(&self) -> Result<BrowserSession> {
        let executable = if self.engine_root.is_file() {
            self.engine_root.clone()
        } else {
            find_bundled_engine(&self.engine_root).ok_or_else(|| {
                Error::NotFound(format!(
                    "bundled browser under {}",
                    self.engine_root.display()
                ))
            })?
        };
        launch(self.name(), &executable, EphemeralProfile::scratch()?, &self.settings).await
    }
}

/// Start `executable` with a debug port on `profile`, wait for it, attach to its page.
/// On any failure the process is killed and the profile removed.
async fn launch(
    tier: &'static str,
    executable: &Path,
    profile: EphemeralProfile,
    settings: &LaunchSettings,
) -> Result<BrowserSession> {
    let port = find_available_port(settings.port_scan_start, settings.port_scan_count)?;
    let args = build_launch_args(port, profile.user_data_dir(), false);
    info!(tier, port, executable = %executable.display(), "Launching browser");

    let mut child = Command::new(executable)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Browser(format!("failed to launch {}: {}", executable.display(), e)))?;

    let mut output = OutputTail::capture(&mut child);
    let attached = async {
        wait_for_debug_port(port, &mut child, &mut output, settings.launch_timeout).await?;
        let ws_url = get_page_ws_url(port).await?;
        CdpPage::attach(&ws_url).await
    }
    .await;

    match attached {
        Ok(page) => Ok(BrowserSession::new(tier, port, Arc::new(page))
            .with_process(executable.to_path_buf(), child, output)
            .with_profile(profile)),
        Err(e) => {
            let _ = child.kill().await;
            profile.remove();
            Err(e)
        }
    }
}
