//! Owner of the single live browser session.

use serde_json::{json, Value};
use sisypho_core::config::BrowserConfig;
use sisypho_core::{Error, Paths, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::session::{BrowserSession, HealthReport};
use super::strategy::{standard_chain, AcquireStrategy};

/// Manager handle shared by capability wrappers; the lock gives one action exclusive access.
pub type SharedBrowser = Arc<Mutex<BrowserSessionManager>>;

/// Why a live session is no longer reusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecycleReason {
    PageClosed,
    Expired,
    Unresponsive,
    MemoryExceeded(u64),
}

impl std::fmt::Display for RecycleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecycleReason::PageClosed => f.write_str("page closed"),
            RecycleReason::Expired => f.write_str("session older than TTL"),
            RecycleReason::Unresponsive => f.write_str("page unresponsive"),
            RecycleReason::MemoryExceeded(mb) => write!(f, "memory use {} MB over limit", mb),
        }
    }
}

pub struct BrowserSessionManager {
    strategies: Vec<Box<dyn AcquireStrategy>>,
    session: Option<BrowserSession>,
    ttl: Duration,
    max_memory_mb: u64,
}

impl BrowserSessionManager {
    pub fn new(strategies: Vec<Box<dyn AcquireStrategy>>, ttl: Duration, max_memory_mb: u64) -> Self {
        Self {
            strategies,
            session: None,
            ttl,
            max_memory_mb,
        }
    }

    pub fn from_config(config: &BrowserConfig, paths: &Paths) -> Self {
        Self::new(
            standard_chain(config, paths),
            Duration::from_secs(config.ttl_secs),
            config.max_memory_mb,
        )
    }

    pub fn into_shared(self) -> SharedBrowser {
        Arc::new(Mutex::new(self))
    }

    /// The live session, recycled first if it is no longer healthy.
    pub async fn acquire_session(&mut self) -> Result<&BrowserSession> {
        self.invalidate_if_unhealthy().await;
        if self.session.is_none() {
            let session = self.run_chain().await?;
            self.session = Some(session);
        }
        self.session
            .as_ref()
            .ok_or_else(|| Error::Browser("no browser session".into()))
    }

    /// Tear the session down if any health trigger fires. Returns true if it did.
    pub async fn invalidate_if_unhealthy(&mut self) -> bool {
        let Some(reason) = self.recycle_reason().await else {
            return false;
        };
        if let Some(session) = self.session.take() {
            info!(
                tier = session.tier(),
                port = session.debug_port(),
                reason = %reason,
                "Recycling browser session"
            );
            session.close().await;
        }
        true
    }

    pub async fn release(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    pub fn current(&self) -> Option<&BrowserSession> {
        self.session.as_ref()
    }

    pub async fn health(&self) -> Option<HealthReport> {
        let session = self.session.as_ref()?;
        let page = session.page();
        let open = page.is_open();
        let responsive = open && page.ping().await.is_ok();
        let current_url = if responsive {
            page.current_url().await.ok()
        } else {
            None
        };
        Some(HealthReport {
            tier: session.tier().to_string(),
            debug_port: session.debug_port(),
            age_secs: session.age().as_secs(),
            open,
            responsive,
            memory_mb: session.memory_mb().await,
            owns_process: session.owns_process(),
            profile_dir: session.profile_dir().map(|p| p.display().to_string()),
            executable: session.executable_path().map(|p| p.display().to_string()),
            current_url,
        })
    }

    pub async fn status(&self) -> Value {
        match self.health().await {
            Some(report) => json!({
                "active": true,
                "ttlSecs": self.ttl.as_secs(),
                "maxMemoryMb": self.max_memory_mb,
                "session": report,
            }),
            None => json!({ "active": false, "ttlSecs": self.ttl.as_secs() }),
        }
    }

    /// Clear page storage between runs. A failure recycles the session instead.
    pub async fn reset_storage(&mut self) -> Result<()> {
        let cleared = {
            let session = self.acquire_session().await?;
            session.page().clear_storage().await
        };
        if let Err(e) = cleared {
            warn!(error = %e, "Clearing browser storage failed, recycling session");
            self.release().await;
        }
        Ok(())
    }

    async fn recycle_reason(&self) -> Option<RecycleReason> {
        let session = self.session.as_ref()?;
        let page = session.page();
        if !page.is_open() {
            return Some(RecycleReason::PageClosed);
        }
        if session.age() >= self.ttl {
            return Some(RecycleReason::Expired);
        }
        if let Err(e) = page.ping().await {
            warn!(port = session.debug_port(), error = %e, "Browser ping failed");
            return Some(RecycleReason::Unresponsive);
        }
        if let Some(mb) = session.memory_mb().await {
            if mb > self.max_memory_mb {
                return Some(RecycleReason::MemoryExceeded(mb));
            }
        }
        None
    }

    async fn run_chain(&self) -> Result<BrowserSession> {
        let mut failures = Vec::new();
        for strategy in &self.strategies {
            info!(tier = strategy.name(), "Trying browser acquisition tier");
            match strategy.attempt().await {
                Ok(session) => {
                    info!(tier = strategy.name(), port = session.debug_port(), "Browser session acquired");
                    return Ok(session);
                }
                Err(e) => {
                    warn!(tier = strategy.name(), error = %e, "Browser tier failed");
                    failures.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }
        Err(Error::Browser(format!(
            "all browser acquisition tiers failed ({})",
            failures.join("; ")
        )))
    }
}
