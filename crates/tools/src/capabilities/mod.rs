//! The capability surface handed to skill code.
//!
//! Every wrapper here absorbs transport and browser errors, logs them with the
//! tool or selector involved, and reports plain success/failure or a value.

pub mod desktop;
pub mod notify;
pub mod spreadsheet;
pub mod web;

use async_trait::async_trait;
use serde_json::Value;
use sisypho_core::{Config, Paths};
use std::sync::Arc;

use crate::browser::{BrowserSessionManager, SharedBrowser};
use crate::mcp::{BackendRegistry, CallOutcome, SharedRegistry};

pub use desktop::{split_typed_text, Desktop, TypedChunk};
pub use notify::{present_files_line, Notifier};
pub use spreadsheet::{CellRef, FileWorkbooks, SpreadsheetStore};
pub use web::Web;

/// Anything that can route a tool call to a backend.
#[async_trait]
pub trait ToolCaller: Send + Sync {
    async fn call_tool(&self, tool: &str, arguments: Value) -> CallOutcome;
}

#[async_trait]
impl ToolCaller for SharedRegistry {
    async fn call_tool(&self, tool: &str, arguments: Value) -> CallOutcome {
        self.lock().await.call(tool, arguments, None).await
    }
}

/// Everything a running skill may touch, wired to one registry and one browser manager.
#[derive(Clone)]
pub struct Capabilities {
    pub desktop: Arc<Desktop>,
    pub web: Arc<Web>,
    pub sheets: Arc<dyn SpreadsheetStore>,
    pub notifier: Arc<Notifier>,
    registry: SharedRegistry,
    browser: SharedBrowser,
}

impl Capabilities {
    pub fn new(registry: SharedRegistry, browser: SharedBrowser, paths: &Paths) -> Self {
        Self {
            desktop: Arc::new(Desktop::new(Arc::new(registry.clone()))),
            web: Arc::new(Web::new(browser.clone())),
            sheets: Arc::new(FileWorkbooks::new(paths.workbooks_dir())),
            notifier: Arc::new(Notifier::stdout()),
            registry,
            browser,
        }
    }

    /// Registry from configured backends plus a lazily acquired browser.
    pub fn from_config(config: &Config, paths: &Paths) -> Self {
        let registry = BackendRegistry::from_config(config, paths).into_shared();
        let browser = BrowserSessionManager::from_config(&config.browser, paths).into_shared();
        Self::new(registry, browser, paths)
    }

    pub fn with_desktop(mut self, desktop: Desktop) -> Self {
        self.desktop = Arc::new(desktop);
        self
    }

    pub fn with_sheets(mut self, sheets: Arc<dyn SpreadsheetStore>) -> Self {
        self.sheets = sheets;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn browser(&self) -> &SharedBrowser {
        &self.browser
    }

    /// Stop every backend and close the browser session.
    pub async fn shutdown(&self) {
        self.registry.lock().await.cleanup().await;
        self.browser.lock().await.release().await;
        self.sheets.close_all();
    }
}
