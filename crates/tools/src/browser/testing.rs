//! In-memory page and tier doubles for unit tests.

use async_trait::async_trait;
use sisypho_core::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::page::{BrowserPage, ContentQuery, ScrollTarget};
use super::session::BrowserSession;
use super::strategy::AcquireStrategy;

#[derive(Default)]
pub struct MockPage {
    pub closed: AtomicBool,
    pub unresponsive: AtomicBool,
    pub missing_selector: Mutex<Option<String>>,
    pub actions: Mutex<Vec<String>>,
    /// Markup changes on every read.
    pub churning: AtomicBool,
    close_calls: AtomicUsize,
    /// Visited urls and the index of the current one.
    history: Mutex<(Vec<String>, usize)>,
    snapshots: Mutex<VecDeque<String>>,
    html_reads: AtomicUsize,
}

impl MockPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    /// Markup returned by successive reads; the last one repeats.
    pub fn set_snapshots(&self, snapshots: &[&str]) {
        *self.snapshots.lock().unwrap() = snapshots.iter().map(|s| s.to_string()).collect();
    }

    pub fn html_reads(&self) -> usize {
        self.html_reads.load(Ordering::SeqCst)
    }

    fn step_history(&self, delta: isize) -> Result<()> {
        let mut history = self.history.lock().unwrap();
        let target = history.1 as isize + delta;
        if history.0.is_empty() || target < 0 || target as usize >= history.0.len() {
            return Err(Error::Browser("no such history entry".into()));
        }
        history.1 = target as usize;
        Ok(())
    }

    fn record(&self, action: String) {
        self.actions.lock().unwrap().push(action);
    }

    fn check_selector(&self, selector: &str) -> Result<()> {
        if self.missing_selector.lock().unwrap().as_deref() == Some(selector) {
            return Err(Error::NotFound(format!("element {}", selector)));
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserPage for MockPage {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<String> {
        if self.unresponsive.load(Ordering::SeqCst) {
            return Err(Error::Timeout("ping".into()));
        }
        Ok("Mock".into())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.record(format!("navigate {}", url));
        let mut history = self.history.lock().unwrap();
        if !history.0.is_empty() {
            let keep = history.1 + 1;
            history.0.truncate(keep);
        }
        history.0.push(url.to_string());
        history.1 = history.0.len() - 1;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<String> {
        self.check_selector(selector)?;
        self.record(format!("click {}", selector));
        Ok(selector.to_string())
    }

    async fn type_text(&self, selector: &str, text: &str, submit: bool) -> Result<()> {
        self.check_selector(selector)?;
        self.record(format!("type {} {} {}", selector, text, submit));
        Ok(())
    }

    async fn content(&self, query: &ContentQuery) -> Result<Vec<String>> {
        self.record(format!("content {}", query.root));
        Ok(vec![format!("content of {}", query.root)])
    }

    async fn current_url(&self) -> Result<String> {
        let history = self.history.lock().unwrap();
        Ok(history.0.get(history.1).cloned().unwrap_or_else(|| "about:blank".into()))
    }

    async fn go_back(&self) -> Result<()> {
        self.step_history(-1)?;
        self.record("back".into());
        Ok(())
    }

    async fn go_forward(&self) -> Result<()> {
        self.step_history(1)?;
        self.record("forward".into());
        Ok(())
    }

    async fn reload(&self, bypass_cache: bool) -> Result<()> {
        self.record(format!("reload {}", bypass_cache));
        Ok(())
    }

    async fn scroll(&self, target: ScrollTarget) -> Result<()> {
        self.record(format!("scroll {:?}", target));
        Ok(())
    }

    async fn submit_form(&self, selector: &str) -> Result<()> {
        self.check_selector(selector)?;
        self.record(format!("submit {}", selector));
        Ok(())
    }

    async fn wait_for_element(&self, selector: &str, timeout: Duration, visible: bool) -> Result<()> {
        if self.check_selector(selector).is_err() {
            tokio::time::sleep(timeout).await;
            return Err(Error::Timeout(format!("element {}", selector)));
        }
        self.record(format!("wait {} {}", selector, visible));
        Ok(())
    }

    async fn document_html(&self) -> Result<String> {
        let n = self.html_reads.fetch_add(1, Ordering::SeqCst);
        if self.churning.load(Ordering::SeqCst) {
            return Ok(format!("<p>{}</p>", n));
        }
        let mut snapshots = self.snapshots.lock().unwrap();
        let html = snapshots.front().cloned().unwrap_or_else(|| "<html></html>".into());
        if snapshots.len() > 1 {
            snapshots.pop_front();
        }
        Ok(html)
    }

    async fn clear_storage(&self) -> Result<()> {
        self.record("clear_storage".into());
        Ok(())
    }

    async fn close_browser(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Tier that fails or hands out sessions on successive ports.
pub struct MockStrategy {
    pub name: &'static str,
    pub fail: bool,
    pub next_port: Arc<AtomicU16>,
    pub attempts: Arc<AtomicUsize>,
    pub pages: Arc<Mutex<Vec<Arc<MockPage>>>>,
}

impl MockStrategy {
    pub fn new(name: &'static str, fail: bool) -> Self {
        Self {
            name,
            fail,
            next_port: Arc::new(AtomicU16::new(9400)),
            attempts: Arc::new(AtomicUsize::new(0)),
            pages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn attempts(&self) -> Arc<AtomicUsize> {
        self.attempts.clone()
    }

    pub fn pages(&self) -> Arc<Mutex<Vec<Arc<MockPage>>>> {
        self.pages.clone()
    }
}

#[async_trait]
impl AcquireStrategy for MockStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn attempt(&self) -> Result<BrowserSession> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Browser(format!("{} unavailable", self.name)));
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        let page = Arc::new(MockPage::new());
        self.pages.lock().unwrap().push(page.clone());
        Ok(BrowserSession::new(self.name, port, page))
    }
}
