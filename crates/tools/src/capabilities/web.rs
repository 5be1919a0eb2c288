//! Browser actions for skills. Each action takes the manager lock for its whole
//! duration, so the health check and the action see the same session.

use sisypho_core::Result;
use std::time::Duration;
use tracing::{info, warn};

use crate::browser::{wait_for_settle, ContentQuery, ScrollTarget, SettleTiming, SharedBrowser};

pub const DEFAULT_ELEMENT_WAIT: Duration = Duration::from_millis(5000);

pub struct Web {
    browser: SharedBrowser,
    settle: SettleTiming,
}

impl Web {
    pub fn new(browser: SharedBrowser) -> Self {
        Self {
            browser,
            settle: SettleTiming::default(),
        }
    }

    /// How long a click waits for the page to stop changing.
    pub fn with_settle(mut self, settle: SettleTiming) -> Self {
        self.settle = settle;
        self
    }

    pub async fn navigate(&self, url: &str) -> bool {
        let outcome: Result<()> = async {
            let mut manager = self.browser.lock().await;
            let session = manager.acquire_session().await?;
            session.page().navigate(url).await
        }
        .await;
        report("navigate", url, outcome).is_some()
    }

    /// Click, then (with `wait_for_change`) wait for the page to settle.
    /// A page that never settles still counts as a successful click.
    pub async fn click_element(&self, selector: &str, wait_for_change: bool) -> bool {
        let outcome: Result<String> = async {
            let mut manager = self.browser.lock().await;
            let session = manager.acquire_session().await?;
            let used = session.page().click(selector).await?;
            if wait_for_change {
                wait_for_settle(session.page(), self.settle).await;
            }
            Ok(used)
        }
        .await;
        report("click", selector, outcome).is_some()
    }

    pub async fn go_back(&self) -> bool {
        let outcome: Result<()> = async {
            let mut manager = self.browser.lock().await;
            let session = manager.acquire_session().await?;
            session.page().go_back().await
        }
        .await;
        report("back", "history", outcome).is_some()
    }

    pub async fn go_forward(&self) -> bool {
        let outcome: Result<()> = async {
            let mut manager = self.browser.lock().await;
            let session = manager.acquire_session().await?;
            session.page().go_forward().await
        }
        .await;
        report("forward", "history", outcome).is_some()
    }

    pub async fn reload(&self, bypass_cache: bool) -> bool {
        let outcome: Result<()> = async {
            let mut manager = self.browser.lock().await;
            let session = manager.acquire_session().await?;
            session.page().reload(bypass_cache).await
        }
        .await;
        report("reload", "page", outcome).is_some()
    }

    pub async fn scroll(&self, target: ScrollTarget) -> bool {
        let label = format!("{:?}", target);
        let outcome: Result<()> = async {
            let mut manager = self.browser.lock().await;
            let session = manager.acquire_session().await?;
            session.page().scroll(target).await
        }
        .await;
        report("scroll", &label, outcome).is_some()
    }

    pub async fn submit_form(&self, selector: &str) -> bool {
        let outcome: Result<()> = async {
            let mut manager = self.browser.lock().await;
            let session = manager.acquire_session().await?;
            session.page().submit_form(selector).await
        }
        .await;
        report("submit", selector, outcome).is_some()
    }

    pub async fn wait_for_element(&self, selector: &str, timeout: Duration, visible: bool) -> bool {
        let outcome: Result<()> = async {
            let mut manager = self.browser.lock().await;
            let session = manager.acquire_session().await?;
            session.page().wait_for_element(selector, timeout, visible).await
        }
        .await;
        report("wait", selector, outcome).is_some()
    }

    pub async fn type_into(&self, selector: &str, text: &str, submit: bool) -> bool {
        let outcome: Result<()> = async {
            let mut manager = self.browser.lock().await;
            let session = manager.acquire_session().await?;
            session.page().type_text(selector, text, submit).await
        }
        .await;
        report("type", selector, outcome).is_some()
    }

    /// Text (or markup, with `remove_tags` off) under `root`; `None` on failure.
    pub async fn get_content(&self, root: &str, remove_tags: bool, max_results: i64) -> Option<Vec<String>> {
        let query = ContentQuery {
            root: root.to_string(),
            remove_tags,
            max_results,
        };
        let outcome: Result<Vec<String>> = async {
            let mut manager = self.browser.lock().await;
            let session = manager.acquire_session().await?;
            session.page().content(&query).await
        }
        .await;
        report("content", root, outcome)
    }
}

fn report<T>(action: &str, target: &str, outcome: Result<T>) -> Option<T> {
    match outcome {
        Ok(value) => {
            info!(action, target, "Browser action done");
            Some(value)
        }
        Err(e) => {
            warn!(action, target, error = %e, "Browser action failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::MockStrategy;
    use crate::browser::{BrowserPage, BrowserSessionManager};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn web_with(strategy: MockStrategy) -> Web {
        let manager = BrowserSessionManager::new(vec![Box::new(strategy)], Duration::from_secs(1800), 1024);
        Web::new(manager.into_shared()).with_settle(SettleTiming {
            interval: Duration::from_millis(5),
            stable_for: Duration::from_millis(10),
            timeout: Duration::from_millis(200),
        })
    }

    #[tokio::test]
    async fn test_actions_reach_page() {
        let strategy = MockStrategy::new("mock", false);
        let pages = strategy.pages();
        let web = web_with(strategy);

        assert!(web.navigate("https://example.com").await);
        assert!(web.click_element("#go", true).await);
        assert!(web.type_into("input[name='q']", "rust", true).await);
        let content = web.get_content("main", true, 1).await.unwrap();
        assert_eq!(content, vec!["content of main"]);

        let pages = pages.lock().unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(
            pages[0].actions(),
            vec![
                "navigate https://example.com",
                "click #go",
                "type input[name='q'] rust true",
                "content main",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_element_is_plain_failure() {
        let strategy = MockStrategy::new("mock", false);
        let pages = strategy.pages();
        let web = web_with(strategy);
        assert!(web.navigate("about:blank").await);

        *pages.lock().unwrap()[0].missing_selector.lock().unwrap() = Some("#gone".into());
        assert!(!web.click_element("#gone", true).await);
        assert!(!web.type_into("#gone", "x", false).await);
        // Session survives element misses
        assert!(web.click_element("#there", false).await);
        assert_eq!(pages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_session_recycled_before_action() {
        let strategy = MockStrategy::new("mock", false);
        let pages = strategy.pages();
        let web = web_with(strategy);
        assert!(web.navigate("about:blank").await);

        pages.lock().unwrap()[0].unresponsive.store(true, Ordering::SeqCst);
        assert!(web.navigate("https://example.com").await);
        let pages = pages.lock().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].actions(), vec!["navigate https://example.com"]);
    }

    #[tokio::test]
    async fn test_click_waits_for_page_to_settle() {
        let strategy = MockStrategy::new("mock", false);
        let pages = strategy.pages();
        let web = web_with(strategy);
        assert!(web.navigate("about:blank").await);

        let page = pages.lock().unwrap()[0].clone();
        page.set_snapshots(&["<p>before</p>", "<p>loading</p>", "<p>after</p>"]);
        assert!(web.click_element("#tab", true).await);
        assert!(page.html_reads() >= 4);

        let reads = page.html_reads();
        assert!(web.click_element("#menu", false).await);
        assert_eq!(page.html_reads(), reads);

        // A page that keeps changing still reports the click
        page.churning.store(true, Ordering::SeqCst);
        assert!(web.click_element("#ticker", true).await);
    }

    #[tokio::test]
    async fn test_history_reload_and_scroll() {
        let strategy = MockStrategy::new("mock", false);
        let pages = strategy.pages();
        let web = web_with(strategy);

        assert!(web.navigate("https://a.example").await);
        assert!(!web.go_back().await);
        assert!(web.navigate("https://b.example").await);
        assert!(web.go_back().await);
        assert!(!web.go_back().await);
        assert!(web.go_forward().await);
        assert!(!web.go_forward().await);
        assert!(web.reload(true).await);
        assert!(web.scroll(ScrollTarget::Bottom).await);
        assert!(web.scroll(ScrollTarget::To { x: 0, y: 500 }).await);

        let page = pages.lock().unwrap()[0].clone();
        assert_eq!(page.current_url().await.unwrap(), "https://b.example");
        assert_eq!(
            page.actions()[2..],
            ["back", "forward", "reload true", "scroll Bottom", "scroll To { x: 0, y: 500 }"]
        );
    }

    #[tokio::test]
    async fn test_submit_and_wait_for_element() {
        let strategy = MockStrategy::new("mock", false);
        let pages = strategy.pages();
        let web = web_with(strategy);

        assert!(web.submit_form("#login").await);
        assert!(web.wait_for_element(".results", DEFAULT_ELEMENT_WAIT, true).await);

        let page = pages.lock().unwrap()[0].clone();
        *page.missing_selector.lock().unwrap() = Some(".modal".into());
        assert!(!web.submit_form(".modal").await);
        assert!(!web.wait_for_element(".modal", Duration::from_millis(20), false).await);
        assert_eq!(page.actions(), vec!["submit #login", "wait .results true"]);
    }

    #[tokio::test]
    async fn test_no_browser_available() {
        let web = web_with(MockStrategy::new("mock", true));
        assert!(!web.navigate("https://example.com").await);
        assert!(web.get_content("/", true, 1).await.is_none());
    }
}
