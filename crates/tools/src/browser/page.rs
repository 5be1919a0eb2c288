//! Page-level browser actions behind a trait, so sessions can carry any page driver.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use sisypho_core::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::cdp::CdpClient;

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());
static INLINE_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").unwrap());

/// What to extract from the page.
///
/// `root` is `/` for the whole page, an XPath when it starts with `/`, else a CSS
/// selector. `max_results` of -1 means every match.
#[derive(Debug, Clone)]
pub struct ContentQuery {
    pub root: String,
    pub remove_tags: bool,
    pub max_results: i64,
}

impl Default for ContentQuery {
    fn default() -> Self {
        Self {
            root: "/".to_string(),
            remove_tags: true,
            max_results: 1,
        }
    }
}

/// Where `scroll` moves the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollTarget {
    Top,
    Bottom,
    To { x: i64, y: i64 },
}

impl ScrollTarget {
    /// `top` or `bottom`.
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "top" => Ok(ScrollTarget::Top),
            "bottom" => Ok(ScrollTarget::Bottom),
            other => Err(Error::Browser(format!("invalid scroll target '{}'", other))),
        }
    }

    fn script(self) -> String {
        match self {
            ScrollTarget::Top => "window.scrollTo(0, 0)".to_string(),
            ScrollTarget::Bottom => "window.scrollTo(0, document.body.scrollHeight)".to_string(),
            ScrollTarget::To { x, y } => format!("window.scrollTo({}, {})", x, y),
        }
    }
}

/// How to wait for the document to stop changing after an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleTiming {
    pub interval: Duration,
    /// The markup must stay unchanged this long.
    pub stable_for: Duration,
    pub timeout: Duration,
}

impl Default for SettleTiming {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            stable_for: Duration::from_millis(800),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Poll the document markup until it holds still for `stable_for`.
///
/// Returns whether it settled. Running out of time is not an error: pages with
/// tickers or animations never settle and the caller carries on.
pub async fn wait_for_settle(page: &dyn BrowserPage, timing: SettleTiming) -> bool {
    let started = Instant::now();
    let mut last: Option<String> = None;
    let mut stable = Duration::ZERO;
    while started.elapsed() < timing.timeout {
        match page.document_html().await {
            Ok(html) => {
                if last.as_deref() == Some(html.as_str()) {
                    stable += timing.interval;
                } else {
                    stable = Duration::ZERO;
                }
                if stable >= timing.stable_for {
                    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "DOM settled");
                    return true;
                }
                last = Some(html);
            }
            Err(e) => debug!(error = %e, "DOM snapshot failed"),
        }
        tokio::time::sleep(timing.interval).await;
    }
    info!(timeout_ms = timing.timeout.as_millis() as u64, "DOM still changing, proceeding");
    false
}

#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Whether the underlying connection is still alive.
    fn is_open(&self) -> bool;

    /// Cheap responsiveness check; returns the document title.
    async fn ping(&self) -> Result<String>;

    async fn navigate(&self, url: &str) -> Result<()>;

    /// Click by CSS selector, falling back to progressively shorter `a > b > c` suffixes.
    /// Returns the selector that matched.
    async fn click(&self, selector: &str) -> Result<String>;

    async fn type_text(&self, selector: &str, text: &str, submit: bool) -> Result<()>;

    async fn content(&self, query: &ContentQuery) -> Result<Vec<String>>;

    async fn current_url(&self) -> Result<String>;

    /// Step back in session history; fails on the first entry.
    async fn go_back(&self) -> Result<()>;

    /// Step forward in session history; fails on the last entry.
    async fn go_forward(&self) -> Result<()>;

    async fn reload(&self, bypass_cache: bool) -> Result<()>;

    async fn scroll(&self, target: ScrollTarget) -> Result<()>;

    /// Submit a form element, or press Enter in any other element.
    async fn submit_form(&self, selector: &str) -> Result<()>;

    /// Wait until `selector` is attached (and rendered, with `visible`).
    async fn wait_for_element(&self, selector: &str, timeout: Duration, visible: bool) -> Result<()>;

    /// Current serialized markup, used to tell when the page stops changing.
    async fn document_html(&self) -> Result<String>;

    /// Clear local/session storage and caches.
    async fn clear_storage(&self) -> Result<()>;

    /// Ask the browser process to exit.
    async fn close_browser(&self) -> Result<()>;
}

/// Page driven over a CDP page-target connection.
pub struct CdpPage {
    cdp: CdpClient,
}

impl CdpPage {
    pub async fn attach(ws_url: &str) -> Result<Self> {
        let cdp = CdpClient::connect(ws_url).await?;
        cdp.enable_domain("Page").await?;
        cdp.enable_domain("Runtime").await?;
        cdp.enable_domain("Network").await.ok();
        debug!(ws_url, "CDP page attached");
        Ok(Self { cdp })
    }

    /// Move `delta` entries through session history.
    async fn traverse_history(&self, delta: i64) -> Result<()> {
        let history = self.cdp.send_command("Page.getNavigationHistory", json!({})).await?;
        let current = history.get("currentIndex").and_then(Value::as_i64).unwrap_or(0);
        let entries = history
            .get("entries")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let entry_id = usize::try_from(current + delta)
            .ok()
            .and_then(|idx| entries.get(idx))
            .and_then(|entry| entry.get("id"))
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                Error::Browser(if delta < 0 {
                    "no previous page in history".to_string()
                } else {
                    "no next page in history".to_string()
                })
            })?;
        self.cdp
            .send_command("Page.navigateToHistoryEntry", json!({ "entryId": entry_id }))
            .await?;
        self.wait_until_ready().await
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let started = Instant::now();
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if self.cdp.evaluate_js("document.readyState").await?.as_str() == Some("complete") {
                return Ok(());
            }
            if started.elapsed() >= NAVIGATION_TIMEOUT {
                return Err(Error::Timeout(format!(
                    "page did not finish loading within {}s",
                    NAVIGATION_TIMEOUT.as_secs()
                )));
            }
        }
    }
}

fn js_string(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

#[async_trait]
impl BrowserPage for CdpPage {
    fn is_open(&self) -> bool {
        !self.cdp.is_closed()
    }

    async fn ping(&self) -> Result<String> {
        let title = self.cdp.evaluate_js("document.title").await?;
        Ok(title.as_str().unwrap_or_default().to_string())
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let mut loaded = self.cdp.subscribe_event("Page.loadEventFired").await;
        let result = self.cdp.navigate(url).await?;
        if let Some(err) = result.get("errorText").and_then(Value::as_str) {
            if !err.is_empty() {
                return Err(Error::Browser(format!("navigation to {} failed: {}", url, err)));
            }
        }
        // Same-document navigations carry no loader and fire no load event.
        if result.get("loaderId").is_none() {
            return Ok(());
        }
        match tokio::time::timeout(NAVIGATION_TIMEOUT, loaded.recv()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(Error::Browser("page closed during navigation".into())),
            Err(_) => Err(Error::Timeout(format!(
                "page {} did not finish loading within {}s",
                url,
                NAVIGATION_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn click(&self, selector: &str) -> Result<String> {
        let js = format!(
            r#"(function(sel) {{
  function all(s) {{ try {{ return document.querySelectorAll(s); }} catch (e) {{ return []; }} }}
  var el = null, used = sel;
  var exact = all(sel);
  if (exact.length > 0) {{ el = exact[0]; }}
  else {{
    var parts = sel.split(' > ');
    for (var i = 0; i < parts.length && !el; i++) {{
      var s = parts.slice(i).join(' > ');
      var m = all(s);
      if (m.length === 1) {{ el = m[0]; used = s; }}
    }}
    if (!el) {{
      var last = parts[parts.length - 1], lm = all(last);
      if (lm.length > 0) {{ el = lm[0]; used = last; }}
    }}
  }}
  if (!el) return null;
  el.scrollIntoView({{block: 'center'}});
  el.click();
  return used;
}})({})"#,
            js_string(selector)
        );
        match self.cdp.evaluate_js(&js).await? {
            Value::String(used) => {
                if used != selector {
                    debug!(selector, matched = %used, "Fuzzy selector match");
                }
                Ok(used)
            }
            _ => Err(Error::NotFound(format!("element {}", selector))),
        }
    }

    async fn type_text(&self, selector: &str, text: &str, submit: bool) -> Result<()> {
        let focus = format!(
            r#"(function(sel) {{
  var el = document.querySelector(sel);
  if (!el) return false;
  el.focus();
  if ('value' in el) {{ el.value = ''; }} else {{ el.textContent = ''; }}
  return true;
}})({})"#,
            js_string(selector)
        );
        if self.cdp.evaluate_js(&focus).await?.as_bool() != Some(true) {
            return Err(Error::NotFound(format!("element {}", selector)));
        }

        self.cdp.insert_text(text).await?;
        self.cdp
            .evaluate_js(
                "document.activeElement && (document.activeElement.dispatchEvent(new Event('input', {bubbles: true})), document.activeElement.dispatchEvent(new Event('change', {bubbles: true})))",
            )
            .await?;

        if submit {
            self.cdp.dispatch_key_event("keyDown", "Enter", "Enter", 13).await?;
            self.cdp.dispatch_key_event("keyUp", "Enter", "Enter", 13).await?;
        }
        Ok(())
    }

    async fn content(&self, query: &ContentQuery) -> Result<Vec<String>> {
        let js = format!(
            r#"(function(root, removeTags, max) {{
  if (root === '/') {{
    if (removeTags) return [document.body ? document.body.innerText : document.documentElement.innerText];
    return [document.documentElement.outerHTML];
  }}
  var nodes = [];
  if (root.charAt(0) === '/') {{
    var r = document.evaluate(root, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
    for (var i = 0; i < r.snapshotLength; i++) nodes.push(r.snapshotItem(i));
  }} else {{
    nodes = Array.prototype.slice.call(document.querySelectorAll(root));
  }}
  if (max >= 0) nodes = nodes.slice(0, max);
  return nodes.map(function(n) {{
    if (removeTags) return n.innerText !== undefined ? n.innerText : n.textContent;
    return n.innerHTML !== undefined ? n.innerHTML : n.textContent;
  }});
}})({}, {}, {})"#,
            js_string(&query.root),
            query.remove_tags,
            query.max_results
        );
        let raw = self.cdp.evaluate_js(&js).await?;
        let items: Vec<String> = raw
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(clean_content(items, query.max_results))
    }

    async fn current_url(&self) -> Result<String> {
        let url = self.cdp.evaluate_js("window.location.href").await?;
        Ok(url.as_str().unwrap_or_default().to_string())
    }

    async fn go_back(&self) -> Result<()> {
        self.traverse_history(-1).await
    }

    async fn go_forward(&self) -> Result<()> {
        self.traverse_history(1).await
    }

    async fn reload(&self, bypass_cache: bool) -> Result<()> {
        let mut loaded = self.cdp.subscribe_event("Page.loadEventFired").await;
        self.cdp
            .send_command("Page.reload", json!({ "ignoreCache": bypass_cache }))
            .await?;
        match tokio::time::timeout(NAVIGATION_TIMEOUT, loaded.recv()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(Error::Browser("page closed during reload".into())),
            Err(_) => Err(Error::Timeout(format!(
                "reload did not finish within {}s",
                NAVIGATION_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn scroll(&self, target: ScrollTarget) -> Result<()> {
        self.cdp.evaluate_js(&target.script()).await?;
        Ok(())
    }

    async fn submit_form(&self, selector: &str) -> Result<()> {
        let js = format!(
            r#"(function(sel) {{
  var el = document.querySelector(sel);
  if (!el) return null;
  if (el.tagName === 'FORM') {{
    if (el.requestSubmit) {{ el.requestSubmit(); }} else {{ el.submit(); }}
    return 'submitted';
  }}
  el.focus();
  return 'focused';
}})({})"#,
            js_string(selector)
        );
        match self.cdp.evaluate_js(&js).await? {
            Value::String(how) if how == "submitted" => Ok(()),
            Value::String(_) => {
                self.cdp.dispatch_key_event("keyDown", "Enter", "Enter", 13).await?;
                self.cdp.dispatch_key_event("keyUp", "Enter", "Enter", 13).await?;
                Ok(())
            }
            _ => Err(Error::NotFound(format!("element {}", selector))),
        }
    }

    async fn wait_for_element(&self, selector: &str, timeout: Duration, visible: bool) -> Result<()> {
        let js = format!(
            r#"(function(sel, visible) {{
  var el;
  try {{ el = document.querySelector(sel); }} catch (e) {{ return false; }}
  if (!el) return false;
  if (!visible) return true;
  var style = window.getComputedStyle(el);
  return style.visibility !== 'hidden' && style.display !== 'none' && el.getClientRects().length > 0;
}})({}, {})"#,
            js_string(selector),
            visible
        );
        let started = Instant::now();
        loop {
            if self.cdp.evaluate_js(&js).await?.as_bool() == Some(true) {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::Timeout(format!(
                    "element {} did not appear within {}ms",
                    selector,
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn document_html(&self) -> Result<String> {
        let html = self.cdp.evaluate_js("document.documentElement.outerHTML").await?;
        Ok(html.as_str().unwrap_or_default().to_string())
    }

    async fn clear_storage(&self) -> Result<()> {
        self.cdp
            .evaluate_js(
                r#"(async function() {
  try { localStorage.clear(); } catch (e) {}
  try { sessionStorage.clear(); } catch (e) {}
  if (window.caches) {
    var keys = await caches.keys();
    await Promise.all(keys.map(function(k) { return caches.delete(k); }));
  }
  return true;
})()"#,
            )
            .await?;
        if let Err(e) = self.cdp.clear_browser_cache().await {
            warn!(error = %e, "Clearing browser cache failed");
        }
        Ok(())
    }

    async fn close_browser(&self) -> Result<()> {
        self.cdp.send_command("Browser.close", json!({})).await?;
        Ok(())
    }
}

/// Normalize whitespace and apply the result limit.
pub fn clean_content(items: Vec<String>, max_results: i64) -> Vec<String> {
    let cleaned: Vec<String> = items
        .into_iter()
        .map(|item| {
            let collapsed = BLANK_LINES.replace_all(&item, "\n\n");
            INLINE_SPACE.replace_all(&collapsed, " ").trim().to_string()
        })
        .collect();
    if max_results < 0 {
        return cleaned;
    }
    cleaned.into_iter().take(max_results as usize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::MockPage;

    #[test]
    fn test_clean_content_whitespace() {
        let raw = vec!["  Title\n\n\n   \nBody\t\t text   here  ".to_string()];
        assert_eq!(clean_content(raw, 1), vec!["Title\n\nBody text here"]);
    }

    #[test]
    fn test_clean_content_limits() {
        let items: Vec<String> = (0..5).map(|i| format!("item {}", i)).collect();
        assert_eq!(clean_content(items.clone(), -1).len(), 5);
        assert_eq!(clean_content(items.clone(), 2), vec!["item 0", "item 1"]);
        assert_eq!(clean_content(items.clone(), 10).len(), 5);
        assert!(clean_content(items, 0).is_empty());
    }

    #[test]
    fn test_scroll_targets() {
        assert_eq!(ScrollTarget::parse(" Top ").unwrap(), ScrollTarget::Top);
        assert_eq!(ScrollTarget::parse("bottom").unwrap(), ScrollTarget::Bottom);
        assert!(ScrollTarget::parse("middle").is_err());
        assert_eq!(ScrollTarget::To { x: 0, y: 500 }.script(), "window.scrollTo(0, 500)");
        assert!(ScrollTarget::Bottom.script().contains("scrollHeight"));
    }

    fn quick() -> SettleTiming {
        SettleTiming {
            interval: Duration::from_millis(5),
            stable_for: Duration::from_millis(15),
            timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_settle_waits_out_changes() {
        let page = MockPage::new();
        page.set_snapshots(&["<p>1</p>", "<p>2</p>", "<p>3</p>"]);
        assert!(wait_for_settle(&page, quick()).await);
        // Each snapshot is read once before the last one repeats
        assert!(page.html_reads() >= 6);
    }

    #[tokio::test]
    async fn test_settle_gives_up_on_churning_page() {
        let page = MockPage::new();
        page.churning.store(true, std::sync::atomic::Ordering::SeqCst);
        let timing = SettleTiming {
            timeout: Duration::from_millis(60),
            ..quick()
        };
        assert!(!wait_for_settle(&page, timing).await);
    }

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(js_string("a[name='q']"), r#""a[name='q']""#);
        assert_eq!(js_string("say \"hi\""), r#""say \"hi\"""#);
    }
}
