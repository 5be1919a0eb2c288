//! Locating browsers, profiles and debug endpoints on the local machine.

use serde::Deserialize;
use serde_json::Value;
use sisypho_core::{Error, Result};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::debug;

const VERSION_QUERY_TIMEOUT: Duration = Duration::from_millis(400);
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const OUTPUT_TAIL_BYTES: usize = 8 * 1024;
/// How long an exited browser's readers get to hit end of stream.
const EXIT_DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Response of `GET /json/version` on a debug port.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpVersionInfo {
    #[serde(rename = "Browser", default)]
    pub browser: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub web_socket_debugger_url: Option<String>,
}

/// Well-known install locations, most specific first. Bare names go through `which`.
fn executable_candidates() -> Vec<String> {
    let mut candidates: Vec<String> = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome".into(),
            "/Applications/Google Chrome Canary.app/Contents/MacOS/Google Chrome Canary".into(),
            "/usr/local/bin/google-chrome".into(),
        ]
    } else if cfg!(target_os = "linux") {
        vec![
            "google-chrome".into(),
            "google-chrome-stable".into(),
            "/usr/bin/google-chrome".into(),
            "/usr/local/bin/google-chrome".into(),
        ]
    } else {
        vec![
            r"C:\Program Files\Google\Chrome\Application\chrome.exe".into(),
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe".into(),
        ]
    };
    if cfg!(target_os = "macos") {
        if let Some(home) = dirs::home_dir() {
            candidates.push(
                home.join("Applications/Google Chrome.app/Contents/MacOS/Google Chrome")
                    .display()
                    .to_string(),
            );
        }
    }
    candidates
}

/// Find the real browser executable. An explicit override is authoritative.
pub fn find_browser_executable(override_path: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        let path = PathBuf::from(path);
        return path.exists().then_some(path);
    }
    for candidate in executable_candidates() {
        let path = Path::new(&candidate);
        if path.exists() {
            return Some(path.to_path_buf());
        }
        if !candidate.contains('/') && !candidate.contains('\\') {
            if let Ok(found) = which::which(&candidate) {
                return Some(found);
            }
        }
    }
    None
}

/// Find a bundled Chromium build under `root` (e.g. `~/.sisypho/browsers/chromium-1234/...`).
pub fn find_bundled_engine(root: &Path) -> Option<PathBuf> {
    let names = [
        "Chromium.app/Contents/MacOS/Chromium",
        "chrome-mac/Chromium.app/Contents/MacOS/Chromium",
        "chrome-linux/chrome",
        "chrome-win/chrome.exe",
        "chrome",
        "chromium",
    ];
    let mut dirs: Vec<PathBuf> = vec![root.to_path_buf()];
    if let Ok(entries) = std::fs::read_dir(root) {
        let mut nested: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        nested.sort();
        // Newest build revision last in lexical order
        nested.reverse();
        dirs.extend(nested);
    }
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|p| p.is_file())
}

/// The user's default profile directory for this platform.
pub fn user_profile_dir() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let dir = if cfg!(target_os = "macos") {
        home.join("Library/Application Support/Google/Chrome/Default")
    } else if cfg!(target_os = "windows") {
        home.join("AppData/Local/Google/Chrome/User Data/Default")
    } else {
        home.join(".config/google-chrome/Default")
    };
    dir.is_dir().then_some(dir)
}

pub async fn is_port_open(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            VERSION_QUERY_TIMEOUT,
            tokio::net::TcpStream::connect(("127.0.0.1", port))
        )
        .await,
        Ok(Ok(_))
    )
}

/// Query `/json/version`. `None` when nothing debuggable answers.
pub async fn query_debug_endpoint(port: u16) -> Option<CdpVersionInfo> {
    let client = reqwest::Client::builder()
        .timeout(VERSION_QUERY_TIMEOUT)
        .build()
        .ok()?;
    let url = format!("http://127.0.0.1:{}/json/version", port);
    let resp = client.get(&url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    resp.json::<CdpVersionInfo>().await.ok()
}

/// First port in `[start, start + count)` that can be bound locally.
pub fn find_available_port(start: u16, count: u16) -> Result<u16> {
    for offset in 0..count {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(Error::Browser(format!(
        "no free debug port in {}..{}",
        start,
        start.saturating_add(count)
    )))
}

/// Poll the debug port until it answers, the process exits, or `timeout` passes.
pub async fn wait_for_debug_port(
    port: u16,
    child: &mut Child,
    output: &mut OutputTail,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        if query_debug_endpoint(port).await.is_some() {
            debug!(port, elapsed_ms = start.elapsed().as_millis() as u64, "Debug port ready");
            return Ok(());
        }
        if let Ok(Some(status)) = child.try_wait() {
            output.wait_for_eof(EXIT_DRAIN_WAIT).await;
            return Err(Error::Browser(format!(
                "browser exited early with {} before port {} opened: {}",
                status,
                port,
                output.text()
            )));
        }
        if start.elapsed() > timeout {
            return Err(Error::Timeout(format!(
                "debug port {} not ready after {}s",
                port,
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// The last few KiB a child wrote to stdout and stderr.
///
/// Background readers drain both pipes for the life of the process so a
/// chatty browser never blocks on a full pipe. Dropping the tail stops them.
pub struct OutputTail {
    buf: Arc<Mutex<VecDeque<u8>>>,
    readers: Vec<JoinHandle<()>>,
}

impl OutputTail {
    /// Take the child's piped stdout and stderr and start draining them.
    pub fn capture(child: &mut Child) -> Self {
        let mut tail = Self {
            buf: Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_BYTES))),
            readers: Vec::new(),
        };
        if let Some(out) = child.stdout.take() {
            tail.drain(out);
        }
        if let Some(err) = child.stderr.take() {
            tail.drain(err);
        }
        tail
    }

    fn drain<R: AsyncRead + Unpin + Send + 'static>(&mut self, mut pipe: R) {
        let buf = self.buf.clone();
        self.readers.push(tokio::spawn(async move {
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let Ok(mut tail) = buf.lock() else { break };
                        tail.extend(&chunk[..n]);
                        let excess = tail.len().saturating_sub(OUTPUT_TAIL_BYTES);
                        tail.drain(..excess);
                    }
                }
            }
        }));
    }

    /// Wait up to `limit` for every pipe to close. A helper process holding a
    /// pipe open only costs the wait.
    pub async fn wait_for_eof(&mut self, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        for reader in &mut self.readers {
            if tokio::time::timeout_at(deadline, reader).await.is_err() {
                debug!("Browser output still open after exit");
                return;
            }
        }
    }

    /// Captured output so far, trimmed.
    pub fn text(&self) -> String {
        let Ok(tail) = self.buf.lock() else {
            return String::new();
        };
        let (front, back) = tail.as_slices();
        let mut bytes = Vec::with_capacity(tail.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

impl Drop for OutputTail {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// WebSocket URL of the first `page` target. Retries since the tab may lag the port.
pub async fn get_page_ws_url(port: u16) -> Result<String> {
    let url = format!("http://127.0.0.1:{}/json/list", port);

    for attempt in 0..10 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        let resp = match reqwest::get(&url).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        let targets: Vec<Value> = match resp.json().await {
            Ok(t) => t,
            Err(_) => continue,
        };
        for target in &targets {
            if target.get("type").and_then(Value::as_str) == Some("page") {
                if let Some(ws_url) = target.get("webSocketDebuggerUrl").and_then(Value::as_str) {
                    return Ok(ws_url.to_string());
                }
            }
        }
    }

    Err(Error::Browser(format!(
        "no page target on port {} after retries",
        port
    )))
}

/// Arguments for a debuggable launch. `headless` is never used by the chain itself.
pub fn build_launch_args(debug_port: u16, user_data_dir: &Path, headless: bool) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-popup-blocking".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-sync".to_string(),
    ];
    if headless {
        args.push("--headless=new".to_string());
    }
    args.push("about:blank".to_string());
    args
}
