//! Records user interactions by polling the browser-bridge and accessibility
//! backends and appending each poll's events to `recording.jsonl`.

use chrono::{DateTime, Local, NaiveDateTime};
use serde_json::{json, Value};
use sisypho_core::config::RecordingConfig;
use sisypho_core::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::capabilities::ToolCaller;
use crate::mcp::{CallError, CallOutcome, ToolPayload};

pub const RECORDING_FILE: &str = "recording.jsonl";

const BROWSER_QUEUE_TOOL: &str = "retrieve_write_interaction_queue";
const CAPTURED_EVENTS_TOOL: &str = "get_captured_events";
const CLEAR_EVENTS_TOOL: &str = "clear_captured_events";

/// Accessibility detail fields too large to keep.
const BULKY_DETAIL_FIELDS: &[&str] = &["element_semantic_path", "element_path"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingSummary {
    pub file: PathBuf,
    pub polls: u64,
    pub events_written: u64,
}

pub struct Recorder {
    caller: Arc<dyn ToolCaller>,
    output_dir: PathBuf,
    poll_interval: Duration,
    clear_every: u32,
}

impl Recorder {
    pub fn new(caller: Arc<dyn ToolCaller>, output_dir: PathBuf, config: &RecordingConfig) -> Self {
        Self {
            caller,
            output_dir,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            clear_every: config.clear_every,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn recording_file(&self) -> PathBuf {
        self.output_dir.join(RECORDING_FILE)
    }

    /// Poll until `shutdown` fires or the browser bridge goes away.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<RecordingSummary> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.recording_file();
        let mut file = tokio::fs::File::create(&path).await?;
        let mut summary = RecordingSummary {
            file: path.clone(),
            ..Default::default()
        };

        // Start from a clean slate on both backends
        self.caller.call_tool(CLEAR_EVENTS_TOOL, json!({})).await;
        self.caller.call_tool(BROWSER_QUEUE_TOOL, json!({})).await;
        info!(
            path = %path.display(),
            interval_ms = self.poll_interval.as_millis() as u64,
            "Recording started"
        );

        loop {
            let Some(events) = self.poll_once(summary.polls).await else {
                warn!("Browser bridge disconnected, stopping recording");
                break;
            };
            summary.polls += 1;
            if !events.is_empty() {
                let mut buf = String::new();
                for event in &events {
                    buf.push_str(&event.to_string());
                    buf.push('\n');
                }
                file.write_all(buf.as_bytes()).await?;
                file.flush().await?;
                summary.events_written += events.len() as u64;
                debug!(count = events.len(), "Wrote events");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.recv() => {
                    info!("Recording stopped");
                    break;
                }
            }
        }

        file.flush().await?;
        info!(
            path = %path.display(),
            polls = summary.polls,
            events = summary.events_written,
            "Recording saved"
        );
        Ok(summary)
    }

    /// One poll of both backends, merged and sorted. `None` when the browser
    /// bridge connection is gone.
    async fn poll_once(&self, polls_so_far: u64) -> Option<Vec<Value>> {
        let browser = self.caller.call_tool(BROWSER_QUEUE_TOOL, json!({})).await;
        if let CallOutcome::Failed(CallError::ConnectionLost(reason)) = &browser {
            warn!(reason = %reason, "Browser bridge lost");
            return None;
        }
        let accessibility = self.caller.call_tool(CAPTURED_EVENTS_TOOL, json!({})).await;

        let polls = polls_so_far + 1;
        if self.clear_every > 0 && polls % u64::from(self.clear_every) == 0 {
            debug!(polls, "Clearing captured events");
            let cleared = self.caller.call_tool(CLEAR_EVENTS_TOOL, json!({})).await;
            if let Some(e) = cleared.error() {
                warn!(error = %e, "Clearing captured events failed");
            }
        }

        let mut events = browser_events(&browser);
        events.extend(accessibility_events(&accessibility));
        sort_by_timestamp(&mut events);
        Some(events)
    }
}

/// Browser-bridge interactions, minus their DOM snapshot, tagged as chrome.
pub fn browser_events(outcome: &CallOutcome) -> Vec<Value> {
    let Some(interactions) = outcome
        .payload()
        .and_then(ToolPayload::as_structured)
        .and_then(|v| v.get("interactions"))
        .and_then(Value::as_array)
    else {
        if let Some(e) = outcome.error() {
            warn!(error = %e, "Polling browser events failed");
        }
        return Vec::new();
    };
    interactions
        .iter()
        .filter_map(Value::as_object)
        .map(|event| {
            let mut event = event.clone();
            event.remove("domState");
            event.insert("source".into(), json!("chrome"));
            Value::Object(event)
        })
        .collect()
}

/// Accessibility events wrapped as `{timestamp, source, event}` records.
///
/// Scroll events are dropped, as are bulky path details and details whose
/// value is the driver's `"None"`/`"Unknown"` placeholder.
pub fn accessibility_events(outcome: &CallOutcome) -> Vec<Value> {
    let events = match outcome.payload().and_then(ToolPayload::as_structured) {
        Some(Value::Array(events)) => events,
        Some(other) => {
            if other.get("success").and_then(Value::as_bool) == Some(false) {
                let message = other.get("message").and_then(Value::as_str).unwrap_or("unknown error");
                warn!(message, "Accessibility events error");
            }
            return Vec::new();
        }
        None => {
            if let Some(e) = outcome.error() {
                warn!(error = %e, "Polling accessibility events failed");
            }
            return Vec::new();
        }
    };

    events
        .iter()
        .filter_map(Value::as_object)
        .filter(|event| event.get("type").and_then(Value::as_str) != Some("scroll"))
        .map(|event| {
            let mut event = event.clone();
            let mut source = "accessibility".to_string();
            if let Some(Value::Object(details)) = event.get_mut("details") {
                for field in BULKY_DETAIL_FIELDS {
                    details.remove(*field);
                }
                details.retain(|_, v| !matches!(v.as_str(), Some("None") | Some("Unknown")));
                if let Some(s) = details.get("source").and_then(Value::as_str) {
                    source = s.to_string();
                }
            }
            let timestamp = event
                .get("timestamp")
                .cloned()
                .unwrap_or_else(|| json!(Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()));
            json!({
                "timestamp": timestamp,
                "source": source,
                "event": Value::Object(event),
            })
        })
        .collect()
}

/// Stable sort by `timestamp`, which may be epoch numbers or ISO strings.
pub fn sort_by_timestamp(events: &mut [Value]) {
    events.sort_by(|a, b| {
        timestamp_millis(a)
            .partial_cmp(&timestamp_millis(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn timestamp_millis(event: &Value) -> f64 {
    match event.get("timestamp") {
        Some(Value::Number(n)) => {
            let v = n.as_f64().unwrap_or(0.0);
            // Seconds rather than milliseconds
            if v < 1e11 {
                v * 1000.0
            } else {
                v
            }
        }
        Some(Value::String(s)) => parse_iso_millis(s).unwrap_or(f64::MAX),
        _ => f64::MAX,
    }
}

fn parse_iso_millis(s: &str) -> Option<f64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis() as f64);
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    let local = naive.and_local_timezone(Local).single()?;
    Some(local.timestamp_millis() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn structured(v: Value) -> CallOutcome {
        CallOutcome::Payload(ToolPayload::Structured(v))
    }

    #[test]
    fn test_browser_events_strip_dom_state() {
        let outcome = structured(json!({"interactions": [
            {"type": "click", "timestamp": 5, "domState": "<html>..."},
            "junk"
        ]}));
        let events = browser_events(&outcome);
        assert_eq!(events, vec![json!({"type": "click", "timestamp": 5, "source": "chrome"})]);
        assert!(browser_events(&CallOutcome::NoResult).is_empty());
    }

    #[test]
    fn test_accessibility_events_filtered() {
        let outcome = structured(json!([
            {"type": "scroll", "timestamp": "2025-01-01T00:00:01"},
            {"type": "click", "timestamp": "2025-01-01T00:00:02", "details": {
                "element_path": "/a/b", "element_semantic_path": "x",
                "role": "AXButton", "title": "None", "value": "Unknown", "source": "finder"
            }},
            {"type": "key", "timestamp": "2025-01-01T00:00:03"}
        ]));
        let events = accessibility_events(&outcome);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["source"], "finder");
        assert_eq!(
            events[0]["event"]["details"],
            json!({"role": "AXButton", "source": "finder"})
        );
        assert_eq!(events[1]["source"], "accessibility");
        assert_eq!(events[1]["timestamp"], "2025-01-01T00:00:03");
    }

    #[test]
    fn test_accessibility_error_payload_is_empty() {
        let outcome = structured(json!({"success": false, "message": "not trusted"}));
        assert!(accessibility_events(&outcome).is_empty());
        assert!(accessibility_events(&CallOutcome::Payload(ToolPayload::Text("hi".into()))).is_empty());
    }

    #[test]
    fn test_sort_mixed_timestamps() {
        let mut events = vec![
            json!({"timestamp": "2025-01-01T00:00:03Z", "id": 3}),
            json!({"timestamp": 1735689601, "id": 1}),
            json!({"timestamp": 1735689602000u64, "id": 2}),
            json!({"id": 4}),
        ];
        sort_by_timestamp(&mut events);
        let ids: Vec<i64> = events.iter().map(|e| e["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    /// Serves canned browser and accessibility batches, then reports the bridge gone.
    struct ScriptedCaller {
        batches: Mutex<Vec<(CallOutcome, CallOutcome)>>,
        pending_ax: Mutex<Option<CallOutcome>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolCaller for ScriptedCaller {
        async fn call_tool(&self, tool: &str, _arguments: Value) -> CallOutcome {
            self.calls.lock().unwrap().push(tool.to_string());
            match tool {
                BROWSER_QUEUE_TOOL => {
                    // The first queue call only drains
                    if self.calls.lock().unwrap().iter().filter(|t| *t == BROWSER_QUEUE_TOOL).count() == 1 {
                        return structured(json!({"interactions": []}));
                    }
                    let mut batches = self.batches.lock().unwrap();
                    if batches.is_empty() {
                        return CallOutcome::Failed(CallError::ConnectionLost("bridge exited".into()));
                    }
                    let (browser, ax) = batches.remove(0);
                    *self.pending_ax.lock().unwrap() = Some(ax);
                    browser
                }
                CAPTURED_EVENTS_TOOL => self
                    .pending_ax
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or(CallOutcome::NoResult),
                _ => CallOutcome::NoResult,
            }
        }
    }

    #[tokio::test]
    async fn test_run_loop_writes_until_bridge_lost() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller {
            batches: Mutex::new(vec![
                (
                    structured(json!({"interactions": [{"timestamp": 2000, "domState": {}}]})),
                    structured(json!([{"type": "click", "timestamp": 1000}])),
                ),
                (
                    structured(json!({"interactions": []})),
                    structured(json!([{"type": "scroll", "timestamp": 3000}])),
                ),
            ]),
            pending_ax: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        });
        let config = RecordingConfig {
            poll_interval_ms: 1,
            clear_every: 2,
        };
        let recorder = Arc::new(Recorder::new(caller.clone(), dir.path().join("session"), &config));
        let (_tx, rx) = broadcast::channel(1);

        let summary = recorder.clone().run_loop(rx).await.unwrap();
        assert_eq!(summary.polls, 2);
        assert_eq!(summary.events_written, 2);

        let text = std::fs::read_to_string(recorder.recording_file()).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["source"], "accessibility");
        assert_eq!(lines[1], json!({"timestamp": 2000, "source": "chrome"}));

        let calls = caller.calls.lock().unwrap();
        assert_eq!(calls[0], CLEAR_EVENTS_TOOL);
        assert_eq!(calls.iter().filter(|t| *t == CLEAR_EVENTS_TOOL).count(), 2);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let caller = Arc::new(ScriptedCaller {
            batches: Mutex::new(vec![(CallOutcome::NoResult, CallOutcome::NoResult); 1000]),
            pending_ax: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        });
        let config = RecordingConfig {
            poll_interval_ms: 20,
            clear_every: 10,
        };
        let recorder = Arc::new(Recorder::new(caller, dir.path().to_path_buf(), &config));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(recorder.clone().run_loop(rx));
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(()).unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert!(summary.polls >= 1);
        assert_eq!(summary.events_written, 0);
        assert!(recorder.recording_file().exists());
    }
}
