//! Native app automation through the accessibility backend.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ToolCaller;
use crate::mcp::{CallOutcome, ToolPayload};
use crate::safe_truncate;

const SWITCH_SETTLE: Duration = Duration::from_millis(200);
const FINDER_PROMPT_PAUSE: Duration = Duration::from_millis(300);
const FINDER_NAVIGATE_PAUSE: Duration = Duration::from_millis(200);

/// One step of a typed string: literal text or a named key press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedChunk {
    Text(String),
    Key(&'static str),
}

/// Split typed text on escape sequences.
///
/// `\n` and `\r` press return, `\t` tab, `\s` space, `\b` delete and `\\` types
/// one backslash. Any other backslash is typed as is.
pub fn split_typed_text(text: &str) -> Vec<TypedChunk> {
    let mut chunks = Vec::new();
    let mut pending = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            pending.push(c);
            continue;
        }
        let key = match chars.peek() {
            Some('\\') => {
                chars.next();
                pending.push('\\');
                continue;
            }
            Some('n') | Some('r') => "return",
            Some('t') => "tab",
            Some('s') => "space",
            Some('b') => "delete",
            _ => {
                pending.push('\\');
                continue;
            }
        };
        chars.next();
        if !pending.is_empty() {
            chunks.push(TypedChunk::Text(std::mem::take(&mut pending)));
        }
        chunks.push(TypedChunk::Key(key));
    }
    if !pending.is_empty() {
        chunks.push(TypedChunk::Text(pending));
    }
    chunks
}

/// Desktop actions. Remembers the app it last switched to so repeated
/// actions in one app skip the switch.
pub struct Desktop {
    caller: Arc<dyn ToolCaller>,
    active_app: Mutex<Option<String>>,
    settle: Duration,
}

impl Desktop {
    pub fn new(caller: Arc<dyn ToolCaller>) -> Self {
        Self {
            caller,
            active_app: Mutex::new(None),
            settle: SWITCH_SETTLE,
        }
    }

    /// Pause after an app switch before the next action.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn active_app(&self) -> Option<String> {
        self.active_app.lock().ok().and_then(|a| a.clone())
    }

    pub async fn click(
        &self,
        app: &str,
        descriptor: &str,
        right_click: bool,
        double_click: bool,
        duration_ms: u64,
    ) -> bool {
        if !self.ensure_app(app).await {
            return false;
        }
        let mut arguments = json!({
            "action": if right_click { "AXShowMenu" } else { "AXPress" },
        });
        if !descriptor.is_empty() {
            arguments["path"] = json!(descriptor);
        }
        if !app.is_empty() {
            arguments["app_name"] = json!(app);
        }
        debug!(app, descriptor, right_click, double_click, duration_ms, "Desktop click");

        let presses = if double_click && !right_click { 2 } else { 1 };
        for _ in 0..presses {
            if !self.checked_call("perform_action", arguments.clone()).await {
                return false;
            }
        }
        true
    }

    pub async fn type_text(&self, app: &str, text: &str) -> bool {
        if !self.ensure_app(app).await {
            return false;
        }
        for chunk in split_typed_text(text) {
            let ok = match chunk {
                TypedChunk::Text(t) => self.checked_call("send_string", json!({ "text": t })).await,
                TypedChunk::Key(key) => self.checked_call("send_keystroke", json!({ "key": key })).await,
            };
            if !ok {
                warn!(app, text = safe_truncate(text, 80), "Typing aborted");
                return false;
            }
        }
        true
    }

    pub async fn command(&self, app: &str, descriptor: &str, modifiers: &[String], key: &str) -> bool {
        if key.is_empty() {
            warn!(app, descriptor, "Keyboard command without a key");
            return false;
        }
        if !self.ensure_app(app).await {
            return false;
        }
        let mut arguments = json!({ "key": key });
        if !modifiers.is_empty() {
            arguments["modifiers"] = json!(modifiers);
        }
        self.checked_call("send_keystroke", arguments).await
    }

    /// Text of an element, or `None` when the backend could not read it.
    pub async fn get_element_content(&self, app: &str, descriptor: &str) -> Option<String> {
        if !self.ensure_app(app).await {
            return None;
        }
        let outcome = self
            .caller
            .call_tool("get_element_content", json!({ "app_name": app, "path": descriptor }))
            .await;
        // Content reads answer with the content itself, so only an explicit refusal fails.
        if !outcome.is_success() || outcome.reported_refusal() {
            warn!(app, descriptor, error = ?outcome.error(), "Reading element content failed");
            return None;
        }
        match outcome {
            CallOutcome::Payload(ToolPayload::Structured(v)) => Some(match v.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => v.to_string(),
            }),
            CallOutcome::Payload(ToolPayload::Text(t)) => Some(t),
            CallOutcome::NoResult => Some(String::new()),
            CallOutcome::Failed(_) => None,
        }
    }

    /// Launch an app through Spotlight.
    pub async fn open_app(&self, app: &str) -> bool {
        let command = vec!["command".to_string()];
        self.command("", "", &command, "space").await
            && self.type_text("", app).await
            && self.command("", "", &[], "return").await
    }

    /// Reveal `path` in Finder through its Go to Folder prompt.
    pub async fn open_file_in_finder(&self, path: &str) -> bool {
        let go_to = vec!["command".to_string(), "shift".to_string()];
        if !self.command("Finder", "", &go_to, "g").await {
            return false;
        }
        tokio::time::sleep(FINDER_PROMPT_PAUSE).await;
        if !self.type_text("Finder", path).await || !self.command("Finder", "", &[], "return").await {
            return false;
        }
        tokio::time::sleep(FINDER_NAVIGATE_PAUSE).await;
        true
    }

    async fn ensure_app(&self, app: &str) -> bool {
        if app.is_empty() || self.active_app().as_deref() == Some(app) {
            return true;
        }
        let outcome = self
            .caller
            .call_tool("switch_to_app", json!({ "app_name": app }))
            .await;
        if !outcome.reported_success() {
            warn!(app, error = ?outcome.error(), "Switching app failed");
            return false;
        }
        if let Ok(mut active) = self.active_app.lock() {
            *active = Some(app.to_string());
        }
        tokio::time::sleep(self.settle).await;
        true
    }

    async fn checked_call(&self, tool: &str, arguments: Value) -> bool {
        let outcome = self.caller.call_tool(tool, arguments).await;
        let ok = outcome.reported_success();
        match (&outcome, ok) {
            (CallOutcome::Failed(e), _) => warn!(tool, error = %e, "Desktop action failed"),
            (_, false) => warn!(tool, result = ?outcome.payload(), "Desktop action reported failure"),
            _ => info!(tool, "Desktop action done"),
        }
        ok
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mcp::CallError;
    use async_trait::async_trait;

    /// Records calls; answers `{"success": true}` unless a tool is listed as
    /// failing or as answering without a success flag.
    #[derive(Default)]
    pub(crate) struct RecordingCaller {
        pub calls: Mutex<Vec<(String, Value)>>,
        pub failing: Vec<&'static str>,
        pub unflagged: Vec<&'static str>,
        pub content: Option<Value>,
    }

    impl RecordingCaller {
        pub(crate) fn tools(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl ToolCaller for RecordingCaller {
        async fn call_tool(&self, tool: &str, arguments: Value) -> CallOutcome {
            self.calls.lock().unwrap().push((tool.to_string(), arguments));
            if self.failing.contains(&tool) {
                return CallOutcome::Payload(ToolPayload::Structured(
                    json!({"success": false, "message": "nope"}),
                ));
            }
            if self.unflagged.contains(&tool) {
                return CallOutcome::Payload(ToolPayload::Structured(
                    json!({"message": "element not found"}),
                ));
            }
            if tool == "get_element_content" {
                if let Some(v) = &self.content {
                    return CallOutcome::Payload(ToolPayload::Structured(v.clone()));
                }
                return CallOutcome::Failed(CallError::Tool("no element".into()));
            }
            CallOutcome::Payload(ToolPayload::Structured(json!({"success": true})))
        }
    }

    fn desktop(caller: Arc<RecordingCaller>) -> Desktop {
        Desktop::new(caller).with_settle(Duration::ZERO)
    }

    #[test]
    fn test_split_plain_text() {
        assert_eq!(split_typed_text("hello"), vec![TypedChunk::Text("hello".into())]);
        assert!(split_typed_text("").is_empty());
    }

    #[test]
    fn test_split_escapes() {
        assert_eq!(
            split_typed_text(r"user\tpass\n"),
            vec![
                TypedChunk::Text("user".into()),
                TypedChunk::Key("tab"),
                TypedChunk::Text("pass".into()),
                TypedChunk::Key("return"),
            ]
        );
        assert_eq!(
            split_typed_text(r"\s\b\r"),
            vec![TypedChunk::Key("space"), TypedChunk::Key("delete"), TypedChunk::Key("return")]
        );
    }

    #[test]
    fn test_split_literal_backslashes() {
        assert_eq!(split_typed_text(r"C:\\dir"), vec![TypedChunk::Text(r"C:\dir".into())]);
        assert_eq!(split_typed_text(r"a\qb\"), vec![TypedChunk::Text(r"a\qb\".into())]);
    }

    #[tokio::test]
    async fn test_switch_skipped_when_app_active() {
        let caller = Arc::new(RecordingCaller::default());
        let d = desktop(caller.clone());
        assert!(d.type_text("Notes", "hi").await);
        assert!(d.type_text("Notes", "there").await);
        assert_eq!(d.active_app().as_deref(), Some("Notes"));
        assert_eq!(
            caller.tools(),
            vec!["switch_to_app", "send_string", "send_string"]
        );
    }

    #[tokio::test]
    async fn test_type_text_sends_keystrokes() {
        let caller = Arc::new(RecordingCaller::default());
        let d = desktop(caller.clone());
        assert!(d.type_text("", r"a\nb").await);
        let calls = caller.calls.lock().unwrap().clone();
        assert_eq!(calls[0], ("send_string".to_string(), json!({"text": "a"})));
        assert_eq!(calls[1], ("send_keystroke".to_string(), json!({"key": "return"})));
        assert_eq!(calls[2], ("send_string".to_string(), json!({"text": "b"})));
    }

    #[tokio::test]
    async fn test_click_arguments() {
        let caller = Arc::new(RecordingCaller::default());
        let d = desktop(caller.clone());
        assert!(d.click("Finder", "AXWindow > AXButton", true, false, 100).await);
        let calls = caller.calls.lock().unwrap().clone();
        assert_eq!(calls[1].0, "perform_action");
        assert_eq!(
            calls[1].1,
            json!({"action": "AXShowMenu", "path": "AXWindow > AXButton", "app_name": "Finder"})
        );
    }

    #[tokio::test]
    async fn test_failed_switch_aborts_action() {
        let caller = Arc::new(RecordingCaller {
            failing: vec!["switch_to_app"],
            ..Default::default()
        });
        let d = desktop(caller.clone());
        assert!(!d.click("Ghost", "AXButton", false, false, 0).await);
        assert_eq!(caller.tools(), vec!["switch_to_app"]);
        assert!(d.active_app().is_none());
    }

    #[tokio::test]
    async fn test_command_requires_key() {
        let caller = Arc::new(RecordingCaller::default());
        let d = desktop(caller.clone());
        assert!(!d.command("", "", &[], "").await);
        assert!(d.command("", "", &["command".into(), "shift".into()], "g").await);
        let calls = caller.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, json!({"key": "g", "modifiers": ["command", "shift"]}));
    }

    #[tokio::test]
    async fn test_element_content() {
        let caller = Arc::new(RecordingCaller {
            content: Some(json!({"content": "New Tab"})),
            ..Default::default()
        });
        let d = desktop(caller);
        assert_eq!(d.get_element_content("", "AXButton").await.as_deref(), Some("New Tab"));

        let d = desktop(Arc::new(RecordingCaller::default()));
        assert_eq!(d.get_element_content("", "AXButton").await, None);
    }

    #[tokio::test]
    async fn test_answer_without_success_flag_is_failure() {
        let caller = Arc::new(RecordingCaller {
            unflagged: vec!["perform_action"],
            ..Default::default()
        });
        let d = desktop(caller.clone());
        assert!(!d.click("Finder", "AXButton", false, true, 0).await);
        assert_eq!(caller.tools(), vec!["switch_to_app", "perform_action"]);

        let caller = Arc::new(RecordingCaller {
            unflagged: vec!["switch_to_app"],
            ..Default::default()
        });
        let d = desktop(caller.clone());
        assert!(!d.type_text("Notes", "hi").await);
        assert!(d.active_app().is_none());
    }

    #[tokio::test]
    async fn test_element_content_refusal() {
        let caller = Arc::new(RecordingCaller {
            content: Some(json!({"success": false, "message": "no such element"})),
            ..Default::default()
        });
        assert_eq!(desktop(caller).get_element_content("", "AXButton").await, None);

        let caller = Arc::new(RecordingCaller {
            content: Some(json!({"success": true, "content": 42})),
            ..Default::default()
        });
        assert_eq!(desktop(caller).get_element_content("", "AXButton").await.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_open_file_in_finder_sequence() {
        let caller = Arc::new(RecordingCaller::default());
        let d = desktop(caller.clone());
        assert!(d.open_file_in_finder("/tmp/report.xlsx").await);
        let calls = caller.calls.lock().unwrap().clone();
        assert_eq!(calls[0], ("switch_to_app".to_string(), json!({"app_name": "Finder"})));
        assert_eq!(calls[1].1, json!({"key": "g", "modifiers": ["command", "shift"]}));
        assert_eq!(calls[2], ("send_string".to_string(), json!({"text": "/tmp/report.xlsx"})));
        assert_eq!(calls[3], ("send_keystroke".to_string(), json!({"key": "return"})));
        assert_eq!(calls.len(), 4);

        let caller = Arc::new(RecordingCaller {
            failing: vec!["send_keystroke"],
            ..Default::default()
        });
        let d = desktop(caller.clone());
        assert!(!d.open_file_in_finder("/tmp").await);
        assert_eq!(caller.tools(), vec!["switch_to_app", "send_keystroke"]);
    }

    #[tokio::test]
    async fn test_open_app_sequence() {
        let caller = Arc::new(RecordingCaller::default());
        let d = desktop(caller.clone());
        assert!(d.open_app("Calculator").await);
        assert_eq!(caller.tools(), vec!["send_keystroke", "send_string", "send_keystroke"]);
    }
}
