pub mod browser;
pub mod capabilities;
pub mod mcp;
pub mod recording;

pub use browser::{BrowserSessionManager, SharedBrowser};
pub use capabilities::{Capabilities, ToolCaller};
pub use mcp::{BackendRegistry, CallError, CallOutcome, McpClient, SharedRegistry, ToolPayload};
pub use recording::Recorder;

/// Truncate a string to at most `max_chars` bytes, respecting UTF-8 char boundaries.
pub fn safe_truncate(s: &str, max_chars: usize) -> &str {
    if s.len() <= max_chars {
        return s;
    }
    let mut end = max_chars;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
