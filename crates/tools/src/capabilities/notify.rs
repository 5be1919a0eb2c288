//! "Present results to the user": one tagged JSON line on stdout, picked up by
//! whatever front end launched the skill.

use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
struct PresentFiles<'a> {
    #[serde(rename = "__type__")]
    kind: &'static str,
    alert_title: &'a str,
    alert_message: &'a str,
    files: &'a [String],
}

pub fn present_files_line(title: &str, message: &str, files: &[String]) -> String {
    let event = PresentFiles {
        kind: "present_files",
        alert_title: title,
        alert_message: message,
        files,
    };
    serde_json::to_string(&event).unwrap_or_default()
}

pub struct Notifier {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Notifier {
    pub fn stdout() -> Self {
        Self::with_sink(Box::new(std::io::stdout()))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self { sink: Mutex::new(sink) }
    }

    pub fn present_files(&self, title: &str, message: &str, files: &[String]) -> bool {
        let line = present_files_line(title, message, files);
        let Ok(mut sink) = self.sink.lock() else {
            return false;
        };
        match writeln!(sink, "{}", line).and_then(|_| sink.flush()) {
            Ok(()) => {
                info!(title, count = files.len(), "Presented files");
                true
            }
            Err(e) => {
                warn!(error = %e, "Presenting files failed");
                false
            }
        }
    }
}
