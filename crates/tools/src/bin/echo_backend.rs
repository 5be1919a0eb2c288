//! Minimal line-protocol backend used by the process-level tests.
//!
//! Usage: `sisypho-echo-backend [--reject-initialize] [--chatty] [--ack] TOOL...`
//!
//! Each positional argument becomes an exposed tool. Calls echo
//! `{"tool": name, "arguments": args}` back as text (with `"success": true`
//! under `--ack`), except for a few reserved names:
//! - `fail*`     answers with a JSON-RPC error
//! - `empty`     answers with an empty text item
//! - `plain`     answers with non-JSON text
//! - `crash`     exits without answering
//! - `slow`      echoes after a two second pause
//! - `wrong_id`  echoes under a request id that was never sent

use std::io::{BufRead, Write};
use std::time::Duration;

use serde_json::{json, Value};

const SLOW_REPLY: Duration = Duration::from_secs(2);

fn main() {
    let mut tools = Vec::new();
    let mut reject_initialize = false;
    let mut chatty = false;
    let mut ack = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--reject-initialize" => reject_initialize = true,
            "--chatty" => chatty = true,
            "--ack" => ack = true,
            _ => tools.push(arg),
        }
    }

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = msg.get("method").and_then(Value::as_str).unwrap_or_default();
        let Some(id) = msg.get("id").cloned() else {
            if method == "notifications/shutdown" {
                return;
            }
            continue;
        };

        if chatty {
            let note = json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}});
            let _ = writeln!(stdout, "{}", note);
        }

        let reply = match method {
            "initialize" if reject_initialize => error_reply(&id, "initialize rejected"),
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "echo", "version": "0.1.0"}
                }
            }),
            "tools/list" => {
                let listed: Vec<Value> = tools
                    .iter()
                    .map(|name| json!({
                        "name": name,
                        "description": format!("echo tool {}", name),
                        "inputSchema": {"type": "object"}
                    }))
                    .collect();
                json!({"jsonrpc": "2.0", "id": id, "result": {"tools": listed}})
            }
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                if !tools.contains(&name) {
                    error_reply(&id, &format!("unknown tool {}", name))
                } else if name == "crash" {
                    return;
                } else if name.starts_with("fail") {
                    error_reply(&id, &format!("tool {} failed", name))
                } else if name == "empty" {
                    text_reply(&id, "")
                } else if name == "plain" {
                    text_reply(&id, "plain text result")
                } else {
                    let mut echo = json!({"tool": name, "arguments": arguments});
                    if ack {
                        echo["success"] = json!(true);
                    }
                    let reply_id = match name.as_str() {
                        "slow" => {
                            std::thread::sleep(SLOW_REPLY);
                            id
                        }
                        "wrong_id" => json!(id.as_u64().unwrap_or_default() + 1000),
                        _ => id,
                    };
                    text_reply(&reply_id, &echo.to_string())
                }
            }
            other => error_reply(&id, &format!("method not found: {}", other)),
        };
        if writeln!(stdout, "{}", reply).is_err() || stdout.flush().is_err() {
            return;
        }
    }
}

fn text_reply(id: &Value, text: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {"content": [{"type": "text", "text": text}]}
    })
}

fn error_reply(id: &Value, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": -32000, "message": message}
    })
}
