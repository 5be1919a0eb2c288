//! The functions a skill script can see.
//!
//! Nothing is reachable from a script unless it is registered here. Capability
//! calls run on the sandbox's blocking thread and wait on the runtime through
//! `Handle::block_on`.

use rhai::{Array, Dynamic, Engine, Map};
use serde_json::Value;
use sisypho_tools::browser::ScrollTarget;
use sisypho_tools::capabilities::web::DEFAULT_ELEMENT_WAIT;
use sisypho_tools::capabilities::Capabilities;
use sisypho_tools::mcp::{CallOutcome, ToolPayload};
use sisypho_tools::ToolCaller;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

const MAX_SLEEP_MS: i64 = 10_000;

/// Logging, timing and JSON helpers.
pub fn register_helpers(engine: &mut Engine) {
    engine.register_fn("log", |msg: &str| {
        info!(source = "skill", "{}", msg);
    });
    engine.register_fn("log_warn", |msg: &str| {
        warn!(source = "skill", "{}", msg);
    });
    engine.register_fn("sleep_ms", |ms: i64| {
        if ms > 0 && ms <= MAX_SLEEP_MS {
            std::thread::sleep(std::time::Duration::from_millis(ms as u64));
        }
    });
    engine.register_fn("timestamp", || -> i64 { chrono::Utc::now().timestamp() });
    engine.register_fn("to_json", |val: Dynamic| -> String {
        serde_json::to_string(&dynamic_to_json(&val)).unwrap_or_default()
    });
    engine.register_fn("from_json", |s: &str| -> Dynamic {
        match serde_json::from_str::<Value>(s) {
            Ok(v) => json_to_dynamic(&v),
            Err(_) => Dynamic::UNIT,
        }
    });
}

/// Desktop, browser, spreadsheet and notification capabilities, plus raw
/// `call_tool` access to the backend registry.
pub fn register_capabilities(engine: &mut Engine, caps: &Capabilities, handle: Handle) {
    register_desktop(engine, caps, &handle);
    register_web(engine, caps, &handle);
    register_sheets(engine, caps);

    let notifier = caps.notifier.clone();
    engine.register_fn("present_files", move |title: &str, message: &str, files: Array| -> bool {
        notifier.present_files(title, message, &strings(files))
    });

    let registry = caps.registry().clone();
    let h = handle;
    engine.register_fn("call_tool", move |name: &str, params: Map| -> Dynamic {
        debug!(tool = name, "Skill calling tool");
        let outcome = h.block_on(registry.call_tool(name, map_to_json(&params)));
        outcome_to_dynamic(outcome)
    });
}

fn register_desktop(engine: &mut Engine, caps: &Capabilities, handle: &Handle) {
    let (d, h) = (caps.desktop.clone(), handle.clone());
    engine.register_fn(
        "click",
        move |app: &str, descriptor: &str, right_click: bool, double_click: bool, duration_ms: i64| -> bool {
            h.block_on(d.click(app, descriptor, right_click, double_click, duration_ms.max(0) as u64))
        },
    );
    let (d, h) = (caps.desktop.clone(), handle.clone());
    engine.register_fn("click", move |app: &str, descriptor: &str| -> bool {
        h.block_on(d.click(app, descriptor, false, false, 0))
    });
    let (d, h) = (caps.desktop.clone(), handle.clone());
    engine.register_fn("type_text", move |app: &str, text: &str| -> bool {
        h.block_on(d.type_text(app, text))
    });
    let (d, h) = (caps.desktop.clone(), handle.clone());
    engine.register_fn(
        "command",
        move |app: &str, descriptor: &str, modifiers: Array, key: &str| -> bool {
            h.block_on(d.command(app, descriptor, &strings(modifiers), key))
        },
    );
    let (d, h) = (caps.desktop.clone(), handle.clone());
    engine.register_fn("get_element_content", move |app: &str, descriptor: &str| -> Dynamic {
        h.block_on(d.get_element_content(app, descriptor))
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT)
    });
    let (d, h) = (caps.desktop.clone(), handle.clone());
    engine.register_fn("open_app", move |app: &str| -> bool { h.block_on(d.open_app(app)) });
    let (d, h) = (caps.desktop.clone(), handle.clone());
    engine.register_fn("open_file_in_finder", move |path: &str| -> bool {
        h.block_on(d.open_file_in_finder(path))
    });
}

fn register_web(engine: &mut Engine, caps: &Capabilities, handle: &Handle) {
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("navigate", move |url: &str| -> bool { h.block_on(w.navigate(url)) });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("click_element", move |selector: &str| -> bool {
        h.block_on(w.click_element(selector, true))
    });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("click_element", move |selector: &str, wait_for_change: bool| -> bool {
        h.block_on(w.click_element(selector, wait_for_change))
    });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("go_back", move || -> bool { h.block_on(w.go_back()) });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("go_forward", move || -> bool { h.block_on(w.go_forward()) });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("reload", move || -> bool { h.block_on(w.reload(false)) });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("reload", move |bypass_cache: bool| -> bool { h.block_on(w.reload(bypass_cache)) });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("scroll", move |target: &str| -> bool {
        match ScrollTarget::parse(target) {
            Ok(target) => h.block_on(w.scroll(target)),
            Err(e) => {
                warn!(error = %e, "scroll failed");
                false
            }
        }
    });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("scroll", move |x: i64, y: i64| -> bool {
        h.block_on(w.scroll(ScrollTarget::To { x, y }))
    });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("submit_form", move |selector: &str| -> bool {
        h.block_on(w.submit_form(selector))
    });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("wait_for_element", move |selector: &str| -> bool {
        h.block_on(w.wait_for_element(selector, DEFAULT_ELEMENT_WAIT, true))
    });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn(
        "wait_for_element",
        move |selector: &str, timeout_ms: i64, visible: bool| -> bool {
            let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
            h.block_on(w.wait_for_element(selector, timeout, visible))
        },
    );
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("type_into", move |selector: &str, text: &str, submit: bool| -> bool {
        h.block_on(w.type_into(selector, text, submit))
    });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("type_into", move |selector: &str, text: &str| -> bool {
        h.block_on(w.type_into(selector, text, false))
    });
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn(
        "get_content",
        move |root: &str, remove_tags: bool, max_results: i64| -> Dynamic {
            content_to_dynamic(h.block_on(w.get_content(root, remove_tags, max_results)))
        },
    );
    let (w, h) = (caps.web.clone(), handle.clone());
    engine.register_fn("get_content", move |root: &str| -> Dynamic {
        content_to_dynamic(h.block_on(w.get_content(root, true, 1)))
    });
}

fn register_sheets(engine: &mut Engine, caps: &Capabilities) {
    let s = caps.sheets.clone();
    engine.register_fn("create_workbook", move |path: &str| -> Dynamic {
        handle_or_unit("create_workbook", s.create_workbook(path))
    });
    let s = caps.sheets.clone();
    engine.register_fn("open_workbook", move |path: &str| -> Dynamic {
        handle_or_unit("open_workbook", s.open_workbook(path))
    });
    let s = caps.sheets.clone();
    engine.register_fn("read_cell", move |wb: &str, cell: &str| -> Dynamic {
        match s.read_cell(wb, cell) {
            Ok(Some(v)) => Dynamic::from(v),
            Ok(None) => Dynamic::UNIT,
            Err(e) => {
                warn!(workbook = wb, cell, error = %e, "read_cell failed");
                Dynamic::UNIT
            }
        }
    });
    let s = caps.sheets.clone();
    engine.register_fn("read_range", move |wb: &str, range: &str| -> Dynamic {
        match s.read_range(wb, range) {
            Ok(rows) => Dynamic::from(
                rows.into_iter()
                    .map(|row| {
                        let cells: Array = row
                            .into_iter()
                            .map(|cell| cell.map(Dynamic::from).unwrap_or(Dynamic::UNIT))
                            .collect();
                        Dynamic::from(cells)
                    })
                    .collect::<Array>(),
            ),
            Err(e) => {
                warn!(workbook = wb, range, error = %e, "read_range failed");
                Dynamic::UNIT
            }
        }
    });
    let s = caps.sheets.clone();
    engine.register_fn("list_worksheets", move |wb: &str| -> Dynamic {
        match s.list_worksheets(wb) {
            Ok(names) => Dynamic::from(names.into_iter().map(Dynamic::from).collect::<Array>()),
            Err(e) => {
                warn!(workbook = wb, error = %e, "list_worksheets failed");
                Dynamic::UNIT
            }
        }
    });
    let s = caps.sheets.clone();
    engine.register_fn("create_worksheet", move |wb: &str, name: &str| -> bool {
        succeeded("create_worksheet", s.create_worksheet(wb, name))
    });
    let s = caps.sheets.clone();
    engine.register_fn("write_cell",move |wb: &str, cell: &str, value: Dynamic| -> bool {
        succeeded("write_cell", s.write_cell(wb, cell, &cell_text(&value)))
    });
    let s = caps.sheets.clone();
    engine.register_fn("write_range", move |wb: &str, start: &str, rows: Array| -> bool {
        let rows: Vec<Vec<String>> = rows
            .into_iter()
            .map(|row| match row.try_cast::<Array>() {
                Some(cells) => cells.iter().map(cell_text).collect(),
                None => Vec::new(),
            })
            .collect();
        succeeded("write_range", s.write_range(wb, start, &rows))
    });
    let s = caps.sheets.clone();
    engine.register_fn("save_workbook", move |wb: &str| -> bool {
        succeeded("save_workbook", s.save_workbook(wb))
    });
    let s = caps.sheets.clone();
    engine.register_fn("close_workbook", move |wb: &str| -> bool {
        succeeded("close_workbook", s.close_workbook(wb))
    });
}

fn strings(items: Array) -> Vec<String> {
    items.into_iter().filter_map(|d| d.into_string().ok()).collect()
}

fn cell_text(value: &Dynamic) -> String {
    if value.is_unit() {
        String::new()
    } else if value.is_string() {
        value.clone().into_string().unwrap_or_default()
    } else {
        value.to_string()
    }
}

fn handle_or_unit(op: &str, result: sisypho_core::Result<String>) -> Dynamic {
    match result {
        Ok(handle) => Dynamic::from(handle),
        Err(e) => {
            warn!(op, error = %e, "Workbook operation failed");
            Dynamic::UNIT
        }
    }
}

fn succeeded(op: &str, result: sisypho_core::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(op, error = %e, "Workbook operation failed");
            false
        }
    }
}

fn content_to_dynamic(content: Option<Vec<String>>) -> Dynamic {
    match content {
        Some(items) => Dynamic::from(items.into_iter().map(Dynamic::from).collect::<Array>()),
        None => Dynamic::UNIT,
    }
}

/// Tool results as script values; failures become `#{error: "..."}`.
fn outcome_to_dynamic(outcome: CallOutcome) -> Dynamic {
    match outcome {
        CallOutcome::Payload(ToolPayload::Structured(v)) => json_to_dynamic(&v),
        CallOutcome::Payload(ToolPayload::Text(t)) => Dynamic::from(t),
        CallOutcome::NoResult => Dynamic::UNIT,
        CallOutcome::Failed(e) => {
            let mut map = Map::new();
            map.insert("error".into(), Dynamic::from(e.to_string()));
            Dynamic::from(map)
        }
    }
}

pub fn json_to_dynamic(val: &Value) -> Dynamic {
    match val {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::from(n.to_string())
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(arr) => Dynamic::from(arr.iter().map(json_to_dynamic).collect::<Array>()),
        Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

pub fn dynamic_to_json(val: &Dynamic) -> Value {
    if val.is_unit() {
        Value::Null
    } else if let Ok(b) = val.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = val.as_int() {
        Value::from(i)
    } else if let Ok(f) = val.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if val.is_string() {
        Value::String(val.clone().into_string().unwrap_or_default())
    } else if val.is_array() {
        let arr = val.clone().into_array().unwrap_or_default();
        Value::Array(arr.iter().map(dynamic_to_json).collect())
    } else if let Some(map) = val.clone().try_cast::<Map>() {
        map_to_json(&map)
    } else {
        Value::String(val.to_string())
    }
}

pub fn map_to_json(map: &Map) -> Value {
    let mut obj = serde_json::Map::new();
    for (k, v) in map {
        obj.insert(k.to_string(), dynamic_to_json(v));
    }
    Value::Object(obj)
}
