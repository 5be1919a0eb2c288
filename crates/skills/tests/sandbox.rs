use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sisypho_core::Paths;
use sisypho_skills::{EngineConfig, RunOutcome, SkillCipher, SkillReport, SkillRunner, SkillSandbox};
use sisypho_tools::capabilities::{Capabilities, FileWorkbooks, Desktop, Notifier, ToolCaller};
use sisypho_tools::mcp::{CallOutcome, ToolPayload};
use sisypho_tools::{BackendRegistry, BrowserSessionManager};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Calls(Mutex<Vec<(String, Value)>>);

#[async_trait]
impl ToolCaller for Calls {
    async fn call_tool(&self, tool: &str, arguments: Value) -> CallOutcome {
        self.0.lock().unwrap().push((tool.to_string(), arguments));
        if tool == "get_element_content" {
            return CallOutcome::Payload(ToolPayload::Structured(json!({"content": "42 items"})));
        }
        CallOutcome::Payload(ToolPayload::Structured(json!({"success": true})))
    }
}

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn capabilities(dir: &std::path::Path, calls: Arc<Calls>, sink: Sink) -> Capabilities {
    let registry = BackendRegistry::new().into_shared();
    let browser = BrowserSessionManager::new(Vec::new(), Duration::from_secs(1800), 1024).into_shared();
    Capabilities::new(registry, browser, &Paths::with_base(dir.to_path_buf()))
        .with_desktop(Desktop::new(calls).with_settle(Duration::ZERO))
        .with_sheets(Arc::new(FileWorkbooks::new(dir.join("workbooks"))))
        .with_notifier(Notifier::with_sink(Box::new(sink)))
}

const REPORT_SKILL: &str = r#"
fn run(app, path) {
    if !click(app, "AXWindow > AXButton") { return false; }
    type_text(app, "total\\n");
    let text = get_element_content(app, "AXStaticText");

    let wb = create_workbook(path);
    if wb == () { return false; }
    write_range(wb, "A1", [["label", "value"], ["items", text]]);
    write_cell(wb, "C2", 7);
    save_workbook(wb);
    let back = read_cell(wb, "B2");
    close_workbook(wb);

    present_files("Report", "done", [path]);
    back
}
"#;

#[tokio::test(flavor = "multi_thread")]
async fn skill_drives_desktop_and_sheets() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Calls::default());
    let sink = Sink::default();
    let sandbox = SkillSandbox::new(EngineConfig::default(), capabilities(dir.path(), calls.clone(), sink.clone()));

    let mut params = Map::new();
    params.insert("app".into(), json!("Numbers"));
    params.insert("path".into(), json!("report.csv"));
    let out = sandbox.run(REPORT_SKILL, &params, Duration::from_secs(10)).await.unwrap();
    assert_eq!(out, RunOutcome::Completed(json!("42 items")));

    let tools: Vec<String> = calls.0.lock().unwrap().iter().map(|(t, _)| t.clone()).collect();
    assert_eq!(tools[0], "switch_to_app");
    assert!(tools.contains(&"perform_action".to_string()));
    assert!(tools.contains(&"send_keystroke".to_string()));

    let csv = std::fs::read_to_string(dir.path().join("workbooks/report.csv")).unwrap();
    assert!(csv.starts_with("label,value"));
    assert!(csv.contains("items,42 items,7"));

    let printed = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
    let line: Value = serde_json::from_str(printed.trim()).unwrap();
    assert_eq!(line["__type__"], "present_files");
    assert_eq!(line["files"], json!(["report.csv"]));
}

#[tokio::test(flavor = "multi_thread")]
async fn browser_capabilities_fail_softly_without_a_browser() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = SkillSandbox::new(
        EngineConfig::default(),
        capabilities(dir.path(), Arc::new(Calls::default()), Sink::default()),
    );
    let src = r#"fn run() { [navigate("https://example.com"), get_content("body") == ()] }"#;
    let out = sandbox.run(src, &Map::new(), Duration::from_secs(10)).await.unwrap();
    assert_eq!(out, RunOutcome::Completed(json!([false, true])));
}

#[tokio::test(flavor = "multi_thread")]
async fn sealed_skill_runs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let cipher = SkillCipher::new("JBSWY3DPEHPK3PXP").unwrap();
    let now = 1_700_000_000;
    let payload = cipher.encrypt(r#"fn run() { log("hi"); call_tool("nothing_here", #{}) }"#, now).unwrap();

    let caps = capabilities(dir.path(), Arc::new(Calls::default()), Sink::default());
    let runner = SkillRunner::new(cipher, SkillSandbox::new(EngineConfig::default(), caps));
    match runner.execute_at(&payload, &Map::new(), now + 10).await {
        SkillReport::Completed(v) => assert!(v["error"].is_string()),
        other => panic!("unexpected report: {:?}", other),
    }
}

const LEDGER_SKILL: &str = r#"
fn run(path) {
    let wb = create_workbook(path);
    if !create_worksheet(wb, "Totals") { return false; }
    write_range(wb, "Totals!A1", [["north", 3], ["south", 4]]);
    write_cell(wb, "A1", "summary");
    if !save_workbook(wb) { return false; }
    close_workbook(wb);

    let wb = open_workbook(path);
    let rows = read_range(wb, "Totals!A1:C2");
    [list_worksheets(wb), rows[1][1], rows[0][2] == (), read_range(wb, "A1:") == ()]
}
"#;

#[tokio::test(flavor = "multi_thread")]
async fn skill_keeps_named_sheets_in_xlsx() {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = SkillSandbox::new(
        EngineConfig::default(),
        capabilities(dir.path(), Arc::new(Calls::default()), Sink::default()),
    );
    let mut params = Map::new();
    params.insert("path".into(), json!("ledger.xlsx"));
    let out = sandbox.run(LEDGER_SKILL, &params, Duration::from_secs(10)).await.unwrap();
    assert_eq!(out, RunOutcome::Completed(json!([["Sheet1", "Totals"], "4", true, true])));
    assert!(dir.path().join("workbooks/ledger.xlsx").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn navigation_helpers_are_callable() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(Calls::default());
    let sandbox = SkillSandbox::new(
        EngineConfig::default(),
        capabilities(dir.path(), calls.clone(), Sink::default()),
    );
    let src = r##"fn run() {
        [go_back(), go_forward(), reload(), reload(true), scroll("top"), scroll(0, 400),
         scroll("sideways"), submit_form("#f"), wait_for_element("#x", 10, false),
         click_element("#b", false), open_file_in_finder("/tmp")]
    }"##;
    let out = sandbox.run(src, &Map::new(), Duration::from_secs(20)).await.unwrap();
    // No browser is configured, so every web action fails softly
    assert_eq!(
        out,
        RunOutcome::Completed(json!([false, false, false, false, false, false, false, false, false, false, true]))
    );
    let tools: Vec<String> = calls.0.lock().unwrap().iter().map(|(t, _)| t.clone()).collect();
    assert_eq!(tools, vec!["switch_to_app", "send_keystroke", "send_string", "send_keystroke"]);
}
