use serde_json::json;
use sisypho_tools::mcp::{BackendRegistry, CallError, CallOutcome, ConnectionState, ToolPayload};

fn backend(args: &str) -> String {
    format!("{} {}", env!("CARGO_BIN_EXE_sisypho-echo-backend"), args)
}

#[tokio::test]
async fn end_to_end_two_tools() {
    let mut registry = BackendRegistry::new();
    registry.add_backend(&backend("a b"), Some("echo")).unwrap();

    assert!(registry.initialize_all().await);
    assert_eq!(
        registry.call("a", json!({}), None).await,
        CallOutcome::Payload(ToolPayload::Structured(json!({"tool": "a", "arguments": {}})))
    );
    assert_eq!(
        registry.call("c", json!({}), None).await,
        CallOutcome::Failed(CallError::ToolNotFound("c".into()))
    );
    // Registry still serves after the miss
    assert!(registry.call("b", json!({"x": 1}), None).await.is_success());
    registry.cleanup().await;
}

#[tokio::test]
async fn first_registered_wins() {
    let mut registry = BackendRegistry::new();
    registry.add_backend(&backend("shared only_first"), Some("first")).unwrap();
    registry.add_backend(&backend("shared only_second"), Some("second")).unwrap();
    assert!(registry.initialize_all().await);

    for _ in 0..3 {
        assert_eq!(registry.resolve("shared").await.as_deref(), Some("first"));
    }
    assert_eq!(registry.resolve("only_second").await.as_deref(), Some("second"));
    assert_eq!(registry.resolve("nothing").await, None);

    // Explicit backend bypasses resolution
    assert!(registry.call("shared", json!({}), Some("second")).await.is_success());
    registry.cleanup().await;
}

#[tokio::test]
async fn partial_initialization_keeps_healthy_backends() {
    let mut registry = BackendRegistry::new();
    registry.add_backend("/nonexistent/broken-backend", None).unwrap();
    registry.add_backend(&backend("a"), Some("echo")).unwrap();

    assert!(!registry.initialize_all().await);
    let status = registry.backends();
    assert_eq!(status[0].name, "broken-backend");
    assert_eq!(status[0].state, ConnectionState::Failed);
    assert_eq!(status[1].state, ConnectionState::Ready);
    assert_eq!(status[1].tool_count, 1);

    assert!(registry.call("a", json!({}), None).await.is_success());
    registry.cleanup().await;
    registry.cleanup().await;
    assert!(registry.backends().is_empty());
}

#[tokio::test]
async fn resolve_initializes_lazily() {
    let mut registry = BackendRegistry::new();
    registry.add_backend(&backend("a"), Some("echo")).unwrap();
    assert_eq!(registry.backends()[0].state, ConnectionState::Stopped);
    assert_eq!(registry.resolve("a").await.as_deref(), Some("echo"));
    assert_eq!(registry.backends()[0].state, ConnectionState::Ready);
    registry.cleanup().await;
}
