use std::collections::HashMap;
use std::time::Duration;

use axon_mcp::{AuthMode, ConnectionKind, McpClientRecord, McpManager, ToolAllowList};

/// A real child process stands in for an MCP stdio server: it answers the
/// first line (`tools/list`) with one tool, then the second line
/// (`tools/call`) with a canned result. Exercises `StdioTransport` end to
/// end rather than mocking the transport trait.
fn echo_server_record(id: &str) -> McpClientRecord {
    let script = concat!(
        "read _l1; ",
        "echo '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"tools\":[",
        "{\"name\":\"lookup\",\"description\":\"look something up\",\"params_schema\":{\"required\":[\"q\"]}}",
        "]}}'; ",
        "read _l2; ",
        "echo '{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"content\":[{\"text\":\"weather is sunny\"}],\"isError\":false}}'",
    );

    McpClientRecord {
        id: id.to_string(),
        name: "echo-demo".to_string(),
        kind: ConnectionKind::Stdio { command: "sh".to_string(), args: vec!["-c".to_string(), script.to_string()], env: HashMap::new() },
        auth: AuthMode::None,
        tools_to_execute: ToolAllowList::Wildcard,
        tools_to_auto_execute: ToolAllowList::Names(vec!["lookup".to_string()]),
        supports_ping: false,
    }
}

#[tokio::test]
async fn registered_client_exposes_its_catalog_and_auto_execute_allowlist() {
    let manager = McpManager::new();
    manager.register_client(echo_server_record("demo")).await.expect("initial tools/list should succeed");

    let catalog = manager.filtered_catalog(None, None, None, None).await;
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].1.name, "lookup");

    assert!(manager.is_auto_execute("demo", "lookup").await);
    assert!(!manager.is_auto_execute("demo", "some_other_tool").await);
}

#[tokio::test]
async fn auto_executable_tool_call_runs_to_completion_through_the_real_transport() {
    let manager = McpManager::new();
    manager.register_client(echo_server_record("demo")).await.expect("initial tools/list should succeed");

    assert!(manager.is_auto_execute("demo", "lookup").await);

    let result = manager
        .execute_tool("auto-call-1", "demo", "lookup", serde_json::json!({ "q": "weather" }), Duration::from_secs(5))
        .await
        .expect("auto-executed tool call should succeed");

    assert!(!result.is_error);
    assert_eq!(result.content.len(), 1);
    assert_eq!(result.content[0].text, "weather is sunny");
}

#[tokio::test]
async fn tool_outside_auto_execute_allowlist_still_requires_explicit_execution() {
    let manager = McpManager::new();
    manager.register_client(echo_server_record("demo")).await.expect("initial tools/list should succeed");

    assert!(!manager.is_auto_execute("demo", "delete_everything").await);

    // The allow-list that gates auto-execution is separate from the one
    // that gates execution at all: `tools_to_execute` is a wildcard here, so
    // an explicit call for a tool outside the auto-execute set still runs.
    let result = manager
        .execute_tool("manual-call-1", "demo", "lookup", serde_json::json!({ "q": "weather" }), Duration::from_secs(5))
        .await
        .expect("explicit tool call should still succeed");
    assert!(!result.is_error);
}
