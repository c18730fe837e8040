//! HTTP surface tests

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use tempfile::TempDir;

use file_reader_server::cache::CacheConfig;
use file_reader_server::config::{Config, StorageConfig};
use file_reader_server::mcp::{http, McpServer};
use file_reader_server::state::AppState;

struct Harness {
    _cache: TempDir,
    files: TempDir,
    server: TestServer,
}

fn harness() -> Harness {
    let cache = TempDir::new().unwrap();
    let files = TempDir::new().unwrap();
    let config = Config {
        cache: CacheConfig {
            root_dir: cache.path().to_path_buf(),
            ..Default::default()
        },
        storage: StorageConfig {
            allowed_dirs: vec![files.path().to_path_buf()],
            allow_relative: false,
        },
        ..Default::default()
    };
    let server = TestServer::new(http::router(McpServer::new(AppState::new(config)))).unwrap();
    Harness {
        _cache: cache,
        files,
        server,
    }
}

fn tool_call(id: u64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments }
    })
}

fn tool_body(reply: &Value) -> Value {
    serde_json::from_str(reply["result"]["content"][0]["text"].as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let response = h.server.get("/health").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["status"], "healthy");
}

#[tokio::test]
async fn test_read_then_cache_hit() {
    let h = harness();
    let path = h.files.path().join("minutes.md");
    std::fs::write(&path, "# Minutes\n\nBudget approved for the next quarter.").unwrap();
    let call = tool_call(1, "read_local_files", json!({ "file_paths": [path.display().to_string()] }));

    let first = h.server.post("/mcp").json(&call).await.json::<Value>();
    let body = tool_body(&first);
    assert_eq!(body["results"][0]["status"], "success");
    assert_eq!(body["results"][0]["doc_type"], "md");

    let second = h.server.post("/mcp").json(&call).await.json::<Value>();
    let body = tool_body(&second);
    assert_eq!(body["results"][0]["status"], "cache_hit");
    assert_eq!(body["summary"]["cache_hit"], 1);

    let stats = h
        .server
        .post("/mcp")
        .json(&tool_call(2, "cache_stats", json!({})))
        .await
        .json::<Value>();
    let stats = tool_body(&stats);
    assert!(stats["total_size_bytes"].as_u64().unwrap() > 0);

    let cleared = h
        .server
        .post("/mcp")
        .json(&tool_call(3, "clear_cache", json!({ "namespace": "parsed" })))
        .await
        .json::<Value>();
    assert_eq!(tool_body(&cleared)["removed"], 1);
}

#[tokio::test]
async fn test_outside_allowed_directory_is_unreadable() {
    let h = harness();
    let elsewhere = TempDir::new().unwrap();
    let path = elsewhere.path().join("secret.txt");
    std::fs::write(&path, "not for you, not for anyone").unwrap();

    let reply = h
        .server
        .post("/mcp")
        .json(&tool_call(1, "read_local_files", json!({ "file_paths": [path.display().to_string()] })))
        .await
        .json::<Value>();
    let body = tool_body(&reply);
    assert_eq!(body["results"][0]["status"], "failed");
    assert_eq!(body["results"][0]["error"]["kind"], "file_not_readable");
}

#[tokio::test]
async fn test_list_parsers() {
    let h = harness();
    let reply = h
        .server
        .post("/mcp")
        .json(&tool_call(1, "list_parsers", json!({})))
        .await
        .json::<Value>();
    let body = tool_body(&reply);
    assert_eq!(body["parsers"]["text"]["available"], true);
    assert!(body["supported_extensions"]
        .as_array()
        .unwrap()
        .contains(&json!(".docx")));
}

#[tokio::test]
async fn test_notification_and_bad_bodies() {
    let h = harness();
    let response = h
        .server
        .post("/mcp")
        .json(&json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }))
        .await;
    response.assert_status(StatusCode::ACCEPTED);

    let response = h.server.post("/mcp").text("   ").await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "bad_request");

    let response = h.server.post("/mcp").text("{oops").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["error"]["code"], -32700);

    h.server.get("/nowhere").await.assert_status(StatusCode::NOT_FOUND);
}
