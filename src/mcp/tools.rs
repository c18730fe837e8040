//! Tool definitions and handlers

use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::protocol::{RpcError, ToolResult};
use crate::cache::Namespace;
use crate::reader::{BatchRequest, FileStatus};
use crate::state::AppState;

const MB: f64 = 1024.0 * 1024.0;

/// List all available tools with their schemas
pub fn list_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "read_local_files",
            "description": "Read local PDF, Office, OpenDocument, EPUB, text, image and archive files and return their content as markdown",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "file_paths": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Absolute paths of the files to read, e.g. /Users/me/report.pdf"
                    },
                    "max_size_mb": {
                        "type": "number",
                        "description": "Per-file size limit in MB; the server default when omitted"
                    }
                },
                "required": ["file_paths"]
            },
            "annotations": {
                "title": "Local file reader",
                "readOnlyHint": true,
                "destructiveHint": false,
                "idempotentHint": true
            }
        }),
        json!({
            "name": "cache_stats",
            "description": "Show cache usage per namespace",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "clear_cache",
            "description": "Remove cached results, for one namespace or all of them",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "namespace": {
                        "type": "string",
                        "enum": ["parsed", "image", "archive"]
                    }
                }
            }
        }),
        json!({
            "name": "list_parsers",
            "description": "List the file formats this server can read and whether their dependencies are installed",
            "inputSchema": { "type": "object", "properties": {} }
        }),
    ]
}

#[derive(Debug, Deserialize)]
struct ReadLocalFilesArgs {
    file_paths: Vec<String>,
    #[serde(default, alias = "max_size")]
    max_size_mb: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ClearCacheArgs {
    #[serde(default)]
    namespace: Option<String>,
}

/// Run one tool. Protocol-level problems (unknown tool, bad arguments) are
/// errors; everything about the files themselves goes into the result.
pub async fn call_tool(state: &AppState, name: &str, arguments: Value) -> Result<ToolResult, RpcError> {
    info!(tool = name, "Calling tool");
    match name {
        "read_local_files" => read_local_files(state, parse_args(arguments)?).await,
        "cache_stats" => to_result(&state.cache().stats()),
        "clear_cache" => clear_cache(state, parse_args(arguments)?).await,
        "list_parsers" => list_parsers(state).await,
        other => Err(RpcError::invalid_params(format!("Unknown tool: {other}"))),
    }
}

async fn read_local_files(state: &AppState, args: ReadLocalFilesArgs) -> Result<ToolResult, RpcError> {
    let paths: Vec<String> = args.file_paths.iter().map(|p| decode_path(p)).collect();

    let mut request = BatchRequest::new(paths);
    if let Some(mb) = args.max_size_mb {
        if !mb.is_finite() || mb <= 0.0 {
            return Err(RpcError::invalid_params("max_size_mb must be a positive number"));
        }
        request = request.with_max_file_size((mb * MB) as u64);
    }

    match state.reader().read_files(request).await {
        Ok(batch) => {
            let summary = json!({
                "total": batch.results.len(),
                "success": batch.count(FileStatus::Success),
                "cache_hit": batch.count(FileStatus::CacheHit),
                "failed": batch.count(FileStatus::Failed),
            });
            to_result(&json!({ "summary": summary, "results": batch.results }))
        }
        Err(e) => {
            let body = json!({
                "error": { "kind": e.kind(), "message": e.to_string() },
                "results": [],
            });
            let text = serde_json::to_string_pretty(&body).map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(ToolResult::error(text))
        }
    }
}

async fn clear_cache(state: &AppState, args: ClearCacheArgs) -> Result<ToolResult, RpcError> {
    let namespace = args
        .namespace
        .as_deref()
        .filter(|ns| !ns.trim().is_empty() && *ns != "all")
        .map(Namespace::from_str)
        .transpose()
        .map_err(RpcError::invalid_params)?;

    let removed = state.cache().clear(namespace).await;
    to_result(&json!({
        "namespace": namespace.map(|ns| ns.to_string()).unwrap_or_else(|| "all".to_string()),
        "removed": removed,
    }))
}

async fn list_parsers(state: &AppState) -> Result<ToolResult, RpcError> {
    let parsers = state.loader().available_parsers().await;
    to_result(&json!({
        "parsers": parsers,
        "supported_extensions": state.loader().registry().supported_extensions(),
    }))
}

/// Clients sometimes send percent-encoded or padded paths
fn decode_path(raw: &str) -> String {
    let trimmed = raw.trim();
    match urlencoding::decode(trimmed) {
        Ok(decoded) => {
            if decoded != trimmed {
                debug!(raw = trimmed, decoded = %decoded, "Decoded path");
            }
            decoded.trim().to_string()
        }
        Err(_) => trimmed.to_string(),
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T, RpcError> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| RpcError::invalid_params(format!("Invalid arguments: {e}")))
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<ToolResult, RpcError> {
    serde_json::to_string_pretty(value)
        .map(ToolResult::text)
        .map_err(|e| RpcError::internal(e.to_string()))
}
