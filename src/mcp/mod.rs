//! Tool-call protocol (JSON-RPC 2.0) over HTTP or stdio
//!
//! Both transports hand raw messages to [`McpServer`], which owns the
//! method table. Notifications are processed but never answered.

pub mod http;
pub mod protocol;
pub mod stdio;
pub mod tools;

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::state::AppState;
use protocol::{RpcError, RpcRequest, RpcResponse, JSONRPC_VERSION, PROTOCOL_VERSION};

pub const SERVER_NAME: &str = "file-reader-server";

/// Protocol front end shared by the transports
#[derive(Clone)]
pub struct McpServer {
    state: AppState,
}

impl McpServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Handle one serialized message. `None` means nothing to send back.
    pub async fn handle_text(&self, raw: &str) -> Option<String> {
        let reply = match serde_json::from_str::<Value>(raw) {
            Ok(message) => self.handle_value(message).await?,
            Err(e) => {
                warn!(error = %e, "Unparseable message");
                to_value(RpcResponse::failure(
                    Value::Null,
                    RpcError::parse_error(format!("Parse error: {e}")),
                ))
            }
        };
        match serde_json::to_string(&reply) {
            Ok(text) => Some(text),
            Err(e) => {
                error!(error = %e, "Failed to serialize response");
                None
            }
        }
    }

    /// Handle a decoded message, single or batch
    pub async fn handle_value(&self, message: Value) -> Option<Value> {
        match message {
            Value::Array(items) if items.is_empty() => Some(to_value(RpcResponse::failure(
                Value::Null,
                RpcError::invalid_request("Empty batch"),
            ))),
            Value::Array(items) => {
                let mut replies = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(reply) = self.handle_single(item).await {
                        replies.push(reply);
                    }
                }
                (!replies.is_empty()).then_some(Value::Array(replies))
            }
            single => self.handle_single(single).await,
        }
    }

    async fn handle_single(&self, message: Value) -> Option<Value> {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let request: RpcRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                return Some(to_value(RpcResponse::failure(
                    id,
                    RpcError::invalid_request(format!("Invalid request: {e}")),
                )))
            }
        };
        self.handle(request).await.map(to_value)
    }

    /// Dispatch a request to its method
    pub async fn handle(&self, request: RpcRequest) -> Option<RpcResponse> {
        debug!(method = %request.method, "Received request");

        if request.jsonrpc != JSONRPC_VERSION {
            return (!request.is_notification()).then(|| {
                RpcResponse::failure(
                    request.id.clone().unwrap_or(Value::Null),
                    RpcError::invalid_request("jsonrpc must be \"2.0\""),
                )
            });
        }
        if request.is_notification() {
            debug!(method = %request.method, "Notification");
            return None;
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        let outcome = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": { "listChanged": false }
                }
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tools::list_tools() })),
            "tools/call" => self.call_tool(request.params).await,
            other => {
                warn!(method = other, "Unknown method");
                Err(RpcError::method_not_found(other))
            }
        };

        Some(match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(error) => RpcResponse::failure(id, error),
        })
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params = params.unwrap_or(Value::Null);
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("Missing tool name"))?;
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let result = tools::call_tool(&self.state, name, arguments).await?;
        serde_json::to_value(result).map_err(|e| RpcError::internal(e.to_string()))
    }
}

fn to_value(response: RpcResponse) -> Value {
    serde_json::to_value(&response).unwrap_or_else(|e| {
        error!(error = %e, "Failed to encode response");
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": Value::Null,
            "error": { "code": protocol::INTERNAL_ERROR, "message": "Internal error" }
        })
    })
}
