//! JSON-RPC 2.0 framing: request parsing, response/notification builders,
//! and the error-code table.
//!
//! One JSON-RPC message per WebSocket text frame. Standard codes follow the
//! JSON-RPC 2.0 spec; gateway-specific errors live in the reserved server
//! range −32000..−32099.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Server-defined range.
pub const SPAWN_FAILED: i64 = -32000;
pub const SESSION_LIMIT: i64 = -32001;
pub const COMMAND_NOT_ALLOWED: i64 = -32002;
pub const INVALID_STATE: i64 = -32003;
pub const SESSION_BUSY: i64 = -32004;

/// A parsed JSON-RPC request (or client notification, when `id` is absent).
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl RpcRequest {
    /// Parse one frame. Distinguishes unparseable JSON from a well-formed
    /// frame that isn't JSON-RPC 2.0 so the caller can pick the right code.
    pub fn parse(text: &str) -> Result<Self, i64> {
        let request: Self = serde_json::from_str(text).map_err(|_| PARSE_ERROR)?;
        if request.jsonrpc != "2.0" {
            return Err(INVALID_REQUEST);
        }
        Ok(request)
    }
}

/// Parameters for the `execute` method.
#[derive(Debug, Deserialize)]
pub struct ExecuteParams {
    pub command: String,
    /// Explicit timeout override in seconds.
    pub timeout: Option<u64>,
    pub env: Option<HashMap<String, String>>,
    pub cwd: Option<String>,
    /// Optional hints consumed by the timeout estimator.
    pub complexity: Option<String>,
    pub expected_output_tokens: Option<u64>,
    pub tools_allowed: Option<Vec<String>>,
    /// Caller expects a structured (JSON) reply.
    #[serde(default)]
    pub structured: bool,
}

/// Parameters for the `control` method.
#[derive(Debug, Deserialize)]
pub struct ControlParams {
    #[serde(rename = "type")]
    pub control_type: String,
}

/// Parameters for the `hook` method.
#[derive(Debug, Deserialize)]
pub struct HookParams {
    /// `"pre"`, `"post"`, or `"error"`.
    pub phase: String,
}

/// Build a success response for a request id.
pub fn result_response(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Build an error response. `id` is `null` when the request id was never
/// recovered (parse errors).
pub fn error_response(id: Option<&Value>, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.cloned().unwrap_or(Value::Null),
        "error": {
            "code": code,
            "message": message,
        },
    })
}

/// Build a server → client notification (no id).
pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_request_with_id() {
        let req = RpcRequest::parse(
            r#"{"jsonrpc":"2.0","id":1,"method":"execute","params":{"command":"true"}}"#,
        )
        .unwrap();
        assert_eq!(req.method, "execute");
        assert_eq!(req.id, Some(json!(1)));
        let params: ExecuteParams = serde_json::from_value(req.params.unwrap()).unwrap();
        assert_eq!(params.command, "true");
        assert!(!params.structured);
    }

    #[test]
    fn rejects_non_json() {
        assert_eq!(RpcRequest::parse("not json").unwrap_err(), PARSE_ERROR);
    }

    #[test]
    fn rejects_wrong_version() {
        let err = RpcRequest::parse(r#"{"jsonrpc":"1.0","method":"x"}"#).unwrap_err();
        assert_eq!(err, INVALID_REQUEST);
    }

    #[test]
    fn control_params_use_the_type_field() {
        let params: ControlParams = serde_json::from_value(json!({"type": "PAUSE"})).unwrap();
        assert_eq!(params.control_type, "PAUSE");
    }

    #[test]
    fn notification_has_no_id() {
        let n = notification("process.output", json!({"seq": 1}));
        assert!(n.get("id").is_none());
        assert_eq!(n["method"], "process.output");
        assert_eq!(n["jsonrpc"], "2.0");
    }

    #[test]
    fn error_response_defaults_to_null_id() {
        let e = error_response(None, PARSE_ERROR, "bad frame");
        assert!(e["id"].is_null());
        assert_eq!(e["error"]["code"], PARSE_ERROR);
    }
}
