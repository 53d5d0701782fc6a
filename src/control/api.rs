//! Control protocol shapes and error codes.

use serde::Deserialize;
use serde_json::{json, Value};

pub const UNKNOWN_METHOD: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL: i64 = -32603;

/// One request line: `{"id": 1, "method": "status", "params": {...}}`.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Method failure carrying its protocol error code.
#[derive(Debug)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn unknown_method(method: &str) -> Self {
        Self {
            code: UNKNOWN_METHOD,
            message: format!("unknown method: {}", method),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            code: INTERNAL,
            message: err.to_string(),
        }
    }
}

pub fn result_line(id: Value, result: Value) -> String {
    json!({ "id": id, "result": result }).to_string()
}

pub fn error_line(id: Value, code: i64, message: &str) -> String {
    json!({ "id": id, "error": { "code": code, "message": message } }).to_string()
}

/// Decodes `params`, treating absent/null as all-defaults.
pub fn parse_params<T>(params: &Value) -> Result<T, RpcError>
where
    T: Default + serde::de::DeserializeOwned,
{
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone())
        .map_err(|e| RpcError::invalid_params(format!("bad params: {}", e)))
}
