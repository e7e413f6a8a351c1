//! The JSON-RPC 2.0 surface shared by the daemon and its clients.
//!
//! Envelope types plus the parameter and result payloads of every method.
//! Error codes: the standard JSON-RPC range for protocol problems, and a
//! small daemon-specific table so that clients can distinguish domain
//! errors (`HostNotCreated` in particular) without string matching.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::XvError;
use crate::vg::LvStatus;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;

    pub const HOST_NOT_CREATED: i64 = -32001;
    pub const NOT_FOUND: i64 = -32002;
    pub const ALREADY_EXISTS: i64 = -32003;
    pub const ONLY_THIS_MUCH_FREE: i64 = -32004;
    pub const TRY_AGAIN: i64 = -32010;
    pub const INTERNAL: i64 = -32099;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("unknown method {method}"))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(Self::INVALID_PARAMS, format!("invalid params: {detail}"))
    }
}

impl From<XvError> for RpcError {
    fn from(e: XvError) -> Self {
        let code = match &e {
            XvError::Retry | XvError::Suspended => Self::TRY_AGAIN,
            XvError::HostNotCreated(_) => Self::HOST_NOT_CREATED,
            XvError::NotFound(_) => Self::NOT_FOUND,
            XvError::AlreadyExists(_) => Self::ALREADY_EXISTS,
            XvError::OnlyThisMuchFree(_) => Self::ONLY_THIS_MUCH_FREE,
            XvError::NotFormatted | XvError::Io(_) | XvError::Msg(_) => Self::INTERNAL,
        };
        Self::new(code, e.to_string())
    }
}

// ---------------------------------------------------------------------
// Method payloads
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameParams {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostParams {
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateLvParams {
    pub name: String,
    pub size_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameLvParams {
    pub name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeLvParams {
    pub name: String,
    pub size_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStatusParams {
    pub name: String,
    pub status: Vec<LvStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagParams {
    pub name: String,
    pub tag: String,
}

/// State of one per-host ring as reported by `Host.all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Name of the LV backing the queue.
    pub lv: String,
    pub suspended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    pub name: String,
    pub from_lvm: QueueStatus,
    pub to_lvm: QueueStatus,
    pub free_extents: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let req = RpcRequest::new("Host.create", json!({"host": "h1"}), json!(1));
        let text = serde_json::to_string(&req).unwrap();
        let back: RpcRequest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.method, "Host.create");
        assert_eq!(back.params["host"], "h1");
    }

    #[test]
    fn test_error_codes() {
        let e = RpcError::from(XvError::HostNotCreated("h1".into()));
        assert_eq!(e.code, RpcError::HOST_NOT_CREATED);
        let e = RpcError::from(XvError::OnlyThisMuchFree(3));
        assert_eq!(e.code, RpcError::ONLY_THIS_MUCH_FREE);
        let e = RpcError::from(XvError::Io("boom".into()));
        assert_eq!(e.code, RpcError::INTERNAL);
    }

    #[test]
    fn test_response_skips_absent_fields() {
        let resp = RpcResponse::result(json!(7), json!("ok"));
        let text = serde_json::to_string(&resp).unwrap();
        assert!(!text.contains("error"));
        let resp = RpcResponse::error(json!(7), RpcError::method_not_found("nope"));
        let text = serde_json::to_string(&resp).unwrap();
        assert!(!text.contains("result"));
    }
}
