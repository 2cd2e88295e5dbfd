//! Wire types for the provider-relay protocol.
//!
//! Every context (page provider, relay, authority, approval CLI) speaks in
//! these types. They are plain JSON-serializable values: nothing here holds a
//! channel, a lock or a secret.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC protocol version carried by every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

/// A single RPC call as produced by the page provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
}

impl RpcEnvelope {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            jsonrpc: default_jsonrpc(),
        }
    }
}

/// Error categories understood by every context.
///
/// The numeric codes follow EIP-1193 where it defines one and the JSON-RPC
/// reserved range otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorKind {
    InvalidParams,
    MethodNotSupported,
    ChannelUnavailable,
    ResultNotFound,
    UserRejected,
    SigningFailed,
    RequestTimeout,
    Unauthorized,
    UnrecognizedChain,
    Internal,
}

impl RpcErrorKind {
    pub const fn code(self) -> i64 {
        match self {
            Self::InvalidParams => -32602,
            Self::MethodNotSupported => 4200,
            Self::ChannelUnavailable => 4900,
            Self::ResultNotFound => -32004,
            Self::UserRejected => 4001,
            Self::SigningFailed => -32003,
            Self::RequestTimeout => -32005,
            Self::Unauthorized => 4100,
            Self::UnrecognizedChain => 4902,
            Self::Internal => -32603,
        }
    }

    /// Map a wire code back to its kind. Unknown codes are `Internal`.
    pub const fn from_code(code: i64) -> Self {
        match code {
            -32602 => Self::InvalidParams,
            4200 => Self::MethodNotSupported,
            4900 => Self::ChannelUnavailable,
            -32004 => Self::ResultNotFound,
            4001 => Self::UserRejected,
            -32003 => Self::SigningFailed,
            -32005 => Self::RequestTimeout,
            4100 => Self::Unauthorized,
            4902 => Self::UnrecognizedChain,
            _ => Self::Internal,
        }
    }
}

/// The `error` member of a failed [`RpcResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl RpcErrorObject {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> RpcErrorKind {
        RpcErrorKind::from_code(self.code)
    }
}

impl fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcOutcome {
    #[serde(rename = "result")]
    Success(Value),
    #[serde(rename = "error")]
    Failure(RpcErrorObject),
}

/// Response to an [`RpcEnvelope`], correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    pub id: u64,
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl RpcResult {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            jsonrpc: default_jsonrpc(),
            outcome: RpcOutcome::Success(result),
        }
    }

    pub fn failure(id: u64, error: RpcErrorObject) -> Self {
        Self {
            id,
            jsonrpc: default_jsonrpc(),
            outcome: RpcOutcome::Failure(error),
        }
    }

    pub fn error(id: u64, kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self::failure(id, RpcErrorObject::new(kind, message))
    }

    pub fn into_result(self) -> Result<Value, RpcErrorObject> {
        match self.outcome {
            RpcOutcome::Success(value) => Ok(value),
            RpcOutcome::Failure(error) => Err(error),
        }
    }
}

/// Messages exchanged between the page context and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PageMessage {
    #[serde(rename = "PING")]
    Ping { id: i64 },
    #[serde(rename = "PONG")]
    Pong { id: i64 },
    #[serde(rename = "RPC_REQUEST")]
    RpcRequest { id: u64, payload: RpcEnvelope },
    #[serde(rename = "RPC_RESPONSE")]
    RpcResponse { id: u64, response: RpcResult },
    #[serde(rename = "accountsChanged")]
    AccountsChanged { accounts: Vec<String> },
    #[serde(rename = "chainChanged")]
    ChainChanged {
        #[serde(rename = "chainId")]
        chain_id: String,
    },
}

impl PageMessage {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "PING",
            Self::Pong { .. } => "PONG",
            Self::RpcRequest { .. } => "RPC_REQUEST",
            Self::RpcResponse { .. } => "RPC_RESPONSE",
            Self::AccountsChanged { .. } => "accountsChanged",
            Self::ChainChanged { .. } => "chainChanged",
        }
    }
}

/// First response of an approval-gated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMarker {
    #[serde(rename = "requestId")]
    pub request_id: u64,
    pub pending: bool,
}

impl PendingMarker {
    pub fn new(request_id: u64) -> Self {
        Self {
            request_id,
            pending: true,
        }
    }

    /// Recognise a marker inside an arbitrary RPC result.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if !obj.get("pending")?.as_bool()? {
            return None;
        }
        let request_id = obj.get("requestId")?.as_u64()?;
        Some(Self::new(request_id))
    }

    pub fn to_value(self) -> Value {
        serde_json::json!({ "requestId": self.request_id, "pending": self.pending })
    }
}

/// An approval-gated call awaiting a human decision, as shown to the
/// approval UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A chain the wallet knows how to reach.
///
/// Serialised camelCase on the wire; snake_case is accepted too so the same
/// type can be read from config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(alias = "chain_id")]
    pub chain_id: String,
    pub name: String,
    #[serde(alias = "rpc_url")]
    pub rpc_url: String,
    #[serde(default, alias = "block_explorer", skip_serializing_if = "Option::is_none")]
    pub block_explorer: Option<String>,
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_hex_quantity(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}
