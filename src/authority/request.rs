//! Typed view of the authority's method surface.
//!
//! Every `(method, params)` pair is parsed into a [`WalletRequest`] before
//! any business logic runs, so handlers only ever see well-formed input.

use super::signer::TransactionRequest;
use super::state::SeedPhrase;
use super::WalletError;
use alloy_dyn_abi::TypedData;
use alloy_primitives::Address;
use serde_json::Value;
use std::str::FromStr;
use walletbridge_types::{parse_hex_quantity, Network};

/// Upper bound for `wallet_deriveAccounts`.
pub const MAX_DERIVE_COUNT: usize = 100;

/// Methods a page may reach through the relay.
pub const PAGE_METHODS: &[&str] = &[
    "eth_chainId",
    "eth_requestAccounts",
    "eth_getBalance",
    "eth_sendTransaction",
    "eth_signTypedData_v4",
    "wallet_getAccounts",
    "wallet_switchEthereumChain",
    "get_request_result",
];

pub const KNOWN_METHODS: &[&str] = &[
    "wallet_deriveAccounts",
    "wallet_getAccounts",
    "wallet_getAllAccounts",
    "wallet_setCurrentAccount",
    "wallet_setMnemonic",
    "wallet_setAccounts",
    "wallet_getState",
    "wallet_reset",
    "eth_sendTransaction",
    "eth_signTypedData_v4",
    "eth_chainId",
    "eth_requestAccounts",
    "eth_getBalance",
    "notification_response",
    "get_request_result",
    "get_pending_requests",
    "wallet_switchEthereumChain",
    "wallet_setChainId",
    "wallet_addNetwork",
];

#[derive(Debug, Clone)]
pub enum WalletRequest {
    DeriveAccounts { seed: SeedPhrase, count: usize },
    GetAccounts,
    GetAllAccounts,
    SetCurrentAccount(usize),
    SetMnemonic(SeedPhrase),
    SetAccounts(Vec<Address>),
    GetState,
    Reset,
    SendTransaction(TransactionRequest),
    SignTypedData {
        address: Address,
        typed_data: Box<TypedData>,
        /// Parsed JSON as shown to the approval UI.
        display: Value,
    },
    ChainId,
    RequestAccounts,
    GetBalance(Address),
    NotificationResponse { request_id: u64, approved: bool },
    GetRequestResult(u64),
    GetPendingRequests,
    SwitchChain(String),
    SetChainId(String),
    AddNetwork(Network),
}

fn param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a Value, WalletError> {
    params
        .get(index)
        .filter(|v| !v.is_null())
        .ok_or_else(|| WalletError::InvalidParams(format!("missing parameter `{name}`")))
}

fn string_param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str, WalletError> {
    param(params, index, name)?
        .as_str()
        .ok_or_else(|| WalletError::InvalidParams(format!("`{name}` must be a string")))
}

/// Integers arrive as JSON numbers, or as hex/decimal strings from some
/// dapps.
fn u64_param(params: &[Value], index: usize, name: &str) -> Result<u64, WalletError> {
    let value = param(params, index, name)?;
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => parse_hex_quantity(s).or_else(|| s.parse().ok()),
        _ => None,
    };
    parsed.ok_or_else(|| {
        WalletError::InvalidParams(format!("`{name}` must be a non-negative integer"))
    })
}

fn address_value(value: &Value, name: &str) -> Result<Address, WalletError> {
    value
        .as_str()
        .and_then(|s| Address::from_str(s).ok())
        .ok_or_else(|| WalletError::InvalidParams(format!("`{name}` must be a 20-byte hex address")))
}

fn seed_param(params: &[Value], index: usize) -> Result<SeedPhrase, WalletError> {
    SeedPhrase::new(string_param(params, index, "seed")?)
        .ok_or_else(|| WalletError::InvalidParams("seed phrase is empty".to_string()))
}

/// Lowercase `0x` form of a hex chain id, or `None` if it is not hex.
pub fn canonical_chain_id(chain_id: &str) -> Option<String> {
    parse_hex_quantity(chain_id).map(|n| format!("{n:#x}"))
}

fn chain_id_value(value: &Value) -> Result<String, WalletError> {
    value
        .as_str()
        .and_then(canonical_chain_id)
        .ok_or_else(|| WalletError::InvalidParams("`chainId` must be a hex string".to_string()))
}

impl WalletRequest {
    pub fn is_known(method: &str) -> bool {
        KNOWN_METHODS.contains(&method)
    }

    pub fn page_allowed(method: &str) -> bool {
        PAGE_METHODS.contains(&method)
    }

    pub fn parse(method: &str, params: &[Value]) -> Result<Self, WalletError> {
        let request = match method {
            "wallet_deriveAccounts" => {
                let seed = seed_param(params, 0)?;
                let count = u64_param(params, 1, "count")? as usize;
                if count > MAX_DERIVE_COUNT {
                    return Err(WalletError::InvalidParams(format!(
                        "count must be at most {MAX_DERIVE_COUNT}"
                    )));
                }
                Self::DeriveAccounts { seed, count }
            }
            "wallet_getAccounts" => Self::GetAccounts,
            "wallet_getAllAccounts" => Self::GetAllAccounts,
            "wallet_setCurrentAccount" => {
                Self::SetCurrentAccount(u64_param(params, 0, "index")? as usize)
            }
            "wallet_setMnemonic" => Self::SetMnemonic(seed_param(params, 0)?),
            "wallet_setAccounts" => {
                let raw = param(params, 0, "accounts")?.as_array().ok_or_else(|| {
                    WalletError::InvalidParams("`accounts` must be an array".to_string())
                })?;
                let accounts = raw
                    .iter()
                    .map(|v| address_value(v, "accounts[]"))
                    .collect::<Result<Vec<_>, _>>()?;
                Self::SetAccounts(accounts)
            }
            "wallet_getState" => Self::GetState,
            "wallet_reset" => Self::Reset,
            "eth_sendTransaction" => {
                let tx = serde_json::from_value(param(params, 0, "transaction")?.clone())
                    .map_err(|e| WalletError::InvalidParams(format!("transaction: {e}")))?;
                Self::SendTransaction(tx)
            }
            "eth_signTypedData_v4" => {
                let address = address_value(param(params, 0, "address")?, "address")?;
                let display = match param(params, 1, "typedData")? {
                    Value::String(raw) => serde_json::from_str(raw)
                        .map_err(|e| WalletError::InvalidParams(format!("typedData: {e}")))?,
                    other => other.clone(),
                };
                let typed_data: TypedData = serde_json::from_value(display.clone())
                    .map_err(|e| WalletError::InvalidParams(format!("typedData: {e}")))?;
                Self::SignTypedData {
                    address,
                    typed_data: Box::new(typed_data),
                    display,
                }
            }
            "eth_chainId" => Self::ChainId,
            "eth_requestAccounts" => Self::RequestAccounts,
            "eth_getBalance" => {
                Self::GetBalance(address_value(param(params, 0, "address")?, "address")?)
            }
            "notification_response" => {
                let request_id = u64_param(params, 0, "requestId")?;
                let approved = param(params, 1, "approved")?.as_bool().ok_or_else(|| {
                    WalletError::InvalidParams("`approved` must be a boolean".to_string())
                })?;
                Self::NotificationResponse {
                    request_id,
                    approved,
                }
            }
            "get_request_result" => Self::GetRequestResult(u64_param(params, 0, "requestId")?),
            "get_pending_requests" => Self::GetPendingRequests,
            "wallet_switchEthereumChain" => {
                let chain_id = param(params, 0, "chain")?
                    .get("chainId")
                    .ok_or_else(|| WalletError::InvalidParams("missing `chainId`".to_string()))?;
                Self::SwitchChain(chain_id_value(chain_id)?)
            }
            "wallet_setChainId" => Self::SetChainId(chain_id_value(param(params, 0, "chainId")?)?),
            "wallet_addNetwork" => {
                let mut network: Network =
                    serde_json::from_value(param(params, 0, "network")?.clone())
                        .map_err(|e| WalletError::InvalidParams(format!("network: {e}")))?;
                network.chain_id = canonical_chain_id(&network.chain_id).ok_or_else(|| {
                    WalletError::InvalidParams("`chainId` must be a hex string".to_string())
                })?;
                if network.rpc_url.trim().is_empty() {
                    return Err(WalletError::InvalidParams("`rpcUrl` is required".to_string()));
                }
                Self::AddNetwork(network)
            }
            other => return Err(WalletError::MethodNotSupported(other.to_string())),
        };
        Ok(request)
    }

    /// Whether the call suspends on a human decision.
    pub fn requires_approval(&self) -> bool {
        matches!(self, Self::SendTransaction(_) | Self::SignTypedData { .. })
    }
}
