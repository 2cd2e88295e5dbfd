use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("Malformed balance response: {0}")]
    Malformed(String),
}

/// Native balance lookup against a chain's JSON-RPC endpoint.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn get_balance(&self, rpc_url: &str, address: Address) -> Result<U256, BalanceError>;
}

#[derive(Debug, Deserialize)]
struct NodeError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct NodeResponse {
    result: Option<U256>,
    error: Option<NodeError>,
}

/// `eth_getBalance` over HTTP.
#[derive(Debug, Clone)]
pub struct JsonRpcBalance {
    client: reqwest::Client,
}

impl JsonRpcBalance {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for JsonRpcBalance {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl BalanceSource for JsonRpcBalance {
    async fn get_balance(&self, rpc_url: &str, address: Address) -> Result<U256, BalanceError> {
        debug!(%rpc_url, %address, "eth_getBalance");
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_getBalance",
            "params": [address, "latest"],
        });

        let response: NodeResponse = self
            .client
            .post(rpc_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(BalanceError::Node {
                code: err.code,
                message: err.message,
            });
        }
        response
            .result
            .ok_or_else(|| BalanceError::Malformed("missing result".to_string()))
    }
}
