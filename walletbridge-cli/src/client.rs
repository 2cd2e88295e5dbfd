use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use walletbridge_types::{PendingRequest, RpcEnvelope, RpcErrorObject, RpcResult};

/// Errors talking to the bridge's approval API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bridge refused the session token")]
    Forbidden,

    #[error("Pending request {0} not found")]
    NotFound(u64),

    #[error("Bridge returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Wallet error: {0}")]
    Rpc(RpcErrorObject),
}

/// What the approval flow needs from the bridge.
#[async_trait]
pub trait ApprovalApi: Send + Sync {
    async fn list_pending_requests(&self) -> Result<Vec<PendingRequest>, ClientError>;

    async fn submit_response(&self, request_id: u64, approved: bool) -> Result<RpcResult, ClientError>;
}

/// HTTP client for the bridge's privileged `/api` routes.
pub struct BridgeClient {
    base: String,
    token: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl BridgeClient {
    pub fn new(base: &str, token: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(ClientError::Forbidden);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ClientError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Call a wallet method with UI rights and unwrap its outcome.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let resp = self
            .http
            .post(self.url("/rpc"))
            .header("X-Session-Token", &self.token)
            .json(&RpcEnvelope::new(id, method, params))
            .send()
            .await?;
        let result: RpcResult = Self::check(resp).await?.json().await?;
        result.into_result().map_err(ClientError::Rpc)
    }

    pub async fn pending_request(&self, request_id: u64) -> Result<PendingRequest, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/pending/{request_id}")))
            .header("X-Session-Token", &self.token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(request_id));
        }
        Ok(Self::check(resp).await?.json().await?)
    }
}

#[async_trait]
impl ApprovalApi for BridgeClient {
    async fn list_pending_requests(&self) -> Result<Vec<PendingRequest>, ClientError> {
        let resp = self
            .http
            .get(self.url("/pending"))
            .header("X-Session-Token", &self.token)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn submit_response(&self, request_id: u64, approved: bool) -> Result<RpcResult, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/pending/{request_id}/response")))
            .header("X-Session-Token", &self.token)
            .json(&json!({ "approved": approved }))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(request_id));
        }
        Ok(Self::check(resp).await?.json().await?)
    }
}
