use crate::client::{ApprovalApi, ClientError};
use tracing::info;
use walletbridge_types::{PendingRequest, RpcResult};

/// Presents one pending request and reports the operator's decision.
///
/// The id arrives out of band (command line, notification). A request that
/// is no longer pending is an error, never a silent wait.
pub struct ApprovalController<'a, A: ApprovalApi> {
    api: &'a A,
}

impl<'a, A: ApprovalApi> ApprovalController<'a, A> {
    pub fn new(api: &'a A) -> Self {
        Self { api }
    }

    pub async fn find(&self, request_id: u64) -> Result<PendingRequest, ClientError> {
        self.api
            .list_pending_requests()
            .await?
            .into_iter()
            .find(|r| r.id == request_id)
            .ok_or(ClientError::NotFound(request_id))
    }

    pub async fn decide(&self, request_id: u64, approved: bool) -> Result<RpcResult, ClientError> {
        let request = self.find(request_id).await?;
        info!(request_id, method = %request.method, approved, "Submitting decision");
        self.api.submit_response(request.id, approved).await
    }

    pub async fn approve(&self, request_id: u64) -> Result<RpcResult, ClientError> {
        self.decide(request_id, true).await
    }

    pub async fn reject(&self, request_id: u64) -> Result<RpcResult, ClientError> {
        self.decide(request_id, false).await
    }
}

/// Human-readable summary for the terminal.
pub fn describe(request: &PendingRequest) -> String {
    let params = serde_json::to_string_pretty(&request.params).unwrap_or_default();
    format!(
        "Request {}\n  method:  {}\n  created: {}\n  params:  {}",
        request.id, request.method, request.timestamp, params
    )
}
