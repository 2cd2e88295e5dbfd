//! The bridge over a real socket.
//!
//! Binds the web router to an ephemeral port, connects a provider to
//! `/ws` and drives approvals through the HTTP API the way the operator
//! CLI does.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use walletbridge::authority::{
    Authority, AuthorityHandle, BalanceError, BalanceSource, Caller, LocalKeySigner,
};
use walletbridge::config::{ProviderConfig, WalletConfig};
use walletbridge::provider::Provider;
use walletbridge::store::MemoryStore;
use walletbridge::web::{create_router, AppState};
use walletbridge_types::{PageMessage, PendingRequest, RpcErrorKind, RpcResult};

const SEED: &str = "test test test test test test test test test test test junk";
const FIRST: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
const TOKEN: &str = "test-session-token";

struct ZeroBalance;

#[async_trait]
impl BalanceSource for ZeroBalance {
    async fn get_balance(&self, _rpc_url: &str, _address: Address) -> Result<U256, BalanceError> {
        Ok(U256::ZERO)
    }
}

/// Running server for one test.
struct TestServer {
    addr: std::net::SocketAddr,
    handle: AuthorityHandle,
    http: reqwest::Client,
    _task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let mut authority = Authority::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalKeySigner),
            Arc::new(ZeroBalance),
            WalletConfig::default(),
        );
        authority.activate().await.unwrap();
        let handle = authority.spawn();

        let state = AppState {
            authority: handle.clone(),
            relay_timeout: Duration::from_secs(2),
            session_token: Arc::new(TOKEN.to_string()),
        };
        let app = create_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            handle,
            http: reqwest::Client::new(),
            _task: task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn rpc(&self, method: &str, params: Vec<Value>) -> RpcResult {
        self.http
            .post(self.url("/api/rpc"))
            .header("X-Session-Token", TOKEN)
            .json(&json!({"id": 1, "method": method, "params": params}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn pending(&self) -> Vec<PendingRequest> {
        self.http
            .get(self.url("/api/pending"))
            .header("X-Session-Token", TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn provider(&self) -> Provider {
        let config = ProviderConfig {
            direct_timeout_ms: 2_000,
            approval_timeout_ms: 10_000,
            poll_interval_ms: 50,
            poll_grace_ms: 50,
        };
        Provider::connect(&format!("ws://{}/ws", self.addr), config)
            .await
            .unwrap()
    }
}

async fn onboard(server: &TestServer) {
    server.rpc("wallet_setMnemonic", vec![json!(SEED)]).await.into_result().unwrap();
    let accounts = server
        .rpc("wallet_deriveAccounts", vec![json!(SEED), json!(1)])
        .await
        .into_result()
        .unwrap();
    server.rpc("wallet_setAccounts", vec![accounts]).await.into_result().unwrap();
}

#[tokio::test]
async fn test_health_is_public() {
    let server = TestServer::start().await;
    let body: Value = server
        .http
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["authority"], json!(true));
}

#[tokio::test]
async fn test_api_requires_session_token() {
    let server = TestServer::start().await;

    let missing = server.http.get(server.url("/api/pending")).send().await.unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::FORBIDDEN);

    let wrong = server
        .http
        .get(server.url("/api/pending"))
        .header("X-Session-Token", "guess")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), reqwest::StatusCode::FORBIDDEN);

    assert!(server.pending().await.is_empty());
}

#[tokio::test]
async fn test_page_reads_over_socket() {
    let server = TestServer::start().await;
    onboard(&server).await;
    let provider = server.provider().await;

    assert_eq!(provider.request("eth_chainId", vec![]).await.unwrap(), json!("0x7a69"));
    assert_eq!(
        provider.request("eth_requestAccounts", vec![]).await.unwrap(),
        json!([FIRST])
    );
    assert!(provider.ping().await.is_ok());
}

#[tokio::test]
async fn test_approval_over_http() {
    let server = TestServer::start().await;
    onboard(&server).await;
    let provider = Arc::new(server.provider().await);

    let page = provider.clone();
    let sent = tokio::spawn(async move {
        page.request("eth_sendTransaction", vec![json!({"from": FIRST, "value": "0x0"})])
            .await
    });

    let request = loop {
        if let Some(request) = server.pending().await.into_iter().next() {
            break request;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(request.method, "eth_sendTransaction");

    let shown: PendingRequest = server
        .http
        .get(server.url(&format!("/api/pending/{}", request.id)))
        .header("X-Session-Token", TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(shown, request);

    let decided: RpcResult = server
        .http
        .post(server.url(&format!("/api/pending/{}/response", request.id)))
        .header("X-Session-Token", TOKEN)
        .json(&json!({"approved": true}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let hash = decided.into_result().unwrap();

    assert_eq!(sent.await.unwrap().unwrap(), hash);

    // Already decided
    let again = server
        .http
        .post(server.url(&format!("/api/pending/{}/response", request.id)))
        .header("X-Session-Token", TOKEN)
        .json(&json!({"approved": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_raw_frames_cannot_reach_privileged_methods() {
    let server = TestServer::start().await;
    onboard(&server).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();
    let frame = json!({
        "type": "RPC_REQUEST",
        "id": 5,
        "payload": {"id": 5, "method": "wallet_getState", "params": [], "jsonrpc": "2.0"}
    });
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();

    let reply = loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => break serde_json::from_str::<PageMessage>(&text).unwrap(),
            _ => continue,
        }
    };
    match reply {
        PageMessage::RpcResponse { id, response } => {
            assert_eq!(id, 5);
            assert_eq!(response.into_result().unwrap_err().kind(), RpcErrorKind::Unauthorized);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Same call with wallet-UI rights
    let state = server.rpc("wallet_getState", vec![]).await.into_result().unwrap();
    assert_eq!(state["accounts"], json!([FIRST]));
    assert!(state.get("mnemonic").is_none());
    assert!(server.handle.request(Caller::Extension, "wallet_getState", vec![]).await.is_ok());
}

#[tokio::test]
async fn test_stopped_authority_surfaces_as_channel_error() {
    let server = TestServer::start().await;
    let provider = server.provider().await;
    assert!(provider.ping().await.is_ok());

    server.handle.shutdown().await;

    let err = provider.request("eth_chainId", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), RpcErrorKind::ChannelUnavailable);

    // The relay itself is still up
    assert!(provider.ping().await.is_ok());
}
