//! End-to-end flows across the three contexts, wired in-process.
//!
//! page provider <-> relay <-> authority, all over tokio channels. The
//! approver plays the wallet UI by listening on the approval topic and
//! answering through the privileged caller.

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use walletbridge::authority::{
    Authority, AuthorityHandle, BalanceError, BalanceSource, Caller, LocalKeySigner, Topic,
    WalletEvent,
};
use walletbridge::config::{ProviderConfig, WalletConfig};
use walletbridge::provider::{Listener, Provider, ProviderError};
use walletbridge::relay::Relay;
use walletbridge::store::MemoryStore;
use walletbridge_types::{PageMessage, PendingMarker, RpcErrorKind, RpcResult};

const SEED: &str = "test test test test test test test test test test test junk";
const FIRST: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
const SECOND: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

struct FixedBalance;

#[async_trait]
impl BalanceSource for FixedBalance {
    async fn get_balance(&self, _rpc_url: &str, _address: Address) -> Result<U256, BalanceError> {
        Ok(U256::from(1_000_000u64))
    }
}

fn fast_config() -> ProviderConfig {
    ProviderConfig {
        direct_timeout_ms: 2_000,
        approval_timeout_ms: 5_000,
        poll_interval_ms: 20,
        poll_grace_ms: 20,
    }
}

async fn spawn_authority() -> AuthorityHandle {
    let mut authority = Authority::new(
        Arc::new(MemoryStore::new()),
        Arc::new(LocalKeySigner),
        Arc::new(FixedBalance),
        WalletConfig::default(),
    );
    authority.activate().await.unwrap();
    authority.spawn()
}

async fn extension(handle: &AuthorityHandle, method: &str, params: Vec<Value>) -> RpcResult {
    handle.request(Caller::Extension, method, params).await.unwrap()
}

/// Import the well-known development mnemonic with two accounts.
async fn onboard(handle: &AuthorityHandle) {
    extension(handle, "wallet_setMnemonic", vec![json!(SEED)])
        .await
        .into_result()
        .unwrap();
    let accounts = extension(handle, "wallet_deriveAccounts", vec![json!(SEED), json!(2)])
        .await
        .into_result()
        .unwrap();
    extension(handle, "wallet_setAccounts", vec![accounts])
        .await
        .into_result()
        .unwrap();
}

/// A provider talking to a real relay in front of `handle`.
fn connect_page(handle: &AuthorityHandle, config: ProviderConfig) -> Provider {
    let (page_tx, relay_rx) = mpsc::channel(64);
    let (relay_tx, page_rx) = mpsc::channel(64);
    tokio::spawn(Relay::new(handle.clone(), Duration::from_secs(2)).run(relay_rx, relay_tx));
    Provider::over_channels(page_tx, page_rx, config)
}

/// A provider whose relay side is driven by the test.
fn fake_peer(config: ProviderConfig) -> (Provider, mpsc::Receiver<PageMessage>, mpsc::Sender<PageMessage>) {
    let (page_tx, peer_rx) = mpsc::channel(64);
    let (peer_tx, page_rx) = mpsc::channel(64);
    (Provider::over_channels(page_tx, page_rx, config), peer_rx, peer_tx)
}

fn capture(provider: &Provider, event: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener: Listener = Arc::new(move |payload: &Value| {
        let _ = tx.send(payload.clone());
    });
    provider.on(event, listener);
    rx
}

/// Answer the next approval prompt with `approved`.
fn approver(handle: &AuthorityHandle, approved: bool) -> tokio::task::JoinHandle<RpcResult> {
    let handle = handle.clone();
    let mut events = handle.subscribe(Topic::Approval);
    tokio::spawn(async move {
        loop {
            if let Ok(WalletEvent::ApprovalRequested { request_id, .. }) = events.recv().await {
                return extension(
                    &handle,
                    "notification_response",
                    vec![json!(request_id), json!(approved)],
                )
                .await;
            }
        }
    })
}

async fn next_request(peer_rx: &mut mpsc::Receiver<PageMessage>) -> (u64, String, Vec<Value>) {
    loop {
        match peer_rx.recv().await {
            Some(PageMessage::RpcRequest { id, payload }) => return (id, payload.method, payload.params),
            Some(_) => continue,
            None => panic!("provider hung up"),
        }
    }
}

async fn reply(peer_tx: &mpsc::Sender<PageMessage>, id: u64, value: Value) {
    peer_tx
        .send(PageMessage::RpcResponse {
            id,
            response: RpcResult::success(id, value),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_connect_and_read() {
    let handle = spawn_authority().await;
    onboard(&handle).await;
    let provider = connect_page(&handle, fast_config());
    let mut connects = capture(&provider, "connect");

    let accounts = provider.request("eth_requestAccounts", vec![]).await.unwrap();
    assert_eq!(accounts, json!([FIRST]));
    assert_eq!(provider.selected_address().await.as_deref(), Some(FIRST));
    assert!(connects.recv().await.is_some());

    assert_eq!(provider.request("eth_chainId", vec![]).await.unwrap(), json!("0x7a69"));
    assert_eq!(provider.request("eth_accounts", vec![]).await.unwrap(), json!([FIRST]));

    let balance = provider
        .request("eth_getBalance", vec![json!(FIRST), json!("latest")])
        .await
        .unwrap();
    assert_eq!(balance, json!("0xf4240"));
}

#[tokio::test]
async fn test_request_accounts_before_onboarding() {
    let handle = spawn_authority().await;
    let mut approvals = handle.subscribe(Topic::Approval);
    let provider = connect_page(&handle, fast_config());

    let accounts = provider.request("eth_requestAccounts", vec![]).await.unwrap();
    assert_eq!(accounts, json!([]));
    assert_eq!(approvals.recv().await.unwrap(), WalletEvent::ConnectRequested);
    assert!(provider.selected_address().await.is_none());
}

#[tokio::test]
async fn test_approved_transaction() {
    let handle = spawn_authority().await;
    onboard(&handle).await;
    let provider = connect_page(&handle, fast_config());
    let decision = approver(&handle, true);

    let hash = provider
        .request(
            "eth_sendTransaction",
            vec![json!({"from": FIRST, "to": SECOND, "value": "0xde0b6b3a7640000"})],
        )
        .await
        .unwrap();

    let hash = hash.as_str().unwrap().to_string();
    assert!(hash.starts_with("0x"));
    assert_eq!(hash.len(), 66);

    // The approver sees the same result the page got
    let approved = decision.await.unwrap().into_result().unwrap();
    assert_eq!(approved, json!(hash));

    let pending = extension(&handle, "get_pending_requests", vec![]).await;
    assert_eq!(pending.into_result().unwrap(), json!([]));
}

#[tokio::test]
async fn test_rejected_transaction() {
    let handle = spawn_authority().await;
    onboard(&handle).await;
    let provider = connect_page(&handle, fast_config());
    let decision = approver(&handle, false);

    let err = provider
        .request("eth_sendTransaction", vec![json!({"to": SECOND, "value": "0x1"})])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RpcErrorKind::UserRejected);
    assert_eq!(err.kind().code(), 4001);

    let answer = decision.await.unwrap();
    assert_eq!(answer.into_result().unwrap_err().kind(), RpcErrorKind::UserRejected);
}

#[tokio::test]
async fn test_typed_data_signature() {
    let handle = spawn_authority().await;
    onboard(&handle).await;
    let provider = connect_page(&handle, fast_config());
    let _decision = approver(&handle, true);

    let typed = json!({
        "types": {
            "EIP712Domain": [{"name": "name", "type": "string"}, {"name": "chainId", "type": "uint256"}],
            "Permit": [{"name": "owner", "type": "address"}, {"name": "value", "type": "uint256"}]
        },
        "primaryType": "Permit",
        "domain": {"name": "Bridge", "chainId": 31337},
        "message": {"owner": FIRST, "value": 1000}
    });
    let signature = provider
        .request("eth_signTypedData_v4", vec![json!(FIRST), json!(typed.to_string())])
        .await
        .unwrap();

    let signature = signature.as_str().unwrap();
    assert!(signature.starts_with("0x"));
    assert_eq!(signature.len(), 132);
}

#[tokio::test]
async fn test_second_decision_is_refused() {
    let handle = spawn_authority().await;
    onboard(&handle).await;
    let provider = Arc::new(connect_page(&handle, fast_config()));
    let mut approvals = handle.subscribe(Topic::Approval);

    let page = provider.clone();
    let sent = tokio::spawn(async move {
        page.request("eth_sendTransaction", vec![json!({"to": SECOND, "value": "0x0"})])
            .await
    });

    let request_id = loop {
        if let WalletEvent::ApprovalRequested { request_id, .. } = approvals.recv().await.unwrap() {
            break request_id;
        }
    };
    let first = extension(&handle, "notification_response", vec![json!(request_id), json!(true)]).await;
    let second = extension(&handle, "notification_response", vec![json!(request_id), json!(false)]).await;

    let hash = first.into_result().unwrap();
    assert_eq!(second.into_result().unwrap_err().kind(), RpcErrorKind::ResultNotFound);
    assert_eq!(sent.await.unwrap().unwrap(), hash);
}

#[tokio::test]
async fn test_wallet_events_reach_page() {
    let handle = spawn_authority().await;
    onboard(&handle).await;
    let provider = connect_page(&handle, fast_config());
    let mut accounts = capture(&provider, "accountsChanged");
    let mut chains = capture(&provider, "chainChanged");

    // Settles the initial chain lookup and proves the relay is subscribed
    assert_eq!(provider.request("eth_chainId", vec![]).await.unwrap(), json!("0x7a69"));

    extension(&handle, "wallet_setCurrentAccount", vec![json!(1)])
        .await
        .into_result()
        .unwrap();
    assert_eq!(accounts.recv().await.unwrap(), json!([SECOND]));
    assert_eq!(provider.selected_address().await.as_deref(), Some(SECOND));

    extension(
        &handle,
        "wallet_addNetwork",
        vec![json!({"chainId": "0x1", "name": "Mainnet", "rpcUrl": "https://eth.llamarpc.com"})],
    )
    .await
    .into_result()
    .unwrap();
    extension(&handle, "wallet_setChainId", vec![json!("0x1")])
        .await
        .into_result()
        .unwrap();
    assert_eq!(chains.recv().await.unwrap(), json!("0x1"));
    assert_eq!(provider.chain_id().await.as_deref(), Some("0x1"));
}

#[tokio::test]
async fn test_switch_chain_from_page() {
    let handle = spawn_authority().await;
    onboard(&handle).await;
    extension(
        &handle,
        "wallet_addNetwork",
        vec![json!({"chainId": "0xAA36A7", "name": "Sepolia", "rpcUrl": "https://rpc.sepolia.org"})],
    )
    .await
    .into_result()
    .unwrap();

    let provider = connect_page(&handle, fast_config());
    let mut chains = capture(&provider, "chainChanged");
    assert_eq!(provider.request("eth_chainId", vec![]).await.unwrap(), json!("0x7a69"));

    provider
        .request("wallet_switchEthereumChain", vec![json!({"chainId": "0xaa36a7"})])
        .await
        .unwrap();
    assert_eq!(chains.recv().await.unwrap(), json!("0xaa36a7"));
    assert_eq!(provider.request("eth_chainId", vec![]).await.unwrap(), json!("0xaa36a7"));

    // The relay broadcast for the same switch is deduplicated
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(chains.try_recv().is_err());

    let err = provider
        .request("wallet_switchEthereumChain", vec![json!({"chainId": "0x89"})])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RpcErrorKind::UnrecognizedChain);
}

#[tokio::test]
async fn test_page_cannot_reach_privileged_methods() {
    let handle = spawn_authority().await;
    onboard(&handle).await;

    let (page_tx, relay_rx) = mpsc::channel(8);
    let (relay_tx, mut page_rx) = mpsc::channel(8);
    tokio::spawn(Relay::new(handle.clone(), Duration::from_secs(2)).run(relay_rx, relay_tx));

    for (id, method) in [(1, "wallet_getState"), (2, "notification_response"), (3, "wallet_reset")] {
        page_tx
            .send(PageMessage::RpcRequest {
                id,
                payload: walletbridge_types::RpcEnvelope::new(id, method, vec![json!(1), json!(true)]),
            })
            .await
            .unwrap();
        match page_rx.recv().await {
            Some(PageMessage::RpcResponse { id: got, response }) => {
                assert_eq!(got, id);
                assert_eq!(response.into_result().unwrap_err().kind(), RpcErrorKind::Unauthorized);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    // Nothing changed behind the refused calls
    let state = extension(&handle, "wallet_getState", vec![]).await.into_result().unwrap();
    assert_eq!(state["hasMnemonic"], json!(true));
}

#[tokio::test]
async fn test_provider_rejects_unknown_method_locally() {
    let handle = spawn_authority().await;
    let provider = connect_page(&handle, fast_config());
    let err = provider.request("wallet_getState", vec![]).await.unwrap_err();
    assert!(matches!(err, ProviderError::MethodNotSupported(_)));
    assert_eq!(err.kind().code(), 4200);
}

#[tokio::test]
async fn test_reset_is_idempotent() {
    let handle = spawn_authority().await;
    onboard(&handle).await;

    for _ in 0..2 {
        let reset = extension(&handle, "wallet_reset", vec![]).await;
        assert_eq!(reset.into_result().unwrap(), json!(true));
    }
    let state = extension(&handle, "wallet_getState", vec![]).await.into_result().unwrap();
    assert_eq!(state["hasMnemonic"], json!(false));
    assert_eq!(state["accounts"], json!([]));
    assert_eq!(state["currentAccount"], json!(0));
    assert_eq!(state["currentChainId"], json!("0x7a69"));
}

#[tokio::test]
async fn test_derivation_is_deterministic() {
    let handle = spawn_authority().await;
    let first = extension(&handle, "wallet_deriveAccounts", vec![json!(SEED), json!(3)])
        .await
        .into_result()
        .unwrap();
    let again = extension(&handle, "wallet_deriveAccounts", vec![json!(SEED), json!(3)])
        .await
        .into_result()
        .unwrap();
    assert_eq!(first, again);
    assert_eq!(first[0], json!(FIRST));
    assert_eq!(first[1], json!(SECOND));
}

#[tokio::test]
async fn test_out_of_order_responses_match_their_calls() {
    let (provider, mut peer_rx, peer_tx) = fake_peer(fast_config());
    let provider = Arc::new(provider);

    let (boot_id, boot_method, _) = next_request(&mut peer_rx).await;
    assert_eq!(boot_method, "eth_chainId");
    reply(&peer_tx, boot_id, json!("0x7a69")).await;

    let page = provider.clone();
    let balance_a = tokio::spawn(async move {
        page.request("eth_getBalance", vec![json!(FIRST), json!("latest")]).await
    });
    let page = provider.clone();
    let balance_b = tokio::spawn(async move {
        page.request("eth_getBalance", vec![json!(SECOND), json!("latest")]).await
    });

    let one = next_request(&mut peer_rx).await;
    let two = next_request(&mut peer_rx).await;
    assert_ne!(one.0, two.0);

    // Answer in reverse order, each with a value derived from its own params
    for (id, _, params) in [two, one] {
        let value = if params[0] == json!(FIRST) { "0xa" } else { "0xb" };
        reply(&peer_tx, id, json!(value)).await;
    }

    assert_eq!(balance_a.await.unwrap().unwrap(), json!("0xa"));
    assert_eq!(balance_b.await.unwrap().unwrap(), json!("0xb"));
    assert_eq!(provider.in_flight(), 0);
}

#[tokio::test]
async fn test_stale_response_is_dropped() {
    let (provider, mut peer_rx, peer_tx) = fake_peer(fast_config());
    let (boot_id, _, _) = next_request(&mut peer_rx).await;
    reply(&peer_tx, boot_id, json!("0x7a69")).await;

    // Nobody is waiting for this id
    reply(&peer_tx, 9_999, json!("0xdead")).await;

    let provider = Arc::new(provider);
    let page = provider.clone();
    let call = tokio::spawn(async move { page.request("eth_chainId", vec![]).await });
    let (id, method, _) = next_request(&mut peer_rx).await;
    assert_eq!(method, "eth_chainId");
    reply(&peer_tx, id, json!("0x1")).await;

    assert_eq!(call.await.unwrap().unwrap(), json!("0x1"));
    assert_eq!(provider.chain_id().await.as_deref(), Some("0x1"));
}

struct SlowBalance;

#[async_trait]
impl BalanceSource for SlowBalance {
    async fn get_balance(&self, _rpc_url: &str, _address: Address) -> Result<U256, BalanceError> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok(U256::from(1u64))
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_rpc_node_does_not_block_other_calls() {
    let mut authority = Authority::new(
        Arc::new(MemoryStore::new()),
        Arc::new(LocalKeySigner),
        Arc::new(SlowBalance),
        WalletConfig::default(),
    );
    authority.activate().await.unwrap();
    let handle = authority.spawn();

    let (page_tx, relay_rx) = mpsc::channel(64);
    let (relay_tx, page_rx) = mpsc::channel(64);
    tokio::spawn(Relay::new(handle.clone(), Duration::from_secs(1)).run(relay_rx, relay_tx));
    let provider = Provider::over_channels(page_tx, page_rx, fast_config());

    let (balance, chain) = tokio::join!(
        provider.request("eth_getBalance", vec![json!(FIRST), json!("latest")]),
        async {
            tokio::task::yield_now().await;
            provider.request("eth_chainId", vec![]).await
        }
    );
    assert_eq!(chain.unwrap(), json!("0x7a69"));
    // Only the slow lookup itself runs into the relay deadline
    assert_eq!(balance.unwrap_err().kind(), RpcErrorKind::ChannelUnavailable);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let (provider, _peer_rx, _peer_tx) = fake_peer(ProviderConfig {
        direct_timeout_ms: 100,
        ..fast_config()
    });

    let err = provider.request("eth_chainId", vec![]).await.unwrap_err();
    assert!(matches!(err, ProviderError::RequestTimeout(_)));
    assert_eq!(provider.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_undecided_approval_times_out() {
    let (provider, mut peer_rx, peer_tx) = fake_peer(ProviderConfig {
        approval_timeout_ms: 1_000,
        poll_grace_ms: 100,
        poll_interval_ms: 100,
        ..fast_config()
    });

    // Always pending, never decided
    let peer = tokio::spawn(async move {
        let mut polls = 0u32;
        while let Some(msg) = peer_rx.recv().await {
            let PageMessage::RpcRequest { id, payload } = msg else { continue };
            let response = match payload.method.as_str() {
                "eth_chainId" => RpcResult::success(id, json!("0x7a69")),
                "eth_sendTransaction" => RpcResult::success(id, PendingMarker::new(77).to_value()),
                "get_request_result" => {
                    polls += 1;
                    RpcResult::error(id, RpcErrorKind::ResultNotFound, "Result not found")
                }
                other => panic!("unexpected {other}"),
            };
            if peer_tx.send(PageMessage::RpcResponse { id, response }).await.is_err() {
                break;
            }
        }
        polls
    });

    let err = provider
        .request("eth_sendTransaction", vec![json!({"to": SECOND})])
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::RequestTimeout(_)));

    drop(provider);
    let polls = peer.await.unwrap();
    assert!(polls >= 5, "polled {polls} times");
}

#[tokio::test]
async fn test_closed_transport_fails_waiting_calls() {
    let (provider, mut peer_rx, peer_tx) = fake_peer(fast_config());
    let provider = Arc::new(provider);
    let _boot = next_request(&mut peer_rx).await;

    let page = provider.clone();
    let call = tokio::spawn(async move { page.request("eth_chainId", vec![]).await });
    let _ = next_request(&mut peer_rx).await;

    drop(peer_tx);
    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), RpcErrorKind::ChannelUnavailable);
    assert!(provider.is_closed());

    let err = provider.request("eth_chainId", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), RpcErrorKind::ChannelUnavailable);
}

#[tokio::test]
async fn test_ping_round_trip() {
    let handle = spawn_authority().await;
    let provider = connect_page(&handle, fast_config());
    let rtt = provider.ping().await.unwrap();
    assert!(rtt < Duration::from_secs(2));
}
