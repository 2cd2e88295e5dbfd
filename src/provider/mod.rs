//! The page-facing provider.
//!
//! Correlates every outgoing call with its response, enforces the call
//! budgets, switches to polling when a call needs human approval, and
//! surfaces wallet events to page listeners.

pub mod discovery;
pub mod events;
pub mod poll;

pub use discovery::{inject, injected, Announcement, DiscoveryBus, ProviderInfo};
pub use events::{EventEmitter, Listener};
pub use poll::ResultPoller;

use crate::config::ProviderConfig;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walletbridge_types::{
    PageMessage, PendingMarker, RpcEnvelope, RpcErrorKind, RpcErrorObject, RpcResult,
};

/// Calls that come back as a pending marker and need the longer budget.
pub const APPROVAL_METHODS: &[&str] = &["eth_sendTransaction", "eth_signTypedData_v4"];

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Request timeout: {0}")]
    RequestTimeout(String),

    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Method not supported: {0}")]
    MethodNotSupported(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("{message}")]
    Rpc { code: i64, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("A provider is already injected")]
    AlreadyInjected,
}

impl ProviderError {
    pub fn kind(&self) -> RpcErrorKind {
        match self {
            Self::RequestTimeout(_) => RpcErrorKind::RequestTimeout,
            Self::ChannelUnavailable(_) => RpcErrorKind::ChannelUnavailable,
            Self::MethodNotSupported(_) => RpcErrorKind::MethodNotSupported,
            Self::Rpc { code, .. } => RpcErrorKind::from_code(*code),
            Self::Cancelled | Self::Transport(_) | Self::AlreadyInjected => RpcErrorKind::Internal,
        }
    }

    /// "Not found yet" while polling.
    pub fn is_transient(&self) -> bool {
        self.kind() == RpcErrorKind::ResultNotFound
    }
}

impl From<RpcErrorObject> for ProviderError {
    fn from(err: RpcErrorObject) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

struct PendingCall {
    method: String,
    reply: oneshot::Sender<RpcResult>,
}

/// Removes a correlation entry however the waiting call ends.
struct CallEntry<'a> {
    calls: &'a DashMap<u64, PendingCall>,
    id: u64,
}

impl Drop for CallEntry<'_> {
    fn drop(&mut self) {
        self.calls.remove(&self.id);
    }
}

struct Inner {
    outbound: mpsc::Sender<PageMessage>,
    calls: DashMap<u64, PendingCall>,
    pings: DashMap<i64, oneshot::Sender<()>>,
    next_id: AtomicU64,
    next_ping: AtomicI64,
    selected_address: RwLock<Option<String>>,
    chain_id: RwLock<Option<String>>,
    emitter: EventEmitter,
    config: ProviderConfig,
    /// Cancelled when the provider is dropped or its transport ends.
    closed: CancellationToken,
}

impl Inner {
    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        deadline: Instant,
    ) -> Result<RpcResult, ProviderError> {
        if self.closed.is_cancelled() {
            return Err(ProviderError::ChannelUnavailable("provider closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                reply,
            },
        );
        let _entry = CallEntry {
            calls: &self.calls,
            id,
        };

        let exchange = async {
            let msg = PageMessage::RpcRequest {
                id,
                payload: RpcEnvelope::new(id, method, params),
            };
            self.outbound
                .send(msg)
                .await
                .map_err(|_| ProviderError::ChannelUnavailable("relay is gone".to_string()))?;
            rx.await
                .map_err(|_| ProviderError::ChannelUnavailable("connection closed".to_string()))
        };

        match timeout_at(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(id, %method, "Request timed out");
                Err(ProviderError::RequestTimeout(method.to_string()))
            }
        }
    }

    /// Returns whether the cached chain id changed.
    async fn set_chain_id(&self, chain_id: &str) -> bool {
        let normalized = chain_id.to_ascii_lowercase();
        let mut current = self.chain_id.write().await;
        if current.as_deref() == Some(normalized.as_str()) {
            return false;
        }
        *current = Some(normalized);
        true
    }

    async fn handle_incoming(&self, msg: PageMessage) {
        match msg {
            PageMessage::RpcResponse { id, response } => match self.calls.remove(&id) {
                Some((_, call)) => {
                    debug!(id, method = %call.method, "Response received");
                    let _ = call.reply.send(response);
                }
                None => debug!(id, "Dropping response with unknown id"),
            },
            PageMessage::Ping { id } => {
                let _ = self.outbound.send(PageMessage::Pong { id }).await;
            }
            PageMessage::Pong { id } => {
                if let Some((_, waiter)) = self.pings.remove(&id) {
                    let _ = waiter.send(());
                }
            }
            PageMessage::AccountsChanged { accounts } => {
                *self.selected_address.write().await = accounts.first().cloned();
                self.emitter.emit("accountsChanged", &json!(accounts));
            }
            PageMessage::ChainChanged { chain_id } => {
                if self.set_chain_id(&chain_id).await {
                    self.emitter.emit("chainChanged", &json!(chain_id));
                }
            }
            PageMessage::RpcRequest { id, .. } => {
                debug!(id, "Ignoring RPC request sent to the page");
            }
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut inbound: mpsc::Receiver<PageMessage>) {
    loop {
        let msg = tokio::select! {
            _ = inner.closed.cancelled() => break,
            msg = inbound.recv() => msg,
        };
        let Some(msg) = msg else { break };
        inner.handle_incoming(msg).await;
    }

    inner.closed.cancel();
    // Dropping the reply senders fails every call still waiting
    inner.calls.clear();
    inner.pings.clear();
    debug!("Provider reader stopped");
}

/// Page-facing request/event API.
pub struct Provider {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("in_flight", &self.inner.calls.len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl Provider {
    /// Run over an already-established message channel pair.
    pub fn over_channels(
        outbound: mpsc::Sender<PageMessage>,
        inbound: mpsc::Receiver<PageMessage>,
        config: ProviderConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            outbound,
            calls: DashMap::new(),
            pings: DashMap::new(),
            next_id: AtomicU64::new(1),
            next_ping: AtomicI64::new(-1),
            selected_address: RwLock::new(None),
            chain_id: RwLock::new(None),
            emitter: EventEmitter::new(),
            config,
            closed: CancellationToken::new(),
        });
        tokio::spawn(read_loop(inner.clone(), inbound));

        let provider = Self { inner };
        provider.bootstrap();
        provider
    }

    /// Connect to a relay's WebSocket endpoint.
    pub async fn connect(url: &str, config: ProviderConfig) -> Result<Self, ProviderError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        info!(%url, "Connected to relay");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<PageMessage>(64);
        let (in_tx, in_rx) = mpsc::channel::<PageMessage>(64);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize page message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    warn!("WebSocket send error: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<PageMessage>(&text) {
                        Ok(msg) => {
                            if in_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Unparseable relay message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self::over_channels(out_tx, in_rx, config))
    }

    /// Fetch the initial chain id in the background. Failure leaves it
    /// unset.
    fn bootstrap(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + inner.config.direct_timeout();
            match inner.call("eth_chainId", Vec::new(), deadline).await {
                Ok(result) => match result.into_result() {
                    Ok(Value::String(chain_id)) => {
                        inner.set_chain_id(&chain_id).await;
                    }
                    Ok(other) => debug!(%other, "Unexpected eth_chainId result"),
                    Err(e) => debug!("Initial chain id lookup failed: {}", e),
                },
                Err(e) => debug!("Initial chain id lookup failed: {}", e),
            }
        });
    }

    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, ProviderError> {
        match method {
            "eth_accounts" => self.direct("wallet_getAccounts", params).await,
            "eth_requestAccounts" => {
                let accounts = self.direct(method, params).await?;
                if let Some(first) = accounts
                    .as_array()
                    .and_then(|list| list.first())
                    .and_then(Value::as_str)
                {
                    *self.inner.selected_address.write().await = Some(first.to_string());
                    let chain_id = self.chain_id().await;
                    self.inner.emitter.emit("connect", &json!({ "chainId": chain_id }));
                }
                Ok(accounts)
            }
            "eth_chainId" => {
                let chain_id = self.direct(method, params).await?;
                if let Some(id) = chain_id.as_str() {
                    self.inner.set_chain_id(id).await;
                }
                Ok(chain_id)
            }
            "wallet_switchEthereumChain" => {
                let requested = params
                    .first()
                    .and_then(|p| p.get("chainId"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let result = self.direct(method, params).await?;
                if let Some(chain_id) = requested {
                    if self.inner.set_chain_id(&chain_id).await {
                        self.inner
                            .emitter
                            .emit("chainChanged", &json!(chain_id.to_ascii_lowercase()));
                    }
                }
                Ok(result)
            }
            "eth_getBalance" => self.direct(method, params).await,
            m if APPROVAL_METHODS.contains(&m) => {
                let deadline = Instant::now() + self.inner.config.approval_timeout();
                self.settle(method, params, deadline).await
            }
            other => Err(ProviderError::MethodNotSupported(other.to_string())),
        }
    }

    async fn direct(&self, method: &str, params: Vec<Value>) -> Result<Value, ProviderError> {
        let deadline = Instant::now() + self.inner.config.direct_timeout();
        self.settle(method, params, deadline).await
    }

    /// One exchange, then polling if the answer is a pending marker. The
    /// whole thing shares one deadline.
    async fn settle(
        &self,
        method: &str,
        params: Vec<Value>,
        deadline: Instant,
    ) -> Result<Value, ProviderError> {
        let inner = &self.inner;
        let first = inner.call(method, params, deadline).await?.into_result()?;
        let Some(marker) = PendingMarker::from_value(&first) else {
            return Ok(first);
        };
        debug!(request_id = marker.request_id, %method, "Awaiting user approval");

        let cancel = inner.closed.child_token();
        let _stop_polling = cancel.clone().drop_guard();
        let poller = ResultPoller::until(
            inner.config.poll_grace(),
            inner.config.poll_interval(),
            deadline,
            cancel,
        );
        poller
            .run(marker.request_id, |request_id| async move {
                inner
                    .call("get_request_result", vec![json!(request_id)], deadline)
                    .await?
                    .into_result()
                    .map_err(ProviderError::from)
            })
            .await
    }

    /// Liveness probe. Returns the round-trip time.
    pub async fn ping(&self) -> Result<Duration, ProviderError> {
        let id = self.inner.next_ping.fetch_sub(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pings.insert(id, tx);

        let started = Instant::now();
        let probe = async {
            self.inner
                .outbound
                .send(PageMessage::Ping { id })
                .await
                .map_err(|_| ProviderError::ChannelUnavailable("relay is gone".to_string()))?;
            rx.await
                .map_err(|_| ProviderError::ChannelUnavailable("connection closed".to_string()))
        };
        let outcome = timeout(self.inner.config.direct_timeout(), probe).await;
        self.inner.pings.remove(&id);
        match outcome {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::RequestTimeout("ping".to_string())),
        }
    }

    pub fn on(&self, event: &str, listener: Listener) {
        self.inner.emitter.on(event, listener);
    }

    pub fn remove_listener(&self, event: &str, listener: &Listener) -> bool {
        self.inner.emitter.remove_listener(event, listener)
    }

    pub async fn selected_address(&self) -> Option<String> {
        self.inner.selected_address.read().await.clone()
    }

    pub async fn chain_id(&self) -> Option<String> {
        self.inner.chain_id.read().await.clone()
    }

    /// Calls still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.inner.calls.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.inner.closed.cancel();
    }
}
