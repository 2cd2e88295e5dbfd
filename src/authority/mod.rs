//! The signer/state authority.
//!
//! The only holder of key material. Runs as a single-consumer actor: every
//! call is handled to completion before the next one starts, so state,
//! pending requests and result cells need no locking.

pub mod balance;
pub mod events;
pub mod pending;
pub mod request;
pub mod signer;
pub mod state;

pub use balance::{BalanceError, BalanceSource, JsonRpcBalance};
pub use events::{EventHub, Topic, WalletEvent};
pub use pending::{PendingAction, PendingEntry, PendingRegistry, RequestIdGenerator, ResultCells};
pub use request::WalletRequest;
pub use signer::{KeySigner, LocalKeySigner, SignerError, TransactionRequest};
pub use state::{SeedPhrase, StateError, WalletState};

use crate::config::WalletConfig;
use crate::store::{SharedStore, StoreError};
use serde_json::{json, Value};
use alloy_primitives::Address;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use walletbridge_types::{
    parse_hex_quantity, PendingMarker, PendingRequest, RpcEnvelope, RpcErrorKind, RpcErrorObject,
    RpcResult,
};

/// Accounts derived when a stored mnemonic has none.
pub const DEFAULT_ACCOUNT_COUNT: usize = 5;

/// Where a call came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// An untrusted page, through a relay.
    Page,
    /// The wallet's own UI or the operator CLI.
    Extension,
}

/// Authority errors. Each maps to one wire error code.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Method not supported: {0}")]
    MethodNotSupported(String),

    #[error("Method {0} is not available to pages")]
    Unauthorized(String),

    #[error("Unrecognized chain ID {0}")]
    UnrecognizedChain(String),

    #[error("Request not found")]
    RequestNotFound(u64),

    #[error("Result not found")]
    ResultNotFound(u64),

    #[error("User rejected the request")]
    UserRejected,

    #[error("Wallet not initialized")]
    NotInitialized,

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error("Storage failure: {0}")]
    Store(#[from] StoreError),

    #[error("Balance lookup failed: {0}")]
    Balance(#[from] BalanceError),

    /// An error stored in a result cell, replayed to the poller.
    #[error("{}", .0.message)]
    Resolved(RpcErrorObject),
}

impl WalletError {
    pub fn kind(&self) -> RpcErrorKind {
        match self {
            Self::InvalidParams(_) => RpcErrorKind::InvalidParams,
            Self::MethodNotSupported(_) => RpcErrorKind::MethodNotSupported,
            Self::Unauthorized(_) => RpcErrorKind::Unauthorized,
            Self::UnrecognizedChain(_) => RpcErrorKind::UnrecognizedChain,
            Self::RequestNotFound(_) | Self::ResultNotFound(_) => RpcErrorKind::ResultNotFound,
            Self::UserRejected => RpcErrorKind::UserRejected,
            Self::NotInitialized => RpcErrorKind::SigningFailed,
            Self::Signer(_) => RpcErrorKind::SigningFailed,
            Self::Store(_) | Self::Balance(_) => RpcErrorKind::Internal,
            Self::Resolved(obj) => obj.kind(),
        }
    }

    pub fn to_rpc(&self) -> RpcErrorObject {
        match self {
            Self::Resolved(obj) => obj.clone(),
            other => RpcErrorObject::new(other.kind(), other.to_string()),
        }
    }
}

impl From<StateError> for WalletError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::AccountOutOfRange { .. } => Self::InvalidParams(err.to_string()),
            StateError::UnknownChain(chain) => Self::UnrecognizedChain(chain),
        }
    }
}

type WalletResult<T> = Result<T, WalletError>;

/// What a call needs after the actor has looked at it.
enum Step {
    Ready(Value),
    /// Network I/O that must not hold up the actor.
    Lookup(BalanceLookup),
}

/// A balance query detached from wallet state.
struct BalanceLookup {
    source: Arc<dyn BalanceSource>,
    rpc_url: String,
    address: Address,
}

impl BalanceLookup {
    async fn run(self) -> WalletResult<Value> {
        let balance = self.source.get_balance(&self.rpc_url, self.address).await?;
        Ok(json!(format!("{balance:#x}")))
    }
}

fn respond(id: u64, method: &str, caller: Caller, outcome: WalletResult<Value>) -> RpcResult {
    match outcome {
        Ok(value) => RpcResult::success(id, value),
        Err(err) => {
            match err.kind() {
                RpcErrorKind::ResultNotFound | RpcErrorKind::UserRejected => {
                    debug!(method, "{}", err)
                }
                _ => warn!(method, ?caller, "Call failed: {}", err),
            }
            RpcResult::failure(id, err.to_rpc())
        }
    }
}

pub struct Authority {
    state: WalletState,
    registry: PendingRegistry,
    cells: ResultCells,
    ids: RequestIdGenerator,
    store: SharedStore,
    signer: Arc<dyn KeySigner>,
    balance: Arc<dyn BalanceSource>,
    events: Arc<EventHub>,
    wallet: WalletConfig,
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("accounts", &self.state.accounts().len())
            .field("chain_id", &self.state.current_chain_id())
            .field("pending", &self.registry.len())
            .field("cells", &self.cells.len())
            .finish()
    }
}

impl Authority {
    pub fn new(
        store: SharedStore,
        signer: Arc<dyn KeySigner>,
        balance: Arc<dyn BalanceSource>,
        mut wallet: WalletConfig,
    ) -> Self {
        if let Some(id) = request::canonical_chain_id(&wallet.default_network.chain_id) {
            wallet.default_network.chain_id = id;
        }
        Self {
            state: WalletState::new(wallet.default_network.clone()),
            registry: PendingRegistry::new(),
            cells: ResultCells::new(),
            ids: RequestIdGenerator::new(),
            store,
            signer,
            balance,
            events: Arc::new(EventHub::new()),
            wallet,
        }
    }

    pub fn events(&self) -> Arc<EventHub> {
        self.events.clone()
    }

    pub fn state(&self) -> &WalletState {
        &self.state
    }

    /// Load persisted state. A stored mnemonic without accounts gets the
    /// default account set derived and saved.
    pub async fn activate(&mut self) -> WalletResult<()> {
        let entries = self.store.get(&state::STATE_KEYS).await?;
        self.state = WalletState::from_entries(&entries, self.wallet.default_network.clone());

        if self.state.accounts().is_empty() {
            if let Some(seed) = self.state.mnemonic().cloned() {
                let accounts = self.derive(&seed, DEFAULT_ACCOUNT_COUNT)?;
                info!(count = accounts.len(), "Restored accounts from stored mnemonic");
                self.state.set_accounts(accounts);
            }
        }
        self.persist().await?;

        info!(
            accounts = self.state.accounts().len(),
            chain_id = %self.state.current_chain_id(),
            has_mnemonic = self.state.mnemonic().is_some(),
            "Wallet authority activated"
        );
        Ok(())
    }

    /// Handle one call to completion. Every failure becomes an error result.
    pub async fn dispatch(&mut self, caller: Caller, envelope: RpcEnvelope) -> RpcResult {
        let outcome = match self.handle(caller, &envelope.method, &envelope.params).await {
            Ok(Step::Ready(value)) => Ok(value),
            Ok(Step::Lookup(lookup)) => lookup.run().await,
            Err(err) => Err(err),
        };
        respond(envelope.id, &envelope.method, caller, outcome)
    }

    async fn handle(&mut self, caller: Caller, method: &str, params: &[Value]) -> WalletResult<Step> {
        if !WalletRequest::is_known(method) {
            return Err(WalletError::MethodNotSupported(method.to_string()));
        }
        if caller == Caller::Page && !WalletRequest::page_allowed(method) {
            return Err(WalletError::Unauthorized(method.to_string()));
        }

        match WalletRequest::parse(method, params)? {
            WalletRequest::GetBalance(address) => Ok(Step::Lookup(self.balance_lookup(address))),
            request => self.apply(method, request).await.map(Step::Ready),
        }
    }

    /// Snapshot what a balance query needs so it can run off the actor.
    fn balance_lookup(&self, address: Address) -> BalanceLookup {
        BalanceLookup {
            source: self.balance.clone(),
            rpc_url: self.state.active_network().rpc_url.clone(),
            address,
        }
    }

    async fn apply(&mut self, method: &str, request: WalletRequest) -> WalletResult<Value> {
        match request {
            WalletRequest::DeriveAccounts { seed, count } => {
                let accounts = self.derive(&seed, count)?;
                Ok(json!(accounts.iter().map(state::checksum).collect::<Vec<_>>()))
            }
            WalletRequest::GetAccounts => Ok(json!(self.active_accounts())),
            WalletRequest::GetAllAccounts => Ok(json!(self.state.account_strings())),
            WalletRequest::SetCurrentAccount(index) => {
                self.state.set_current_account(index)?;
                self.persist().await?;
                self.announce_accounts();
                Ok(json!(true))
            }
            WalletRequest::SetMnemonic(seed) => {
                self.signer
                    .derive_address(seed.expose(), &self.wallet.account_path(0))
                    .map_err(|e| WalletError::InvalidParams(e.to_string()))?;
                self.state.set_mnemonic(seed);
                self.persist().await?;
                info!("Mnemonic stored");
                Ok(json!(true))
            }
            WalletRequest::SetAccounts(accounts) => {
                self.state.set_accounts(accounts);
                self.persist().await?;
                self.announce_accounts();
                Ok(json!(true))
            }
            WalletRequest::GetState => Ok(json!(self.state.view())),
            WalletRequest::Reset => self.reset().await,
            WalletRequest::SendTransaction(tx) => {
                if let Some(from) = tx.from {
                    if Some(from) != self.state.active_address() {
                        return Err(WalletError::InvalidParams(format!(
                            "`from` {from} is not the active account"
                        )));
                    }
                }
                let params = vec![json!(tx)];
                Ok(self.enqueue(method, params, PendingAction::SendTransaction(tx)))
            }
            WalletRequest::SignTypedData {
                address,
                typed_data,
                display,
            } => {
                if Some(address) != self.state.active_address() {
                    return Err(WalletError::InvalidParams(format!(
                        "{address} is not the active account"
                    )));
                }
                let params = vec![json!(state::checksum(&address)), display];
                Ok(self.enqueue(method, params, PendingAction::SignTypedData(typed_data)))
            }
            WalletRequest::ChainId => Ok(json!(self.state.current_chain_id())),
            WalletRequest::RequestAccounts => self.request_accounts().await,
            WalletRequest::GetBalance(address) => self.balance_lookup(address).run().await,
            WalletRequest::NotificationResponse {
                request_id,
                approved,
            } => self.resolve(request_id, approved),
            WalletRequest::GetRequestResult(request_id) => {
                self.expire_results();
                match self.cells.take(request_id) {
                    None => Err(WalletError::ResultNotFound(request_id)),
                    Some(Ok(value)) => {
                        debug!(request_id, "Result delivered");
                        Ok(value)
                    }
                    Some(Err(error)) => Err(WalletError::Resolved(error)),
                }
            }
            WalletRequest::GetPendingRequests => Ok(json!(self.registry.list())),
            WalletRequest::SwitchChain(chain_id) => {
                self.switch_chain(&chain_id).await?;
                Ok(Value::Null)
            }
            WalletRequest::SetChainId(chain_id) => {
                self.switch_chain(&chain_id).await?;
                Ok(json!(true))
            }
            WalletRequest::AddNetwork(network) => {
                info!(chain_id = %network.chain_id, name = %network.name, "Network added");
                self.state.add_network(network);
                self.persist().await?;
                Ok(json!(true))
            }
        }
    }

    fn derive(&self, seed: &SeedPhrase, count: usize) -> WalletResult<Vec<Address>> {
        (0..count)
            .map(|i| {
                self.signer
                    .derive_address(seed.expose(), &self.wallet.account_path(i))
                    .map_err(WalletError::from)
            })
            .collect()
    }

    fn active_accounts(&self) -> Vec<String> {
        self.state
            .active_address()
            .map(|a| vec![state::checksum(&a)])
            .unwrap_or_default()
    }

    fn announce_accounts(&self) {
        self.events.publish(WalletEvent::AccountsChanged {
            accounts: self.active_accounts(),
        });
    }

    async fn persist(&self) -> WalletResult<()> {
        self.store.set(self.state.to_entries()).await?;
        Ok(())
    }

    async fn reset(&mut self) -> WalletResult<Value> {
        let had_accounts = !self.state.accounts().is_empty();
        let old_chain = self.state.current_chain_id().to_string();
        let had_pending = !self.registry.is_empty();

        self.store.clear().await?;
        self.state.reset(self.wallet.default_network.clone());
        self.registry.clear();
        self.cells.clear();

        if had_accounts {
            self.announce_accounts();
        }
        if old_chain != self.state.current_chain_id() {
            self.events.publish(WalletEvent::ChainChanged {
                chain_id: self.state.current_chain_id().to_string(),
            });
        }
        if had_pending {
            self.events.publish(WalletEvent::PendingCountChanged { count: 0 });
        }
        info!("Wallet reset to defaults");
        Ok(json!(true))
    }

    async fn request_accounts(&mut self) -> WalletResult<Value> {
        if self.state.accounts().is_empty() {
            info!("No accounts yet, asking the user to connect");
            self.events.publish(WalletEvent::ConnectRequested);
            return Ok(json!([]));
        }
        if self.state.repair_current_account() {
            warn!("Active account index was out of range, reset to 0");
            self.persist().await?;
        }
        Ok(json!(self.active_accounts()))
    }

    async fn switch_chain(&mut self, chain_id: &str) -> WalletResult<()> {
        if self.state.switch_chain(chain_id)? {
            self.persist().await?;
            info!(%chain_id, "Switched chain");
            self.events.publish(WalletEvent::ChainChanged {
                chain_id: chain_id.to_string(),
            });
        }
        Ok(())
    }

    fn enqueue(&mut self, method: &str, params: Vec<Value>, action: PendingAction) -> Value {
        let request_id = self.ids.next();
        self.registry.insert(PendingEntry {
            request: PendingRequest {
                id: request_id,
                method: method.to_string(),
                params,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            action,
        });
        info!(request_id, %method, "Awaiting approval");

        self.events.publish(WalletEvent::ApprovalRequested {
            request_id,
            method: method.to_string(),
        });
        self.events.publish(WalletEvent::PendingCountChanged {
            count: self.registry.len(),
        });
        PendingMarker::new(request_id).to_value()
    }

    /// Apply the user's decision. The entry leaves the registry before any
    /// signing, so the first decision for an id is the only one acted on.
    fn resolve(&mut self, request_id: u64, approved: bool) -> WalletResult<Value> {
        let entry = self
            .registry
            .remove(request_id)
            .ok_or(WalletError::RequestNotFound(request_id))?;
        self.events.publish(WalletEvent::PendingCountChanged {
            count: self.registry.len(),
        });
        self.expire_results();

        if !approved {
            info!(request_id, "Request rejected by user");
            let err = WalletError::UserRejected;
            self.cells.store(request_id, Err(err.to_rpc()));
            return Err(err);
        }

        match self.execute(&entry.action) {
            Ok(value) => {
                info!(request_id, method = %entry.request.method, "Request approved and signed");
                self.cells.store(request_id, Ok(value.clone()));
                Ok(value)
            }
            Err(err) => {
                warn!(request_id, "Approved request failed: {}", err);
                self.cells.store(request_id, Err(err.to_rpc()));
                Err(err)
            }
        }
    }

    /// Drop results nobody collected within the approval budget.
    fn expire_results(&mut self) {
        let expired = self.cells.prune(self.wallet.result_ttl());
        if expired > 0 {
            debug!(expired, "Expired uncollected results");
        }
    }

    fn execute(&self, action: &PendingAction) -> WalletResult<Value> {
        let seed = self.state.mnemonic().ok_or(WalletError::NotInitialized)?;
        if self.state.active_address().is_none() {
            return Err(WalletError::NotInitialized);
        }
        let path = self.wallet.account_path(self.state.current_account());

        match action {
            PendingAction::SendTransaction(tx) => {
                let chain_id = match tx.chain_id {
                    Some(id) => u64::try_from(id).map_err(|_| {
                        SignerError::InvalidTransaction("chainId out of range".to_string())
                    })?,
                    None => parse_hex_quantity(self.state.current_chain_id()).ok_or_else(|| {
                        SignerError::InvalidTransaction("active chain id is not hex".to_string())
                    })?,
                };
                let signed = self.signer.sign_transaction(seed.expose(), &path, tx, chain_id)?;
                debug!(raw_len = signed.raw.len(), "Transaction signed");
                Ok(json!(signed.hash.to_string()))
            }
            PendingAction::SignTypedData(typed_data) => {
                let signature = self.signer.sign_typed_data(seed.expose(), &path, typed_data)?;
                Ok(json!(signer::encode_signature(&signature)))
            }
        }
    }

    /// Run as an actor and hand back a cloneable handle.
    pub fn spawn(self) -> AuthorityHandle {
        let (tx, rx) = mpsc::channel(256);
        let events = self.events.clone();
        tokio::spawn(self.run(rx));
        AuthorityHandle {
            tx,
            events,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Call {
                    caller,
                    envelope,
                    reply,
                } => {
                    let id = envelope.id;
                    let step = self.handle(caller, &envelope.method, &envelope.params).await;
                    match step {
                        Ok(Step::Lookup(lookup)) => {
                            tokio::spawn(async move {
                                let outcome = lookup.run().await;
                                let _ = reply.send(respond(id, &envelope.method, caller, outcome));
                            });
                        }
                        // The caller may have timed out and gone away
                        Ok(Step::Ready(value)) => {
                            let _ = reply.send(respond(id, &envelope.method, caller, Ok(value)));
                        }
                        Err(err) => {
                            let _ = reply.send(respond(id, &envelope.method, caller, Err(err)));
                        }
                    }
                }
                Command::Shutdown => break,
            }
        }
        info!("Wallet authority stopped");
    }
}

enum Command {
    Call {
        caller: Caller,
        envelope: RpcEnvelope,
        reply: oneshot::Sender<RpcResult>,
    },
    Shutdown,
}

/// The actor has stopped or dropped the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Wallet authority unavailable")]
pub struct AuthorityUnavailable;

impl From<AuthorityUnavailable> for crate::error::AppError {
    fn from(_: AuthorityUnavailable) -> Self {
        Self::AuthorityUnavailable
    }
}

/// Cloneable entry point to a running [`Authority`].
#[derive(Clone)]
pub struct AuthorityHandle {
    tx: mpsc::Sender<Command>,
    events: Arc<EventHub>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for AuthorityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl AuthorityHandle {
    pub async fn call(
        &self,
        caller: Caller,
        envelope: RpcEnvelope,
    ) -> Result<RpcResult, AuthorityUnavailable> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Call {
                caller,
                envelope,
                reply,
            })
            .await
            .map_err(|_| AuthorityUnavailable)?;
        rx.await.map_err(|_| AuthorityUnavailable)
    }

    /// Build an envelope with a handle-local id and call.
    pub async fn request(
        &self,
        caller: Caller,
        method: &str,
        params: Vec<Value>,
    ) -> Result<RpcResult, AuthorityUnavailable> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.call(caller, RpcEnvelope::new(id, method, params)).await
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe(topic)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe_global()
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stop the actor after the calls already queued.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}
