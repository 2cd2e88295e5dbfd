use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use walletbridge::{
    authority::{Authority, AuthorityHandle, JsonRpcBalance, LocalKeySigner, WalletEvent},
    config::AppConfig,
    store::{SharedStore, SqliteStore},
    web,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Pick up a local .env before anything reads the environment
    dotenvy::dotenv().ok();

    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "walletbridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting WalletBridge v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::init()?;
    info!("Configuration loaded");

    let store: SharedStore =
        Arc::new(SqliteStore::connect(&config.store.url, config.store.max_connections).await?);
    info!("Capability store connected: {}", config.store.url);

    let mut authority = Authority::new(
        store,
        Arc::new(LocalKeySigner),
        Arc::new(JsonRpcBalance::new(config.relay.call_timeout())),
        config.wallet.clone(),
    );
    authority.activate().await?;
    let handle = authority.spawn();

    tokio::spawn(log_wallet_events(handle.clone()));

    let session_token = if config.approval.session_token.is_empty() {
        let token = uuid::Uuid::new_v4().to_string();
        warn!("No approval.session_token configured, generated one for this run");
        info!("Approval session token: {}", token);
        token
    } else {
        config.approval.session_token.clone()
    };

    let state = web::AppState {
        authority: handle.clone(),
        relay_timeout: config.relay.call_timeout(),
        session_token: Arc::new(session_token),
    };
    let app = web::create_router(state);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Relay listening on ws://{}/ws", addr);
    info!("Approval API on http://{}/api", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown requested");
    });
    if let Err(e) = server.await {
        error!("Web server error: {}", e);
    }

    handle.shutdown().await;
    Ok(())
}

/// Stand-in for the extension badge and notification window.
async fn log_wallet_events(handle: AuthorityHandle) {
    let mut rx = handle.subscribe_all();
    loop {
        match rx.recv().await {
            Ok(WalletEvent::ApprovalRequested { request_id, method }) => {
                info!(request_id, %method, "Approval needed: walletbridge-cli show {}", request_id);
            }
            Ok(WalletEvent::PendingCountChanged { count }) => {
                info!(count, "Pending approvals");
            }
            Ok(WalletEvent::ConnectRequested) => {
                info!("A page asked to connect but the wallet has no accounts");
            }
            Ok(WalletEvent::ChainChanged { chain_id }) => {
                info!(%chain_id, "Active chain changed");
            }
            Ok(WalletEvent::AccountsChanged { accounts }) => {
                info!(exposed = accounts.len(), "Accounts changed");
            }
            Err(RecvError::Lagged(n)) => warn!("Event log lagged {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}
