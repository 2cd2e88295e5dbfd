//! Page-side forwarder.
//!
//! One relay serves one page session. It answers liveness probes itself,
//! forwards RPC envelopes to the authority untouched and mirrors
//! page-topic events back into the page.

use crate::authority::{AuthorityHandle, Caller, Topic, WalletEvent};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use walletbridge_types::{PageMessage, RpcEnvelope, RpcErrorKind, RpcResult};

#[derive(Debug, Clone)]
pub struct Relay {
    authority: AuthorityHandle,
    call_timeout: Duration,
}

impl Relay {
    pub fn new(authority: AuthorityHandle, call_timeout: Duration) -> Self {
        Self {
            authority,
            call_timeout,
        }
    }

    /// Serve a page until its inbound stream ends or its outbound side
    /// closes.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<PageMessage>,
        outbound: mpsc::Sender<PageMessage>,
    ) {
        let mut events = Some(self.authority.subscribe(Topic::Page));
        info!("Relay session started");

        loop {
            tokio::select! {
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break };
                    if !self.on_page_message(msg, &outbound).await {
                        break;
                    }
                }
                event = next_event(&mut events), if events.is_some() => {
                    match event {
                        Ok(event) => {
                            let Some(msg) = event.to_page_message() else { continue };
                            if outbound.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!("Relay lagged {} wallet events", n);
                        }
                        Err(RecvError::Closed) => {
                            debug!("Authority event stream closed");
                            events = None;
                        }
                    }
                }
            }
        }

        info!("Relay session ended");
    }

    /// Returns false once the page side is gone.
    async fn on_page_message(&self, msg: PageMessage, outbound: &mpsc::Sender<PageMessage>) -> bool {
        match msg {
            PageMessage::Ping { id } => outbound.send(PageMessage::Pong { id }).await.is_ok(),
            PageMessage::RpcRequest { id, payload } => {
                debug!(id, method = %payload.method, "Forwarding page request");
                let relay = self.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    let response = relay.forward(payload).await;
                    if outbound
                        .send(PageMessage::RpcResponse { id, response })
                        .await
                        .is_err()
                    {
                        debug!(id, "Page went away before its response");
                    }
                });
                true
            }
            other @ (PageMessage::Pong { .. }
            | PageMessage::RpcResponse { .. }
            | PageMessage::AccountsChanged { .. }
            | PageMessage::ChainChanged { .. }) => {
                debug!(kind = other.kind(), "Ignoring page message");
                true
            }
        }
    }

    /// Exactly one result per envelope, even when the authority never
    /// answers.
    async fn forward(&self, payload: RpcEnvelope) -> RpcResult {
        let id = payload.id;
        match timeout(self.call_timeout, self.authority.call(Caller::Page, payload)).await {
            Ok(Ok(result)) => result,
            Ok(Err(unavailable)) => {
                warn!(id, "{}", unavailable);
                RpcResult::error(id, RpcErrorKind::ChannelUnavailable, unavailable.to_string())
            }
            Err(_) => {
                warn!(id, "Wallet authority did not answer in time");
                RpcResult::error(
                    id,
                    RpcErrorKind::ChannelUnavailable,
                    "Wallet authority did not respond",
                )
            }
        }
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<WalletEvent>>,
) -> Result<WalletEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
