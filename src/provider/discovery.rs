//! Announce-on-demand provider discovery (EIP-6963 shape) and the single
//! global injection slot.

use super::{Provider, ProviderError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub const ANNOUNCE_EVENT: &str = "eip6963:announceProvider";
pub const REQUEST_EVENT: &str = "eip6963:requestProvider";

static INJECTED: OnceLock<Arc<Provider>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub uuid: String,
    pub name: String,
    pub icon: String,
    pub rdns: String,
}

impl Default for ProviderInfo {
    fn default() -> Self {
        Self {
            uuid: "walletbridge".to_string(),
            name: "WalletBridge".to_string(),
            icon: String::new(),
            rdns: "io.walletbridge".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Announcement {
    pub info: ProviderInfo,
    pub provider: Arc<Provider>,
}

/// Page-wide discovery channel. Providers announce once on registration
/// and again every time a dapp asks.
#[derive(Debug)]
pub struct DiscoveryBus {
    announce_tx: broadcast::Sender<Announcement>,
    registered: RwLock<Vec<Announcement>>,
}

impl DiscoveryBus {
    pub fn new() -> Self {
        let (announce_tx, _) = broadcast::channel(16);
        Self {
            announce_tx,
            registered: RwLock::new(Vec::new()),
        }
    }

    /// Listen for announcements.
    pub fn subscribe(&self) -> broadcast::Receiver<Announcement> {
        self.announce_tx.subscribe()
    }

    pub fn announce(&self, info: ProviderInfo, provider: Arc<Provider>) {
        let announcement = Announcement { info, provider };
        info!(uuid = %announcement.info.uuid, "{}", ANNOUNCE_EVENT);
        if let Ok(mut registered) = self.registered.write() {
            registered.retain(|a| a.info.uuid != announcement.info.uuid);
            registered.push(announcement.clone());
        }
        let _ = self.announce_tx.send(announcement);
    }

    /// Ask every registered provider to announce again. Returns how many
    /// did.
    pub fn request_providers(&self) -> usize {
        debug!("{}", REQUEST_EVENT);
        let registered = match self.registered.read() {
            Ok(registered) => registered.clone(),
            Err(_) => return 0,
        };
        for announcement in &registered {
            let _ = self.announce_tx.send(announcement.clone());
        }
        registered.len()
    }
}

impl Default for DiscoveryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the page's global provider. Only the first call wins.
pub fn inject(provider: Arc<Provider>) -> Result<Arc<Provider>, ProviderError> {
    INJECTED
        .set(provider.clone())
        .map_err(|_| ProviderError::AlreadyInjected)?;
    info!("Provider injected");
    Ok(provider)
}

pub fn injected() -> Option<Arc<Provider>> {
    INJECTED.get().cloned()
}
