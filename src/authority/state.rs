//! Wallet state owned by the authority.

use alloy_primitives::Address;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use walletbridge_types::Network;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_MNEMONIC: &str = "mnemonic";
pub const KEY_ACCOUNTS: &str = "accounts";
pub const KEY_CURRENT_ACCOUNT: &str = "currentAccount";
pub const KEY_CURRENT_CHAIN_ID: &str = "currentChainId";
pub const KEY_NETWORKS: &str = "networks";

/// Every key the state occupies in the capability store.
pub const STATE_KEYS: [&str; 5] = [
    KEY_MNEMONIC,
    KEY_ACCOUNTS,
    KEY_CURRENT_ACCOUNT,
    KEY_CURRENT_CHAIN_ID,
    KEY_NETWORKS,
];

/// A BIP-39 mnemonic. Wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SeedPhrase(String);

impl SeedPhrase {
    /// Normalise whitespace. Returns `None` for an empty phrase.
    pub fn new(phrase: &str) -> Option<Self> {
        let words: Vec<&str> = phrase.split_whitespace().collect();
        if words.is_empty() {
            return None;
        }
        Some(Self(words.join(" ")))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn word_count(&self) -> usize {
        self.0.split(' ').count()
    }
}

impl fmt::Debug for SeedPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeedPhrase([REDACTED; {} words])", self.word_count())
    }
}

/// Rejected state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Account index {index} out of range ({len} accounts)")]
    AccountOutOfRange { index: usize, len: usize },

    #[error("Unrecognized chain ID {0}")]
    UnknownChain(String),
}

/// Render an address the way wallets show it (EIP-55).
pub fn checksum(address: &Address) -> String {
    address.to_checksum(None)
}

/// The wallet singleton.
///
/// Invariants held by every setter:
/// - `current_account < accounts.len()` whenever `accounts` is non-empty
/// - `networks` is never empty
/// - `current_chain_id` names one of `networks`
#[derive(Debug, Clone)]
pub struct WalletState {
    mnemonic: Option<SeedPhrase>,
    accounts: Vec<Address>,
    current_account: usize,
    current_chain_id: String,
    networks: Vec<Network>,
}

impl WalletState {
    pub fn new(default_network: Network) -> Self {
        Self {
            mnemonic: None,
            accounts: Vec::new(),
            current_account: 0,
            current_chain_id: default_network.chain_id.clone(),
            networks: vec![default_network],
        }
    }

    pub fn mnemonic(&self) -> Option<&SeedPhrase> {
        self.mnemonic.as_ref()
    }

    pub fn accounts(&self) -> &[Address] {
        &self.accounts
    }

    pub fn current_account(&self) -> usize {
        self.current_account
    }

    /// The active address, if any account exists.
    pub fn active_address(&self) -> Option<Address> {
        self.accounts.get(self.current_account).copied()
    }

    pub fn current_chain_id(&self) -> &str {
        &self.current_chain_id
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    pub fn active_network(&self) -> &Network {
        self.networks
            .iter()
            .find(|n| n.chain_id == self.current_chain_id)
            .unwrap_or(&self.networks[0])
    }

    pub fn set_mnemonic(&mut self, seed: SeedPhrase) {
        self.mnemonic = Some(seed);
    }

    /// Replace the account list. The first account becomes active.
    pub fn set_accounts(&mut self, accounts: Vec<Address>) {
        self.accounts = accounts;
        self.current_account = 0;
    }

    pub fn set_current_account(&mut self, index: usize) -> Result<(), StateError> {
        if index >= self.accounts.len() {
            return Err(StateError::AccountOutOfRange {
                index,
                len: self.accounts.len(),
            });
        }
        self.current_account = index;
        Ok(())
    }

    /// Pull an out-of-range index back to 0. Returns true if it moved.
    pub fn repair_current_account(&mut self) -> bool {
        if self.current_account != 0 && self.current_account >= self.accounts.len() {
            self.current_account = 0;
            return true;
        }
        false
    }

    /// Returns whether the active chain actually changed.
    pub fn switch_chain(&mut self, chain_id: &str) -> Result<bool, StateError> {
        if !self.networks.iter().any(|n| n.chain_id == chain_id) {
            return Err(StateError::UnknownChain(chain_id.to_string()));
        }
        if self.current_chain_id == chain_id {
            return Ok(false);
        }
        self.current_chain_id = chain_id.to_string();
        Ok(true)
    }

    /// Insert a network, replacing any entry with the same chain id.
    pub fn add_network(&mut self, network: Network) {
        match self.networks.iter_mut().find(|n| n.chain_id == network.chain_id) {
            Some(existing) => *existing = network,
            None => self.networks.push(network),
        }
    }

    pub fn reset(&mut self, default_network: Network) {
        *self = Self::new(default_network);
    }

    /// Serialise into capability-store entries.
    pub fn to_entries(&self) -> HashMap<String, Value> {
        let mut entries = HashMap::new();
        if let Some(seed) = &self.mnemonic {
            entries.insert(KEY_MNEMONIC.to_string(), json!(seed.expose()));
        }
        entries.insert(KEY_ACCOUNTS.to_string(), json!(self.account_strings()));
        entries.insert(KEY_CURRENT_ACCOUNT.to_string(), json!(self.current_account));
        entries.insert(KEY_CURRENT_CHAIN_ID.to_string(), json!(self.current_chain_id));
        entries.insert(KEY_NETWORKS.to_string(), json!(self.networks));
        entries
    }

    /// Rebuild from capability-store entries. Missing or malformed fields
    /// fall back to defaults and the invariants are re-established.
    pub fn from_entries(entries: &HashMap<String, Value>, default_network: Network) -> Self {
        let mut state = Self::new(default_network);

        if let Some(seed) = entries
            .get(KEY_MNEMONIC)
            .and_then(Value::as_str)
            .and_then(SeedPhrase::new)
        {
            state.mnemonic = Some(seed);
        }

        if let Some(raw) = entries.get(KEY_ACCOUNTS).and_then(Value::as_array) {
            state.accounts = raw
                .iter()
                .filter_map(|v| {
                    let parsed = v.as_str().and_then(|s| Address::from_str(s).ok());
                    if parsed.is_none() {
                        warn!(value = %v, "Dropping malformed stored account");
                    }
                    parsed
                })
                .collect();
        }

        if let Some(networks) = entries.get(KEY_NETWORKS) {
            match serde_json::from_value::<Vec<Network>>(networks.clone()) {
                Ok(networks) if !networks.is_empty() => state.networks = networks,
                Ok(_) => {}
                Err(e) => warn!("Ignoring malformed stored networks: {}", e),
            }
        }

        if let Some(index) = entries.get(KEY_CURRENT_ACCOUNT).and_then(Value::as_u64) {
            state.current_account = usize::try_from(index).unwrap_or(0);
        }
        if state.current_account >= state.accounts.len() {
            state.current_account = 0;
        }

        state.current_chain_id = match entries.get(KEY_CURRENT_CHAIN_ID).and_then(Value::as_str) {
            Some(id) if state.networks.iter().any(|n| n.chain_id == id) => id.to_string(),
            _ => state.networks[0].chain_id.clone(),
        };

        state
    }

    pub fn account_strings(&self) -> Vec<String> {
        self.accounts.iter().map(checksum).collect()
    }

    /// What `wallet_getState` returns. The seed phrase itself never leaves
    /// the authority.
    pub fn view(&self) -> StateView {
        StateView {
            has_mnemonic: self.mnemonic.is_some(),
            accounts: self.account_strings(),
            current_account: self.current_account,
            current_chain_id: self.current_chain_id.clone(),
            networks: self.networks.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateView {
    pub has_mnemonic: bool,
    pub accounts: Vec<String>,
    pub current_account: usize,
    pub current_chain_id: String,
    pub networks: Vec<Network>,
}
