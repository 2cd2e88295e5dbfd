use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use walletbridge_types::Network;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// HTTP / WebSocket listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8787
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Capability store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite URL. `sqlite::memory:` keeps everything in RAM.
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_store_url() -> String {
    "sqlite://walletbridge.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    1
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Wallet defaults applied on first activation and after a reset
#[derive(Debug, Deserialize, Clone)]
pub struct WalletConfig {
    #[serde(default = "default_network")]
    pub default_network: Network,
    /// HD path prefix; the account index is appended.
    #[serde(default = "default_derivation_path")]
    pub derivation_path: String,
    /// How long an uncollected approval result is kept
    #[serde(default = "default_approval_timeout_ms")]
    pub result_ttl_ms: u64,
}

pub fn default_network() -> Network {
    Network {
        chain_id: "0x7a69".to_string(),
        name: "Hardhat Local".to_string(),
        rpc_url: "http://localhost:8545".to_string(),
        block_explorer: None,
    }
}

pub fn default_derivation_path() -> String {
    "m/44'/60'/0'/0".to_string()
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            default_network: default_network(),
            derivation_path: default_derivation_path(),
            result_ttl_ms: default_approval_timeout_ms(),
        }
    }
}

/// Relay settings
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// How long the relay waits for the authority before reporting the
    /// channel as unavailable
    #[serde(default = "default_direct_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_direct_timeout_ms(),
        }
    }
}

impl RelayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Page provider timing budgets
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    #[serde(default = "default_direct_timeout_ms")]
    pub direct_timeout_ms: u64,
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay before the first poll, lets the approval UI open
    #[serde(default = "default_poll_grace_ms")]
    pub poll_grace_ms: u64,
}

fn default_direct_timeout_ms() -> u64 {
    10_000
}

fn default_approval_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_poll_grace_ms() -> u64 {
    1_000
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            direct_timeout_ms: default_direct_timeout_ms(),
            approval_timeout_ms: default_approval_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_grace_ms: default_poll_grace_ms(),
        }
    }
}

impl ProviderConfig {
    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_timeout_ms)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_grace(&self) -> Duration {
        Duration::from_millis(self.poll_grace_ms)
    }
}

/// Privileged API access
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ApprovalConfig {
    /// Token required in `X-Session-Token`. Empty means one is generated
    /// at startup.
    #[serde(default)]
    pub session_token: String,
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: WALLETBRIDGE_)
            // e.g., WALLETBRIDGE_SERVER__PORT, WALLETBRIDGE_STORE__URL
            .add_source(
                Environment::with_prefix("WALLETBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    /// Get reference to the global config
    pub fn get() -> &'static Self {
        CONFIG.get().expect("Config not initialized. Call AppConfig::init() first.")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Build the derivation path for one account index.
impl WalletConfig {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_millis(self.result_ttl_ms)
    }

    pub fn account_path(&self, index: usize) -> String {
        format!("{}/{}", self.derivation_path.trim_end_matches('/'), index)
    }
}
