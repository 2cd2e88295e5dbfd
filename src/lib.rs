pub mod authority;
pub mod config;
pub mod error;
pub mod provider;
pub mod relay;
pub mod store;
pub mod web;

pub use authority::{Authority, AuthorityHandle, Caller};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use provider::{Provider, ProviderError};
pub use relay::Relay;
