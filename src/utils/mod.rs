pub mod config;
pub mod env_guard;
pub mod error;
pub mod telemetry;

pub use config::RelayConfig;
pub use env_guard::harden_env_setup;
pub use error::compact_error_message;
