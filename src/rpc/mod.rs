//! Node access over JSON-RPC.
//!
//! Only HTTP is used: the pipeline polls for new heights itself, so push
//! subscriptions add nothing but reconnection handling.

pub mod http;

pub use http::{create_provider, redact_url, AlloyChainClient, AlloyConnector, Provider};
